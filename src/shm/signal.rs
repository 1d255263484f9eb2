use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub trait ReadySignal: Send + Sync {
    /// 置位信号；上一次信号尚未被读端消费时返回 `Ok(false)`
    fn notify(&self) -> io::Result<bool>;

    /// 等待信号并消费它，超时返回 `Ok(false)`
    fn wait(&self, timeout: Duration) -> io::Result<bool>;
}

impl<S: ReadySignal + ?Sized> ReadySignal for Arc<S> {
    fn notify(&self) -> io::Result<bool> {
        (**self).notify()
    }

    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        (**self).wait(timeout)
    }
}

/// 进程内信号，测试和同进程读端使用
#[derive(Default)]
pub struct LocalSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl LocalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        *self.pending.lock()
    }
}

impl ReadySignal for LocalSignal {
    fn notify(&self) -> io::Result<bool> {
        let mut pending = self.pending.lock();
        if *pending {
            return Ok(false);
        }
        *pending = true;
        self.cond.notify_one();
        Ok(true)
    }

    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while !*pending {
            if self.cond.wait_until(&mut pending, deadline).timed_out() {
                break;
            }
        }
        let fired = *pending;
        *pending = false;
        Ok(fired)
    }
}

#[cfg(target_os = "linux")]
pub use posix::NamedSignal;

#[cfg(windows)]
pub use win32::NamedSignal;

#[cfg(not(any(target_os = "linux", windows)))]
pub use unsupported::NamedSignal;

/// POSIX 命名信号量，值只在 0/1 之间
#[cfg(target_os = "linux")]
mod posix {
    use std::ffi::CString;
    use std::io;
    use std::time::Duration;

    use super::ReadySignal;
    use crate::error::ChannelError;

    pub struct NamedSignal {
        sem: *mut libc::sem_t,
        name: CString,
        owner: bool,
    }

    // SAFETY: POSIX 信号量本身是线程安全的
    unsafe impl Send for NamedSignal {}
    unsafe impl Sync for NamedSignal {}

    fn sem_name(name: &str) -> Result<CString, ChannelError> {
        let trimmed = name.trim_start_matches('/');
        if trimmed.is_empty() || trimmed.contains('/') {
            return Err(ChannelError::InvalidName {
                name: name.to_string(),
            });
        }
        CString::new(format!("/{}", trimmed)).map_err(|_| ChannelError::InvalidName {
            name: name.to_string(),
        })
    }

    impl NamedSignal {
        /// 创建或打开；只有真正创建的一方 drop 时 unlink
        pub fn create_or_open(name: &str) -> Result<Self, ChannelError> {
            let cname = sem_name(name)?;
            let sem = unsafe {
                libc::sem_open(
                    cname.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::c_uint,
                    0 as libc::c_uint,
                )
            };
            if sem != libc::SEM_FAILED {
                return Ok(Self {
                    sem,
                    name: cname,
                    owner: true,
                });
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err.into());
            }
            Self::open(name)
        }

        pub fn open(name: &str) -> Result<Self, ChannelError> {
            let cname = sem_name(name)?;
            let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
            if sem == libc::SEM_FAILED {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self {
                sem,
                name: cname,
                owner: false,
            })
        }

        fn value(&self) -> io::Result<i32> {
            let mut value: libc::c_int = 0;
            if unsafe { libc::sem_getvalue(self.sem, &mut value) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(value)
        }

        /// 把多余的计数清掉，保持二值语义
        fn drain(&self) {
            while unsafe { libc::sem_trywait(self.sem) } == 0 {}
        }
    }

    impl ReadySignal for NamedSignal {
        fn notify(&self) -> io::Result<bool> {
            if self.value()? > 0 {
                return Ok(false);
            }
            if unsafe { libc::sem_post(self.sem) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(true)
        }

        fn wait(&self, timeout: Duration) -> io::Result<bool> {
            let mut now = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let total_nsec = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
            let deadline = libc::timespec {
                tv_sec: now.tv_sec
                    + timeout.as_secs() as libc::time_t
                    + (total_nsec / 1_000_000_000) as libc::time_t,
                tv_nsec: (total_nsec % 1_000_000_000) as libc::c_long,
            };
            loop {
                if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                    self.drain();
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::ETIMEDOUT) => return Ok(false),
                    _ => return Err(err),
                }
            }
        }
    }

    impl Drop for NamedSignal {
        fn drop(&mut self) {
            unsafe {
                libc::sem_close(self.sem);
                if self.owner {
                    libc::sem_unlink(self.name.as_ptr());
                }
            }
        }
    }
}

/// 手动复位的命名事件：读端等待后负责复位
#[cfg(windows)]
mod win32 {
    use std::io;
    use std::time::Duration;

    use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows::Win32::System::Threading::{
        CreateEventW, EVENT_ALL_ACCESS, OpenEventW, ResetEvent, SetEvent, WaitForSingleObject,
    };
    use windows::core::HSTRING;

    use super::ReadySignal;
    use crate::error::ChannelError;

    pub struct NamedSignal {
        handle: HANDLE,
    }

    // SAFETY: 事件句柄可跨线程使用
    unsafe impl Send for NamedSignal {}
    unsafe impl Sync for NamedSignal {}

    impl NamedSignal {
        pub fn create_or_open(name: &str) -> Result<Self, ChannelError> {
            let wide = HSTRING::from(name);
            let handle = unsafe { CreateEventW(None, true, false, &wide) }
                .map_err(io::Error::other)?;
            Ok(Self { handle })
        }

        pub fn open(name: &str) -> Result<Self, ChannelError> {
            let wide = HSTRING::from(name);
            let handle = unsafe { OpenEventW(EVENT_ALL_ACCESS, false, &wide) }
                .map_err(io::Error::other)?;
            Ok(Self { handle })
        }
    }

    impl ReadySignal for NamedSignal {
        fn notify(&self) -> io::Result<bool> {
            if unsafe { WaitForSingleObject(self.handle, 0) } == WAIT_OBJECT_0 {
                return Ok(false);
            }
            unsafe { SetEvent(self.handle) }.map_err(io::Error::other)?;
            Ok(true)
        }

        fn wait(&self, timeout: Duration) -> io::Result<bool> {
            let ms = timeout.as_millis().min(u32::MAX as u128 - 1) as u32;
            let result = unsafe { WaitForSingleObject(self.handle, ms) };
            if result == WAIT_OBJECT_0 {
                unsafe { ResetEvent(self.handle) }.map_err(io::Error::other)?;
                Ok(true)
            } else if result == WAIT_TIMEOUT {
                Ok(false)
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }

    impl Drop for NamedSignal {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.handle);
            }
        }
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod unsupported {
    use std::io;
    use std::time::Duration;

    use super::ReadySignal;
    use crate::error::ChannelError;

    pub struct NamedSignal(());

    impl NamedSignal {
        pub fn create_or_open(_name: &str) -> Result<Self, ChannelError> {
            Err(ChannelError::Unsupported)
        }

        pub fn open(_name: &str) -> Result<Self, ChannelError> {
            Err(ChannelError::Unsupported)
        }
    }

    impl ReadySignal for NamedSignal {
        fn notify(&self) -> io::Result<bool> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        fn wait(&self, _timeout: Duration) -> io::Result<bool> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }
}
