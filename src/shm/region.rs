use std::io;

use memmap2::MmapMut;

use crate::error::ChannelError;

enum Mapping {
    Mmap(MmapMut),
    #[cfg(windows)]
    View(win32::MappedView),
}

pub struct SharedRegion {
    name: Option<String>,
    mapping: Mapping,
    #[cfg(unix)]
    owned_path: Option<std::path::PathBuf>,
}

fn check_name(name: &str) -> Result<&str, ChannelError> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains(['/', '\\', '\0']) {
        return Err(ChannelError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(trimmed)
}

fn check_size(size: usize) -> Result<(), ChannelError> {
    if size == 0 {
        return Err(ChannelError::InvalidSize { size });
    }
    Ok(())
}

impl SharedRegion {
    /// 进程内匿名映射，不能跨进程共享
    pub fn anonymous(size: usize) -> Result<Self, ChannelError> {
        check_size(size)?;
        Ok(Self {
            name: None,
            mapping: Mapping::Mmap(MmapMut::map_anon(size)?),
            #[cfg(unix)]
            owned_path: None,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn len(&self) -> usize {
        match &self.mapping {
            Mapping::Mmap(map) => map.len(),
            #[cfg(windows)]
            Mapping::View(view) => view.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.mapping {
            Mapping::Mmap(map) => &map[..],
            #[cfg(windows)]
            Mapping::View(view) => view.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.mapping {
            Mapping::Mmap(map) => &mut map[..],
            #[cfg(windows)]
            Mapping::View(view) => view.as_mut_slice(),
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut_slice().as_mut_ptr()
    }
}

#[cfg(unix)]
impl SharedRegion {
    fn dir() -> std::path::PathBuf {
        let dev_shm = std::path::Path::new("/dev/shm");
        if dev_shm.is_dir() {
            dev_shm.to_path_buf()
        } else {
            std::env::temp_dir()
        }
    }

    /// 创建或打开；只有真正创建了文件的一方 drop 时删除
    pub fn create_or_open(name: &str, size: usize) -> Result<Self, ChannelError> {
        let name = check_name(name)?;
        check_size(size)?;
        let path = Self::dir().join(name);
        let mut options = std::fs::OpenOptions::new();
        options.read(true).write(true);
        let (file, created) = match options.clone().create_new(true).open(&path) {
            Ok(file) => (file, true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => (options.open(&path)?, false),
            Err(e) => return Err(e.into()),
        };
        // 只扩不缩，别人可能已经映射了更大的区域
        if file.metadata()?.len() < size as u64 {
            file.set_len(size as u64)?;
        }
        // SAFETY: 文件长度至少为 size；其他进程修改内容不会改变映射的有效性
        let map = unsafe { memmap2::MmapOptions::new().len(size).map_mut(&file)? };
        Ok(Self {
            name: Some(name.to_string()),
            mapping: Mapping::Mmap(map),
            owned_path: created.then_some(path),
        })
    }

    /// 打开已有区域（读端）
    pub fn open(name: &str, size: usize) -> Result<Self, ChannelError> {
        let name = check_name(name)?;
        check_size(size)?;
        let path = Self::dir().join(name);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)?;
        let actual = file.metadata()?.len();
        if actual < size as u64 {
            return Err(ChannelError::LayoutMismatch {
                reason: format!("{} 只有 {} 字节，需要 {}", name, actual, size),
            });
        }
        // SAFETY: 同上
        let map = unsafe { memmap2::MmapOptions::new().len(size).map_mut(&file)? };
        Ok(Self {
            name: Some(name.to_string()),
            mapping: Mapping::Mmap(map),
            owned_path: None,
        })
    }
}

#[cfg(unix)]
impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Some(path) = self.owned_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("删除共享内存 {} 失败: {}", path.display(), e);
                }
            }
        }
    }
}

#[cfg(windows)]
impl SharedRegion {
    pub fn create_or_open(name: &str, size: usize) -> Result<Self, ChannelError> {
        let name = check_name(name)?;
        check_size(size)?;
        Ok(Self {
            name: Some(name.to_string()),
            mapping: Mapping::View(win32::MappedView::create_or_open(name, size)?),
        })
    }

    pub fn open(name: &str, size: usize) -> Result<Self, ChannelError> {
        let name = check_name(name)?;
        check_size(size)?;
        Ok(Self {
            name: Some(name.to_string()),
            mapping: Mapping::View(win32::MappedView::open(name, size)?),
        })
    }
}

#[cfg(windows)]
mod win32 {
    use std::io;

    use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
    use windows::Win32::System::Memory::{
        CreateFileMappingW, FILE_MAP_ALL_ACCESS, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile,
        OpenFileMappingW, PAGE_READWRITE, UnmapViewOfFile,
    };
    use windows::core::HSTRING;

    pub struct MappedView {
        handle: HANDLE,
        view: MEMORY_MAPPED_VIEW_ADDRESS,
        len: usize,
    }

    // SAFETY: 句柄与映射视图可以在线程间转移，访问由上层的锁约束
    unsafe impl Send for MappedView {}
    unsafe impl Sync for MappedView {}

    impl MappedView {
        pub fn create_or_open(name: &str, size: usize) -> io::Result<Self> {
            let wide = HSTRING::from(name);
            let handle = unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    None,
                    PAGE_READWRITE,
                    ((size as u64) >> 32) as u32,
                    size as u32,
                    &wide,
                )
            }
            .map_err(io::Error::other)?;
            Self::map(handle, size)
        }

        pub fn open(name: &str, size: usize) -> io::Result<Self> {
            let wide = HSTRING::from(name);
            let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, &wide) }
                .map_err(io::Error::other)?;
            Self::map(handle, size)
        }

        fn map(handle: HANDLE, size: usize) -> io::Result<Self> {
            let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
            if view.Value.is_null() {
                let err = io::Error::last_os_error();
                unsafe {
                    let _ = CloseHandle(handle);
                }
                return Err(err);
            }
            Ok(Self {
                handle,
                view,
                len: size,
            })
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn as_slice(&self) -> &[u8] {
            // SAFETY: 视图至少 len 字节，生命周期与 self 相同
            unsafe { std::slice::from_raw_parts(self.view.Value as *const u8, self.len) }
        }

        pub fn as_mut_slice(&mut self) -> &mut [u8] {
            // SAFETY: 同上，且 &mut self 保证独占
            unsafe { std::slice::from_raw_parts_mut(self.view.Value as *mut u8, self.len) }
        }
    }

    impl Drop for MappedView {
        fn drop(&mut self) {
            unsafe {
                let _ = UnmapViewOfFile(self.view);
                let _ = CloseHandle(self.handle);
            }
        }
    }
}
