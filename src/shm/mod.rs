pub mod region;
pub mod signal;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use region::SharedRegion;
pub use signal::{LocalSignal, NamedSignal, ReadySignal};

use crate::config::SharedMemoryConfig;
use crate::error::ChannelError;
use crate::export::FrameSink;
use crate::stats::ChannelCounters;

// DoubleBuffered 头部（小端）：
//  0 u32 magic      4 u16 version   6 u16 layout
//  8 u64 begun     16 u64 published
// 24 u32 active    28 u32 reserved
// 32 u32 len[0]    36 u32 len[1]
// 40 u32 width     44 u32 height    48..64 reserved
pub const HEADER_LEN: usize = 64;
pub const HEADER_MAGIC: u32 = 0x4650_4631; // "FPF1"
pub const HEADER_VERSION: u16 = 1;

const READ_ATTEMPTS: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelLayout {
    /// 无头部，后写覆盖先写；写得快时读端可能读到撕裂的帧
    #[default]
    Raw,
    /// 头部加两块缓冲，写非活动缓冲后切换索引
    DoubleBuffered,
}

impl ChannelLayout {
    pub fn region_size(self, payload: usize) -> usize {
        match self {
            Self::Raw => payload,
            Self::DoubleBuffered => HEADER_LEN + payload * 2,
        }
    }

    fn tag(self) -> u16 {
        match self {
            Self::Raw => 0,
            Self::DoubleBuffered => 1,
        }
    }
}

/// 一次写入的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 已写入并置位信号
    Delivered,
    /// 已写入，但上一次信号还没被读端消费
    SignalPending,
    /// 已写入，置位信号失败
    SignalFailed,
    /// 超过缓冲区大小，什么都没写
    Rejected,
}

impl WriteOutcome {
    pub fn is_written(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// 头部字段的原子视图
struct Header {
    base: *mut u8,
}

impl Header {
    /// # Safety
    /// `base` 指向至少 `HEADER_LEN` 字节、8 字节对齐的映射内存，且在使用期间有效
    unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }

    fn u64_at(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: 偏移是 8 的倍数，映射按页对齐
        unsafe { AtomicU64::from_ptr(self.base.add(offset).cast()) }
    }

    fn u32_at(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: 偏移是 4 的倍数
        unsafe { AtomicU32::from_ptr(self.base.add(offset).cast()) }
    }

    fn magic(&self) -> &AtomicU32 {
        self.u32_at(0)
    }

    fn version_and_layout(&self) -> &AtomicU32 {
        self.u32_at(4)
    }

    fn begun(&self) -> &AtomicU64 {
        self.u64_at(8)
    }

    fn published(&self) -> &AtomicU64 {
        self.u64_at(16)
    }

    fn active(&self) -> &AtomicU32 {
        self.u32_at(24)
    }

    fn len(&self, buffer: usize) -> &AtomicU32 {
        self.u32_at(32 + buffer * 4)
    }

    fn width(&self) -> &AtomicU32 {
        self.u32_at(40)
    }

    fn height(&self) -> &AtomicU32 {
        self.u32_at(44)
    }

    fn init(&self, width: u32, height: u32) {
        let tag = HEADER_VERSION as u32 | (ChannelLayout::DoubleBuffered.tag() as u32) << 16;
        self.begun().store(0, Ordering::Relaxed);
        self.published().store(0, Ordering::Relaxed);
        self.active().store(0, Ordering::Relaxed);
        self.len(0).store(0, Ordering::Relaxed);
        self.len(1).store(0, Ordering::Relaxed);
        self.width().store(width, Ordering::Relaxed);
        self.height().store(height, Ordering::Relaxed);
        self.version_and_layout().store(tag, Ordering::Relaxed);
        self.magic().store(HEADER_MAGIC, Ordering::Release);
    }

    fn check(&self, width: u32, height: u32) -> Result<(), ChannelError> {
        let magic = self.magic().load(Ordering::Acquire);
        if magic != HEADER_MAGIC {
            return Err(ChannelError::LayoutMismatch {
                reason: format!("头部标识 {:#x} 不正确，写端可能未初始化", magic),
            });
        }
        let tag = self.version_and_layout().load(Ordering::Relaxed);
        if tag as u16 != HEADER_VERSION {
            return Err(ChannelError::LayoutMismatch {
                reason: format!("头部版本 {} 不支持", tag as u16),
            });
        }
        let (w, h) = (
            self.width().load(Ordering::Relaxed),
            self.height().load(Ordering::Relaxed),
        );
        if (w, h) != (width, height) {
            return Err(ChannelError::LayoutMismatch {
                reason: format!("写端分辨率 {}x{}，读端期望 {}x{}", w, h, width, height),
            });
        }
        Ok(())
    }
}

fn payload_len(width: u32, height: u32) -> Result<usize, ChannelError> {
    let size = width as usize * height as usize * 4;
    if size == 0 {
        return Err(ChannelError::InvalidSize { size });
    }
    Ok(size)
}

/// 从映射中取出最新一帧，返回写入 `out` 的字节数
///
/// # Safety
/// `base` 指向按 `layout` 布局、长度至少 `layout.region_size(payload)` 的映射
unsafe fn read_mapped(
    base: *mut u8,
    layout: ChannelLayout,
    payload: usize,
    out: &mut Vec<u8>,
) -> Option<usize> {
    match layout {
        ChannelLayout::Raw => {
            out.resize(payload, 0);
            // SAFETY: 调用方保证映射至少 payload 字节
            unsafe { std::ptr::copy_nonoverlapping(base, out.as_mut_ptr(), payload) };
            Some(payload)
        }
        ChannelLayout::DoubleBuffered => {
            // SAFETY: 同上
            let header = unsafe { Header::new(base) };
            for _ in 0..READ_ATTEMPTS {
                let published = header.published().load(Ordering::Acquire);
                if published == 0 {
                    return None;
                }
                let active = header.active().load(Ordering::Acquire) as usize & 1;
                let len = (header.len(active).load(Ordering::Acquire) as usize).min(payload);
                out.resize(len, 0);
                // SAFETY: 缓冲区位于头部之后，长度不超过 payload
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        base.add(HEADER_LEN + active * payload),
                        out.as_mut_ptr(),
                        len,
                    )
                };
                fence(Ordering::Acquire);
                // 写端又开始写了第二帧，说明它可能正写在刚读的这块缓冲上
                if header.begun().load(Ordering::Relaxed) <= published + 1 {
                    return Some(len);
                }
                std::hint::spin_loop();
            }
            None
        }
    }
}

/// 写端
pub struct SharedFrameChannel {
    region: Mutex<SharedRegion>,
    signal: Box<dyn ReadySignal>,
    layout: ChannelLayout,
    payload_size: usize,
    frames_written: AtomicU64,
    frames_dropped: AtomicU64,
}

impl SharedFrameChannel {
    /// 按配置创建命名共享内存与就绪信号
    pub fn create(config: &SharedMemoryConfig, width: u32, height: u32) -> Result<Self, ChannelError> {
        if config.event_name.trim().is_empty() {
            return Err(ChannelError::InvalidName {
                name: config.event_name.clone(),
            });
        }
        let payload = payload_len(width, height)?;
        let region =
            SharedRegion::create_or_open(&config.map_name, config.layout.region_size(payload))?;
        let signal = NamedSignal::create_or_open(&config.event_name)?;
        debug!(
            "共享内存通道 {} / {} 已创建, 布局 {:?}, 帧大小 {}",
            config.map_name, config.event_name, config.layout, payload
        );
        Self::from_parts(region, Box::new(signal), config.layout, width, height)
    }

    pub fn from_parts(
        mut region: SharedRegion,
        signal: Box<dyn ReadySignal>,
        layout: ChannelLayout,
        width: u32,
        height: u32,
    ) -> Result<Self, ChannelError> {
        let payload_size = payload_len(width, height)?;
        let needed = layout.region_size(payload_size);
        if region.len() < needed {
            return Err(ChannelError::LayoutMismatch {
                reason: format!("共享内存 {} 字节，布局需要 {}", region.len(), needed),
            });
        }
        if layout == ChannelLayout::DoubleBuffered {
            // SAFETY: 区域至少 HEADER_LEN 字节，且在 &mut 下没有其他访问者
            unsafe { Header::new(region.as_mut_ptr()) }.init(width, height);
        }
        Ok(Self {
            region: Mutex::new(region),
            signal,
            layout,
            payload_size,
            frames_written: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        })
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn counters(&self) -> ChannelCounters {
        ChannelCounters {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn write(&self, bytes: &[u8]) -> WriteOutcome {
        if bytes.len() > self.payload_size {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("帧大小 {} 超过共享内存 {}，丢弃", bytes.len(), self.payload_size);
            return WriteOutcome::Rejected;
        }

        {
            let mut region = self.region.lock();
            let base = region.as_mut_ptr();
            match self.layout {
                ChannelLayout::Raw => {
                    region.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
                }
                ChannelLayout::DoubleBuffered => {
                    // SAFETY: from_parts 检查过区域大小，写端互斥由锁保证
                    let header = unsafe { Header::new(base) };
                    let target = 1 - (header.active().load(Ordering::Relaxed) as usize & 1);
                    header.begun().fetch_add(1, Ordering::AcqRel);
                    fence(Ordering::Release);
                    // SAFETY: 目标缓冲区位于 [HEADER_LEN + target * payload, +payload)
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            bytes.as_ptr(),
                            base.add(HEADER_LEN + target * self.payload_size),
                            bytes.len(),
                        )
                    };
                    header.len(target).store(bytes.len() as u32, Ordering::Release);
                    header.active().store(target as u32, Ordering::Release);
                    header.published().fetch_add(1, Ordering::Release);
                }
            }
        }
        self.frames_written.fetch_add(1, Ordering::Relaxed);

        match self.signal.notify() {
            Ok(true) => WriteOutcome::Delivered,
            Ok(false) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                WriteOutcome::SignalPending
            }
            Err(e) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("置位就绪信号失败: {}", e);
                WriteOutcome::SignalFailed
            }
        }
    }

    /// 以读端的方式取出当前内容，同进程调试用
    pub fn read_latest(&self, out: &mut Vec<u8>) -> Option<usize> {
        let mut region = self.region.lock();
        // SAFETY: 区域大小在构造时检查过
        unsafe { read_mapped(region.as_mut_ptr(), self.layout, self.payload_size, out) }
    }
}

impl FrameSink for SharedFrameChannel {
    fn write_frame(&self, bytes: &[u8]) -> WriteOutcome {
        self.write(bytes)
    }

    fn counters(&self) -> ChannelCounters {
        SharedFrameChannel::counters(self)
    }
}

/// 读端，可以在另一个进程里
pub struct SharedFrameReader {
    region: SharedRegion,
    signal: Box<dyn ReadySignal>,
    layout: ChannelLayout,
    payload_size: usize,
}

impl SharedFrameReader {
    pub fn open(config: &SharedMemoryConfig, width: u32, height: u32) -> Result<Self, ChannelError> {
        let payload = payload_len(width, height)?;
        let region = SharedRegion::open(&config.map_name, config.layout.region_size(payload))?;
        let signal = NamedSignal::open(&config.event_name)?;
        Self::from_parts(region, Box::new(signal), config.layout, width, height)
    }

    pub fn from_parts(
        mut region: SharedRegion,
        signal: Box<dyn ReadySignal>,
        layout: ChannelLayout,
        width: u32,
        height: u32,
    ) -> Result<Self, ChannelError> {
        let payload_size = payload_len(width, height)?;
        let needed = layout.region_size(payload_size);
        if region.len() < needed {
            return Err(ChannelError::LayoutMismatch {
                reason: format!("共享内存 {} 字节，布局需要 {}", region.len(), needed),
            });
        }
        if layout == ChannelLayout::DoubleBuffered {
            // SAFETY: 区域至少 HEADER_LEN 字节
            unsafe { Header::new(region.as_mut_ptr()) }.check(width, height)?;
        }
        Ok(Self {
            region,
            signal,
            layout,
            payload_size,
        })
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// 等待写端的就绪信号
    pub fn wait_ready(&self, timeout: Duration) -> Result<bool, ChannelError> {
        Ok(self.signal.wait(timeout)?)
    }

    /// 复制最新一帧到 `out`；双缓冲布局下还没有帧或多次重试仍读不到完整帧时返回 `None`
    pub fn read_latest(&mut self, out: &mut Vec<u8>) -> Option<usize> {
        // SAFETY: 区域大小在构造时检查过
        unsafe { read_mapped(self.region.as_mut_ptr(), self.layout, self.payload_size, out) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn channel(layout: ChannelLayout, w: u32, h: u32) -> (SharedFrameChannel, Arc<LocalSignal>) {
        let signal = Arc::new(LocalSignal::new());
        let payload = (w * h * 4) as usize;
        let region = SharedRegion::anonymous(layout.region_size(payload)).unwrap();
        let channel =
            SharedFrameChannel::from_parts(region, Box::new(signal.clone()), layout, w, h).unwrap();
        (channel, signal)
    }

    #[test]
    fn oversized_payload_is_rejected_and_counted() {
        let (channel, signal) = channel(ChannelLayout::Raw, 4, 4);
        let size = channel.payload_size();
        assert_eq!(channel.write(&vec![7; size + 1]), WriteOutcome::Rejected);
        assert_eq!(
            channel.counters(),
            ChannelCounters {
                frames_written: 0,
                frames_dropped: 1
            }
        );
        assert!(!signal.is_pending());
        let mut out = Vec::new();
        channel.read_latest(&mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn exact_size_payload_is_written_in_full() {
        let (channel, signal) = channel(ChannelLayout::Raw, 4, 4);
        let frame: Vec<u8> = (0..channel.payload_size()).map(|i| i as u8).collect();
        assert_eq!(channel.write(&frame), WriteOutcome::Delivered);
        assert!(signal.is_pending());
        let mut out = Vec::new();
        assert_eq!(channel.read_latest(&mut out), Some(frame.len()));
        assert_eq!(out, frame);
    }

    #[test]
    fn latest_write_wins_and_pending_signal_is_counted() {
        let (channel, signal) = channel(ChannelLayout::Raw, 2, 2);
        let size = channel.payload_size();
        assert_eq!(channel.write(&vec![1; size]), WriteOutcome::Delivered);
        assert_eq!(channel.write(&vec![2; size]), WriteOutcome::SignalPending);
        assert_eq!(
            channel.counters(),
            ChannelCounters {
                frames_written: 2,
                frames_dropped: 1
            }
        );
        assert!(signal.wait(Duration::ZERO).unwrap());
        let mut out = Vec::new();
        channel.read_latest(&mut out);
        assert_eq!(out, vec![2; size]);
        assert_eq!(channel.write(&vec![3; size]), WriteOutcome::Delivered);
    }

    #[test]
    fn double_buffered_reads_latest_complete_frame() {
        let (channel, _signal) = channel(ChannelLayout::DoubleBuffered, 2, 2);
        let mut out = Vec::new();
        assert_eq!(channel.read_latest(&mut out), None);

        let size = channel.payload_size();
        for v in 1..=5u8 {
            assert!(channel.write(&vec![v; size]).is_written());
            assert_eq!(channel.read_latest(&mut out), Some(size));
            assert_eq!(out, vec![v; size]);
        }
        // 短帧只报告实际长度
        channel.write(&[9; 6]);
        assert_eq!(channel.read_latest(&mut out), Some(6));
        assert_eq!(out, vec![9; 6]);
    }

    #[test]
    fn region_too_small_for_layout() {
        let region = SharedRegion::anonymous(16).unwrap();
        let result = SharedFrameChannel::from_parts(
            region,
            Box::new(LocalSignal::new()),
            ChannelLayout::DoubleBuffered,
            2,
            2,
        );
        assert!(matches!(result, Err(ChannelError::LayoutMismatch { .. })));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reader_in_other_handle_sees_double_buffered_frames() {
        let pid = std::process::id();
        let config = SharedMemoryConfig {
            map_name: format!("framepipe-chan-test-{pid}"),
            event_name: format!("framepipe-chan-ready-{pid}"),
            layout: ChannelLayout::DoubleBuffered,
        };
        let writer = SharedFrameChannel::create(&config, 8, 4).unwrap();
        let mut reader = SharedFrameReader::open(&config, 8, 4).unwrap();
        assert!(matches!(
            SharedFrameReader::open(&config, 4, 4),
            Err(ChannelError::LayoutMismatch { .. })
        ));

        let frame = vec![0xAB; writer.payload_size()];
        assert_eq!(writer.write(&frame), WriteOutcome::Delivered);
        assert!(reader.wait_ready(Duration::from_secs(1)).unwrap());
        let mut out = Vec::new();
        assert_eq!(reader.read_latest(&mut out), Some(frame.len()));
        assert_eq!(out, frame);
    }
}
