use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use super::{DisplayFrame, DisplaySource};
use crate::error::CaptureError;
use crate::gpu::host::{HostDevice, HostImage};
use crate::gpu::{GpuImage, ImageDesc, PixelFormat};

/// 取帧/释放/重建次数，可以在源被移进捕获线程后继续观察
#[derive(Clone, Default)]
pub struct SyntheticProbe {
    acquired: Arc<AtomicU64>,
    released: Arc<AtomicU64>,
    resets: Arc<AtomicU64>,
}

impl SyntheticProbe {
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    /// 已取出但还没释放的帧数
    pub fn outstanding(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Acquire)
    }
}

pub struct SyntheticDisplay {
    device: Arc<HostDevice>,
    desc: ImageDesc,
    /// 为零时每次调用都立即给出新帧
    refresh: Duration,
    started: Instant,
    frame_index: u64,
    held: bool,
    faults: VecDeque<CaptureError>,
    cursor_only_every: Option<u64>,
    pixels: Vec<u8>,
    probe: SyntheticProbe,
}

impl SyntheticDisplay {
    /// `refresh_hz <= 0` 表示不限速
    pub fn new(device: Arc<HostDevice>, width: u32, height: u32, refresh_hz: f64) -> Self {
        let refresh = if refresh_hz > 0.0 {
            Duration::from_secs_f64(1.0 / refresh_hz)
        } else {
            Duration::ZERO
        };
        Self {
            device,
            desc: ImageDesc::new(width, height, PixelFormat::Bgra8),
            refresh,
            started: Instant::now(),
            frame_index: 0,
            held: false,
            faults: VecDeque::new(),
            cursor_only_every: None,
            pixels: Vec::new(),
            probe: SyntheticProbe::default(),
        }
    }

    /// 依次在接下来的取帧调用中返回这些错误
    pub fn with_faults(mut self, faults: impl IntoIterator<Item = CaptureError>) -> Self {
        self.faults.extend(faults);
        self
    }

    /// 每 `n` 帧有一帧没有呈现时间
    pub fn with_cursor_only_every(mut self, n: u64) -> Self {
        self.cursor_only_every = Some(n.max(1));
        self
    }

    pub fn probe(&self) -> SyntheticProbe {
        self.probe.clone()
    }

    pub fn desc(&self) -> ImageDesc {
        self.desc
    }

    /// 等到下一个 vblank，超时返回 `None`
    fn wait_vblank(&mut self, timeout: Duration) -> Option<Duration> {
        let elapsed = self.started.elapsed();
        if self.refresh.is_zero() {
            self.frame_index += 1;
            return Some(elapsed);
        }
        let refresh_ns = self.refresh.as_nanos();
        let current = (elapsed.as_nanos() / refresh_ns) as u64;
        let next = current.max(self.frame_index) + 1;
        let vblank = vblank_at(refresh_ns, next);
        let wait = vblank.saturating_sub(elapsed);
        if wait > timeout {
            thread::sleep(timeout);
            return None;
        }
        thread::sleep(wait);
        self.frame_index = next;
        Some(vblank)
    }

    fn render(&mut self) -> Result<HostImage, CaptureError> {
        let (w, h) = (self.desc.width as usize, self.desc.height as usize);
        let t = self.frame_index as usize;
        let bar = (t * 4) % w.max(1);
        self.pixels.resize(self.desc.tight_len(), 0);
        self.pixels
            .par_chunks_exact_mut(w * 4)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, px) in row.chunks_exact_mut(4).enumerate() {
                    let on_bar = x.abs_diff(bar) < 4;
                    px[0] = if on_bar { 255 } else { (x * 255 / w.max(1)) as u8 };
                    px[1] = (y * 255 / h.max(1)) as u8;
                    px[2] = (t % 256) as u8;
                    px[3] = 255;
                }
            });
        self.device
            .upload(self.desc, &self.pixels)
            .map_err(|e| CaptureError::Fatal {
                reason: e.to_string(),
            })
    }
}

/// 第 `index` 个 vblank 的时刻，按纳秒 u128 计算避免帧号截断
fn vblank_at(refresh_ns: u128, index: u64) -> Duration {
    let ns = refresh_ns * index as u128;
    Duration::new((ns / 1_000_000_000) as u64, (ns % 1_000_000_000) as u32)
}

impl DisplaySource for SyntheticDisplay {
    type Image = HostImage;

    fn try_acquire_next_frame(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<DisplayFrame<HostImage>>, CaptureError> {
        if self.held {
            return Err(CaptureError::Fatal {
                reason: "上一帧尚未释放".into(),
            });
        }
        if let Some(fault) = self.faults.pop_front() {
            return Err(fault);
        }
        let Some(vblank) = self.wait_vblank(timeout) else {
            return Ok(None);
        };
        let image = self.render()?;
        let cursor_only = self
            .cursor_only_every
            .is_some_and(|n| self.frame_index % n == 0);
        self.held = true;
        self.probe.acquired.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(image.desc(), self.desc);
        Ok(Some(DisplayFrame {
            image,
            presented_at: (!cursor_only).then_some(vblank),
        }))
    }

    fn release_frame(&mut self) -> Result<(), CaptureError> {
        if !self.held {
            return Err(CaptureError::Fatal {
                reason: "没有可释放的帧".into(),
            });
        }
        self.held = false;
        self.probe.released.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), CaptureError> {
        self.held = false;
        self.probe.resets.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_must_pair() {
        let device = Arc::new(HostDevice::new());
        let mut display = SyntheticDisplay::new(device, 8, 4, 0.0);
        assert!(display.release_frame().is_err());
        let frame = display
            .try_acquire_next_frame(Duration::from_millis(1))
            .unwrap()
            .unwrap();
        assert_eq!(frame.image.desc(), ImageDesc::new(8, 4, PixelFormat::Bgra8));
        assert!(display.try_acquire_next_frame(Duration::ZERO).is_err());
        display.release_frame().unwrap();
        assert_eq!(display.probe().outstanding(), 0);
    }

    #[test]
    fn vblank_timestamps_are_on_the_refresh_grid() {
        let device = Arc::new(HostDevice::new());
        let mut display = SyntheticDisplay::new(device, 4, 4, 200.0);
        let mut stamps = Vec::new();
        while stamps.len() < 3 {
            if let Some(frame) = display
                .try_acquire_next_frame(Duration::from_millis(20))
                .unwrap()
            {
                stamps.push(frame.presented_at.unwrap());
                display.release_frame().unwrap();
            }
        }
        for pair in stamps.windows(2) {
            let delta = pair[1] - pair[0];
            assert!(delta >= Duration::from_millis(5));
            assert_eq!(delta.as_nanos() % Duration::from_millis(5).as_nanos(), 0);
        }
    }

    #[test]
    fn vblank_grid_survives_frame_index_past_u32() {
        let refresh = Duration::from_secs_f64(1.0 / 60.0).as_nanos();
        let index = u32::MAX as u64 + 10;
        let at = vblank_at(refresh, index);
        assert_eq!(at.as_nanos(), refresh * index as u128);
        assert!(at > vblank_at(refresh, u32::MAX as u64));
        assert_eq!(vblank_at(refresh, 1).as_nanos(), refresh);
    }

    #[test]
    fn short_timeout_returns_none() {
        let device = Arc::new(HostDevice::new());
        let mut display = SyntheticDisplay::new(device, 4, 4, 1.0);
        // 第一个 vblank 在 1 秒后
        assert!(
            display
                .try_acquire_next_frame(Duration::from_millis(1))
                .unwrap()
                .is_none()
        );
        assert_eq!(display.probe().acquired(), 0);
    }

    #[test]
    fn pattern_moves_between_frames() {
        let device = Arc::new(HostDevice::new());
        let mut display = SyntheticDisplay::new(device, 32, 2, 0.0);
        let a = display.try_acquire_next_frame(Duration::ZERO).unwrap().unwrap();
        let first = a.image.row(0).to_vec();
        display.release_frame().unwrap();
        let b = display.try_acquire_next_frame(Duration::ZERO).unwrap().unwrap();
        assert_ne!(first, b.image.row(0));
        display.release_frame().unwrap();
    }
}
