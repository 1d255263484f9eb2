pub mod dump;
pub mod rowcopy;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use dump::{DumpFormat, FrameDumper};
pub use rowcopy::{CopyStrategy, RowCopier};

use crate::error::PipelineError;
use crate::gpu::{GpuDevice, GpuError, GpuImage, ImageDesc};
use crate::ring::FrameConsumer;
use crate::shm::WriteOutcome;
use crate::stats::{ChannelCounters, PipelineStats};

/// 导出帧的去处
pub trait FrameSink: Send + Sync {
    /// `bytes` 是紧凑排列的像素
    fn write_frame(&self, bytes: &[u8]) -> WriteOutcome;

    fn counters(&self) -> ChannelCounters {
        ChannelCounters::default()
    }
}

impl<S: FrameSink + ?Sized> FrameSink for Arc<S> {
    fn write_frame(&self, bytes: &[u8]) -> WriteOutcome {
        (**self).write_frame(bytes)
    }

    fn counters(&self) -> ChannelCounters {
        (**self).counters()
    }
}

/// 单次处理的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportStep {
    /// 缓冲区为空
    Idle,
    Exported(WriteOutcome),
    /// fence 没等到，帧未读取直接丢弃
    FenceTimeout,
    ReadbackFailed,
}

pub struct ExportLoop<D: GpuDevice> {
    device: Arc<D>,
    consumer: FrameConsumer<D::Image, D::Fence>,
    sink: Arc<dyn FrameSink>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    idle_sleep: Duration,
    copier: RowCopier,
    staging: Option<(ImageDesc, D::Staging)>,
    packed: Vec<u8>,
    dumper: Option<FrameDumper>,
}

impl<D: GpuDevice> ExportLoop<D> {
    pub fn new(
        device: Arc<D>,
        consumer: FrameConsumer<D::Image, D::Fence>,
        sink: Arc<dyn FrameSink>,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
        idle_sleep: Duration,
    ) -> Self {
        Self {
            device,
            consumer,
            sink,
            stats,
            cancel,
            idle_sleep,
            copier: RowCopier::detect(),
            staging: None,
            packed: Vec::new(),
            dumper: None,
        }
    }

    pub fn with_dumper(mut self, dumper: FrameDumper) -> Self {
        self.dumper = Some(dumper);
        self
    }

    pub fn run(mut self) -> Result<(), PipelineError> {
        info!("导出线程启动, 行拷贝路径 {:?}", self.copier.strategy());
        while !self.cancel.is_cancelled() {
            if self.step()? == ExportStep::Idle {
                thread::sleep(self.idle_sleep);
            }
        }
        info!("导出线程退出");
        Ok(())
    }

    /// 处理至多一帧
    pub fn step(&mut self) -> Result<ExportStep, PipelineError> {
        let Some(frame) = self.consumer.try_pop() else {
            return Ok(ExportStep::Idle);
        };

        if !self.consumer.wait_for_fence(frame.fence) {
            PipelineStats::bump(&self.stats.fence_timeouts);
            debug!("fence {} 超时，丢弃该帧", frame.fence);
            return Ok(ExportStep::FenceTimeout);
        }

        let desc = match self.read_back(&frame.image) {
            Ok(desc) => desc,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                PipelineStats::bump(&self.stats.readback_failures);
                warn!("读回失败: {}", e);
                return Ok(ExportStep::ReadbackFailed);
            }
        };
        // 像素已经在 CPU 侧，尽早归还 GPU 图像
        drop(frame);

        let outcome = self.sink.write_frame(&self.packed);
        if outcome == WriteOutcome::Rejected {
            PipelineStats::bump(&self.stats.sink_rejections);
        }
        PipelineStats::bump(&self.stats.frames_exported);
        if let Some(dumper) = self.dumper.as_mut() {
            dumper.offer(&self.packed, desc);
        }
        Ok(ExportStep::Exported(outcome))
    }

    fn read_back(&mut self, image: &D::Image) -> Result<ImageDesc, GpuError> {
        let desc = image.desc();
        let staging = match &mut self.staging {
            Some((d, staging)) if *d == desc => staging,
            slot => {
                debug!("创建 staging {}x{}", desc.width, desc.height);
                let staging = self.device.create_staging(desc)?;
                &mut slot.insert((desc, staging)).1
            }
        };
        self.device.copy_to_staging(image, staging)?;
        let mapped = self.device.map_staging(staging)?;
        self.packed.resize(desc.tight_len(), 0);
        self.copier.copy_rows(
            mapped.data,
            mapped.row_pitch,
            &mut self.packed,
            desc.row_bytes(),
            desc.height as usize,
        )?;
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::PixelFormat;
    use crate::gpu::host::{HostDevice, HostFence, HostImage};
    use crate::ring::{FenceWait, FrameProducer, FrameRing};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<Vec<u8>>>,
        limit: Option<usize>,
    }

    impl FrameSink for Collect {
        fn write_frame(&self, bytes: &[u8]) -> WriteOutcome {
            if self.limit.is_some_and(|limit| bytes.len() > limit) {
                return WriteOutcome::Rejected;
            }
            self.frames.lock().push(bytes.to_vec());
            WriteOutcome::Delivered
        }
    }

    struct Fixture {
        device: Arc<HostDevice>,
        producer: FrameProducer<HostImage, HostFence>,
        export: ExportLoop<HostDevice>,
        sink: Arc<Collect>,
        stats: Arc<PipelineStats>,
    }

    fn fixture(fence: HostFence, limit: Option<usize>) -> Fixture {
        let device = Arc::new(HostDevice::with_fence(64, Arc::new(fence)));
        let wait = FenceWait {
            attempts: 2,
            step: Duration::from_millis(1),
        };
        let (producer, consumer) = FrameRing::split(8, device.fence(), wait);
        let sink = Arc::new(Collect {
            limit,
            ..Default::default()
        });
        let stats = Arc::new(PipelineStats::default());
        let export = ExportLoop::new(
            device.clone(),
            consumer,
            sink.clone(),
            stats.clone(),
            CancellationToken::new(),
            Duration::from_millis(1),
        );
        Fixture {
            device,
            producer,
            export,
            sink,
            stats,
        }
    }

    fn frame(device: &HostDevice, w: u32, h: u32, seed: u8) -> (HostImage, Vec<u8>) {
        let desc = ImageDesc::new(w, h, PixelFormat::Rgba8);
        let pixels: Vec<u8> = (0..desc.tight_len()).map(|i| seed.wrapping_add(i as u8)).collect();
        (device.upload(desc, &pixels).unwrap(), pixels)
    }

    #[test]
    fn exports_tight_pixels_and_releases_images() {
        let mut f = fixture(HostFence::new(), None);
        let (img, pixels) = frame(&f.device, 5, 3, 1);
        f.producer.push(img).unwrap();
        assert_eq!(f.export.step().unwrap(), ExportStep::Exported(WriteOutcome::Delivered));
        assert_eq!(f.export.step().unwrap(), ExportStep::Idle);
        assert_eq!(*f.sink.frames.lock(), vec![pixels]);
        assert_eq!(f.device.live_images(), 0);
    }

    #[test]
    fn staging_follows_frame_size() {
        let mut f = fixture(HostFence::new(), None);
        for (w, h) in [(4, 4), (4, 4), (9, 2)] {
            let (img, pixels) = frame(&f.device, w, h, w as u8);
            f.producer.push(img).unwrap();
            f.export.step().unwrap();
            assert_eq!(f.sink.frames.lock().last(), Some(&pixels));
        }
    }

    #[test]
    fn unfinished_fence_drops_frame_unread() {
        let mut f = fixture(HostFence::deferred(), None);
        let (img, _) = frame(&f.device, 2, 2, 0);
        f.producer.push(img).unwrap();
        assert_eq!(f.export.step().unwrap(), ExportStep::FenceTimeout);
        assert!(f.sink.frames.lock().is_empty());
        assert_eq!(f.device.live_images(), 0);
        assert_eq!(
            f.stats
                .fence_timeouts
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        let (img, pixels) = frame(&f.device, 2, 2, 9);
        let fence = f.producer.push(img).unwrap();
        f.device.host_fence().complete_through(fence);
        assert!(matches!(f.export.step().unwrap(), ExportStep::Exported(_)));
        assert_eq!(*f.sink.frames.lock(), vec![pixels]);
    }

    #[test]
    fn sink_rejection_is_counted() {
        let mut f = fixture(HostFence::new(), Some(8));
        let (img, _) = frame(&f.device, 4, 4, 0);
        f.producer.push(img).unwrap();
        assert_eq!(
            f.export.step().unwrap(),
            ExportStep::Exported(WriteOutcome::Rejected)
        );
        let load = |c: &std::sync::atomic::AtomicU64| c.load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(load(&f.stats.sink_rejections), 1);
        assert_eq!(load(&f.stats.frames_exported), 1);
    }

    #[test]
    fn run_returns_after_cancel() {
        let f = fixture(HostFence::new(), None);
        let cancel = f.export.cancel.clone();
        let handle = thread::spawn(move || f.export.run());
        thread::sleep(Duration::from_millis(10));
        cancel.cancel();
        handle.join().unwrap().unwrap();
    }
}
