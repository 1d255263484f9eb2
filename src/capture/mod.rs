pub mod synthetic;

#[cfg(windows)]
pub mod dxgi;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use synthetic::{SyntheticDisplay, SyntheticProbe};

use crate::config::PipelineConfig;
use crate::error::{CaptureError, PipelineError};
use crate::gpu::{FrameResizer, GpuDevice};
use crate::pacing::{FramePacer, PaceOutcome, SystemClock};
use crate::ring::FrameProducer;
use crate::stats::PipelineStats;

/// 显示源给出的一帧
pub struct DisplayFrame<I> {
    pub image: I,
    /// 呈现时间；为 `None` 时只是光标之类的更新，没有新画面
    pub presented_at: Option<Duration>,
}

/// 屏幕复制源
///
/// 每次成功的 `try_acquire_next_frame` 都必须配对一次 `release_frame`，
/// 超时返回 `Ok(None)`，此时不需要释放。
pub trait DisplaySource: Send {
    type Image;

    fn try_acquire_next_frame(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<DisplayFrame<Self::Image>>, CaptureError>;

    fn release_frame(&mut self) -> Result<(), CaptureError>;

    /// 会话失效后重建
    fn reset(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// 离开作用域时释放显示帧，所有分支都走这里
struct ReleaseGuard<'a, S: DisplaySource> {
    source: &'a mut S,
}

impl<S: DisplaySource> Drop for ReleaseGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.source.release_frame() {
            warn!("释放显示帧失败: {}", e);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureSettings {
    pub acquire_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub target_fps: Option<f64>,
    pub spin_threshold: Duration,
}

impl CaptureSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            max_retries: config.max_acquire_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            target_fps: config.target_fps,
            spin_threshold: Duration::from_micros(config.spin_threshold_us),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// 缩放、提交、入队
struct SubmitStage<D: GpuDevice, R> {
    device: Arc<D>,
    resizer: R,
    producer: FrameProducer<D::Image, D::Fence>,
    stats: Arc<PipelineStats>,
    last_present: Option<Duration>,
}

impl<D: GpuDevice, R: FrameResizer<D>> SubmitStage<D, R> {
    fn submit(&mut self, frame: &DisplayFrame<D::Image>) -> Result<(), PipelineError> {
        let Some(presented) = frame.presented_at else {
            PipelineStats::bump(&self.stats.frames_skipped);
            return Ok(());
        };
        if let Some(last) = self.last_present {
            self.stats.intervals.record(presented.saturating_sub(last));
        }
        self.last_present = Some(presented);

        let resized = match self.resizer.resize(&frame.image) {
            Ok(image) => image,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                PipelineStats::bump(&self.stats.resize_failures);
                warn!("缩放失败，跳过该帧: {}", e);
                return Ok(());
            }
        };
        let submitted = self
            .device
            .flush()
            .and_then(|()| self.producer.push(resized).map(|_| ()));
        match submitted {
            Ok(()) => {
                PipelineStats::bump(&self.stats.frames_captured);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                PipelineStats::bump(&self.stats.submit_failures);
                warn!("提交失败，跳过该帧: {}", e);
                Ok(())
            }
        }
    }
}

pub struct CaptureLoop<D: GpuDevice, S, R> {
    source: S,
    stage: SubmitStage<D, R>,
    cancel: CancellationToken,
    settings: CaptureSettings,
    pacer: Option<FramePacer<SystemClock>>,
}

impl<D, S, R> CaptureLoop<D, S, R>
where
    D: GpuDevice,
    S: DisplaySource<Image = D::Image>,
    R: FrameResizer<D>,
{
    pub fn new(
        source: S,
        device: Arc<D>,
        resizer: R,
        producer: FrameProducer<D::Image, D::Fence>,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
        settings: CaptureSettings,
    ) -> Self {
        let pacer = settings
            .target_fps
            .map(|fps| FramePacer::new(SystemClock, fps, settings.spin_threshold));
        Self {
            source,
            stage: SubmitStage {
                device,
                resizer,
                producer,
                stats,
                last_present: None,
            },
            cancel,
            settings,
            pacer,
        }
    }

    pub fn run(mut self) -> Result<(), PipelineError> {
        info!(
            "捕获线程启动, 目标帧率 {:?}, 缓冲区容量 {}",
            self.settings.target_fps,
            self.stage.producer.capacity()
        );
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.reset();
        }
        let mut failures = 0u32;

        while !self.cancel.is_cancelled() {
            let acquired = match self
                .source
                .try_acquire_next_frame(self.settings.acquire_timeout)
            {
                Ok(frame) => {
                    failures = 0;
                    frame
                }
                Err(e) if e.is_recoverable() => {
                    failures += 1;
                    PipelineStats::bump(&self.stage.stats.capture_retries);
                    if failures > self.settings.max_retries {
                        return Err(PipelineError::RetriesExhausted {
                            attempts: failures,
                            source: e,
                        });
                    }
                    warn!("捕获失败 ({}/{}): {}", failures, self.settings.max_retries, e);
                    if e == CaptureError::AccessLost {
                        match self.source.reset() {
                            Ok(()) => info!("屏幕复制会话已重建"),
                            Err(e) if e.is_recoverable() => warn!("重建会话失败: {}", e),
                            Err(e) => return Err(e.into()),
                        }
                    }
                    thread::sleep(self.settings.retry_backoff * failures);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let timed_out = acquired.is_none();
            if let Some(frame) = acquired {
                let _guard = ReleaseGuard {
                    source: &mut self.source,
                };
                self.stage.submit(&frame)?;
            }

            match self.pacer.as_mut() {
                Some(pacer) => {
                    if pacer.wait_next() == PaceOutcome::Overrun {
                        debug!("本轮超过一个完整间隔，重置节拍");
                    }
                }
                None if timed_out => thread::yield_now(),
                None => {}
            }
        }
        info!("捕获线程退出");
        Ok(())
    }
}
