use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::capture::{CaptureLoop, CaptureSettings, DisplaySource};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::export::{ExportLoop, FrameDumper, FrameSink};
use crate::gpu::{FrameResizer, GpuDevice};
use crate::ring::{FenceWait, FrameRing, RingMonitor};
use crate::stats::{PipelineStats, StatsSnapshot};

pub struct Pipeline;

impl Pipeline {
    /// 校验配置，建立环形缓冲区并启动两个线程
    pub fn start<D, S, R>(
        config: &PipelineConfig,
        device: Arc<D>,
        source: S,
        resizer: R,
        sink: Arc<dyn FrameSink>,
    ) -> Result<RunningPipeline, PipelineError>
    where
        D: GpuDevice,
        S: DisplaySource<Image = D::Image> + 'static,
        R: FrameResizer<D> + 'static,
    {
        config.validate()?;
        let fence_wait = FenceWait {
            attempts: config.fence_wait_attempts,
            step: Duration::from_millis(config.fence_wait_step_ms),
        };
        let (producer, consumer) =
            FrameRing::split::<D::Image, D::Fence>(config.ring_capacity, device.fence(), fence_wait);
        let monitor = producer.monitor();
        let stats = Arc::new(PipelineStats::default());
        let cancel = CancellationToken::new();

        let mut export = ExportLoop::new(
            device.clone(),
            consumer,
            sink.clone(),
            stats.clone(),
            cancel.clone(),
            Duration::from_millis(config.export_idle_sleep_ms),
        );
        if let Some(dump) = &config.debug_dump {
            match FrameDumper::new(&dump.dir, dump.format, dump.every_n) {
                Ok(dumper) => export = export.with_dumper(dumper),
                Err(e) => error!("调试落盘不可用: {:#}", e),
            }
        }
        let capture = CaptureLoop::new(
            source,
            device,
            resizer,
            producer,
            stats.clone(),
            cancel.clone(),
            CaptureSettings::from_config(config),
        );

        let export = spawn_loop("export", cancel.clone(), move || export.run())?;
        let capture = match spawn_loop("capture", cancel.clone(), move || capture.run()) {
            Ok(handle) => handle,
            Err(e) => {
                cancel.cancel();
                let _ = export.join();
                return Err(e);
            }
        };
        info!(
            "流水线已启动: 输出 {}x{}, 缓冲区 {}",
            config.output_width, config.output_height, config.ring_capacity
        );

        Ok(RunningPipeline {
            cancel,
            stats,
            monitor,
            sink,
            capture: Some(capture),
            export: Some(export),
        })
    }
}

/// 线程退出时如果带着错误，取消另一边
fn spawn_loop<F>(
    name: &'static str,
    cancel: CancellationToken,
    body: F,
) -> Result<JoinHandle<Result<(), PipelineError>>, PipelineError>
where
    F: FnOnce() -> Result<(), PipelineError> + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let result = body();
            if let Err(e) = &result {
                error!("{} 线程异常结束: {}", name, e);
                cancel.cancel();
            }
            result
        })?;
    Ok(handle)
}

pub struct RunningPipeline {
    cancel: CancellationToken,
    stats: Arc<PipelineStats>,
    monitor: RingMonitor,
    sink: Arc<dyn FrameSink>,
    capture: Option<JoinHandle<Result<(), PipelineError>>>,
    export: Option<JoinHandle<Result<(), PipelineError>>>,
}

impl RunningPipeline {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.monitor, self.sink.counters())
    }

    /// 任一线程已经退出
    pub fn is_finished(&self) -> bool {
        let done = |h: &Option<JoinHandle<_>>| h.as_ref().is_none_or(|h| h.is_finished());
        done(&self.capture) || done(&self.export)
    }

    pub fn shutdown(self) -> Result<StatsSnapshot, PipelineError> {
        self.cancel.cancel();
        self.join()
    }

    /// 等两个线程都退出；先返回捕获线程的错误
    pub fn join(mut self) -> Result<StatsSnapshot, PipelineError> {
        let capture = join_loop("capture", self.capture.take());
        let export = join_loop("export", self.export.take());
        let snapshot = self.stats();
        capture?;
        export?;
        Ok(snapshot)
    }
}

fn join_loop(
    name: &'static str,
    handle: Option<JoinHandle<Result<(), PipelineError>>>,
) -> Result<(), PipelineError> {
    match handle.map(JoinHandle::join) {
        None | Some(Ok(Ok(()))) => Ok(()),
        Some(Ok(Err(e))) => Err(e),
        Some(Err(_)) => Err(PipelineError::ThreadPanicked { thread: name }),
    }
}

impl Drop for RunningPipeline {
    fn drop(&mut self) {
        if self.capture.is_some() || self.export.is_some() {
            self.cancel.cancel();
            let _ = join_loop("capture", self.capture.take());
            let _ = join_loop("export", self.export.take());
        }
    }
}
