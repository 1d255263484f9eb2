use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use framepipe::capture::SyntheticDisplay;
use framepipe::config::{DumpConfig, SourceKind};
use framepipe::export::FrameSink;
use framepipe::gpu::host::{HostDevice, HostResizer};
use framepipe::shm::{ChannelLayout, SharedFrameChannel, SharedFrameReader};
use framepipe::stats::StatsSnapshot;
use framepipe::{Pipeline, PipelineConfig, RunningPipeline};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SourceArg {
    Synthetic,
    Display,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LayoutArg {
    Raw,
    DoubleBuffered,
}

#[derive(Parser, Debug)]
#[command(
    name = "framepipe",
    version,
    about = "采集屏幕帧，缩放后写入共享内存供其他进程读取"
)]
struct Cli {
    /// JSON 配置文件，不存在时使用默认配置
    #[arg(short = 'c', long = "config", default_value = "framepipe.json")]
    config: PathBuf,

    /// 目标帧率，不设置则不限速
    #[arg(long = "fps")]
    fps: Option<f64>,

    #[arg(long = "width")]
    width: Option<u32>,

    #[arg(long = "height")]
    height: Option<u32>,

    /// 环形缓冲区容量
    #[arg(long = "capacity")]
    capacity: Option<usize>,

    #[arg(long = "source", value_enum)]
    source: Option<SourceArg>,

    #[arg(long = "layout", value_enum)]
    layout: Option<LayoutArg>,

    /// 打开调试落盘并写到该目录
    #[arg(long = "dump-dir")]
    dump_dir: Option<PathBuf>,

    /// 作为读端连接已有的通道
    #[arg(long = "read", default_value_t = false)]
    read: bool,
}

impl Cli {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(fps) = self.fps {
            config.target_fps = Some(fps);
        }
        if let Some(width) = self.width {
            config.output_width = width;
        }
        if let Some(height) = self.height {
            config.output_height = height;
        }
        if let Some(capacity) = self.capacity {
            config.ring_capacity = capacity;
        }
        if let Some(source) = self.source {
            config.source.kind = match source {
                SourceArg::Synthetic => SourceKind::Synthetic,
                SourceArg::Display => SourceKind::Display,
            };
        }
        if let Some(layout) = self.layout {
            config.shared_memory.layout = match layout {
                LayoutArg::Raw => ChannelLayout::Raw,
                LayoutArg::DoubleBuffered => ChannelLayout::DoubleBuffered,
            };
        }
        if let Some(dir) = &self.dump_dir {
            let dump = config.debug_dump.get_or_insert_with(DumpConfig::default);
            dump.dir = dir.clone();
        }
    }
}

fn init_tracing() {
    let default_filter = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = PipelineConfig::load(&cli.config)?;
    cli.apply(&mut config);
    config.validate().context("配置无效")?;

    if cli.read {
        return run_reader(config).await;
    }

    let (width, height) = (config.output_width, config.output_height);
    let device = Arc::new(HostDevice::new());
    let resizer = HostResizer::new(device.clone(), width, height);
    let channel = Arc::new(
        SharedFrameChannel::create(&config.shared_memory, width, height)
            .context("创建共享内存通道失败")?,
    );
    info!(
        "共享内存 {} ({:?}, {} 字节/帧), 就绪信号 {}",
        config.shared_memory.map_name,
        config.shared_memory.layout,
        channel.payload_size(),
        config.shared_memory.event_name
    );
    let sink: Arc<dyn FrameSink> = channel;

    let pipeline = match config.source.kind {
        SourceKind::Synthetic => {
            let source = SyntheticDisplay::new(
                device.clone(),
                config.source.width,
                config.source.height,
                config.source.refresh_hz,
            );
            Pipeline::start(&config, device, source, resizer, sink)?
        }
        SourceKind::Display => start_display(&config, device, resizer, sink)?,
    };

    supervise(pipeline, Duration::from_millis(config.stats_interval_ms)).await
}

#[cfg(windows)]
fn start_display(
    config: &PipelineConfig,
    device: Arc<HostDevice>,
    resizer: HostResizer,
    sink: Arc<dyn FrameSink>,
) -> anyhow::Result<RunningPipeline> {
    let source = framepipe::capture::dxgi::DxgiDisplay::new(device.clone())
        .context("初始化 DXGI 桌面复制失败")?;
    Ok(Pipeline::start(config, device, source, resizer, sink)?)
}

#[cfg(not(windows))]
fn start_display(
    _config: &PipelineConfig,
    _device: Arc<HostDevice>,
    _resizer: HostResizer,
    _sink: Arc<dyn FrameSink>,
) -> anyhow::Result<RunningPipeline> {
    anyhow::bail!("当前平台不支持桌面复制，请使用 --source synthetic")
}

fn log_stats(stats: &StatsSnapshot) {
    let iv = &stats.intervals;
    info!(
        "fps: {:.1} 间隔 avg {:.2}ms min {:.2}ms max {:.2}ms last {:.2}ms 占用 {:.0}% 捕获 {} 导出 {} 跳过 {} fence超时 {} 覆盖 {} 共享内存写入 {} 丢弃 {}",
        iv.fps,
        iv.avg_ms,
        iv.min_ms,
        iv.max_ms,
        iv.last_ms,
        stats.occupancy * 100.0,
        stats.frames_captured,
        stats.frames_exported,
        stats.frames_skipped,
        stats.fence_timeouts,
        stats.ring_overwritten,
        stats.channel.frames_written,
        stats.channel.frames_dropped,
    );
}

async fn supervise(pipeline: RunningPipeline, interval: Duration) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("监听 Ctrl+C 失败")?;
                info!("收到 Ctrl+C，正在停止");
                break;
            }
            _ = ticker.tick() => {
                log_stats(&pipeline.stats());
                if pipeline.is_finished() {
                    break;
                }
            }
        }
    }

    let snapshot = tokio::task::spawn_blocking(move || pipeline.shutdown())
        .await
        .context("等待流水线退出失败")??;
    info!(
        "最终统计: {}",
        serde_json::to_string(&snapshot).context("序列化统计失败")?
    );
    Ok(())
}

async fn run_reader(config: PipelineConfig) -> anyhow::Result<()> {
    let mut reader = SharedFrameReader::open(
        &config.shared_memory,
        config.output_width,
        config.output_height,
    )
    .context("打开共享内存通道失败，写端是否已经启动？")?;
    info!("读端已连接 {}", config.shared_memory.map_name);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let mut worker = tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
        let mut buf = Vec::with_capacity(reader.payload_size());
        let mut received = 0u64;
        let mut window = 0u64;
        let mut window_start = Instant::now();
        while !token.is_cancelled() {
            if !reader.wait_ready(Duration::from_millis(100))? {
                continue;
            }
            match reader.read_latest(&mut buf) {
                Some(len) => {
                    received += 1;
                    window += 1;
                    debug!("收到一帧 {} 字节", len);
                }
                None => debug!("没有读到完整帧"),
            }
            let elapsed = window_start.elapsed();
            if elapsed >= Duration::from_secs(1) {
                info!(
                    "读端 fps: {:.1}, 累计 {} 帧",
                    window as f64 / elapsed.as_secs_f64(),
                    received
                );
                window = 0;
                window_start = Instant::now();
            }
        }
        Ok(received)
    });

    let finished_early = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("监听 Ctrl+C 失败")?;
            None
        }
        res = &mut worker => Some(res),
    };
    let received = match finished_early {
        Some(res) => res.context("读端线程异常")??,
        None => {
            cancel.cancel();
            worker.await.context("读端线程异常")??
        }
    };
    info!("读端退出，共收到 {} 帧", received);
    Ok(())
}
