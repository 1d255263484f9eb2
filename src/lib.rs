pub mod capture;
pub mod config;
pub mod error;
pub mod export;
pub mod gpu;
pub mod pacing;
pub mod pipeline;
pub mod ring;
pub mod shm;
pub mod stats;

pub use config::PipelineConfig;
pub use error::{CaptureError, ChannelError, ConfigError, GpuError, PipelineError};
pub use pipeline::{Pipeline, RunningPipeline};
