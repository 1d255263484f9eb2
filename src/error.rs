use thiserror::Error;

/// GPU 侧错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("GPU 设备丢失: {reason}")]
    DeviceLost { reason: String },

    #[error("GPU 资源分配失败: {reason}")]
    OutOfMemory { reason: String },

    #[error("GPU 不支持: {feature}")]
    Unsupported { feature: String },

    #[error("GPU 操作失败: {reason}")]
    Failed { reason: String },
}

impl GpuError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// 设备丢失与功能不支持会终止整条流水线，其余错误只影响当前帧
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost { .. } | Self::Unsupported { .. })
    }
}

/// 屏幕复制源错误（超时不是错误，由 `Ok(None)` 表示）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("显示设备繁忙: {reason}")]
    Busy { reason: String },

    #[error("屏幕复制会话失效")]
    AccessLost,

    #[error("屏幕复制失败: {reason}")]
    Fatal { reason: String },
}

impl CaptureError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::AccessLost)
    }
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("共享内存名称无效: {name:?}")]
    InvalidName { name: String },

    #[error("共享内存大小无效: {size}")]
    InvalidSize { size: usize },

    #[error("共享内存布局不匹配: {reason}")]
    LayoutMismatch { reason: String },

    #[error("当前平台不支持跨进程信号")]
    Unsupported,

    #[error("共享内存 IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("配置无效: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 终止流水线的错误，由持有线程的一方接收
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("捕获重试 {attempts} 次后仍失败: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: CaptureError,
    },

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{thread} 线程异常退出")]
    ThreadPanicked { thread: &'static str },

    #[error("线程创建失败: {0}")]
    Spawn(#[from] std::io::Error),
}
