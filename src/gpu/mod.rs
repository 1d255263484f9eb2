pub mod host;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::error::GpuError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 桌面复制输出的格式
    Bgra8,
    /// 缩放步骤输出的格式
    Rgba8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        4
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl ImageDesc {
    pub const fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// 一行有效像素的字节数（不含设备对齐填充）
    pub const fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub const fn tight_len(&self) -> usize {
        self.row_bytes() * self.height as usize
    }
}

/// 独占的 GPU 图像句柄，drop 时释放底层资源且只释放一次
pub trait GpuImage: Send + 'static {
    fn desc(&self) -> ImageDesc;
}

/// GPU 侧单调递增计数器
pub trait Fence: Send + Sync + 'static {
    /// 在 GPU 队列中排入一次 signal，之前提交的工作全部完成后 `completed_value` 达到 `value`
    fn signal(&self, value: u64) -> Result<(), GpuError>;

    fn completed_value(&self) -> u64;

    /// 最多阻塞 `timeout`，返回 `completed_value() >= value`
    fn wait(&self, value: u64, timeout: Duration) -> bool;
}

/// 映射后可供 CPU 读取的 staging 内容
#[derive(Debug)]
pub struct MappedImage<'a> {
    pub data: &'a [u8],
    /// 设备实际的行跨度，可能大于 `desc.row_bytes()`
    pub row_pitch: usize,
    pub desc: ImageDesc,
}

pub trait GpuDevice: Send + Sync + 'static {
    type Image: GpuImage;
    type Staging: Send + 'static;
    type Fence: Fence;

    fn fence(&self) -> Arc<Self::Fence>;

    /// 提交已录制的命令，之后排入的 fence signal 才有意义
    fn flush(&self) -> Result<(), GpuError>;

    fn create_staging(&self, desc: ImageDesc) -> Result<Self::Staging, GpuError>;

    fn copy_to_staging(
        &self,
        image: &Self::Image,
        staging: &mut Self::Staging,
    ) -> Result<(), GpuError>;

    fn map_staging<'a>(&self, staging: &'a Self::Staging) -> Result<MappedImage<'a>, GpuError>;
}

/// 固定输出分辨率的缩放/归一化步骤
pub trait FrameResizer<D: GpuDevice>: Send {
    fn output_desc(&self) -> ImageDesc;

    /// 失败只影响当前帧，除非 `GpuError::is_fatal`
    fn resize(&mut self, src: &D::Image) -> Result<D::Image, GpuError>;
}
