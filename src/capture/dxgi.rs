use std::sync::Arc;
use std::time::Duration;

use windows::Win32::System::Performance::QueryPerformanceFrequency;

use windows_capture::dxgi_duplication_api::{
    DxgiDuplicationApi, DxgiDuplicationFormat, Error as DxgiError,
};
use windows_capture::monitor::Monitor;

use super::{DisplayFrame, DisplaySource};
use crate::error::CaptureError;
use crate::gpu::host::{HostDevice, HostImage};
use crate::gpu::{ImageDesc, PixelFormat};

pub struct DxgiDisplay {
    dup: DxgiDuplicationApi,
    device: Arc<HostDevice>,
    width: u32,
    height: u32,
    nopad_buffer: Vec<u8>,
    /// QPC 每秒计数
    qpc_frequency: u64,
}

// SAFETY: 复制会话只在捕获线程内使用，创建后整体移交给该线程
unsafe impl Send for DxgiDisplay {}

fn create_dup() -> Result<DxgiDuplicationApi, CaptureError> {
    let monitor = Monitor::primary().map_err(|e| CaptureError::Fatal {
        reason: format!("获取主显示器失败: {}", e),
    })?;
    DxgiDuplicationApi::new_options(monitor, &[DxgiDuplicationFormat::Bgra8]).map_err(|e| {
        CaptureError::Busy {
            reason: format!("创建 DXGI 复制会话失败: {}", e),
        }
    })
}

impl DxgiDisplay {
    pub fn new(device: Arc<HostDevice>) -> Result<Self, CaptureError> {
        let dup = create_dup()?;
        let (width, height) = (dup.width(), dup.height());
        let mut frequency = 0i64;
        unsafe { QueryPerformanceFrequency(&mut frequency) }.map_err(|e| {
            CaptureError::Fatal {
                reason: format!("读取 QPC 频率失败: {}", e),
            }
        })?;
        tracing::info!("DXGI 复制会话已创建: {}x{}", width, height);
        Ok(Self {
            dup,
            device,
            width,
            height,
            nopad_buffer: Vec::new(),
            qpc_frequency: frequency.max(1) as u64,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

fn qpc_to_duration(ticks: u64, frequency: u64) -> Duration {
    let secs = ticks / frequency;
    let nanos = (ticks % frequency) as u128 * 1_000_000_000 / frequency as u128;
    Duration::new(secs, nanos as u32)
}

impl DisplaySource for DxgiDisplay {
    type Image = HostImage;

    fn try_acquire_next_frame(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<DisplayFrame<HostImage>>, CaptureError> {
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        match self.dup.acquire_next_frame(timeout_ms) {
            Ok(mut frame) => {
                // LastPresentTime 为 0 表示只有光标或元数据变化
                let present_qpc = frame.frame_info().LastPresentTime;
                let frequency = self.qpc_frequency;
                let presented_at =
                    (present_qpc > 0).then(|| qpc_to_duration(present_qpc as u64, frequency));
                let buffer = frame.buffer().map_err(|e| CaptureError::Busy {
                    reason: format!("获取帧缓冲失败: {}", e),
                })?;
                let bytes = buffer.as_nopadding_buffer(&mut self.nopad_buffer);
                let desc = ImageDesc::new(self.width, self.height, PixelFormat::Bgra8);
                if bytes.len() != desc.tight_len() {
                    // 分辨率变化，重建会话后按新尺寸继续
                    return Err(CaptureError::AccessLost);
                }
                let image = self
                    .device
                    .upload(desc, bytes)
                    .map_err(|e| CaptureError::Fatal {
                        reason: e.to_string(),
                    })?;
                Ok(Some(DisplayFrame {
                    image,
                    presented_at,
                }))
            }
            Err(DxgiError::Timeout) => Ok(None),
            Err(DxgiError::AccessLost) => Err(CaptureError::AccessLost),
            Err(e) => Err(CaptureError::Fatal {
                reason: e.to_string(),
            }),
        }
    }

    fn release_frame(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn reset(&mut self) -> Result<(), CaptureError> {
        self.dup = create_dup()?;
        self.width = self.dup.width();
        self.height = self.dup.height();
        Ok(())
    }
}
