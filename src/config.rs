use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::export::DumpFormat;
use crate::shm::ChannelLayout;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// 合成测试图案，所有平台可用
    #[default]
    Synthetic,
    /// DXGI 桌面复制，仅 Windows
    Display,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// 合成源的分辨率与刷新率
    pub width: u32,
    pub height: u32,
    pub refresh_hz: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Synthetic,
            width: 1920,
            height: 1080,
            refresh_hz: 60.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedMemoryConfig {
    pub map_name: String,
    pub event_name: String,
    pub layout: ChannelLayout,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            map_name: "framepipe_frames".to_string(),
            event_name: "framepipe_frame_ready".to_string(),
            layout: ChannelLayout::Raw,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    pub dir: PathBuf,
    pub format: DumpFormat,
    /// 每隔多少帧落盘一次
    pub every_n: u64,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("dump"),
            format: DumpFormat::Png,
            every_n: 60,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub output_width: u32,
    pub output_height: u32,
    pub ring_capacity: usize,
    /// 不设置时不限速，有新帧就处理
    pub target_fps: Option<f64>,
    pub acquire_timeout_ms: u64,
    pub max_acquire_retries: u32,
    pub retry_backoff_ms: u64,
    pub fence_wait_attempts: u32,
    pub fence_wait_step_ms: u64,
    pub export_idle_sleep_ms: u64,
    pub spin_threshold_us: u64,
    pub stats_interval_ms: u64,
    pub source: SourceConfig,
    pub shared_memory: SharedMemoryConfig,
    pub debug_dump: Option<DumpConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_width: 640,
            output_height: 480,
            ring_capacity: 128,
            target_fps: None,
            acquire_timeout_ms: 16,
            max_acquire_retries: 5,
            retry_backoff_ms: 2,
            fence_wait_attempts: 10,
            fence_wait_step_ms: 1,
            export_idle_sleep_ms: 2,
            spin_threshold_us: 1000,
            stats_interval_ms: 1000,
            source: SourceConfig::default(),
            shared_memory: SharedMemoryConfig::default(),
            debug_dump: None,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl PipelineConfig {
    /// 读取 JSON 配置；文件不存在时使用默认值
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("配置文件 {} 不存在，使用默认配置", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件 {} 失败", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("解析配置文件 {} 失败", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("序列化配置失败")?;
        std::fs::write(path, json).with_context(|| format!("写入配置文件 {} 失败", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_width == 0 || self.output_height == 0 {
            return Err(invalid(
                "output_width/output_height",
                format!("{}x{}", self.output_width, self.output_height),
            ));
        }
        if self.ring_capacity == 0 {
            return Err(invalid("ring_capacity", "必须大于 0"));
        }
        if let Some(fps) = self.target_fps {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(invalid("target_fps", format!("{} 不是正数", fps)));
            }
        }
        if self.fence_wait_attempts == 0 {
            return Err(invalid("fence_wait_attempts", "必须大于 0"));
        }
        if self.stats_interval_ms == 0 {
            return Err(invalid("stats_interval_ms", "必须大于 0"));
        }
        if self.source.kind == SourceKind::Synthetic
            && (self.source.width == 0 || self.source.height == 0)
        {
            return Err(invalid("source.width/source.height", "合成源尺寸不能为 0"));
        }
        if self.shared_memory.map_name.trim().is_empty() {
            return Err(invalid("shared_memory.map_name", "不能为空"));
        }
        if self.shared_memory.event_name.trim().is_empty() {
            return Err(invalid("shared_memory.event_name", "不能为空"));
        }
        if let Some(dump) = &self.debug_dump {
            if dump.every_n == 0 {
                return Err(invalid("debug_dump.every_n", "必须大于 0"));
            }
        }
        Ok(())
    }

    /// 导出帧的字节数（紧凑 RGBA）
    pub fn frame_bytes(&self) -> usize {
        self.output_width as usize * self.output_height as usize * 4
    }
}
