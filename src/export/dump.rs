use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, bail};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gpu::{ImageDesc, PixelFormat};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpFormat {
    #[default]
    Png,
    Bmp,
    /// 1x3xHxW 的 f32 小端原始数据，数值归一化到 [0, 1]
    Tensor,
}

impl DumpFormat {
    fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Bmp => "bmp",
            Self::Tensor => "f32",
        }
    }
}

/// 把紧凑的 4 通道像素转成 NCHW 张量，丢掉 alpha
pub fn to_nchw_tensor(pixels: &[u8], desc: ImageDesc) -> anyhow::Result<Array4<f32>> {
    if pixels.len() != desc.tight_len() {
        bail!(
            "像素长度 {} 与 {}x{} 不符",
            pixels.len(),
            desc.width,
            desc.height
        );
    }
    let (w, h) = (desc.width as usize, desc.height as usize);
    let order = match desc.format {
        PixelFormat::Rgba8 => [0, 1, 2],
        PixelFormat::Bgra8 => [2, 1, 0],
    };
    Ok(Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
        pixels[(y * w + x) * 4 + order[c]] as f32 / 255.0
    }))
}

/// 同步写一帧，返回写入的文件路径
pub fn write_dump(
    dir: &Path,
    index: u64,
    format: DumpFormat,
    pixels: &[u8],
    desc: ImageDesc,
) -> anyhow::Result<PathBuf> {
    let path = dir.join(format!(
        "frame_{:06}_{}x{}.{}",
        index,
        desc.width,
        desc.height,
        format.extension()
    ));
    match format {
        DumpFormat::Png | DumpFormat::Bmp => {
            let mut rgba = pixels.to_vec();
            if desc.format == PixelFormat::Bgra8 {
                rgba.chunks_exact_mut(4).for_each(|px| px.swap(0, 2));
            }
            let img = image::RgbaImage::from_raw(desc.width, desc.height, rgba)
                .context("像素长度与图像尺寸不符")?;
            let fmt = if format == DumpFormat::Png {
                image::ImageFormat::Png
            } else {
                image::ImageFormat::Bmp
            };
            img.save_with_format(&path, fmt)
                .with_context(|| format!("写入 {} 失败", path.display()))?;
        }
        DumpFormat::Tensor => {
            let tensor = to_nchw_tensor(pixels, desc)?;
            let bytes: Vec<u8> = tensor.iter().flat_map(|v| v.to_le_bytes()).collect();
            std::fs::write(&path, bytes)
                .with_context(|| format!("写入 {} 失败", path.display()))?;
        }
    }
    Ok(path)
}

pub struct FrameDumper {
    dir: PathBuf,
    format: DumpFormat,
    every: u64,
    seen: u64,
    written: Arc<AtomicU64>,
}

impl FrameDumper {
    pub fn new(dir: impl Into<PathBuf>, format: DumpFormat, every: u64) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("创建落盘目录 {} 失败", dir.display()))?;
        Ok(Self {
            dir,
            format,
            every: every.max(1),
            seen: 0,
            written: Arc::new(AtomicU64::new(0)),
        })
    }

    /// 已经写完的文件数
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// 计数一帧，轮到时复制一份交给后台写入
    pub fn offer(&mut self, pixels: &[u8], desc: ImageDesc) {
        self.seen += 1;
        if self.seen % self.every != 0 {
            return;
        }
        let dir = self.dir.clone();
        let format = self.format;
        let index = self.seen;
        let pixels = pixels.to_vec();
        let written = self.written.clone();
        rayon::spawn(move || match write_dump(&dir, index, format, &pixels, desc) {
            Ok(path) => {
                written.fetch_add(1, Ordering::Release);
                debug!("已落盘 {}", path.display());
            }
            Err(e) => warn!("调试落盘失败: {:#}", e),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn gradient(desc: ImageDesc) -> Vec<u8> {
        (0..desc.width * desc.height)
            .flat_map(|i| [i as u8, 100, 200, 255])
            .collect()
    }

    #[test]
    fn tensor_is_planar_and_normalized() {
        let desc = ImageDesc::new(3, 2, PixelFormat::Rgba8);
        let tensor = to_nchw_tensor(&gradient(desc), desc).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 2, 3]);
        assert_eq!(tensor[[0, 0, 1, 2]], 5.0 / 255.0);
        assert_eq!(tensor[[0, 1, 0, 0]], 100.0 / 255.0);
        assert_eq!(tensor[[0, 2, 1, 1]], 200.0 / 255.0);
    }

    #[test]
    fn bgra_tensor_swaps_channels() {
        let desc = ImageDesc::new(1, 1, PixelFormat::Bgra8);
        let tensor = to_nchw_tensor(&[10, 20, 30, 255], desc).unwrap();
        assert_eq!(tensor[[0, 0, 0, 0]], 30.0 / 255.0);
        assert_eq!(tensor[[0, 2, 0, 0]], 10.0 / 255.0);
    }

    #[test]
    fn png_roundtrips_through_image() {
        let dir = tempfile::tempdir().unwrap();
        let desc = ImageDesc::new(4, 3, PixelFormat::Rgba8);
        let pixels = gradient(desc);
        let path = write_dump(dir.path(), 7, DumpFormat::Png, &pixels, desc).unwrap();
        assert!(path.ends_with("frame_000007_4x3.png"));
        let back = image::open(&path).unwrap().to_rgba8();
        assert_eq!(back.into_raw(), pixels);
    }

    #[test]
    fn tensor_file_has_expected_size() {
        let dir = tempfile::tempdir().unwrap();
        let desc = ImageDesc::new(5, 4, PixelFormat::Rgba8);
        let path = write_dump(dir.path(), 1, DumpFormat::Tensor, &gradient(desc), desc).unwrap();
        assert_eq!(std::fs::metadata(path).unwrap().len(), 3 * 5 * 4 * 4);
    }

    #[test]
    fn dumper_writes_every_nth_frame() {
        let dir = tempfile::tempdir().unwrap();
        let desc = ImageDesc::new(2, 2, PixelFormat::Rgba8);
        let pixels = gradient(desc);
        let mut dumper = FrameDumper::new(dir.path().join("dump"), DumpFormat::Bmp, 3).unwrap();
        for _ in 0..7 {
            dumper.offer(&pixels, desc);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while dumper.written() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(dumper.written(), 2);
        let mut names: Vec<String> = std::fs::read_dir(dir.path().join("dump"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["frame_000003_2x2.bmp", "frame_000006_2x2.bmp"]);
    }
}
