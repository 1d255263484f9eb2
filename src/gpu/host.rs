use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;

use super::{
    Fence, FrameResizer, GpuDevice, GpuError, GpuImage, ImageDesc, MappedImage, PixelFormat,
};

/// 与 D3D12 纹理拷贝一致的行对齐
pub const DEFAULT_ROW_ALIGNMENT: usize = 256;

const MAX_POOLED_BUFFERS: usize = 16;

#[derive(Default)]
struct ImagePool {
    free: Mutex<Vec<Vec<u8>>>,
    live: AtomicUsize,
}

impl ImagePool {
    fn take(&self, len: usize) -> Vec<u8> {
        self.live.fetch_add(1, Ordering::Relaxed);
        let mut free = self.free.lock();
        if let Some(pos) = free.iter().position(|buf| buf.len() == len) {
            return free.swap_remove(pos);
        }
        drop(free);
        vec![0; len]
    }

    fn give_back(&self, buf: Vec<u8>) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED_BUFFERS {
            free.push(buf);
        }
    }
}

pub struct HostImage {
    desc: ImageDesc,
    row_pitch: usize,
    data: Vec<u8>,
    pool: Arc<ImagePool>,
}

impl HostImage {
    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// 第 `y` 行的有效像素
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.row_pitch;
        &self.data[start..start + self.desc.row_bytes()]
    }
}

impl GpuImage for HostImage {
    fn desc(&self) -> ImageDesc {
        self.desc
    }
}

impl Drop for HostImage {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.data));
    }
}

impl std::fmt::Debug for HostImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostImage")
            .field("desc", &self.desc)
            .field("row_pitch", &self.row_pitch)
            .finish()
    }
}

pub struct HostStaging {
    desc: ImageDesc,
    row_pitch: usize,
    data: Vec<u8>,
}

/// 主机 fence。命令在提交时已同步执行完，所以默认 signal 即完成；
/// `deferred` 模式下由调用方通过 `complete_through` 推进，用来模拟仍在执行的 GPU 工作。
pub struct HostFence {
    signaled: AtomicU64,
    completed: Mutex<u64>,
    cond: Condvar,
    auto_complete: bool,
}

impl HostFence {
    pub fn new() -> Self {
        Self::with_mode(true)
    }

    pub fn deferred() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(auto_complete: bool) -> Self {
        Self {
            signaled: AtomicU64::new(0),
            completed: Mutex::new(0),
            cond: Condvar::new(),
            auto_complete,
        }
    }

    pub fn last_signaled(&self) -> u64 {
        self.signaled.load(Ordering::Acquire)
    }

    /// 完成 `value` 及之前的所有 signal，超出已 signal 的部分被截断
    pub fn complete_through(&self, value: u64) {
        let target = value.min(self.last_signaled());
        let mut completed = self.completed.lock();
        if target > *completed {
            *completed = target;
            self.cond.notify_all();
        }
    }
}

impl Default for HostFence {
    fn default() -> Self {
        Self::new()
    }
}

impl Fence for HostFence {
    fn signal(&self, value: u64) -> Result<(), GpuError> {
        let prev = self.signaled.fetch_max(value, Ordering::AcqRel);
        if value <= prev {
            return Err(GpuError::failed(format!(
                "fence 值必须递增: {} <= {}",
                value, prev
            )));
        }
        if self.auto_complete {
            self.complete_through(value);
        }
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        *self.completed.lock()
    }

    fn wait(&self, value: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut completed = self.completed.lock();
        while *completed < value {
            if self.cond.wait_until(&mut completed, deadline).timed_out() {
                return *completed >= value;
            }
        }
        true
    }
}

pub struct HostDevice {
    row_alignment: usize,
    fence: Arc<HostFence>,
    pool: Arc<ImagePool>,
    flushes: AtomicU64,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::with_fence(DEFAULT_ROW_ALIGNMENT, Arc::new(HostFence::new()))
    }

    pub fn with_fence(row_alignment: usize, fence: Arc<HostFence>) -> Self {
        Self {
            row_alignment: row_alignment.max(1),
            fence,
            pool: Arc::new(ImagePool::default()),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn row_pitch_for(&self, desc: ImageDesc) -> usize {
        desc.row_bytes().next_multiple_of(self.row_alignment)
    }

    pub fn create_image(&self, desc: ImageDesc) -> Result<HostImage, GpuError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::failed(format!(
                "图像尺寸无效: {}x{}",
                desc.width, desc.height
            )));
        }
        let row_pitch = self.row_pitch_for(desc);
        let data = self.pool.take(row_pitch * desc.height as usize);
        Ok(HostImage {
            desc,
            row_pitch,
            data,
            pool: self.pool.clone(),
        })
    }

    /// 把紧凑排列的像素上传为设备图像
    pub fn upload(&self, desc: ImageDesc, pixels: &[u8]) -> Result<HostImage, GpuError> {
        if pixels.len() != desc.tight_len() {
            return Err(GpuError::failed(format!(
                "上传数据长度 {} 与 {}x{} 不符",
                pixels.len(),
                desc.width,
                desc.height
            )));
        }
        let mut image = self.create_image(desc)?;
        let row_bytes = desc.row_bytes();
        let pitch = image.row_pitch;
        for (dst, src) in image
            .data
            .chunks_exact_mut(pitch)
            .zip(pixels.chunks_exact(row_bytes))
        {
            dst[..row_bytes].copy_from_slice(src);
        }
        Ok(image)
    }

    /// 尚未释放的图像数量
    pub fn live_images(&self) -> usize {
        self.pool.live.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn host_fence(&self) -> &Arc<HostFence> {
        &self.fence
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HostDevice {
    type Image = HostImage;
    type Staging = HostStaging;
    type Fence = HostFence;

    fn fence(&self) -> Arc<HostFence> {
        self.fence.clone()
    }

    fn flush(&self) -> Result<(), GpuError> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn create_staging(&self, desc: ImageDesc) -> Result<HostStaging, GpuError> {
        let row_pitch = self.row_pitch_for(desc);
        Ok(HostStaging {
            desc,
            row_pitch,
            data: vec![0; row_pitch * desc.height as usize],
        })
    }

    fn copy_to_staging(&self, image: &HostImage, staging: &mut HostStaging) -> Result<(), GpuError> {
        if image.desc != staging.desc || image.row_pitch != staging.row_pitch {
            return Err(GpuError::failed(format!(
                "staging 尺寸 {:?} 与图像 {:?} 不符",
                staging.desc, image.desc
            )));
        }
        staging.data.copy_from_slice(&image.data);
        Ok(())
    }

    fn map_staging<'a>(&self, staging: &'a HostStaging) -> Result<MappedImage<'a>, GpuError> {
        Ok(MappedImage {
            data: &staging.data,
            row_pitch: staging.row_pitch,
            desc: staging.desc,
        })
    }
}

/// 双线性缩放 + BGRA→RGBA 通道重排
pub struct HostResizer {
    device: Arc<HostDevice>,
    output: ImageDesc,
}

impl HostResizer {
    pub fn new(device: Arc<HostDevice>, width: u32, height: u32) -> Self {
        Self {
            device,
            output: ImageDesc::new(width, height, PixelFormat::Rgba8),
        }
    }
}

#[derive(Clone, Copy)]
struct Tap {
    i0: usize,
    i1: usize,
    t: f32,
}

fn taps(src_len: u32, dst_len: u32) -> Vec<Tap> {
    let scale = src_len as f32 / dst_len as f32;
    let max = src_len as usize - 1;
    (0..dst_len)
        .map(|d| {
            let s = ((d as f32 + 0.5) * scale - 0.5).max(0.0);
            let i0 = (s.floor() as usize).min(max);
            Tap {
                i0,
                i1: (i0 + 1).min(max),
                t: s - i0 as f32,
            }
        })
        .collect()
}

impl FrameResizer<HostDevice> for HostResizer {
    fn output_desc(&self) -> ImageDesc {
        self.output
    }

    fn resize(&mut self, src: &HostImage) -> Result<HostImage, GpuError> {
        let src_desc = src.desc;
        if src_desc.width == 0 || src_desc.height == 0 {
            return Err(GpuError::failed("源图像为空"));
        }
        // 输出固定为 RGBA，源为 BGRA 时交换 R/B
        let order: [usize; 4] = match src_desc.format {
            PixelFormat::Bgra8 => [2, 1, 0, 3],
            PixelFormat::Rgba8 => [0, 1, 2, 3],
        };

        let mut dst = self.device.create_image(self.output)?;
        let xs = taps(src_desc.width, self.output.width);
        let ys = taps(src_desc.height, self.output.height);
        let src_pitch = src.row_pitch;
        let src_data = &src.data;
        let dst_pitch = dst.row_pitch;

        dst.data
            .par_chunks_mut(dst_pitch)
            .zip(ys.par_iter())
            .for_each(|(row, ty)| {
                let r0 = &src_data[ty.i0 * src_pitch..];
                let r1 = &src_data[ty.i1 * src_pitch..];
                for (x, tx) in xs.iter().enumerate() {
                    let out = &mut row[x * 4..x * 4 + 4];
                    for (c, &sc) in order.iter().enumerate() {
                        let p00 = r0[tx.i0 * 4 + sc] as f32;
                        let p01 = r0[tx.i1 * 4 + sc] as f32;
                        let p10 = r1[tx.i0 * 4 + sc] as f32;
                        let p11 = r1[tx.i1 * 4 + sc] as f32;
                        let top = p00 + (p01 - p00) * tx.t;
                        let bottom = p10 + (p11 - p10) * tx.t;
                        out[c] = (top + (bottom - top) * ty.t).round().clamp(0.0, 255.0) as u8;
                    }
                }
            });
        Ok(dst)
    }
}
