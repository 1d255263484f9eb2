use std::ptr;

use crate::gpu::GpuError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyStrategy {
    Avx2,
    Sse2,
    Scalar,
}

impl CopyStrategy {
    pub fn is_supported(self) -> bool {
        match self {
            Self::Scalar => true,
            #[cfg(target_arch = "x86_64")]
            Self::Avx2 => is_x86_feature_detected!("avx2"),
            #[cfg(target_arch = "x86_64")]
            Self::Sse2 => is_x86_feature_detected!("sse2"),
            #[cfg(not(target_arch = "x86_64"))]
            Self::Avx2 | Self::Sse2 => false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RowCopier {
    strategy: CopyStrategy,
}

impl RowCopier {
    /// 选择当前 CPU 支持的最宽路径
    pub fn detect() -> Self {
        let strategy = [CopyStrategy::Avx2, CopyStrategy::Sse2]
            .into_iter()
            .find(|s| s.is_supported())
            .unwrap_or(CopyStrategy::Scalar);
        Self { strategy }
    }

    /// 指定路径，CPU 不支持时退回标量
    pub fn with_strategy(strategy: CopyStrategy) -> Self {
        if strategy.is_supported() {
            Self { strategy }
        } else {
            Self {
                strategy: CopyStrategy::Scalar,
            }
        }
    }

    pub fn strategy(&self) -> CopyStrategy {
        self.strategy
    }

    /// 把 `rows` 行、每行 `row_bytes` 字节从跨度为 `src_pitch` 的 `src` 紧凑地拷到 `dst`
    pub fn copy_rows(
        &self,
        src: &[u8],
        src_pitch: usize,
        dst: &mut [u8],
        row_bytes: usize,
        rows: usize,
    ) -> Result<(), GpuError> {
        if rows == 0 || row_bytes == 0 {
            return Ok(());
        }
        if src_pitch < row_bytes {
            return Err(GpuError::failed(format!(
                "行跨度 {} 小于行长 {}",
                src_pitch, row_bytes
            )));
        }
        let src_needed = (rows - 1) * src_pitch + row_bytes;
        if src.len() < src_needed {
            return Err(GpuError::failed(format!(
                "映射数据 {} 字节，至少需要 {}",
                src.len(),
                src_needed
            )));
        }
        let dst_needed = rows * row_bytes;
        if dst.len() < dst_needed {
            return Err(GpuError::failed(format!(
                "输出缓冲 {} 字节，至少需要 {}",
                dst.len(),
                dst_needed
            )));
        }

        for y in 0..rows {
            let s = &src[y * src_pitch..y * src_pitch + row_bytes];
            let d = &mut dst[y * row_bytes..(y + 1) * row_bytes];
            match self.strategy {
                // SAFETY: 构造时已确认 CPU 支持对应指令集，s/d 长度相同
                #[cfg(target_arch = "x86_64")]
                CopyStrategy::Avx2 => unsafe { copy_row_avx2(s, d) },
                #[cfg(target_arch = "x86_64")]
                CopyStrategy::Sse2 => unsafe { copy_row_sse2(s, d) },
                _ => d.copy_from_slice(s),
            }
        }
        Ok(())
    }
}

impl Default for RowCopier {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn copy_row_avx2(src: &[u8], dst: &mut [u8]) {
    use std::arch::x86_64::{__m256i, _mm256_loadu_si256, _mm256_storeu_si256};

    let len = src.len().min(dst.len());
    let s = src.as_ptr();
    let d = dst.as_mut_ptr();
    let mut i = 0;
    while i + 32 <= len {
        unsafe {
            let v = _mm256_loadu_si256(s.add(i) as *const __m256i);
            _mm256_storeu_si256(d.add(i) as *mut __m256i, v);
        }
        i += 32;
    }
    unsafe { ptr::copy_nonoverlapping(s.add(i), d.add(i), len - i) };
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn copy_row_sse2(src: &[u8], dst: &mut [u8]) {
    use std::arch::x86_64::{__m128i, _mm_loadu_si128, _mm_storeu_si128};

    let len = src.len().min(dst.len());
    let s = src.as_ptr();
    let d = dst.as_mut_ptr();
    let mut i = 0;
    while i + 16 <= len {
        unsafe {
            let v = _mm_loadu_si128(s.add(i) as *const __m128i);
            _mm_storeu_si128(d.add(i) as *mut __m128i, v);
        }
        i += 16;
    }
    unsafe { ptr::copy_nonoverlapping(s.add(i), d.add(i), len - i) };
}
