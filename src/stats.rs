use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::ring::RingMonitor;

const INTERVAL_BITS: usize = 10;
const INTERVAL_SAMPLES: usize = 1 << INTERVAL_BITS;
const INTERVAL_MASK: usize = INTERVAL_SAMPLES - 1;

/// 最近 1024 个帧间隔（毫秒，f64 位模式存放）。单写者，多读者。
pub struct FrameIntervals {
    samples: Box<[AtomicU64]>,
    written: AtomicUsize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct IntervalSummary {
    pub samples: usize,
    pub fps: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub last_ms: f64,
}

impl FrameIntervals {
    pub fn new() -> Self {
        Self {
            samples: (0..INTERVAL_SAMPLES).map(|_| AtomicU64::new(0)).collect(),
            written: AtomicUsize::new(0),
        }
    }

    pub fn record(&self, delta: Duration) {
        if delta.is_zero() {
            return;
        }
        let ms = delta.as_secs_f64() * 1000.0;
        let n = self.written.load(Ordering::Relaxed);
        self.samples[n & INTERVAL_MASK].store(ms.to_bits(), Ordering::Relaxed);
        self.written.store(n + 1, Ordering::Release);
    }

    pub fn summary(&self) -> IntervalSummary {
        let written = self.written.load(Ordering::Acquire);
        let count = written.min(INTERVAL_SAMPLES);
        if count == 0 {
            return IntervalSummary::default();
        }
        let mut sum = 0.0;
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        for i in 0..count {
            let idx = written.wrapping_sub(1 + i) & INTERVAL_MASK;
            let v = f64::from_bits(self.samples[idx].load(Ordering::Relaxed));
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        let avg = sum / count as f64;
        let last = f64::from_bits(
            self.samples[(written - 1) & INTERVAL_MASK].load(Ordering::Relaxed),
        );
        IntervalSummary {
            samples: count,
            fps: if avg > 0.0 { 1000.0 / avg } else { 0.0 },
            avg_ms: avg,
            min_ms: min,
            max_ms: max,
            last_ms: last,
        }
    }
}

impl Default for FrameIntervals {
    fn default() -> Self {
        Self::new()
    }
}

/// 两个循环共享的计数器
#[derive(Default)]
pub struct PipelineStats {
    pub intervals: FrameIntervals,
    pub frames_captured: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub frames_exported: AtomicU64,
    pub resize_failures: AtomicU64,
    pub submit_failures: AtomicU64,
    pub readback_failures: AtomicU64,
    pub fence_timeouts: AtomicU64,
    pub capture_retries: AtomicU64,
    pub sink_rejections: AtomicU64,
}

impl PipelineStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, ring: &RingMonitor, channel: ChannelCounters) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            intervals: self.intervals.summary(),
            occupancy: ring.occupancy_ratio(),
            ring_capacity: ring.capacity(),
            ring_overwritten: ring.overwritten(),
            frames_captured: load(&self.frames_captured),
            frames_skipped: load(&self.frames_skipped),
            frames_exported: load(&self.frames_exported),
            resize_failures: load(&self.resize_failures),
            submit_failures: load(&self.submit_failures),
            readback_failures: load(&self.readback_failures),
            fence_timeouts: load(&self.fence_timeouts),
            capture_retries: load(&self.capture_retries),
            sink_rejections: load(&self.sink_rejections),
            channel,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChannelCounters {
    pub frames_written: u64,
    pub frames_dropped: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub intervals: IntervalSummary,
    pub occupancy: f64,
    pub ring_capacity: usize,
    pub ring_overwritten: u64,
    pub frames_captured: u64,
    pub frames_skipped: u64,
    pub frames_exported: u64,
    pub resize_failures: u64,
    pub submit_failures: u64,
    pub readback_failures: u64,
    pub fence_timeouts: u64,
    pub capture_retries: u64,
    pub sink_rejections: u64,
    pub channel: ChannelCounters,
}
