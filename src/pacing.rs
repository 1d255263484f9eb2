use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_SPIN_THRESHOLD: Duration = Duration::from_millis(1);

pub trait Clock: Send {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
    /// 忙等中的一次自旋
    fn spin(&self) {
        std::hint::spin_loop();
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<C: Clock + Sync> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }

    fn spin(&self) {
        (**self).spin()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaceOutcome {
    /// 按计划等到了节拍点
    OnTime,
    /// 本轮超时但不足一个间隔，不等待，保持原有节拍
    Late,
    /// 超时超过一个间隔，节拍重置为当前时刻
    Overrun,
}

pub struct FramePacer<C: Clock = SystemClock> {
    clock: C,
    interval: Duration,
    spin_threshold: Duration,
    next_tick: Instant,
}

impl<C: Clock> FramePacer<C> {
    /// `rate_hz` 必须为正数
    pub fn new(clock: C, rate_hz: f64, spin_threshold: Duration) -> Self {
        Self::with_interval(clock, Duration::from_secs_f64(1.0 / rate_hz), spin_threshold)
    }

    pub fn with_interval(clock: C, interval: Duration, spin_threshold: Duration) -> Self {
        let next_tick = clock.now();
        Self {
            clock,
            interval,
            spin_threshold,
            next_tick,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_tick(&self) -> Instant {
        self.next_tick
    }

    /// 从当前时刻重新开始计时
    pub fn reset(&mut self) {
        self.next_tick = self.clock.now();
    }

    /// 阻塞到下一个节拍点
    pub fn wait_next(&mut self) -> PaceOutcome {
        self.next_tick += self.interval;
        let now = self.clock.now();

        if now >= self.next_tick {
            if now - self.next_tick > self.interval {
                self.next_tick = now;
                return PaceOutcome::Overrun;
            }
            return PaceOutcome::Late;
        }

        let remaining = self.next_tick - now;
        if remaining > self.spin_threshold {
            self.clock.sleep(remaining - self.spin_threshold);
        }
        while self.clock.now() < self.next_tick {
            self.clock.spin();
        }
        PaceOutcome::OnTime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// 确定性的假时钟：sleep 会多睡一点模拟系统调度粒度，spin 每次前进固定步长
    struct FakeClock {
        base: Instant,
        offset_ns: AtomicU64,
        oversleep: Duration,
        spin_step: Duration,
        spins: AtomicU64,
    }

    impl FakeClock {
        fn new(oversleep: Duration) -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                offset_ns: AtomicU64::new(0),
                oversleep,
                spin_step: Duration::from_micros(20),
                spins: AtomicU64::new(0),
            })
        }

        fn advance(&self, d: Duration) {
            self.offset_ns
                .fetch_add(d.as_nanos() as u64, Ordering::SeqCst);
        }

        fn elapsed(&self) -> Duration {
            Duration::from_nanos(self.offset_ns.load(Ordering::SeqCst))
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.base + self.elapsed()
        }

        fn sleep(&self, duration: Duration) {
            self.advance(duration + self.oversleep);
        }

        fn spin(&self) {
            self.spins.fetch_add(1, Ordering::SeqCst);
            self.advance(self.spin_step);
        }
    }

    #[test]
    fn mean_interval_matches_target_rate() {
        let clock = FakeClock::new(Duration::from_micros(300));
        let mut pacer = FramePacer::new(clock.clone(), 60.0, DEFAULT_SPIN_THRESHOLD);
        let target = 1.0 / 60.0;

        let mut last = clock.now();
        let mut total = 0.0;
        for _ in 0..1000 {
            assert_eq!(pacer.wait_next(), PaceOutcome::OnTime);
            let now = clock.now();
            total += (now - last).as_secs_f64();
            last = now;
        }
        let mean = total / 1000.0;
        assert!((mean - target).abs() / target < 0.02, "mean {mean}");
        assert!(clock.spins.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn schedule_does_not_drift_with_busy_loop_body() {
        let clock = FakeClock::new(Duration::from_micros(500));
        let mut pacer = FramePacer::new(clock.clone(), 60.0, DEFAULT_SPIN_THRESHOLD);
        let interval = pacer.interval();
        for i in 0..1000u32 {
            // 变化的循环体耗时，始终小于一个间隔
            clock.advance(Duration::from_millis((i % 12) as u64));
            pacer.wait_next();
        }
        let expected = interval * 1000;
        let drift = clock.elapsed().abs_diff(expected);
        assert!(drift < Duration::from_micros(100), "drift {drift:?}");
    }

    #[test]
    fn late_cycle_keeps_schedule() {
        let clock = FakeClock::new(Duration::ZERO);
        let mut pacer = FramePacer::with_interval(
            clock.clone(),
            Duration::from_millis(10),
            DEFAULT_SPIN_THRESHOLD,
        );
        clock.advance(Duration::from_millis(15));
        assert_eq!(pacer.wait_next(), PaceOutcome::Late);
        assert_eq!(clock.elapsed(), Duration::from_millis(15));
        assert_eq!(pacer.wait_next(), PaceOutcome::OnTime);
        let elapsed = clock.elapsed();
        assert!(elapsed >= Duration::from_millis(20) && elapsed < Duration::from_micros(20_100));
    }

    #[test]
    fn overrun_resets_to_now() {
        let clock = FakeClock::new(Duration::ZERO);
        let mut pacer = FramePacer::with_interval(
            clock.clone(),
            Duration::from_millis(10),
            DEFAULT_SPIN_THRESHOLD,
        );
        clock.advance(Duration::from_millis(35));
        assert_eq!(pacer.wait_next(), PaceOutcome::Overrun);
        assert_eq!(pacer.next_tick(), clock.now());
        assert_eq!(pacer.wait_next(), PaceOutcome::OnTime);
        let elapsed = clock.elapsed();
        assert!(elapsed >= Duration::from_millis(45) && elapsed < Duration::from_micros(45_100));
    }

    #[test]
    fn short_remainder_only_spins() {
        let clock = FakeClock::new(Duration::from_secs(1));
        let mut pacer = FramePacer::with_interval(
            clock.clone(),
            Duration::from_micros(500),
            DEFAULT_SPIN_THRESHOLD,
        );
        pacer.wait_next();
        // 剩余时间小于阈值时不会 sleep，否则假时钟会多走 1 秒
        assert!(clock.elapsed() < Duration::from_millis(1));
    }
}
