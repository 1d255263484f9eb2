//! 捕获线程与导出线程之间的 SPSC 帧环形缓冲区，槽位只通过原子 swap 交接

use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::time::Duration;

use tracing::trace;

use crate::gpu::{Fence, GpuError};

/// 等待 fence 的上限：`attempts` 次，每次最多 `step`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FenceWait {
    pub attempts: u32,
    pub step: Duration,
}

impl Default for FenceWait {
    fn default() -> Self {
        Self {
            attempts: 10,
            step: Duration::from_millis(1),
        }
    }
}

struct FrameSlot<I> {
    image: I,
    fence: u64,
}

/// 两端共享的计数器，遥测只读
struct RingCounters {
    capacity: u64,
    write_index: AtomicU64,
    read_index: AtomicU64,
    last_fence: AtomicU64,
    overwritten: AtomicU64,
}

impl RingCounters {
    fn occupancy_ratio(&self) -> f64 {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        let pending = write.saturating_sub(read);
        (pending as f64 / self.capacity as f64).clamp(0.0, 1.0)
    }
}

struct RingShared<I, F> {
    slots: Box<[AtomicPtr<FrameSlot<I>>]>,
    counters: Arc<RingCounters>,
    fence: Arc<F>,
    // 槽位里的 I 只会被一个线程持有，只要求 I: Send
    _marker: PhantomData<*const I>,
}

unsafe impl<I: Send, F: Fence> Send for RingShared<I, F> {}
unsafe impl<I: Send, F: Fence> Sync for RingShared<I, F> {}

impl<I, F> Drop for RingShared<I, F> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let old = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !old.is_null() {
                // SAFETY: 非空指针都来自 Box::into_raw，且 swap 后只有这里持有
                drop(unsafe { Box::from_raw(old) });
            }
        }
    }
}

/// 单生产者/单消费者：`split` 只产生一对不可克隆的句柄
pub struct FrameRing;

impl FrameRing {
    /// 创建容量为 `capacity` 的缓冲区并拆成生产者/消费者两端
    pub fn split<I: Send, F: Fence>(
        capacity: usize,
        fence: Arc<F>,
        fence_wait: FenceWait,
    ) -> (FrameProducer<I, F>, FrameConsumer<I, F>) {
        assert!(capacity > 0, "ring capacity must be positive");
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let counters = Arc::new(RingCounters {
            capacity: capacity as u64,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            last_fence: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
        });
        let shared = Arc::new(RingShared {
            slots,
            counters,
            fence,
            _marker: PhantomData,
        });
        (
            FrameProducer {
                shared: shared.clone(),
                write_index: 0,
            },
            FrameConsumer {
                shared,
                read_index: 0,
                fence_wait,
            },
        )
    }
}

pub struct FrameProducer<I, F> {
    shared: Arc<RingShared<I, F>>,
    write_index: u64,
}

impl<I: Send, F: Fence> FrameProducer<I, F> {
    /// 放入一帧并为它排入 fence signal，返回该帧的 fence 值
    ///
    /// 槽位被占用时旧帧立即释放。signal 失败时帧已经在缓冲区内但不会被发布。
    pub fn push(&mut self, image: I) -> Result<u64, GpuError> {
        let shared = &*self.shared;
        let index = (self.write_index % shared.counters.capacity) as usize;
        let fence = self.write_index + 1;

        let slot = Box::into_raw(Box::new(FrameSlot { image, fence }));
        let prev = shared.slots[index].swap(slot, Ordering::AcqRel);
        if !prev.is_null() {
            // SAFETY: 指针来自 Box::into_raw，swap 之后只有生产者持有
            drop(unsafe { Box::from_raw(prev) });
            shared.counters.overwritten.fetch_add(1, Ordering::Relaxed);
            trace!(index, fence, "覆盖未读帧");
        }

        shared.counters.last_fence.store(fence, Ordering::Release);
        shared.fence.signal(fence)?;

        self.write_index += 1;
        shared
            .counters
            .write_index
            .store(self.write_index, Ordering::Release);
        Ok(fence)
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn occupancy_ratio(&self) -> f64 {
        self.shared.counters.occupancy_ratio()
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            counters: self.shared.counters.clone(),
        }
    }
}

/// 出队的帧，图像所有权完全归调用方
#[derive(Debug)]
pub struct PoppedFrame<I> {
    pub image: I,
    pub fence: u64,
}

pub struct FrameConsumer<I, F> {
    shared: Arc<RingShared<I, F>>,
    read_index: u64,
    fence_wait: FenceWait,
}

impl<I: Send, F: Fence> FrameConsumer<I, F> {
    pub fn try_pop(&mut self) -> Option<PoppedFrame<I>> {
        let shared = &*self.shared;
        let capacity = shared.counters.capacity;
        loop {
            let write = shared.counters.write_index.load(Ordering::Acquire);
            // 生产者已经套圈：更早的帧都被覆盖了
            if write.saturating_sub(self.read_index) > capacity {
                self.read_index = write - capacity;
            }
            if self.read_index >= write {
                self.publish_read_index();
                return None;
            }

            let index = (self.read_index % capacity) as usize;
            let taken = shared.slots[index].swap(ptr::null_mut(), Ordering::AcqRel);
            if taken.is_null() {
                self.read_index += 1;
                continue;
            }
            // SAFETY: 指针来自 Box::into_raw，swap 之后只有消费者持有
            let slot = unsafe { Box::from_raw(taken) };
            debug_assert!(slot.fence > self.read_index);

            // 可能拿到的是套圈后写入的更新帧，读指针跳到它之后，
            // 但不能越过已发布的 write_index（生产者可能还没发布这一帧）
            self.read_index = slot.fence.min(write);
            self.publish_read_index();
            return Some(PoppedFrame {
                image: slot.image,
                fence: slot.fence,
            });
        }
    }

    /// 有界等待该 fence 完成；返回 false 时绝不能读取这帧
    pub fn wait_for_fence(&self, fence: u64) -> bool {
        let gpu = &self.shared.fence;
        for attempt in 0..self.fence_wait.attempts {
            if gpu.completed_value() >= fence || gpu.wait(fence, self.fence_wait.step) {
                return true;
            }
            trace!(fence, attempt, "fence 未完成");
        }
        gpu.completed_value() >= fence
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn occupancy_ratio(&self) -> f64 {
        self.shared.counters.occupancy_ratio()
    }

    /// 含套圈修正的读指针
    pub fn read_index(&self) -> u64 {
        let write = self.shared.counters.write_index.load(Ordering::Acquire);
        self.read_index
            .max(write.saturating_sub(self.shared.counters.capacity))
    }

    pub fn write_index(&self) -> u64 {
        self.shared.counters.write_index.load(Ordering::Acquire)
    }

    fn publish_read_index(&self) {
        self.shared
            .counters
            .read_index
            .store(self.read_index, Ordering::Release);
    }
}

/// 只读视图，给统计用
#[derive(Clone)]
pub struct RingMonitor {
    counters: Arc<RingCounters>,
}

impl RingMonitor {
    pub fn capacity(&self) -> usize {
        self.counters.capacity as usize
    }

    pub fn occupancy_ratio(&self) -> f64 {
        self.counters.occupancy_ratio()
    }

    pub fn last_fence(&self) -> u64 {
        self.counters.last_fence.load(Ordering::Acquire)
    }

    pub fn overwritten(&self) -> u64 {
        self.counters.overwritten.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::host::HostFence;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Tracked {
        id: u32,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ring(
        capacity: usize,
    ) -> (
        FrameProducer<u32, HostFence>,
        FrameConsumer<u32, HostFence>,
        Arc<HostFence>,
    ) {
        let fence = Arc::new(HostFence::new());
        let (p, c) = FrameRing::split(capacity, fence.clone(), FenceWait::default());
        (p, c, fence)
    }

    fn drain<I: Send, F: Fence>(consumer: &mut FrameConsumer<I, F>) -> Vec<(I, u64)> {
        std::iter::from_fn(|| consumer.try_pop().map(|f| (f.image, f.fence))).collect()
    }

    #[test]
    fn pops_in_push_order_without_overflow() {
        let (mut p, mut c, _) = ring(8);
        for id in 0..5u32 {
            p.push(id * 10).unwrap();
        }
        let got = drain(&mut c);
        assert_eq!(got, vec![(0, 1), (10, 2), (20, 3), (30, 4), (40, 5)]);
        assert!(c.try_pop().is_none());
    }

    #[test]
    fn interleaved_push_pop_keeps_fifo() {
        let (mut p, mut c, _) = ring(3);
        let mut expected = Vec::new();
        let mut got = Vec::new();
        for round in 0..20u32 {
            p.push(round).unwrap();
            expected.push(round);
            if round % 2 == 1 {
                got.extend(drain(&mut c).into_iter().map(|(v, _)| v));
            }
        }
        got.extend(drain(&mut c).into_iter().map(|(v, _)| v));
        assert_eq!(got, expected);
    }

    #[test]
    fn overflow_keeps_newest_capacity_frames() {
        let (mut p, mut c, _) = ring(4);
        for fence in 1..=5u32 {
            assert_eq!(p.push(fence).unwrap(), fence as u64);
        }
        assert_eq!(c.write_index() - c.read_index(), 4);
        let fences: Vec<u64> = drain(&mut c).into_iter().map(|(_, f)| f).collect();
        assert_eq!(fences, vec![2, 3, 4, 5]);
        assert!(c.try_pop().is_none());
        assert_eq!(p.monitor().overwritten(), 1);
    }

    #[test]
    fn overflow_by_many_laps() {
        let (mut p, mut c, _) = ring(4);
        for v in 0..103u32 {
            p.push(v).unwrap();
        }
        assert_eq!(c.write_index() - c.read_index(), 4);
        let values: Vec<u32> = drain(&mut c).into_iter().map(|(v, _)| v).collect();
        assert_eq!(values, vec![99, 100, 101, 102]);
    }

    #[test]
    fn fences_strictly_increase() {
        let (mut p, _c, fence) = ring(2);
        let mut last = 0;
        for v in 0..10u32 {
            let f = p.push(v).unwrap();
            assert!(f > last);
            last = f;
        }
        assert_eq!(fence.last_signaled(), 10);
        assert_eq!(p.monitor().last_fence(), 10);
    }

    #[test]
    fn occupancy_ratio_stays_in_unit_range() {
        let (mut p, mut c, _) = ring(4);
        assert_eq!(c.occupancy_ratio(), 0.0);
        p.push(1).unwrap();
        p.push(2).unwrap();
        assert_eq!(p.occupancy_ratio(), 0.5);
        for v in 0..10 {
            p.push(v).unwrap();
            let r = p.occupancy_ratio();
            assert!((0.0..=1.0).contains(&r));
        }
        assert_eq!(c.occupancy_ratio(), 1.0);
        c.try_pop();
        assert!(c.occupancy_ratio() <= 1.0);
        drain(&mut c);
        assert_eq!(c.occupancy_ratio(), 0.0);
    }

    #[test]
    fn overwritten_and_remaining_frames_are_released() {
        let drops = Arc::new(AtomicUsize::new(0));
        let fence = Arc::new(HostFence::new());
        let (mut p, mut c) = FrameRing::split::<Tracked, _>(2, fence, FenceWait::default());
        for id in 0..5 {
            p.push(Tracked {
                id,
                drops: drops.clone(),
            })
            .unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 3);
        let popped = c.try_pop().unwrap();
        assert_eq!(popped.image.id, 3);
        drop(popped);
        assert_eq!(drops.load(Ordering::SeqCst), 4);
        drop(p);
        drop(c);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn wait_for_fence_fails_on_unfinished_work() {
        let fence = Arc::new(HostFence::deferred());
        let wait = FenceWait {
            attempts: 3,
            step: Duration::from_millis(1),
        };
        let (mut p, c) = FrameRing::split::<u32, _>(4, fence.clone(), wait);
        let f1 = p.push(1).unwrap();
        let f2 = p.push(2).unwrap();
        assert!(!c.wait_for_fence(f1));
        fence.complete_through(f1);
        assert!(c.wait_for_fence(f1));
        assert!(!c.wait_for_fence(f2));
        assert!(!c.wait_for_fence(f2 + 1));
    }

    /// signal 到指定值时阻塞，直到测试放行
    struct GatedFence {
        inner: HostFence,
        gate: u64,
        entered: Barrier,
        release: Barrier,
    }

    impl Fence for GatedFence {
        fn signal(&self, value: u64) -> Result<(), GpuError> {
            if value == self.gate {
                self.entered.wait();
                self.release.wait();
            }
            self.inner.signal(value)
        }

        fn completed_value(&self) -> u64 {
            self.inner.completed_value()
        }

        fn wait(&self, value: u64, timeout: Duration) -> bool {
            self.inner.wait(value, timeout)
        }
    }

    #[test]
    fn unpublished_lap_never_moves_read_past_write() {
        let fence = Arc::new(GatedFence {
            inner: HostFence::new(),
            gate: 5,
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let (mut p, mut c) = FrameRing::split::<u32, _>(4, fence.clone(), FenceWait::default());
        for v in 1..=4u32 {
            p.push(v).unwrap();
        }
        let producer = thread::spawn(move || {
            p.push(5).unwrap();
            p
        });
        // 第 5 帧已经换进槽位 0，但 write_index 还是 4
        fence.entered.wait();
        let popped = c.try_pop().unwrap();
        assert_eq!((popped.image, popped.fence), (5, 5));
        let counters = &c.shared.counters;
        let published_read = counters.read_index.load(Ordering::Acquire);
        let published_write = counters.write_index.load(Ordering::Acquire);
        assert_eq!(published_write, 4);
        assert!(published_read <= published_write);
        assert!((0.0..=1.0).contains(&c.occupancy_ratio()));

        fence.release.wait();
        let mut p = producer.join().unwrap();
        assert!(c.try_pop().is_none());
        assert_eq!(c.read_index(), 5);

        p.push(6).unwrap();
        let next = c.try_pop().unwrap();
        assert_eq!((next.image, next.fence), (6, 6));
        assert!(c.try_pop().is_none());
    }

    #[test]
    fn concurrent_producer_consumer_sees_increasing_fences() {
        let (mut p, mut c, _) = ring(16);
        let producer = thread::spawn(move || {
            for v in 0..20_000u32 {
                p.push(v).unwrap();
            }
        });
        let mut last_fence = 0;
        let mut check = |frame: PoppedFrame<u32>| {
            assert!(frame.fence > last_fence);
            assert_eq!(frame.fence, frame.image as u64 + 1);
            last_fence = frame.fence;
        };
        while !producer.is_finished() {
            match c.try_pop() {
                Some(frame) => {
                    check(frame);
                    assert!((0.0..=1.0).contains(&c.occupancy_ratio()));
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        while let Some(frame) = c.try_pop() {
            check(frame);
        }
        assert_eq!(last_fence, 20_000);
    }
}
