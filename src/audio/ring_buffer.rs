//! Lock-free Single-Producer Single-Consumer Ring Buffer
//!
//! 设计目标：
//! - 零锁：生产者和消费者完全无锁操作
//! - 零分配：所有内存在初始化时预分配
//! - 缓存友好：读写位置用 `CachePadded` 隔开，避免 false sharing
//! - 内存锁定：可选 mlock 防止 page fault
//! - 可清空：任意一侧调用 `clear()`，与并发的读竞争时 clear 获胜
//!
//! 槽位是原子类型（Relaxed 访存），发布靠读写位置的 Release/Acquire。
//! 位置是单调递增的计数器，用 wrapping 运算，容量不要求是 2 的幂。
//! 通道里存 i16 样本，硬件输入队列里存 f32 帧。

use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// 可以放进 ring 槽位的样本类型
pub trait RingSample: Copy + Send + Sync + 'static {
    type Slot: Send + Sync;

    fn new_slot() -> Self::Slot;
    fn load(slot: &Self::Slot) -> Self;
    fn store(slot: &Self::Slot, value: Self);
}

impl RingSample for i16 {
    type Slot = AtomicI16;

    #[inline]
    fn new_slot() -> AtomicI16 {
        AtomicI16::new(0)
    }

    #[inline]
    fn load(slot: &AtomicI16) -> i16 {
        slot.load(Ordering::Relaxed)
    }

    #[inline]
    fn store(slot: &AtomicI16, value: i16) {
        slot.store(value, Ordering::Relaxed)
    }
}

/// f32 按位存进 AtomicU32
impl RingSample for f32 {
    type Slot = AtomicU32;

    #[inline]
    fn new_slot() -> AtomicU32 {
        AtomicU32::new(0)
    }

    #[inline]
    fn load(slot: &AtomicU32) -> f32 {
        f32::from_bits(slot.load(Ordering::Relaxed))
    }

    #[inline]
    fn store(slot: &AtomicU32, value: f32) {
        slot.store(value.to_bits(), Ordering::Relaxed)
    }
}

/// SPSC 无锁环形缓冲区
pub struct RingBuffer<T: RingSample = i16> {
    slots: Box<[T::Slot]>,
    capacity: usize,

    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,

    // 是否已锁定内存
    memory_locked: AtomicBool,
}

impl<T: RingSample> RingBuffer<T> {
    /// 创建指定容量的 Ring Buffer
    ///
    /// 容量按样本计，至少为 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots: Vec<T::Slot> = (0..capacity).map(|_| T::new_slot()).collect();

        Self {
            slots: slots.into_boxed_slice(),
            capacity,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: AtomicBool::new(false),
        }
    }

    fn storage_bytes(&self) -> usize {
        self.capacity * std::mem::size_of::<T::Slot>()
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 实时回调里的 page fault 会导致时序抖动。
    /// 返回是否成功锁定（RLIMIT_MEMLOCK 不足时失败，不影响功能）
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.slots.as_ptr() as *const libc::c_void;
        let len = self.storage_bytes();

        // SAFETY: ptr/len 描述的是 self.slots 拥有的一段有效内存
        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }

        let ptr = self.slots.as_ptr() as *const libc::c_void;
        let len = self.storage_bytes();

        // SAFETY: 与 lock_memory 中锁定的是同一段内存
        unsafe {
            libc::munlock(ptr, len);
        }

        log::debug!("Ring buffer memory unlocked");
    }

    /// 写入样本（生产者调用）
    ///
    /// 写入 `min(data.len(), free)` 个样本，返回实际写入数。
    /// wait-free，绝不阻塞
    #[inline]
    pub fn write(&self, data: &[T]) -> usize {
        self.write_with(data.len(), |i| data[i])
    }

    /// 写入 `count` 个由 `sample_at(i)` 生成的样本（生产者调用）
    ///
    /// 边转换边写入，不需要中间缓冲。返回实际写入数
    #[inline]
    pub fn write_with(&self, count: usize, mut sample_at: impl FnMut(usize) -> T) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        // read 可能是旧值（偏小），只会低估空闲空间
        let used = write.wrapping_sub(read);
        debug_assert!(used <= self.capacity, "ring buffer invariant violated: used > capacity");

        let free = self.capacity - used;
        let to_write = count.min(free);

        for i in 0..to_write {
            let idx = write.wrapping_add(i) % self.capacity;
            T::store(&self.slots[idx], sample_at(i));
        }

        self.write_pos
            .store(write.wrapping_add(to_write), Ordering::Release);
        to_write
    }

    /// 读取样本（消费者调用）
    ///
    /// 返回实际读取的样本数。如果读取期间发生了 `clear()`，
    /// 本次拷贝的数据作废，返回 0（`output` 中的内容不可用）。
    /// wait-free，绝不阻塞
    #[inline]
    pub fn read(&self, output: &mut [T]) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);

        let available = write.wrapping_sub(read);
        let to_read = output.len().min(available);
        if to_read == 0 {
            return 0;
        }

        for (i, out) in output[..to_read].iter_mut().enumerate() {
            let idx = read.wrapping_add(i) % self.capacity;
            *out = T::load(&self.slots[idx]);
        }

        // clear() 会推进 read_pos，CAS 失败说明被清空，数据作废
        match self.read_pos.compare_exchange(
            read,
            read.wrapping_add(to_read),
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => to_read,
            Err(_) => 0,
        }
    }

    /// 获取当前可读样本数
    #[inline]
    pub fn available(&self) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        write.wrapping_sub(read).min(self.capacity)
    }

    /// 获取当前可写空间
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity - self.available()
    }

    /// 获取容量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 获取缓冲区填充百分比（用于监控）
    #[inline]
    pub fn fill_ratio(&self) -> f64 {
        self.available() as f64 / self.capacity as f64
    }

    /// 清空缓冲区
    ///
    /// 丢弃调用时已写入的全部样本。任意线程可调用；
    /// 要丢弃并发写入中的数据，调用方需与生产者串行化
    pub fn clear(&self) {
        let write = self.write_pos.load(Ordering::Acquire);
        let mut read = self.read_pos.load(Ordering::Acquire);

        loop {
            // 消费者已经读到（或越过）这个位置
            if (write.wrapping_sub(read) as isize) <= 0 {
                return;
            }
            match self.read_pos.compare_exchange_weak(
                read,
                write,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => read = current,
            }
        }
    }
}

impl<T: RingSample> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ring_buffer_basic() {
        let rb = RingBuffer::<i16>::new(16);

        let data = [1, 2, 3, 4];
        assert_eq!(rb.write(&data), 4);
        assert_eq!(rb.available(), 4);

        let mut output = [0i16; 4];
        assert_eq!(rb.read(&mut output), 4);
        assert_eq!(output, data);
    }

    #[test]
    fn test_ring_buffer_wrap() {
        let rb = RingBuffer::<i16>::new(4);

        // 填满
        assert_eq!(rb.write(&[1, 2, 3, 4]), 4);

        // 读一半
        let mut output = [0i16; 2];
        assert_eq!(rb.read(&mut output), 2);
        assert_eq!(output, [1, 2]);

        // 再写入，测试环绕
        assert_eq!(rb.write(&[5, 6]), 2);

        let mut all = [0i16; 4];
        assert_eq!(rb.read(&mut all), 4);
        assert_eq!(all, [3, 4, 5, 6]);
    }

    #[test]
    fn test_ring_buffer_non_power_of_two() {
        let rb = RingBuffer::<i16>::new(5);
        let mut out = [0i16; 3];

        for round in 0..10i16 {
            let data = [round, round + 1, round + 2];
            assert_eq!(rb.write(&data), 3);
            assert_eq!(rb.read(&mut out), 3);
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_ring_buffer_full() {
        let rb = RingBuffer::<i16>::new(4);

        assert_eq!(rb.write(&[1, 2, 3, 4, 5]), 4);
        assert_eq!(rb.free_space(), 0);

        // 再写应该返回 0
        assert_eq!(rb.write(&[6, 7]), 0);
    }

    #[test]
    fn test_ring_buffer_empty() {
        let rb = RingBuffer::<i16>::new(4);

        let mut output = [0i16; 4];
        assert_eq!(rb.read(&mut output), 0);
    }

    #[test]
    fn test_clear_discards_pending() {
        let rb = RingBuffer::<i16>::new(8);
        rb.write(&[1, 2, 3]);
        rb.clear();

        assert_eq!(rb.available(), 0);
        assert_eq!(rb.free_space(), 8);

        let mut out = [0i16; 4];
        assert_eq!(rb.read(&mut out), 0);

        // clear 之后的写入正常可读
        rb.write(&[9]);
        assert_eq!(rb.read(&mut out), 1);
        assert_eq!(out[0], 9);
    }

    #[test]
    fn test_clear_on_empty_is_noop() {
        let rb = RingBuffer::<i16>::new(4);
        rb.clear();
        assert_eq!(rb.available(), 0);
        assert_eq!(rb.write(&[1, 2, 3, 4]), 4);
    }

    #[test]
    fn test_spsc_preserves_order() {
        let rb = Arc::new(RingBuffer::<i16>::new(64));
        let producer = Arc::clone(&rb);

        let handle = thread::spawn(move || {
            let mut next = 0i16;
            while next < 10_000 {
                let chunk: Vec<i16> = (next..(next + 7).min(10_000)).collect();
                let n = producer.write(&chunk);
                next += n as i16;
                if n == 0 {
                    thread::yield_now();
                }
            }
        });

        let mut expected = 0i16;
        let mut buf = [0i16; 13];
        while expected < 10_000 {
            let n = rb.read(&mut buf);
            for &s in &buf[..n] {
                assert_eq!(s, expected);
                expected += 1;
            }
            if n == 0 {
                thread::yield_now();
            }
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_f32_samples() {
        let rb = RingBuffer::<f32>::new(3);
        assert_eq!(rb.write(&[0.5, -1.0, 0.25, 1.0]), 3);

        let mut out = [0.0f32; 4];
        assert_eq!(rb.read(&mut out), 3);
        assert_eq!(&out[..3], &[0.5, -1.0, 0.25]);
    }

    #[test]
    fn test_write_with_converts_in_place() {
        let rb = RingBuffer::<f32>::new(8);
        let raw = [16384i16, -32768];
        assert_eq!(rb.write_with(raw.len(), |i| raw[i] as f32 / 32768.0), 2);

        let mut out = [0.0f32; 2];
        rb.read(&mut out);
        assert_eq!(out, [0.5, -1.0]);
        assert!((rb.fill_ratio() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fill_ratio() {
        let rb = RingBuffer::<i16>::new(4);
        rb.write(&[1, 2, 3]);
        assert!((rb.fill_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cache_padding() {
        // 读写位置各自独占 cache line
        assert!(std::mem::align_of::<CachePadded<AtomicUsize>>() >= 32);
    }
}
