//! 有界样本通道
//!
//! 连接实时回调与阻塞式应用线程：
//! - 实时侧只调用 `try_push` / `try_pull`：无分配、不阻塞，
//!   溢出丢弃，欠载补零
//! - 应用侧调用 `blocking_push` / `blocking_pull`：空间/数据不足时挂起，
//!   直到有进展或通道关闭
//!
//! 存储是 SPSC 无锁 ring buffer。同一侧的多个调用者由该侧的 gate 互斥量
//! 串行化；实时侧只 `try_lock`，拿不到就当作本周期无法传输。
//!
//! 唤醒：等待者先登记到原子计数再检查 ring，另一侧写完 ring 后发现有等待者
//! 才 notify。两边在登记/写入之后各有一道 SeqCst fence，所以要么等待者
//! 看到新数据，要么唤醒方看到等待者。实时侧不能拿等待者的锁，检查与 wait
//! 之间极短的窗口内到达的通知仍可能丢失，由 `WAKE_BACKSTOP` 兜底。

use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::ring_buffer::RingBuffer;
use super::stats::ChannelStats;

/// 阻塞等待的兜底超时（丢失通知时的最大额外延迟）
pub const WAKE_BACKSTOP: Duration = Duration::from_millis(20);

/// 通道错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// 通道已关闭（流结束）
    #[error("channel closed")]
    Closed,
    /// 截止时间前没有传输任何样本
    #[error("timed out before any sample was transferred")]
    TimedOut,
}

/// 等待者登记，Drop 时注销
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn register(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        // 登记对唤醒方可见之后才检查 ring
        fence(Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 有界 FIFO 样本通道
pub struct BufferedChannel {
    ring: RingBuffer,
    closed: AtomicBool,

    // 同侧调用者串行化，保持 ring 的单生产者/单消费者前提
    producer_gate: Mutex<()>,
    consumer_gate: Mutex<()>,

    data_ready: Condvar,
    space_ready: Condvar,
    data_waiters: AtomicUsize,
    space_waiters: AtomicUsize,

    stats: ChannelStats,
}

impl BufferedChannel {
    /// 创建容量为 `capacity` 个样本的通道
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
            closed: AtomicBool::new(false),
            producer_gate: Mutex::new(()),
            consumer_gate: Mutex::new(()),
            data_ready: Condvar::new(),
            space_ready: Condvar::new(),
            data_waiters: AtomicUsize::new(0),
            space_waiters: AtomicUsize::new(0),
            stats: ChannelStats::new(),
        }
    }

    /// 按时长计算容量：sample_rate × seconds（单声道 16-bit）
    pub fn with_duration(sample_rate: u32, duration: Duration) -> Self {
        let capacity = (sample_rate as f64 * duration.as_secs_f64()).round() as usize;
        Self::new(capacity)
    }

    /// 非阻塞写入（实时侧）
    ///
    /// 写入能放下的部分，剩余样本丢弃。返回写入数
    pub fn try_push(&self, samples: &[i16]) -> usize {
        if samples.is_empty() || self.is_closed() {
            return 0;
        }

        let accepted = match try_gate(&self.producer_gate) {
            Some(_gate) => self.ring.write(samples),
            None => 0,
        };

        self.stats
            .record_try_push(accepted, samples.len() - accepted, self.ring.available());
        if accepted > 0 {
            self.wake(&self.data_waiters, &self.data_ready);
        }
        accepted
    }

    /// 非阻塞读取（实时侧）
    ///
    /// 读出可用样本，不足部分补零（静音）。返回真实样本数
    pub fn try_pull(&self, output: &mut [i16]) -> usize {
        if output.is_empty() {
            return 0;
        }
        if self.is_closed() {
            output.fill(0);
            return 0;
        }

        let pulled = match try_gate(&self.consumer_gate) {
            Some(_gate) => self.ring.read(output),
            None => 0,
        };
        output[pulled..].fill(0);

        self.stats
            .record_try_pull(pulled, output.len() - pulled, self.ring.available());
        if pulled > 0 {
            self.wake(&self.space_waiters, &self.space_ready);
        }
        pulled
    }

    /// 阻塞写入（应用侧）
    ///
    /// 全部写入后返回 `Ok(samples.len())`；通道关闭返回 `Err(Closed)`
    pub fn blocking_push(&self, samples: &[i16]) -> Result<usize, ChannelError> {
        self.push_until(samples, None)
    }

    /// 带截止时间的阻塞写入
    ///
    /// 超时返回已写入的样本数；一个都没写入时返回 `Err(TimedOut)`
    pub fn blocking_push_timeout(
        &self,
        samples: &[i16],
        timeout: Duration,
    ) -> Result<usize, ChannelError> {
        self.push_until(samples, Some(Instant::now() + timeout))
    }

    /// 阻塞读取（应用侧）
    ///
    /// 至少有一个样本可读时返回，读取数不超过 `output.len()`；
    /// 通道关闭返回 `Err(Closed)`
    pub fn blocking_pull(&self, output: &mut [i16]) -> Result<usize, ChannelError> {
        self.pull_until(output, None)
    }

    /// 带截止时间的阻塞读取
    pub fn blocking_pull_timeout(
        &self,
        output: &mut [i16],
        timeout: Duration,
    ) -> Result<usize, ChannelError> {
        self.pull_until(output, Some(Instant::now() + timeout))
    }

    fn push_until(
        &self,
        samples: &[i16],
        deadline: Option<Instant>,
    ) -> Result<usize, ChannelError> {
        let mut gate = lock_gate(&self.producer_gate);
        let mut pushed = 0;

        while pushed < samples.len() {
            if self.is_closed() {
                return Err(ChannelError::Closed);
            }

            let waiter = WaiterGuard::register(&self.space_waiters);
            let n = self.ring.write(&samples[pushed..]);
            if n > 0 {
                drop(waiter);
                pushed += n;
                self.stats.add_pushed(n);
                self.wake(&self.data_waiters, &self.data_ready);
                continue;
            }

            let Some(wait) = wait_budget(deadline) else {
                return if pushed > 0 {
                    Ok(pushed)
                } else {
                    Err(ChannelError::TimedOut)
                };
            };
            gate = self
                .space_ready
                .wait_timeout(gate, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        Ok(pushed)
    }

    fn pull_until(
        &self,
        output: &mut [i16],
        deadline: Option<Instant>,
    ) -> Result<usize, ChannelError> {
        let mut gate = lock_gate(&self.consumer_gate);

        loop {
            if self.is_closed() {
                return Err(ChannelError::Closed);
            }
            if output.is_empty() {
                return Ok(0);
            }

            let waiter = WaiterGuard::register(&self.data_waiters);
            let n = self.ring.read(output);
            if n > 0 {
                drop(waiter);
                drop(gate);
                self.stats.add_pulled(n);
                self.wake(&self.space_waiters, &self.space_ready);
                return Ok(n);
            }

            let Some(wait) = wait_budget(deadline) else {
                return Err(ChannelError::TimedOut);
            };
            gate = self
                .data_ready
                .wait_timeout(gate, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// 丢弃所有已排队样本
    ///
    /// 与并发的读竞争时 flush 获胜：之后第一次 `try_pull` 读不到 flush 前的数据
    ///
    /// 持有生产者 gate：flush 返回前完成的写入全部被丢弃。
    /// 期间实时侧的 `try_push` 拿不到 gate，该周期计为溢出丢弃
    pub fn flush(&self) {
        let gate = lock_gate(&self.producer_gate);
        let discarded = self.ring.available();
        self.ring.clear();
        drop(gate);
        self.wake(&self.space_waiters, &self.space_ready);
        log::debug!("Channel flushed (~{} samples discarded)", discarded);
    }

    /// 关闭通道，唤醒所有等待者
    ///
    /// 返回本次调用是否完成了关闭（重复关闭返回 false）
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.data_ready.notify_all();
        self.space_ready.notify_all();
        true
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// 当前排队的样本数
    #[inline]
    pub fn len(&self) -> usize {
        self.ring.available()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 填充比例 0.0 ~ 1.0
    #[inline]
    pub fn fill_ratio(&self) -> f64 {
        self.ring.fill_ratio()
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// 锁定 ring 存储的内存（尽力而为）
    pub fn lock_memory(&self) -> bool {
        self.ring.lock_memory()
    }

    #[inline]
    fn wake(&self, waiters: &AtomicUsize, cond: &Condvar) {
        // 与 WaiterGuard::register 中的 fence 配对
        fence(Ordering::SeqCst);
        if waiters.load(Ordering::SeqCst) > 0 {
            cond.notify_all();
        }
    }
}

/// 实时侧取 gate：不阻塞
#[inline]
fn try_gate(gate: &Mutex<()>) -> Option<MutexGuard<'_, ()>> {
    match gate.try_lock() {
        Ok(guard) => Some(guard),
        // gate 不保护任何数据，poison 无意义
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

fn lock_gate(gate: &Mutex<()>) -> MutexGuard<'_, ()> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 本次 wait 的时长；截止时间已过返回 None
fn wait_budget(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        None => Some(WAKE_BACKSTOP),
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                None
            } else {
                Some(remaining.min(WAKE_BACKSTOP))
            }
        }
    }
}
