//! 通道统计模块
//!
//! 在实时侧收集统计信息，采用降频采样策略减少开销。
//! 溢出丢弃和欠载补零不是错误，只在这里计数

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 水位采样间隔：每 N 次实时调用才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 水位缓冲区大小
const WATER_LEVEL_BUFFER_SIZE: usize = 256;

/// 通道统计收集器
///
/// 所有操作都是 lock-free 的，适合在音频回调中使用
pub struct ChannelStats {
    rt_calls: AtomicU64,

    samples_pushed: AtomicU64,
    samples_pulled: AtomicU64,

    // 采集侧溢出丢弃的样本数
    dropped_samples: AtomicU64,
    // 播放侧补零的样本数 / 发生补零的回调次数
    underrun_samples: AtomicU64,
    underrun_count: AtomicU64,

    water_level_buffer: Box<[AtomicUsize; WATER_LEVEL_BUFFER_SIZE]>,
    water_level_write_idx: AtomicUsize,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self {
            rt_calls: AtomicU64::new(0),
            samples_pushed: AtomicU64::new(0),
            samples_pulled: AtomicU64::new(0),
            dropped_samples: AtomicU64::new(0),
            underrun_samples: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
            water_level_buffer: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_level_write_idx: AtomicUsize::new(0),
        }
    }

    /// 实时侧每次 try_push / try_pull 调用
    ///
    /// 只在采样点才记录水位
    #[inline]
    fn on_rt_call(&self, water_level: usize) {
        let count = self.rt_calls.fetch_add(1, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            let idx = self.water_level_write_idx.fetch_add(1, Ordering::Relaxed)
                % WATER_LEVEL_BUFFER_SIZE;
            // +1 区分"未采样"和"水位为 0"
            self.water_level_buffer[idx].store(water_level + 1, Ordering::Relaxed);
        }
    }

    /// 记录一次非阻塞写入
    #[inline]
    pub fn record_try_push(&self, accepted: usize, dropped: usize, water_level: usize) {
        self.on_rt_call(water_level);
        self.samples_pushed
            .fetch_add(accepted as u64, Ordering::Relaxed);
        if dropped > 0 {
            self.dropped_samples
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }

    /// 记录一次非阻塞读取
    #[inline]
    pub fn record_try_pull(&self, pulled: usize, shortfall: usize, water_level: usize) {
        self.on_rt_call(water_level);
        self.samples_pulled
            .fetch_add(pulled as u64, Ordering::Relaxed);
        if shortfall > 0 {
            self.underrun_samples
                .fetch_add(shortfall as u64, Ordering::Relaxed);
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn add_pushed(&self, samples: usize) {
        self.samples_pushed
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_pulled(&self, samples: usize) {
        self.samples_pulled
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }

    pub fn underrun_samples(&self) -> u64 {
        self.underrun_samples.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        let mut water_levels: Vec<usize> = self
            .water_level_buffer
            .iter()
            .map(|level| level.load(Ordering::Relaxed))
            .filter(|&level| level > 0)
            .map(|level| level - 1)
            .collect();
        water_levels.sort_unstable();

        StatsReport {
            rt_calls: self.rt_calls.load(Ordering::Relaxed),
            sample_interval: SAMPLE_INTERVAL,
            samples_pushed: self.samples_pushed.load(Ordering::Relaxed),
            samples_pulled: self.samples_pulled.load(Ordering::Relaxed),
            dropped_samples: self.dropped_samples(),
            underrun_samples: self.underrun_samples(),
            underrun_count: self.underrun_count(),
            water_min: water_levels.first().copied().unwrap_or(0),
            water_max: water_levels.last().copied().unwrap_or(0),
        }
    }
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub rt_calls: u64,
    pub sample_interval: u64,
    pub samples_pushed: u64,
    pub samples_pulled: u64,
    pub dropped_samples: u64,
    pub underrun_samples: u64,
    pub underrun_count: u64,
    pub water_min: usize,
    pub water_max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Realtime calls: {}", self.rt_calls)?;
        writeln!(f, "Samples pushed: {}", self.samples_pushed)?;
        writeln!(f, "Samples pulled: {}", self.samples_pulled)?;
        writeln!(f, "Dropped (overrun): {} samples", self.dropped_samples)?;
        writeln!(
            f,
            "Silence-filled (underrun): {} samples in {} calls",
            self.underrun_samples, self.underrun_count
        )?;
        write!(
            f,
            "Water level (every {} calls): min {} / max {} samples",
            self.sample_interval, self.water_min, self.water_max
        )
    }
}
