//! 桥接配置
//!
//! 零值字段表示"未设置"，在 `resolve()` 中一次性替换为默认值。
//! 解析后的快照在 Bridge 生命周期内不再修改

use std::time::Duration;

use super::BridgeError;

/// 默认采样率
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
/// 默认播放缓冲深度
pub const DEFAULT_PLAY_LATENCY: Duration = Duration::from_millis(200);
/// 默认采集缓冲深度
pub const DEFAULT_CAPTURE_LATENCY: Duration = Duration::from_millis(200);

/// 支持的最高采样率
pub const MAX_SAMPLE_RATE: u32 = 768_000;
/// 允许的最大缓冲深度
pub const MAX_LATENCY: Duration = Duration::from_secs(10);

/// 通道容量 = 缓冲深度 × 该周期数（默认 200ms × 25 = 5s）
pub const CHANNEL_DEPTH_PERIODS: u32 = 25;

/// 桥接配置
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// 播放采样率（Hz），0 = 默认
    pub play_sample_rate: u32,
    /// 播放缓冲深度，0 = 默认
    pub play_latency: Duration,
    /// 采集采样率（Hz），0 = 默认
    pub capture_sample_rate: u32,
    /// 采集缓冲深度，0 = 默认
    pub capture_latency: Duration,
}

impl Config {
    /// 填充默认值并校验
    pub fn resolve(mut self) -> Result<Self, BridgeError> {
        if self.play_sample_rate == 0 {
            self.play_sample_rate = DEFAULT_SAMPLE_RATE;
        }
        if self.play_latency.is_zero() {
            self.play_latency = DEFAULT_PLAY_LATENCY;
        }
        if self.capture_sample_rate == 0 {
            self.capture_sample_rate = DEFAULT_SAMPLE_RATE;
        }
        if self.capture_latency.is_zero() {
            self.capture_latency = DEFAULT_CAPTURE_LATENCY;
        }

        validate("play", self.play_sample_rate, self.play_latency)?;
        validate("capture", self.capture_sample_rate, self.capture_latency)?;
        Ok(self)
    }

    /// 播放设备缓冲深度（帧）
    pub fn play_buffer_frames(&self) -> usize {
        frames_for(self.play_sample_rate, self.play_latency)
    }

    /// 采集设备缓冲深度（帧）
    pub fn capture_buffer_frames(&self) -> usize {
        frames_for(self.capture_sample_rate, self.capture_latency)
    }

    /// 播放通道容量（样本）
    pub fn play_channel_capacity(&self) -> usize {
        self.play_buffer_frames() * CHANNEL_DEPTH_PERIODS as usize
    }

    /// 采集通道容量（样本）
    pub fn capture_channel_capacity(&self) -> usize {
        self.capture_buffer_frames() * CHANNEL_DEPTH_PERIODS as usize
    }
}

fn frames_for(sample_rate: u32, latency: Duration) -> usize {
    (sample_rate as f64 * latency.as_secs_f64()).round() as usize
}

fn validate(side: &str, sample_rate: u32, latency: Duration) -> Result<(), BridgeError> {
    if sample_rate > MAX_SAMPLE_RATE {
        return Err(BridgeError::InvalidConfig(format!(
            "{} sample rate {} Hz exceeds {} Hz",
            side, sample_rate, MAX_SAMPLE_RATE
        )));
    }
    if latency > MAX_LATENCY {
        return Err(BridgeError::InvalidConfig(format!(
            "{} latency {:?} exceeds {:?}",
            side, latency, MAX_LATENCY
        )));
    }
    if frames_for(sample_rate, latency) == 0 {
        return Err(BridgeError::InvalidConfig(format!(
            "{} latency {:?} is shorter than one frame at {} Hz",
            side, latency, sample_rate
        )));
    }
    Ok(())
}
