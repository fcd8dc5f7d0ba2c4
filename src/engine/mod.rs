//! 桥接引擎
//!
//! 整合采集、播放两条管线，对外暴露阻塞式 PCM16 字节流。
//! 核心设计：实时回调和应用线程完全解耦，通过有界样本通道连接

pub mod capture;
pub mod config;
pub mod playback;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::audio::format::{self, ChannelMix, FormatError, BYTES_PER_SAMPLE};
use crate::audio::{AudioHost, BufferedChannel, ChannelError, DeviceError, StatsReport};

pub use capture::{CapturePipeline, CaptureState};
pub use config::Config;
pub use playback::PlaybackPipeline;

/// 桥接错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// 采样率或缓冲深度不合法
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// 没有输入/输出设备，或驱动打开/启动失败
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(#[from] DeviceError),
    /// 写入长度不是 16-bit 样本的整数倍
    #[error("malformed input: {len} bytes is not a whole number of 16-bit samples")]
    MalformedInput { len: usize },
    /// 已关闭，或硬件流中途失败
    #[error("audio stream closed")]
    StreamClosed,
}

impl From<FormatError> for BridgeError {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::MalformedInput { len } => Self::MalformedInput { len },
        }
    }
}

impl From<BridgeError> for io::Error {
    fn from(e: BridgeError) -> Self {
        let kind = match e {
            BridgeError::InvalidConfig(_) | BridgeError::MalformedInput { .. } => {
                io::ErrorKind::InvalidInput
            }
            BridgeError::DeviceUnavailable(_) => io::ErrorKind::NotFound,
            BridgeError::StreamClosed => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, e)
    }
}

/// 两条通道的统计快照
#[derive(Debug, Clone, Copy)]
pub struct BridgeStats {
    pub capture: StatsReport,
    pub playback: StatsReport,
    pub capture_queued: usize,
    pub playback_queued: usize,
    /// 通道填充比例 0.0 ~ 1.0
    pub capture_fill_ratio: f64,
    pub playback_fill_ratio: f64,
}

impl std::fmt::Display for BridgeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Capture ({} samples queued, {:.1}% full)",
            self.capture_queued,
            self.capture_fill_ratio * 100.0
        )?;
        writeln!(f, "{}", self.capture)?;
        writeln!(f)?;
        writeln!(
            f,
            "Playback ({} samples queued, {:.1}% full)",
            self.playback_queued,
            self.playback_fill_ratio * 100.0
        )?;
        write!(f, "{}", self.playback)
    }
}

struct Pipelines {
    capture: CapturePipeline,
    playback: PlaybackPipeline,
}

/// 音频桥
///
/// `read` / `write` 可在多个线程上并发调用；`close` 可与进行中的读写并发，
/// 阻塞中的调用会以 `StreamClosed` 返回
pub struct Bridge {
    config: Config,
    capture_channel: Arc<BufferedChannel>,
    playback_channel: Arc<BufferedChannel>,
    pipelines: Mutex<Option<Pipelines>>,
    closed: AtomicBool,
}

impl Bridge {
    /// 打开两条硬件流并开始采集
    pub fn open(config: Config, host: &dyn AudioHost) -> Result<Self, BridgeError> {
        Self::open_with_mix(config, host, ChannelMix::default())
    }

    /// 同 `open`，指定多声道输入如何合成单声道
    pub fn open_with_mix(
        config: Config,
        host: &dyn AudioHost,
        mix: ChannelMix,
    ) -> Result<Self, BridgeError> {
        let config = config.resolve()?;

        log::info!(
            "Opening bridge: play {}Hz/{:?}, capture {}Hz/{:?}",
            config.play_sample_rate,
            config.play_latency,
            config.capture_sample_rate,
            config.capture_latency
        );

        let capture_channel = Arc::new(BufferedChannel::new(config.capture_channel_capacity()));
        let playback_channel = Arc::new(BufferedChannel::new(config.play_channel_capacity()));
        // 尽力而为，失败只记日志
        capture_channel.lock_memory();
        playback_channel.lock_memory();

        // 播放侧先就绪；采集启动失败时 playback 随 Drop 停止
        let playback_device = host.open_playback()?;
        let playback = PlaybackPipeline::start(
            playback_device,
            Arc::clone(&playback_channel),
            config.play_sample_rate,
            config.play_buffer_frames(),
        )?;

        let capture_device =
            host.open_capture(config.capture_sample_rate, config.capture_buffer_frames())?;
        let capture = CapturePipeline::start(capture_device, Arc::clone(&capture_channel), mix)?;

        log::info!(
            "Bridge open: capture buffer {} samples, playback buffer {} samples",
            capture_channel.capacity(),
            playback_channel.capacity()
        );

        Ok(Self {
            config,
            capture_channel,
            playback_channel,
            pipelines: Mutex::new(Some(Pipelines { capture, playback })),
            closed: AtomicBool::new(false),
        })
    }

    /// 解析后的配置
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 阻塞读取采集到的 PCM16 字节
    ///
    /// 返回字节数总是 2 的倍数；`buf` 放不下一个样本时返回 0。
    /// 流结束返回 `StreamClosed`
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, BridgeError> {
        self.read_with(buf, None)
    }

    /// 带截止时间的 `read`，超时返回 `Ok(0)`
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, BridgeError> {
        self.read_with(buf, Some(timeout))
    }

    fn read_with(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, BridgeError> {
        let mut samples = vec![0i16; buf.len() / BYTES_PER_SAMPLE];

        let pulled = match timeout {
            None => self.capture_channel.blocking_pull(&mut samples),
            Some(timeout) => self.capture_channel.blocking_pull_timeout(&mut samples, timeout),
        };

        match pulled {
            Ok(n) => Ok(format::pcm16_to_bytes(&samples[..n], buf)),
            Err(ChannelError::TimedOut) => Ok(0),
            Err(ChannelError::Closed) => Err(BridgeError::StreamClosed),
        }
    }

    /// 阻塞写入 PCM16 字节
    ///
    /// 长度必须是 2 的倍数，否则返回 `MalformedInput` 且不写入任何数据。
    /// 校验通过后全部写入才返回（背压由阻塞吸收）
    pub fn write(&self, bytes: &[u8]) -> Result<usize, BridgeError> {
        let samples = format::bytes_to_pcm16(bytes)?;

        match self.playback_channel.blocking_push(&samples) {
            Ok(_) => Ok(bytes.len()),
            Err(_) => Err(BridgeError::StreamClosed),
        }
    }

    /// 丢弃尚未播放的音频（例如被打断时）
    pub fn clear_output_buffer(&self) {
        self.playback_channel.flush();
    }

    /// 停止两条硬件流并关闭通道
    ///
    /// 幂等；可与进行中的 `read` / `write` 并发调用
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // 先关闭通道，阻塞中的读写立即返回
        self.capture_channel.close();
        self.playback_channel.close();

        let pipelines = self
            .pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut pipelines) = pipelines {
            pipelines.capture.stop();
            pipelines.playback.stop();
        }

        log::info!("Bridge closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 采集是否仍在运行（硬件流失败后为 false）
    pub fn capture_state(&self) -> CaptureState {
        self.pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(CaptureState::Stopped, |p| p.capture.state())
    }

    /// 获取统计信息
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            capture: self.capture_channel.stats().report(),
            playback: self.playback_channel.stats().report(),
            capture_queued: self.capture_channel.len(),
            playback_queued: self.playback_channel.len(),
            capture_fill_ratio: self.capture_channel.fill_ratio(),
            playback_fill_ratio: self.playback_channel.fill_ratio(),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.close();
    }
}

impl io::Read for &Bridge {
    /// 流结束时返回 `Ok(0)`
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match Bridge::read(*self, buf) {
            Err(BridgeError::StreamClosed) => Ok(0),
            result => result.map_err(io::Error::from),
        }
    }
}

impl io::Write for &Bridge {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Bridge::write(*self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for Bridge {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

impl io::Write for Bridge {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
