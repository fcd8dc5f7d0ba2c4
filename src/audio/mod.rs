//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: Lock-free SPSC 样本队列
//! - Channel: 实时侧非阻塞 / 应用侧阻塞的有界通道
//! - Format: PCM16 ↔ f32 转换
//! - Stats: 通道统计
//! - Device: 硬件协作方接口

pub mod channel;
#[cfg(feature = "cpal")]
pub mod cpal_host;
pub mod device;
pub mod format;
pub mod ring_buffer;
pub mod stats;

pub use channel::{BufferedChannel, ChannelError};
#[cfg(feature = "cpal")]
pub use cpal_host::CpalHost;
pub use device::{AudioHost, CaptureDevice, DeviceError, PlaybackDevice, RenderCallback};
pub use format::{ChannelMix, FormatError};
pub use ring_buffer::{RingBuffer, RingSample};
pub use stats::{ChannelStats, StatsReport};
