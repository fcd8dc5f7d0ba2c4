//! PCM Bridge Library
//!
//! Blocking 16-bit PCM streams on top of real-time audio callbacks.

pub mod audio;
pub mod engine;

pub use audio::{AudioHost, ChannelMix, DeviceError};
#[cfg(feature = "cpal")]
pub use audio::CpalHost;
pub use engine::{Bridge, BridgeError, BridgeStats, Config};
