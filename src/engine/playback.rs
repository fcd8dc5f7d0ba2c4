//! 播放管线
//!
//! 播放通道 → `try_pull` 一个周期 → i16→f32 并复制到所有声道 → 驱动输出。
//! 回调在驱动的实时线程上运行：只访问预分配的缓冲区，欠载补静音

use std::sync::Arc;

use crate::audio::format;
use crate::audio::{BufferedChannel, DeviceError, PlaybackDevice, RenderCallback};

/// 播放管线
pub struct PlaybackPipeline {
    device: Option<Box<dyn PlaybackDevice>>,
    channel: Arc<BufferedChannel>,
}

impl PlaybackPipeline {
    /// 打开输出流并注册渲染回调
    pub fn start(
        mut device: Box<dyn PlaybackDevice>,
        channel: Arc<BufferedChannel>,
        sample_rate: u32,
        buffer_frames: usize,
    ) -> Result<Self, DeviceError> {
        let channels = device.channels().max(1);
        let callback = render_callback(Arc::clone(&channel), channels, buffer_frames);

        device.open(sample_rate, buffer_frames, callback)?;
        log::info!(
            "Playback started: {}Hz, {} channel(s), buffer {} frames",
            sample_rate,
            channels,
            buffer_frames
        );

        Ok(Self {
            device: Some(device),
            channel,
        })
    }

    /// 停止输出流并关闭播放通道
    pub fn stop(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.stop();
            log::info!("Playback stopped");
        }
        self.channel.close();
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 构造渲染回调
///
/// `scratch` 按一个缓冲深度预分配；驱动给出更大的输出时分块处理，不重新分配
fn render_callback(
    channel: Arc<BufferedChannel>,
    channels: usize,
    buffer_frames: usize,
) -> RenderCallback {
    let mut scratch = vec![0i16; buffer_frames.max(1)];

    Box::new(move |_input: &[f32], output: &mut [f32]| {
        for chunk in output.chunks_mut(scratch.len() * channels) {
            let frames = chunk.len() / channels;
            let samples = &mut scratch[..frames];
            // 不足部分已被补零
            channel.try_pull(samples);
            format::render_frames(samples, channels, chunk);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::mock;

    #[test]
    fn test_render_pulls_and_duplicates() {
        let (device, handle) = mock::playback(2);
        let channel = Arc::new(BufferedChannel::new(64));
        let _pipeline =
            PlaybackPipeline::start(Box::new(device), Arc::clone(&channel), 48_000, 4).unwrap();
        assert_eq!(handle.opened_with(), Some((48_000, 4)));

        channel.blocking_push(&[16384, -32768]).unwrap();

        let out = handle.render(3, 2);
        assert_eq!(out, vec![0.5, 0.5, -1.0, -1.0, 0.0, 0.0]);
        assert_eq!(channel.stats().underrun_count(), 1);
    }

    #[test]
    fn test_render_larger_than_scratch() {
        let (device, handle) = mock::playback(1);
        let channel = Arc::new(BufferedChannel::new(64));
        let _pipeline =
            PlaybackPipeline::start(Box::new(device), Arc::clone(&channel), 8_000, 2).unwrap();

        channel.blocking_push(&[1, 2, 3, 4, 5]).unwrap();

        let out = handle.render(6, 1);
        let expected: Vec<f32> = [1i16, 2, 3, 4, 5, 0]
            .iter()
            .map(|&s| format::pcm16_to_float(s))
            .collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_flush_silences_pending() {
        let (device, handle) = mock::playback(1);
        let channel = Arc::new(BufferedChannel::new(64));
        let _pipeline =
            PlaybackPipeline::start(Box::new(device), Arc::clone(&channel), 48_000, 8).unwrap();

        channel.blocking_push(&[1000; 16]).unwrap();
        channel.flush();

        assert!(handle.render(8, 1).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_stop_closes_channel() {
        let (device, handle) = mock::playback(2);
        let channel = Arc::new(BufferedChannel::new(8));
        let mut pipeline =
            PlaybackPipeline::start(Box::new(device), Arc::clone(&channel), 48_000, 8).unwrap();

        pipeline.stop();
        assert!(handle.is_stopped());
        assert!(channel.is_closed());
        // 再次停止无副作用
        pipeline.stop();
    }
}
