//! cpal 硬件适配
//!
//! 输入流回调把每个硬件周期写进预分配的 f32 ring，采集线程按周期取出；
//! 输出流回调直接调用注册的渲染回调。设备原生格式是 i16 时在回调里
//! 就地转换，两条路径都不在驱动线程上分配内存

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::device::{AudioHost, CaptureDevice, DeviceError, PlaybackDevice, RenderCallback};
use super::format;
use super::ring_buffer::RingBuffer;

/// 输入队列至少能存放的帧数
const INPUT_QUEUE_MIN_FRAMES: usize = 8192;

/// 输入队列为空时 `read_period` 的等待间隔
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// i16 输出的转换缓冲至少能存放的帧数
const OUTPUT_SCRATCH_MIN_FRAMES: usize = 1024;

/// 默认 host 上的输入/输出设备
pub struct CpalHost {
    host: cpal::Host,
}

impl CpalHost {
    pub fn new() -> Self {
        let host = cpal::default_host();
        log::info!("Audio host: {:?}", host.id());
        Self { host }
    }
}

impl Default for CpalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHost for CpalHost {
    fn open_capture(
        &self,
        sample_rate: u32,
        buffer_frames: usize,
    ) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let device = self
            .host
            .default_input_device()
            .ok_or(DeviceError::NoInputDevice)?;
        let supported = device
            .default_input_config()
            .map_err(|e| DeviceError::Backend(format!("input config: {}", e)))?;

        log::info!(
            "Input device: {} ({} channel(s), {:?})",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            supported.channels(),
            supported.sample_format()
        );

        let config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: buffer_size_for(supported.buffer_size(), buffer_frames),
        };

        let channels = (config.channels as usize).max(1);
        let queue_frames = (buffer_frames * 2).max(INPUT_QUEUE_MIN_FRAMES);
        let queue = Arc::new(RingBuffer::<f32>::new(queue_frames * channels));
        queue.lock_memory();

        Ok(Box::new(CpalCapture {
            device,
            config,
            sample_format: supported.sample_format(),
            stream: None,
            queue,
            overflow: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn open_playback(&self) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        let device = self
            .host
            .default_output_device()
            .ok_or(DeviceError::NoOutputDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|e| DeviceError::Backend(format!("output config: {}", e)))?;

        log::info!(
            "Output device: {} ({} channel(s), {:?})",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            supported.channels(),
            supported.sample_format()
        );

        Ok(Box::new(CpalPlayback {
            device,
            supported,
            stream: None,
        }))
    }
}

/// 请求的深度在设备支持范围内才固定，否则交给驱动
fn buffer_size_for(supported: &cpal::SupportedBufferSize, buffer_frames: usize) -> cpal::BufferSize {
    let Ok(frames) = u32::try_from(buffer_frames) else {
        return cpal::BufferSize::Default;
    };
    match supported {
        cpal::SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&frames) => {
            cpal::BufferSize::Fixed(frames)
        }
        _ => cpal::BufferSize::Default,
    }
}

/// 输入回调：整帧写入队列，放不下的帧丢弃并计数
fn input_callback<T: Copy + 'static>(
    queue: Arc<RingBuffer<f32>>,
    overflow: Arc<AtomicUsize>,
    channels: usize,
    convert: fn(T) -> f32,
) -> impl FnMut(&[T], &cpal::InputCallbackInfo) + Send + 'static {
    move |data: &[T], _: &cpal::InputCallbackInfo| {
        push_frames(&queue, &overflow, channels, data, convert);
    }
}

fn push_frames<T: Copy>(
    queue: &RingBuffer<f32>,
    overflow: &AtomicUsize,
    channels: usize,
    data: &[T],
    convert: fn(T) -> f32,
) {
    // 只有输入回调写队列，空闲空间在写入前不会变小
    let whole = data.len().min(queue.free_space() / channels * channels);
    queue.write_with(whole, |i| convert(data[i]));
    if whole < data.len() {
        overflow.fetch_add(data.len() - whole, Ordering::Relaxed);
    }
}

/// i16 输出：分块渲染到 f32 `scratch` 再转换
fn render_pcm16(callback: &mut RenderCallback, scratch: &mut [f32], data: &mut [i16]) {
    for chunk in data.chunks_mut(scratch.len()) {
        let rendered = &mut scratch[..chunk.len()];
        callback(&[], rendered);
        for (out, &sample) in chunk.iter_mut().zip(rendered.iter()) {
            *out = format::float_to_pcm16(sample);
        }
    }
}

fn identity(sample: f32) -> f32 {
    sample
}

/// 输入设备
pub struct CpalCapture {
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    stream: Option<cpal::Stream>,
    /// 交织帧，驱动回调写、采集线程读
    queue: Arc<RingBuffer<f32>>,
    overflow: Arc<AtomicUsize>,
    failed: Arc<AtomicBool>,
}

// SAFETY: cpal::Stream 在部分平台上不是 Send。CpalCapture 只有一个所有者
// （采集线程），流在该线程上创建（start），并且只销毁一次（stop / drop），
// 从不被并发访问
unsafe impl Send for CpalCapture {}

impl CaptureDevice for CpalCapture {
    fn channels(&self) -> usize {
        self.config.channels as usize
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let channels = self.channels().max(1);
        let failed = Arc::clone(&self.failed);
        let on_error = move |err: cpal::StreamError| {
            log::error!("Input stream error: {}", err);
            failed.store(true, Ordering::Release);
        };

        let stream = match self.sample_format {
            cpal::SampleFormat::F32 => self.device.build_input_stream(
                &self.config,
                input_callback(
                    Arc::clone(&self.queue),
                    Arc::clone(&self.overflow),
                    channels,
                    identity,
                ),
                on_error,
                None,
            ),
            cpal::SampleFormat::I16 => self.device.build_input_stream(
                &self.config,
                input_callback(
                    Arc::clone(&self.queue),
                    Arc::clone(&self.overflow),
                    channels,
                    format::pcm16_to_float,
                ),
                on_error,
                None,
            ),
            other => {
                return Err(DeviceError::Backend(format!(
                    "unsupported input sample format: {:?}",
                    other
                )))
            }
        }
        .map_err(|e| DeviceError::Backend(format!("failed to build input stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| DeviceError::Backend(format!("failed to start input stream: {}", e)))?;

        log::info!(
            "Input stream started: {}Hz, {:?}, {:?}",
            self.config.sample_rate.0,
            self.sample_format,
            self.config.buffer_size
        );

        self.stream = Some(stream);
        Ok(())
    }

    fn read_period(&mut self, frames: &mut [f32]) -> (usize, bool) {
        if self.stream.is_none() {
            return (0, false);
        }

        let channels = self.channels().max(1);
        let more = !self.failed.load(Ordering::Acquire);

        // 回调只写整帧，按整帧取
        let ready = self.queue.available() / channels * channels;
        let want = (frames.len() / channels * channels).min(ready);
        if want == 0 {
            if more {
                thread::sleep(POLL_INTERVAL);
            }
            return (0, more);
        }

        let n = self.queue.read(&mut frames[..want]);
        (n / channels, more)
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            drop(stream);

            let overflow = self.overflow.swap(0, Ordering::Relaxed);
            if overflow > 0 {
                log::warn!("Input queue overflowed: {} samples dropped", overflow);
            }
            log::info!("Input stream stopped");
        }
    }
}

/// 输出设备
pub struct CpalPlayback {
    device: cpal::Device,
    supported: cpal::SupportedStreamConfig,
    stream: Option<cpal::Stream>,
}

// SAFETY: 同 CpalCapture。PlaybackPipeline 是唯一所有者；流在 open 中创建，
// 只在 stop 中销毁一次（Bridge::close 取出管线后在关闭线程上调用）
unsafe impl Send for CpalPlayback {}

impl PlaybackDevice for CpalPlayback {
    fn channels(&self) -> usize {
        self.supported.channels() as usize
    }

    fn open(
        &mut self,
        sample_rate: u32,
        buffer_frames: usize,
        mut callback: RenderCallback,
    ) -> Result<(), DeviceError> {
        let channels = self.channels().max(1);
        let config = cpal::StreamConfig {
            channels: self.supported.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: buffer_size_for(self.supported.buffer_size(), buffer_frames),
        };
        let on_error = |err: cpal::StreamError| log::error!("Output stream error: {}", err);

        let stream = match self.supported.sample_format() {
            cpal::SampleFormat::F32 => self.device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    callback(&[], data);
                },
                on_error,
                None,
            ),
            cpal::SampleFormat::I16 => {
                // 整帧长度，驱动给出更大的输出时分块渲染
                let mut scratch =
                    vec![0.0f32; buffer_frames.max(OUTPUT_SCRATCH_MIN_FRAMES) * channels];
                self.device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        render_pcm16(&mut callback, &mut scratch, data);
                    },
                    on_error,
                    None,
                )
            }
            other => {
                return Err(DeviceError::Backend(format!(
                    "unsupported output sample format: {:?}",
                    other
                )))
            }
        }
        .map_err(|e| DeviceError::Backend(format!("failed to build output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| DeviceError::Backend(format!("failed to start output stream: {}", e)))?;

        log::info!(
            "Output stream started: {}Hz, {:?}, {:?}",
            sample_rate,
            self.supported.sample_format(),
            config.buffer_size
        );

        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            log::info!("Output stream stopped");
        }
    }
}
