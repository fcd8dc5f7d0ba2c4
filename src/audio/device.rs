//! 硬件协作方接口
//!
//! 驱动层不在本 crate 的控制范围内，这里只定义它必须提供的能力：
//! - 采集设备：拉取式，每次调用填充一个周期的交织 f32 帧
//! - 播放设备：回调式，驱动每个周期调用注册的回调，回调必须填满输出
//! - Host：打开默认输入/输出设备

use thiserror::Error;

/// 设备错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("no input device available")]
    NoInputDevice,
    #[error("no output device available")]
    NoOutputDevice,
    /// 驱动打开/启动失败
    #[error("audio backend error: {0}")]
    Backend(String),
}

/// 播放回调：`(input, output)`，交织 f32
///
/// 在驱动的实时线程上调用，只在单次调用期间持有这两个切片
pub type RenderCallback = Box<dyn FnMut(&[f32], &mut [f32]) + Send + 'static>;

/// 采集设备（拉取式）
pub trait CaptureDevice: Send {
    /// 每帧声道数
    fn channels(&self) -> usize;

    /// 启动采集流
    fn start(&mut self) -> Result<(), DeviceError>;

    /// 读取一个周期
    ///
    /// 填充 `frames`（交织），返回 `(帧数, 是否还有后续)`。
    /// 流失败或结束时返回 `more == false`
    fn read_period(&mut self, frames: &mut [f32]) -> (usize, bool);

    /// 停止采集流
    fn stop(&mut self);
}

/// 播放设备（回调式）
pub trait PlaybackDevice: Send {
    /// 每帧声道数
    fn channels(&self) -> usize;

    /// 以给定采样率和缓冲深度（帧）打开输出流并注册回调
    fn open(
        &mut self,
        sample_rate: u32,
        buffer_frames: usize,
        callback: RenderCallback,
    ) -> Result<(), DeviceError>;

    /// 停止输出流，之后不再调用回调
    fn stop(&mut self);
}

/// 设备来源
pub trait AudioHost {
    /// 打开默认输入设备
    fn open_capture(
        &self,
        sample_rate: u32,
        buffer_frames: usize,
    ) -> Result<Box<dyn CaptureDevice>, DeviceError>;

    /// 打开默认输出设备
    fn open_playback(&self) -> Result<Box<dyn PlaybackDevice>, DeviceError>;
}

/// 测试用设备
#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    /// 采集端：测试往队列里塞周期数据，设备线程取出
    #[derive(Clone, Default)]
    pub struct CaptureHandle {
        periods: Arc<Mutex<VecDeque<Vec<f32>>>>,
        ended: Arc<AtomicBool>,
        started: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    impl CaptureHandle {
        pub fn feed(&self, frames: Vec<f32>) {
            self.periods.lock().unwrap().push_back(frames);
        }

        /// 模拟流失败
        pub fn end(&self) {
            self.ended.store(true, Ordering::Release);
        }

        pub fn is_started(&self) -> bool {
            self.started.load(Ordering::Acquire)
        }

        pub fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::Acquire)
        }
    }

    pub struct MockCapture {
        handle: CaptureHandle,
        channels: usize,
        fail_start: bool,
    }

    impl CaptureDevice for MockCapture {
        fn channels(&self) -> usize {
            self.channels
        }

        fn start(&mut self) -> Result<(), DeviceError> {
            if self.fail_start {
                return Err(DeviceError::Backend("start refused".into()));
            }
            self.handle.started.store(true, Ordering::Release);
            Ok(())
        }

        fn read_period(&mut self, frames: &mut [f32]) -> (usize, bool) {
            if self.handle.ended.load(Ordering::Acquire) {
                return (0, false);
            }
            let next = self.handle.periods.lock().unwrap().pop_front();
            match next {
                Some(period) => {
                    let n = period.len().min(frames.len());
                    frames[..n].copy_from_slice(&period[..n]);
                    (n / self.channels, true)
                }
                None => {
                    // 模拟等待下一个硬件周期
                    std::thread::sleep(Duration::from_millis(1));
                    (0, true)
                }
            }
        }

        fn stop(&mut self) {
            self.handle.stopped.store(true, Ordering::Release);
        }
    }

    /// 播放端：测试代替驱动调用回调
    #[derive(Clone, Default)]
    pub struct PlaybackHandle {
        callback: Arc<Mutex<Option<RenderCallback>>>,
        opened_with: Arc<Mutex<Option<(u32, usize)>>>,
        stopped: Arc<AtomicBool>,
    }

    impl PlaybackHandle {
        /// 驱动一个周期，返回输出（交织）
        pub fn render(&self, frames: usize, channels: usize) -> Vec<f32> {
            let mut output = vec![f32::NAN; frames * channels];
            let mut callback = self.callback.lock().unwrap();
            if let Some(callback) = callback.as_mut() {
                callback(&[], &mut output);
            }
            output
        }

        pub fn opened_with(&self) -> Option<(u32, usize)> {
            *self.opened_with.lock().unwrap()
        }

        pub fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::Acquire)
        }
    }

    pub struct MockPlayback {
        handle: PlaybackHandle,
        channels: usize,
    }

    impl PlaybackDevice for MockPlayback {
        fn channels(&self) -> usize {
            self.channels
        }

        fn open(
            &mut self,
            sample_rate: u32,
            buffer_frames: usize,
            callback: RenderCallback,
        ) -> Result<(), DeviceError> {
            *self.handle.opened_with.lock().unwrap() = Some((sample_rate, buffer_frames));
            *self.handle.callback.lock().unwrap() = Some(callback);
            Ok(())
        }

        fn stop(&mut self) {
            self.handle.callback.lock().unwrap().take();
            self.handle.stopped.store(true, Ordering::Release);
        }
    }

    pub fn capture(channels: usize) -> (MockCapture, CaptureHandle) {
        let handle = CaptureHandle::default();
        let device = MockCapture {
            handle: handle.clone(),
            channels,
            fail_start: false,
        };
        (device, handle)
    }

    pub fn playback(channels: usize) -> (MockPlayback, PlaybackHandle) {
        let handle = PlaybackHandle::default();
        let device = MockPlayback {
            handle: handle.clone(),
            channels,
        };
        (device, handle)
    }

    /// 可配置缺失设备的 host
    pub struct MockHost {
        pub capture: CaptureHandle,
        pub playback: PlaybackHandle,
        pub capture_channels: usize,
        pub playback_channels: usize,
        pub has_input: bool,
        pub has_output: bool,
        pub fail_capture_start: bool,
    }

    impl MockHost {
        pub fn new() -> Self {
            Self {
                capture: CaptureHandle::default(),
                playback: PlaybackHandle::default(),
                capture_channels: 1,
                playback_channels: 2,
                has_input: true,
                has_output: true,
                fail_capture_start: false,
            }
        }
    }

    impl AudioHost for MockHost {
        fn open_capture(
            &self,
            _sample_rate: u32,
            _buffer_frames: usize,
        ) -> Result<Box<dyn CaptureDevice>, DeviceError> {
            if !self.has_input {
                return Err(DeviceError::NoInputDevice);
            }
            Ok(Box::new(MockCapture {
                handle: self.capture.clone(),
                channels: self.capture_channels,
                fail_start: self.fail_capture_start,
            }))
        }

        fn open_playback(&self) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
            if !self.has_output {
                return Err(DeviceError::NoOutputDevice);
            }
            Ok(Box::new(MockPlayback {
                handle: self.playback.clone(),
                channels: self.playback_channels,
            }))
        }
    }
}
