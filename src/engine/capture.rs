//! 采集管线
//!
//! 硬件周期帧 → f32→i16 转换 → `try_push` 进采集通道。
//! 采集线程驱动拉取式设备；停止（显式或设备失败）时关闭通道，
//! 阻塞中的读者立即看到流结束

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::format::{self, ChannelMix};
use crate::audio::{BufferedChannel, CaptureDevice, DeviceError};

/// 每次从设备拉取的帧数
pub const CAPTURE_PERIOD_FRAMES: usize = 1024;

/// 采集状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    Running,
}

/// 采集管线
pub struct CapturePipeline {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    channel: Arc<BufferedChannel>,
}

impl CapturePipeline {
    /// 启动采集
    ///
    /// 设备在采集线程上启动，启动结果同步返回
    pub fn start(
        device: Box<dyn CaptureDevice>,
        channel: Arc<BufferedChannel>,
        mix: ChannelMix,
    ) -> Result<Self, DeviceError> {
        let running = Arc::new(AtomicBool::new(true));
        let (started_tx, started_rx) = mpsc::channel();

        let thread = {
            let running = Arc::clone(&running);
            let channel = Arc::clone(&channel);
            thread::Builder::new()
                .name("capture".to_string())
                .spawn(move || {
                    Self::capture_thread_main(device, channel, running, mix, started_tx);
                })
                .map_err(|e| DeviceError::Backend(format!("failed to spawn capture thread: {}", e)))?
        };

        // 线程在报告结果前退出说明 start 期间 panic 了
        let started = started_rx.recv().unwrap_or_else(|_| {
            Err(DeviceError::Backend("capture thread exited during start".into()))
        });

        match started {
            Ok(()) => Ok(Self {
                running,
                thread: Some(thread),
                channel,
            }),
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    fn capture_thread_main(
        mut device: Box<dyn CaptureDevice>,
        channel: Arc<BufferedChannel>,
        running: Arc<AtomicBool>,
        mix: ChannelMix,
        started_tx: mpsc::Sender<Result<(), DeviceError>>,
    ) {
        if let Err(e) = device.start() {
            running.store(false, Ordering::Release);
            let _ = started_tx.send(Err(e));
            return;
        }
        let _ = started_tx.send(Ok(()));

        let channels = device.channels().max(1);
        // 循环内不再分配
        let mut frames = vec![0.0f32; CAPTURE_PERIOD_FRAMES * channels];
        let mut samples = vec![0i16; CAPTURE_PERIOD_FRAMES];

        log::info!(
            "Capture thread started: {} channel(s), {} frames/period",
            channels,
            CAPTURE_PERIOD_FRAMES
        );

        while running.load(Ordering::Acquire) {
            let (frame_count, more) = device.read_period(&mut frames);
            let frame_count = frame_count.min(CAPTURE_PERIOD_FRAMES);

            if frame_count > 0 {
                let n = format::capture_frames(
                    &frames[..frame_count * channels],
                    channels,
                    mix,
                    &mut samples,
                );
                // 溢出丢弃，计入通道统计
                channel.try_push(&samples[..n]);
            }

            if !more {
                log::warn!("Capture stream ended");
                break;
            }
        }

        device.stop();
        running.store(false, Ordering::Release);
        channel.close();
        log::info!("Capture thread stopped");
    }

    pub fn state(&self) -> CaptureState {
        if self.running.load(Ordering::Acquire) {
            CaptureState::Running
        } else {
            CaptureState::Stopped
        }
    }

    /// 停止采集，等待采集线程退出
    ///
    /// 先关闭通道，阻塞中的读者不必等设备返回
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.channel.close();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
