//! PCM Bridge - 命令行工具
//!
//! 用默认输入/输出设备演示阻塞式 PCM16 读写：
//! - loopback: 采集直接回放
//! - record: 采集写入文件或 stdout
//! - play: 从文件或 stdin 读取并播放

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};

use pcm_bridge::{Bridge, BridgeError, ChannelMix, Config, CpalHost};

/// 每次读写的字节数（1024 个样本）
const IO_CHUNK_BYTES: usize = 2048;

/// PCM Bridge - blocking 16-bit PCM streams over the default audio devices
#[derive(Parser)]
#[command(name = "pcm-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Playback sample rate in Hz (0 = 48000)
    #[arg(long, default_value = "0", global = true)]
    play_rate: u32,

    /// Playback buffer depth in milliseconds (0 = 200)
    #[arg(long, default_value = "0", global = true)]
    play_latency_ms: u64,

    /// Capture sample rate in Hz (0 = 48000)
    #[arg(long, default_value = "0", global = true)]
    capture_rate: u32,

    /// Capture buffer depth in milliseconds (0 = 200)
    #[arg(long, default_value = "0", global = true)]
    capture_latency_ms: u64,

    /// Average all input channels instead of taking the left one
    #[arg(long, global = true)]
    downmix: bool,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Play captured audio straight back
    Loopback,

    /// Record raw PCM16 (mono, little-endian) to a file, or '-' for stdout
    Record {
        #[arg(value_name = "PATH")]
        output: PathBuf,
    },

    /// Play raw PCM16 (mono, little-endian) from a file, or '-' for stdin
    Play {
        #[arg(value_name = "PATH")]
        input: PathBuf,
    },
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            play_sample_rate: self.play_rate,
            play_latency: Duration::from_millis(self.play_latency_ms),
            capture_sample_rate: self.capture_rate,
            capture_latency: Duration::from_millis(self.capture_latency_ms),
        }
    }

    fn mix(&self) -> ChannelMix {
        if self.downmix {
            ChannelMix::Downmix
        } else {
            ChannelMix::Left
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志（stderr，不影响 stdout 上的音频数据）
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let host = CpalHost::new();
    let bridge = Arc::new(Bridge::open_with_mix(cli.config(), &host, cli.mix())?);

    // Ctrl+C 关闭 bridge，阻塞中的读写随之返回
    let b = Arc::clone(&bridge);
    ctrlc::set_handler(move || {
        b.close();
    })?;

    let result = match cli.command {
        Commands::Loopback => loopback(&bridge),
        Commands::Record { ref output } => record(&bridge, output),
        Commands::Play { ref input } => play(&bridge, input),
    };

    bridge.close();

    if cli.verbose {
        eprintln!("\n{}", bridge.stats());
    }

    result
}

/// 采集 → 回放，直到关闭
fn loopback(bridge: &Bridge) -> anyhow::Result<()> {
    eprintln!("Loopback running. Press Ctrl+C to stop.");

    let mut buf = [0u8; IO_CHUNK_BYTES];
    loop {
        let n = match bridge.read(&mut buf) {
            Ok(n) => n,
            Err(BridgeError::StreamClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match bridge.write(&buf[..n]) {
            Ok(_) => {}
            Err(BridgeError::StreamClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

/// 采集写入文件，直到关闭
fn record(bridge: &Bridge, path: &Path) -> anyhow::Result<()> {
    let mut output: Box<dyn Write> = if path == Path::new("-") {
        Box::new(BufWriter::new(io::stdout().lock()))
    } else {
        Box::new(BufWriter::new(File::create(path)?))
    };

    eprintln!("Recording to {}. Press Ctrl+C to stop.", path.display());

    // 流结束时 io::copy 看到 Ok(0)
    let mut reader = bridge;
    let bytes = io::copy(&mut reader, &mut output)?;
    output.flush()?;

    log::info!("Recorded {} samples", bytes / 2);
    Ok(())
}

/// 从文件读取并播放，播完（或被关闭）返回
fn play(bridge: &Bridge, path: &Path) -> anyhow::Result<()> {
    let mut input: Box<dyn Read> = if path == Path::new("-") {
        Box::new(BufReader::new(io::stdin().lock()))
    } else {
        Box::new(BufReader::new(File::open(path)?))
    };

    let mut buf = [0u8; IO_CHUNK_BYTES];
    // 上次读到的奇数字节
    let mut carry: Option<u8> = None;
    let mut total = 0usize;

    loop {
        let start = usize::from(carry.is_some());
        if let Some(byte) = carry.take() {
            buf[0] = byte;
        }

        let n = input.read(&mut buf[start..])?;
        if n == 0 {
            break;
        }

        let len = start + n;
        let even = len & !1;
        if even < len {
            carry = Some(buf[even]);
        }

        match bridge.write(&buf[..even]) {
            Ok(written) => total += written,
            Err(BridgeError::StreamClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }

    if carry.is_some() {
        log::warn!("Input ended with a dangling byte, ignored");
    }

    // 等待播放通道排空
    while !bridge.is_closed() && bridge.stats().playback_queued > 0 {
        thread::sleep(Duration::from_millis(20));
    }
    // 最后一个硬件周期
    thread::sleep(bridge.config().play_latency);

    log::info!("Played {} samples", total / 2);
    Ok(())
}
