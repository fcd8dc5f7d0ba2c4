//! 样本格式转换
//!
//! 硬件侧：交织 f32，范围 [-1.0, 1.0]
//! 应用侧：little-endian 16-bit 有符号单声道 PCM
//!
//! 转换是有损但确定的：
//! - f32 → i16：先钳位，再乘 32767，向零截断
//! - i16 → f32：除以 32768（非对称除数，i16::MIN 恰好映射到 -1.0）

use thiserror::Error;

/// 每样本字节数（16-bit 单声道）
pub const BYTES_PER_SAMPLE: usize = 2;

/// 格式错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FormatError {
    /// 字节长度不是 2 的倍数
    #[error("malformed PCM16 input: {len} bytes is not a multiple of 2")]
    MalformedInput { len: usize },
}

/// 多声道采集时如何得到单声道
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChannelMix {
    /// 只取左声道（第 0 声道）
    #[default]
    Left,
    /// 所有声道取平均
    Downmix,
}

#[inline]
pub fn float_to_pcm16(sample: f32) -> i16 {
    // NaN 经 clamp 仍是 NaN，`as` 转换得到 0
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

#[inline]
pub fn pcm16_to_float(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// 校验 PCM16 字节长度
#[inline]
pub fn check_pcm16_len(len: usize) -> Result<(), FormatError> {
    if len % BYTES_PER_SAMPLE != 0 {
        return Err(FormatError::MalformedInput { len });
    }
    Ok(())
}

/// 将 f32 样本编码为 PCM16 字节
pub fn encode(frames: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames.len() * BYTES_PER_SAMPLE);
    for &sample in frames {
        out.extend_from_slice(&float_to_pcm16(sample).to_le_bytes());
    }
    out
}

/// 将 PCM16 字节解码为 f32 样本
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>, FormatError> {
    check_pcm16_len(bytes.len())?;
    Ok(bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|chunk| pcm16_to_float(i16::from_le_bytes([chunk[0], chunk[1]])))
        .collect())
}

/// PCM16 字节 → i16 样本
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>, FormatError> {
    check_pcm16_len(bytes.len())?;
    Ok(bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

/// i16 样本 → PCM16 字节
///
/// 写入 `min(samples.len(), output.len() / 2)` 个样本，返回写入的字节数
pub fn pcm16_to_bytes(samples: &[i16], output: &mut [u8]) -> usize {
    let mut written = 0;
    for (sample, chunk) in samples
        .iter()
        .zip(output.chunks_exact_mut(BYTES_PER_SAMPLE))
    {
        chunk.copy_from_slice(&sample.to_le_bytes());
        written += BYTES_PER_SAMPLE;
    }
    written
}

/// 采集路径：交织 f32 帧 → 单声道 i16
///
/// 实时安全（无分配）。返回写入 `output` 的样本数
pub fn capture_frames(
    interleaved: &[f32],
    channels: usize,
    mix: ChannelMix,
    output: &mut [i16],
) -> usize {
    let channels = channels.max(1);
    let mut count = 0;

    for (frame, out) in interleaved.chunks_exact(channels).zip(output.iter_mut()) {
        let mono = match mix {
            ChannelMix::Left => frame[0],
            ChannelMix::Downmix => frame.iter().sum::<f32>() / channels as f32,
        };
        *out = float_to_pcm16(mono);
        count += 1;
    }
    count
}

/// 播放路径：单声道 i16 → 交织 f32 帧，复制到所有输出声道
///
/// 实时安全（无分配）。`output` 中超出 `samples` 的帧填静音
pub fn render_frames(samples: &[i16], channels: usize, output: &mut [f32]) {
    let channels = channels.max(1);

    for (i, frame) in output.chunks_mut(channels).enumerate() {
        // 不足一帧的尾部也按静音处理
        let value = match samples.get(i) {
            Some(&sample) if frame.len() == channels => pcm16_to_float(sample),
            _ => 0.0,
        };
        frame.fill(value);
    }
}
