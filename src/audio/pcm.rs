//! 16-bit PCM codec for the live audio wire format.
//!
//! - Encode: f32 samples in [-1, 1] → little-endian i16 bytes
//! - Decode: little-endian i16 bytes → f32 samples
//!
//! Plus the channel mixing and rate conversion needed to bridge device
//! formats to the mono 16 kHz / 24 kHz streams the remote endpoint speaks.

use bytes::Bytes;

const SCALE: f32 = 32768.0;

// ======================== Codec ========================

/// Scale each sample by 32768, truncate toward zero and pack as i16 LE.
///
/// Values outside the i16 range saturate (so `1.0` becomes `32767`).
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s * SCALE) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode interleaved i16 LE bytes back to f32.
///
/// Only complete frames (`channels * 2` bytes) are decoded; a trailing
/// partial frame is dropped.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> AudioFrame {
    let channels = channels.max(1);
    let frame_bytes = channels as usize * 2;
    let usable = bytes.len() - bytes.len() % frame_bytes;
    let samples = bytes[..usable]
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / SCALE)
        .collect();
    AudioFrame { samples, sample_rate, channels }
}

// ======================== Frames ========================

/// Decoded audio, interleaved, normalised to [-1, 1].
///
/// On the wire every sample is a 16-bit signed integer; in memory it is kept
/// as f32 so mixing and resampling do not re-quantise.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> std::time::Duration {
        if self.sample_rate == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Collapse to mono at `target_rate`.
    pub fn into_mono(self, target_rate: u32) -> Vec<f32> {
        let mono = downmix(&self.samples, self.channels);
        if self.sample_rate == target_rate {
            mono
        } else {
            resample_linear(&mono, self.sample_rate, target_rate)
        }
    }
}

/// Wire-ready PCM bytes plus their MIME tag (`audio/pcm;rate=16000`).
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    pub data: Bytes,
    pub mime_type: String,
}

impl EncodedChunk {
    pub fn pcm16(data: impl Into<Bytes>, sample_rate: u32) -> Self {
        Self {
            data: data.into(),
            mime_type: pcm_mime(sample_rate),
        }
    }

    /// Sample rate declared by the MIME tag, if any.
    pub fn sample_rate(&self) -> Option<u32> {
        parse_mime_rate(&self.mime_type)
    }

    pub fn is_pcm(&self) -> bool {
        self.mime_type
            .split(';')
            .next()
            .map(|t| t.trim().eq_ignore_ascii_case("audio/pcm"))
            .unwrap_or(false)
    }

    pub fn decode(&self, fallback_rate: u32) -> AudioFrame {
        decode(&self.data, self.sample_rate().unwrap_or(fallback_rate), 1)
    }
}

pub fn pcm_mime(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

pub fn parse_mime_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, v)| v.trim().parse().ok())
}

// ======================== Channel / rate conversion ========================

/// Interleaved multi-channel → mono by averaging all channels.
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Interleaved i16 from a capture device → mono f32.
pub fn capture_to_mono(samples: &[i16], channels: u32) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as f32 / SCALE
        })
        .collect()
}

/// Mono f32 → interleaved i16 for a playback device, duplicating across channels.
pub fn mono_to_playback(samples: &[f32], channels: u32, out: &mut Vec<i16>) {
    out.clear();
    out.reserve(samples.len() * channels.max(1) as usize);
    for &s in samples {
        let v = (s * SCALE).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        for _ in 0..channels.max(1) {
            out.push(v);
        }
    }
}

/// Linear-interpolation rate conversion for mono audio.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

/// Linear rate conversion for a continuous mono stream fed in blocks.
///
/// The fractional read position and the last input sample carry over between
/// calls, so block boundaries leave no seam.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    pos: f64,
    prev: Option<f32>,
    passthrough: bool,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let passthrough = from_rate == to_rate || from_rate == 0 || to_rate == 0;
        Self {
            step: if passthrough { 1.0 } else { from_rate as f64 / to_rate as f64 },
            pos: 0.0,
            prev: None,
            passthrough,
        }
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.passthrough || input.is_empty() {
            return input.to_vec();
        }
        // 上一块的最后一个样本放在下标 0
        let buf: Vec<f32> = self.prev.into_iter().chain(input.iter().copied()).collect();
        let mut out = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);
        while (self.pos.floor() as usize) + 1 < buf.len() {
            let idx = self.pos.floor() as usize;
            let frac = (self.pos - idx as f64) as f32;
            out.push(buf[idx] + (buf[idx + 1] - buf[idx]) * frac);
            self.pos += self.step;
        }
        self.pos -= (buf.len() - 1) as f64;
        self.prev = buf.last().copied();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_stays_within_one_quantum() {
        let samples: Vec<f32> = (0..=200).map(|i| i as f32 / 100.0 - 1.0).collect();
        let frame = decode(&encode(&samples), 16000, 1);
        assert_eq!(frame.samples.len(), samples.len());
        for (a, b) in samples.iter().zip(&frame.samples) {
            assert!((a - b).abs() <= 1.0 / 32768.0, "{} vs {}", a, b);
        }
    }

    #[test]
    fn encode_truncates_and_saturates() {
        assert_eq!(encode(&[0.5]), (16384i16).to_le_bytes().to_vec());
        assert_eq!(encode(&[1.0]), i16::MAX.to_le_bytes().to_vec());
        assert_eq!(encode(&[-1.0]), i16::MIN.to_le_bytes().to_vec());
        // 0.00002 * 32768 = 0.65 → 0
        assert_eq!(encode(&[0.00002]), vec![0, 0]);
    }

    #[test]
    fn decode_drops_trailing_partial_frame() {
        let bytes = [0x00, 0x40, 0x00, 0xC0, 0x7F];
        let frame = decode(&bytes, 24000, 1);
        assert_eq!(frame.samples, vec![0.5, -0.5]);

        let stereo = decode(&bytes, 24000, 2);
        assert_eq!(stereo.samples, vec![0.5, -0.5]);
        assert_eq!(stereo.frames(), 1);
    }

    #[test]
    fn mime_rate_is_parsed() {
        let chunk = EncodedChunk::pcm16(vec![0u8; 4], 16000);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        assert_eq!(chunk.sample_rate(), Some(16000));
        assert!(chunk.is_pcm());
        assert_eq!(parse_mime_rate("audio/pcm; rate=24000"), Some(24000));
        assert_eq!(parse_mime_rate("audio/pcm"), None);
    }

    #[test]
    fn duration_follows_rate() {
        let frame = decode(&vec![0u8; 24000], 24000, 1);
        assert_eq!(frame.frames(), 12000);
        assert_eq!(frame.duration(), std::time::Duration::from_millis(500));
    }

    #[test]
    fn channel_conversion() {
        assert_eq!(downmix(&[0.5, -0.5, 1.0, 0.0], 2), vec![0.0, 0.5]);
        assert_eq!(capture_to_mono(&[16384, 16384, -16384, 0], 2), vec![0.5, -0.25]);

        let mut out = Vec::new();
        mono_to_playback(&[0.5, 2.0], 2, &mut out);
        assert_eq!(out, vec![16384, 16384, i16::MAX, i16::MAX]);
    }

    #[test]
    fn resample_doubles_length_and_interpolates() {
        let up = resample_linear(&[0.0, 1.0], 12000, 24000);
        assert_eq!(up.len(), 4);
        assert_eq!(up[0], 0.0);
        assert!((up[1] - 0.5).abs() < 1e-6);
        assert_eq!(resample_linear(&[0.1, 0.2], 24000, 24000), vec![0.1, 0.2]);
    }

    #[test]
    fn streaming_resampler_has_no_block_seams() {
        let ramp: Vec<f32> = (0..24).map(|i| i as f32 / 24.0).collect();
        for (from, to) in [(24000, 48000), (48000, 16000), (16000, 16000)] {
            let whole = LinearResampler::new(from, to).process(&ramp);

            let mut chunked = LinearResampler::new(from, to);
            let mut out = Vec::new();
            let mut rest = ramp.as_slice();
            for size in [1, 5, 2, 7, 9] {
                let (block, tail) = rest.split_at(size.min(rest.len()));
                out.extend(chunked.process(block));
                rest = tail;
            }
            assert!(rest.is_empty());
            assert_eq!(out, whole, "{} -> {}", from, to);
        }

        let mut up = LinearResampler::new(24000, 48000);
        assert_eq!(up.process(&[0.0, 1.0]), vec![0.0, 0.5]);
        assert_eq!(up.process(&[2.0]), vec![1.0, 1.5]);
    }
}
