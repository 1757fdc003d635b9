//! ALSA PCM device wrappers for audio capture and playback.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// Consecutive failed recoveries after which a write/read loop gives up.
pub const MAX_RECOVERY_RETRIES: u32 = 3;

/// Playback ring buffer length in periods. Bounds how much audio is already
/// committed to the hardware when playback is cut.
const PLAYBACK_BUFFER_PERIODS: usize = 4;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
    /// Ring buffer size in frames
    pub buffer_size: usize,
}

/// Open a PCM device for capture. Mono is requested; the hardware may insist on more.
pub fn open_capture(device: &str, sample_rate: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, 1, None)
}

/// Open a PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Playback, sample_rate, 1, period_size)
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    };
    // EBUSY / EACCES surface here: device held by another session or no permission
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        // plug devices accept mono; raw hw devices may only offer stereo
        if hwp.set_channels(channels).is_err() {
            hwp.set_channels_near(2)
                .with_context(|| format!("No usable channel count on '{}'", device))?;
        }
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
            if matches!(direction, Direction::Playback) {
                hwp.set_buffer_size_near((ps * PLAYBACK_BUFFER_PERIODS) as alsa::pcm::Frames)?;
            }
        }
        pcm.hw_params(&hwp)
            .with_context(|| format!("Failed to apply hw params on '{}'", device))?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
            buffer_size: hwp.get_buffer_size()? as usize,
        }
    };

    if params.sample_rate != sample_rate {
        log::warn!(
            "ALSA {} on '{}' negotiated {}Hz instead of {}Hz",
            dir_name,
            device,
            params.sample_rate,
            sample_rate
        );
    }

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}, buffer_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
        params.buffer_size,
    );

    Ok((pcm, params))
}

/// Bring a PCM back from XRUN/suspend. Returns false once the stream is unrecoverable.
pub fn recover(pcm: &PCM, err: &alsa::Error, dir_name: &str) -> bool {
    log::warn!("ALSA {} error: {}, recovering...", dir_name, err);
    match pcm.prepare() {
        Ok(()) => true,
        Err(e) => {
            log::error!("Failed to recover PCM {}: {}", dir_name, e);
            false
        }
    }
}
