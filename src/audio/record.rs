use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use anyhow::Result;

use super::alsa_device::{self, MAX_RECOVERY_RETRIES};
use super::pcm;

/// Capture loop: ALSA read → mono f32 at `sample_rate` → `sink`.
///
/// The outcome of opening the device is reported once on `opened` before any
/// audio flows, so the caller can fail `open_input` synchronously.
pub fn record_thread(
    device: &str,
    sample_rate: u32,
    sink: mpsc::Sender<Vec<f32>>,
    running: &AtomicBool,
    opened: SyncSender<Result<()>>,
) -> Result<()> {
    let (pcm, params) = match alsa_device::open_capture(device, sample_rate) {
        Ok(v) => v,
        Err(e) => {
            let _ = opened.send(Err(e));
            return Ok(());
        }
    };
    let io = match pcm.io_i16() {
        Ok(io) => io,
        Err(e) => {
            let _ = opened.send(Err(e.into()));
            return Ok(());
        }
    };
    let _ = opened.send(Ok(()));

    let actual_rate = params.sample_rate;
    let actual_channels = params.channels;

    // ALSA read buffer (interleaved i16, one period)
    let mut read_buf = vec![0i16; params.period_size * actual_channels as usize];
    let mut retry_count = 0u32;
    let mut dropped_blocks = 0u64;
    let mut resampler = pcm::LinearResampler::new(actual_rate, sample_rate);

    log::info!(
        "Recording started: rate={}, ch={}, period={}",
        actual_rate,
        actual_channels,
        params.period_size,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                retry_count = 0;
                if frames == 0 {
                    continue;
                }
                let mono =
                    pcm::capture_to_mono(&read_buf[..frames * actual_channels as usize], actual_channels);
                let block = resampler.process(&mono);
                if block.is_empty() {
                    continue;
                }

                // Never block the device thread on a slow consumer
                match sink.try_send(block) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dropped_blocks += 1;
                        if dropped_blocks % 50 == 1 {
                            log::warn!("Capture queue full, dropped {} blocks so far", dropped_blocks);
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        log::info!("Capture consumer dropped");
                        break;
                    }
                }
            }
            Err(e) => {
                retry_count += 1;
                if !alsa_device::recover(&pcm, &e, "capture") || retry_count >= MAX_RECOVERY_RETRIES {
                    log::error!("Capture stream unrecoverable after {} retries", retry_count);
                    break;
                }
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}
