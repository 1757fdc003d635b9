use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use anyhow::Result;

use super::alsa_device::{self, MAX_RECOVERY_RETRIES};
use super::device::OutputEvent;
use super::mixer::Mixer;
use super::pcm;

/// State shared between the playback thread and the `OutputStream` handle.
pub struct PlaybackShared {
    pub mixer: Mutex<Mixer>,
    /// Mirror of `mixer.position()`, readable without the lock.
    pub clock: AtomicU64,
    flush: AtomicBool,
}

impl PlaybackShared {
    pub fn new() -> Self {
        Self {
            mixer: Mutex::new(Mixer::new()),
            clock: AtomicU64::new(0),
            flush: AtomicBool::new(false),
        }
    }

    /// Ask the playback thread to discard what the hardware still holds.
    pub fn request_flush(&self) {
        self.flush.store(true, Ordering::SeqCst);
    }

    fn take_flush(&self) -> bool {
        self.flush.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Complete,
    /// The circuit breaker tripped; this many frames were discarded.
    Dropped(usize),
    /// The stream cannot be recovered.
    Fatal,
}

/// Write one period of `total_frames`, recovering between failed writes.
///
/// `write` receives the number of frames already written and returns how many
/// more it wrote.
pub fn write_period<E: Display>(
    total_frames: usize,
    mut write: impl FnMut(usize) -> std::result::Result<usize, E>,
    mut recover: impl FnMut(&E) -> bool,
) -> WriteOutcome {
    let mut frames_written = 0;
    let mut retry_count = 0u32;
    while frames_written < total_frames {
        match write(frames_written) {
            Ok(n) => {
                frames_written += n;
                retry_count = 0;
            }
            Err(e) => {
                retry_count += 1;
                if !recover(&e) {
                    log::error!("Playback write failed for good: {}", e);
                    return WriteOutcome::Fatal;
                }
                // 熔断器：底层持续跟不上写入速度时，丢弃剩余帧防止死循环
                if retry_count >= MAX_RECOVERY_RETRIES {
                    log::error!(
                        "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                        retry_count,
                        total_frames - frames_written
                    );
                    return WriteOutcome::Dropped(total_frames - frames_written);
                }
            }
        }
    }
    WriteOutcome::Complete
}

/// Playback loop: render one period of the timeline, write it to ALSA, report finished units.
///
/// Silence is written while nothing is scheduled so the clock keeps running.
/// An unrecoverable stream ends the loop and is reported as `OutputEvent::Failed`.
pub fn play_thread(
    device: &str,
    sample_rate: u32,
    period_size: Option<usize>,
    shared: Arc<PlaybackShared>,
    events: mpsc::UnboundedSender<OutputEvent>,
    running: &AtomicBool,
    opened: SyncSender<Result<u32>>,
) -> Result<()> {
    let (pcm, params) = match alsa_device::open_playback(device, sample_rate, period_size) {
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
    let _ = opened.send(Ok(params.sample_rate));

    let actual_channels = params.channels;
    let period = params.period_size.max(1);
    let mut mono = vec![0f32; period];
    let mut interleaved: Vec<i16> = Vec::with_capacity(period * actual_channels as usize);

    log::info!(
        "Playback started: rate={}, ch={}, period={}",
        params.sample_rate,
        actual_channels,
        period,
    );

    while running.load(Ordering::Relaxed) {
        if shared.take_flush() {
            let active = shared.mixer.lock().unwrap_or_else(PoisonError::into_inner).active();
            if let Err(e) = pcm.drop().and_then(|_| pcm.prepare()) {
                report_failure(&events, format!("Failed to flush playback: {}", e));
                break;
            }
            log::debug!("Playback flushed, {} units still scheduled", active);
        }

        // Render under the lock, write outside it: ALSA blocks until there is room
        let finished = {
            let mut mixer = shared.mixer.lock().unwrap_or_else(PoisonError::into_inner);
            let finished = mixer.render(&mut mono);
            shared.clock.store(mixer.position(), Ordering::SeqCst);
            finished
        };
        pcm::mono_to_playback(&mono, actual_channels, &mut interleaved);

        let outcome = write_period(
            period,
            |written| io.writei(&interleaved[written * actual_channels as usize..]),
            |e| alsa_device::recover(&pcm, e, "playback"),
        );
        if outcome == WriteOutcome::Fatal {
            report_failure(&events, "Playback stream unrecoverable".to_string());
            break;
        }

        for id in finished {
            if events.send(OutputEvent::Ended(id)).is_err() {
                log::debug!("Playback event receiver dropped");
            }
        }
    }

    // Discard frames still queued in the ring buffer
    if let Err(e) = pcm.drop() {
        log::debug!("PCM drop failed: {}", e);
    }
    log::info!("Playback stopped");
    Ok(())
}

fn report_failure(events: &mpsc::UnboundedSender<OutputEvent>, reason: String) {
    log::error!("{}", reason);
    let _ = events.send(OutputEvent::Failed(reason));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_writes_are_continued() {
        let mut calls = Vec::new();
        let outcome = write_period(
            8,
            |written| {
                calls.push(written);
                Ok::<_, &str>(3)
            },
            |_| true,
        );
        assert_eq!(outcome, WriteOutcome::Complete);
        assert_eq!(calls, vec![0, 3, 6]);
    }

    #[test]
    fn breaker_drops_the_rest_of_the_period() {
        let mut attempts = 0;
        let outcome = write_period(
            8,
            |written| {
                attempts += 1;
                if written == 0 { Ok(2) } else { Err("underrun") }
            },
            |_| true,
        );
        assert_eq!(outcome, WriteOutcome::Dropped(6));
        assert_eq!(attempts, 1 + MAX_RECOVERY_RETRIES as usize);
    }

    #[test]
    fn failed_recovery_is_fatal() {
        let mut recoveries = 0;
        let outcome = write_period(
            8,
            |_| Err("device unplugged"),
            |_| {
                recoveries += 1;
                false
            },
        );
        assert_eq!(outcome, WriteOutcome::Fatal);
        assert_eq!(recoveries, 1);
    }

    #[test]
    fn flush_request_is_taken_once() {
        let shared = PlaybackShared::new();
        assert!(!shared.take_flush());
        shared.request_flush();
        shared.request_flush();
        assert!(shared.take_flush());
        assert!(!shared.take_flush());
    }
}
