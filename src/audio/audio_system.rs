//! ALSA implementation of the device abstraction.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async network tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

use anyhow::{anyhow, Result};

use super::device::{AudioBackend, InputStream, OutputEvent, OutputStream, UnitId};
use super::play::{play_thread, PlaybackShared};
use super::record::record_thread;
use crate::config::Config;

/// ALSA device names and period sizing.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Desired ALSA playback period size (0 = let ALSA decide)
    pub playback_period_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            playback_period_size: 1024,
        }
    }
}

impl From<&Config> for AudioConfig {
    fn from(config: &Config) -> Self {
        Self {
            capture_device: config.capture_device.to_string(),
            playback_device: config.playback_device.to_string(),
            playback_period_size: config.playback_period_size,
        }
    }
}

/// Opens ALSA streams, each served by a dedicated OS thread.
///
/// - Input: ALSA capture → mono f32 → `sink`
/// - Output: mixer timeline → ALSA playback, completions and failures → `events`
pub struct AlsaBackend {
    config: AudioConfig,
}

impl AlsaBackend {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

impl AudioBackend for AlsaBackend {
    fn open_input(
        &self,
        sample_rate: u32,
        sink: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn InputStream>> {
        let running = Arc::new(AtomicBool::new(true));
        let (opened_tx, opened_rx) = sync_channel(1);

        let handle = {
            let running = running.clone();
            let device = self.config.capture_device.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    if let Err(e) = record_thread(&device, sample_rate, sink, &running, opened_tx) {
                        log::error!("Recording thread error: {}", e);
                    }
                })?
        };

        let mut input = AlsaInput { running, handle: Some(handle) };
        match opened_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(input)),
            Ok(Err(e)) => {
                input.close();
                Err(e)
            }
            Err(_) => {
                input.close();
                Err(anyhow!("Recording thread exited before opening the device"))
            }
        }
    }

    fn open_output(
        &self,
        sample_rate: u32,
        events: mpsc::UnboundedSender<OutputEvent>,
    ) -> Result<Box<dyn OutputStream>> {
        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(PlaybackShared::new());
        let (opened_tx, opened_rx) = sync_channel(1);
        let period_size = match self.config.playback_period_size {
            0 => None,
            n => Some(n),
        };

        let handle = {
            let running = running.clone();
            let shared = shared.clone();
            let device = self.config.playback_device.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = play_thread(
                        &device,
                        sample_rate,
                        period_size,
                        shared,
                        events,
                        &running,
                        opened_tx,
                    ) {
                        log::error!("Playback thread error: {}", e);
                    }
                })?
        };

        let mut output = AlsaOutput {
            running,
            handle: Some(handle),
            shared,
            sample_rate,
        };
        match opened_rx.recv() {
            Ok(Ok(actual_rate)) => {
                output.sample_rate = actual_rate;
                Ok(Box::new(output))
            }
            Ok(Err(e)) => {
                output.close();
                Err(e)
            }
            Err(_) => {
                output.close();
                Err(anyhow!("Playback thread exited before opening the device"))
            }
        }
    }
}

pub struct AlsaInput {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InputStream for AlsaInput {
    /// Signal the thread to stop and wait for it; `readi` returns within one period.
    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for AlsaInput {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct AlsaOutput {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<PlaybackShared>,
    sample_rate: u32,
}

impl OutputStream for AlsaOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> u64 {
        self.shared.clock.load(Ordering::SeqCst)
    }

    fn schedule_buffer(&mut self, id: UnitId, samples: Vec<f32>, start_at: u64) {
        self.shared
            .mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .schedule(id, samples, start_at);
    }

    fn stop(&mut self, id: UnitId) {
        self.shared
            .mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop(id);
    }

    fn flush(&mut self) {
        self.shared.request_flush();
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        self.close();
    }
}
