//! Device abstraction the session core runs against.
//!
//! The core only needs to open one input and one output stream per session,
//! schedule buffers on the output clock, and close both. The ALSA backend in
//! `audio_system` is the production implementation; tests supply their own.

use anyhow::Result;
use tokio::sync::mpsc;

/// Identifier of one scheduled playback buffer.
pub type UnitId = u64;

/// Notifications from a running output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// The buffer played to its end. Stopped buffers are not reported.
    Ended(UnitId),
    /// The device stopped working and will produce nothing more.
    Failed(String),
}

/// Opens capture and playback streams.
pub trait AudioBackend: Send + Sync {
    /// Open the microphone at `sample_rate`, mono. Captured blocks of arbitrary
    /// length are pushed to `sink` until the stream is closed.
    ///
    /// May block until the device is ready.
    fn open_input(
        &self,
        sample_rate: u32,
        sink: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn InputStream>>;

    /// Open the speaker at `sample_rate`, mono. Completions and failures are
    /// reported on `events`.
    ///
    /// May block until the device is ready.
    fn open_output(
        &self,
        sample_rate: u32,
        events: mpsc::UnboundedSender<OutputEvent>,
    ) -> Result<Box<dyn OutputStream>>;
}

pub trait InputStream: Send {
    /// Release the device. Safe to call more than once. May block.
    fn close(&mut self);
}

pub trait OutputStream: Send {
    fn sample_rate(&self) -> u32;

    /// Output clock position in frames at `sample_rate`. Monotonic.
    fn now(&self) -> u64;

    /// Start producing `samples` at clock position `start_at`.
    fn schedule_buffer(&mut self, id: UnitId, samples: Vec<f32>, start_at: u64);

    /// Silence a scheduled or playing buffer.
    fn stop(&mut self, id: UnitId);

    /// Discard audio already handed to the hardware but not yet heard.
    /// Called after every scheduled buffer has been stopped.
    fn flush(&mut self) {}

    /// Release the device. Safe to call more than once. May block.
    fn close(&mut self);
}
