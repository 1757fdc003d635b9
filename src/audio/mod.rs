//! audio - Device I/O, PCM codec and playback scheduling
//!
//! Uses ALSA for audio I/O on dedicated threads; everything above the
//! `device` traits is backend-agnostic.

mod alsa_device;
mod audio_system;
pub mod capture;
pub mod device;
pub mod mixer;
pub mod pcm;
mod play;
mod record;
pub mod scheduler;

pub use audio_system::{AlsaBackend, AudioConfig};
pub use capture::CapturePipeline;
pub use device::{AudioBackend, InputStream, OutputEvent, OutputStream, UnitId};
pub use scheduler::{PlaybackScheduler, PlaybackUnit};
