//! Full-duplex voice sessions with a streaming conversational model.
//!
//! Microphone audio is framed, PCM16 encoded and streamed out over a websocket;
//! the model's audio deltas are scheduled back to back on the output clock,
//! cut on barge-in, and both sides' transcripts are aggregated as they arrive.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod interruption;
pub mod net_link;
pub mod protocol;
pub mod state_machine;
pub mod transcript;

pub use config::Config;
pub use controller::{SessionUpdate, VoiceSession};
pub use error::{SessionError, SessionResult};
pub use state_machine::SessionState;
