//! Error taxonomy for a voice session.

use thiserror::Error;

use crate::state_machine::SessionState;

pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by the session engine.
///
/// Device and transport implementations report `anyhow::Error`; the controller
/// maps those into these variants at the boundary. A completion callback for a
/// unit that was already cancelled is not an error and has no variant here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Microphone or output device could not be acquired. Never retried.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Failure reported by the transport after (or while) connecting.
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound event missing its expected payload. Skipped and logged.
    #[error("malformed inbound event: {0}")]
    MalformedInbound(String),

    #[error("cannot {op} while session is {state:?}")]
    InvalidState { op: &'static str, state: SessionState },

    /// The session was stopped before it reached Open.
    #[error("session stopped before it opened")]
    Cancelled,
}

impl SessionError {
    pub fn device(err: impl std::fmt::Display) -> Self {
        SessionError::DeviceUnavailable(format!("{:#}", err))
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        SessionError::Transport(format!("{:#}", err))
    }
}
