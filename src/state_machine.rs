use tokio::sync::watch;

use crate::error::SessionError;

/// Lifecycle of one voice session. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            // stop() before start(), or an output device that cannot be opened
            (Idle, Connecting) | (Idle, Closed) | (Idle, Failed)
                | (Connecting, Open) | (Connecting, Closing) | (Connecting, Closed) | (Connecting, Failed)
                | (Open, Closing) | (Open, Closed) | (Open, Failed)
                | (Closing, Closed) | (Closing, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

/// Single-writer cell for the session state. Readers subscribe through `watch`.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Idle);
        Self { tx }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move to `to`, returning the previous state. Illegal transitions leave the state untouched.
    pub fn transition(&self, to: SessionState) -> Result<SessionState, SessionError> {
        let from = self.get();
        if !from.can_transition(to) {
            return Err(SessionError::InvalidState { op: to.as_str(), state: from });
        }
        self.tx.send_replace(to);
        log::debug!("Session state {} -> {}", from.as_str(), to.as_str());
        Ok(from)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
