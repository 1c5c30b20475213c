use std::time::Duration;

use thiserror::Error;

use tiller_protocol::DispatchAttempt;

// ── Credential exchange ──────────────────────────────────────────────────────

/// Credential fetch failed. Fatal to the current initialization attempt,
/// retryable on the next `ensure_ready()`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signer request failed: {0}")]
    Request(String),
    #[error("signer returned status {0}")]
    Status(u16),
    #[error("malformed signer response: {0}")]
    Malformed(String),
}

// ── Session lifecycle and sends ──────────────────────────────────────────────

/// Errors surfaced by [`crate::session::RemoteSession`] operations.
///
/// `Clone` so an in-flight initialization can fan the same failure out to
/// every caller awaiting it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("transport connect failed: {0}")]
    Connect(String),

    #[error("backend never signaled ready within {0:?}")]
    ReadyTimeout(Duration),

    /// One send failed. The session and its queue remain usable.
    #[error("transport send failed: {0}")]
    TransportSend(String),

    /// The backend revoked the session (e.g. concurrent login elsewhere).
    #[error("backend forced logout: {0}")]
    ForcedLogout(String),

    /// Fail-fast guard: the session is not ready to send.
    #[error("session not ready")]
    NotReady,

    /// The session was torn down; a fresh `login_with` is required.
    #[error("session destroyed")]
    Destroyed,
}

impl SessionError {
    /// Whether this failure ends the session as a whole, as opposed to one
    /// operation on it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ForcedLogout(_) | Self::Destroyed)
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

/// Command delivery failed across the whole candidate list.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no recipient candidates resolved")]
    NoCandidates,

    #[error("all {} recipient candidates failed", attempts.len())]
    AllFailed { attempts: Vec<DispatchAttempt> },
}

impl DispatchError {
    /// Attempt records for the caller's `commandResult`, empty when no
    /// candidate was ever tried.
    pub fn attempts(&self) -> &[DispatchAttempt] {
        match self {
            Self::NoCandidates => &[],
            Self::AllFailed { attempts } => attempts,
        }
    }
}
