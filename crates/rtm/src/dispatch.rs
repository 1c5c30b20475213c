//! Ordered-fallback command delivery.
//!
//! Backend addressing conventions differ between the login identity and the
//! deliverable recipient identity, so delivery tries an ordered candidate
//! list and stops at the first success, recording every attempt for the
//! caller's result.

use std::sync::Arc;

use tracing::{debug, warn};

use tiller_protocol::{CommandEnvelope, DispatchAttempt};

use crate::{error::DispatchError, session::RemoteSession};

/// Successful delivery: which candidate took the command, and the full
/// attempt trail that led there.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub recipient: String,
    pub attempts: Vec<DispatchAttempt>,
}

/// Resolves recipient candidates and attempts delivery with fallback.
pub struct CommandDispatcher {
    /// Configured fallback target, tried after an explicit override.
    fallback: Option<String>,
}

impl CommandDispatcher {
    pub fn new(fallback: Option<String>) -> Self {
        Self { fallback }
    }

    /// Assemble the ordered, de-duplicated candidate list. Order is fixed:
    /// explicit override, configured fallback, the session's resolved
    /// backend identity, the caller-supplied identity. First occurrence
    /// wins on duplicates.
    pub fn candidates(sources: [Option<&str>; 4]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for candidate in sources.into_iter().flatten() {
            if !candidate.is_empty() && !out.iter().any(|c| c == candidate) {
                out.push(candidate.to_string());
            }
        }
        out
    }

    /// Deliver `envelope` through `session`, trying candidates strictly in
    /// order. Every candidate is attempted at most once; the full attempt
    /// list is returned either way.
    pub async fn dispatch(
        &self,
        session: &Arc<RemoteSession>,
        envelope: &CommandEnvelope,
        recipient_override: Option<&str>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let resolved = session.resolved_user_id().await;
        let caller = session.current_identity().await;
        let candidates = Self::candidates([
            recipient_override,
            self.fallback.as_deref(),
            resolved.as_deref(),
            caller.as_deref(),
        ]);
        self.dispatch_to(session, envelope, &candidates).await
    }

    /// Same as [`Self::dispatch`] with an explicit candidate list.
    pub async fn dispatch_to(
        &self,
        session: &Arc<RemoteSession>,
        envelope: &CommandEnvelope,
        candidates: &[String],
    ) -> Result<DispatchOutcome, DispatchError> {
        if candidates.is_empty() {
            return Err(DispatchError::NoCandidates);
        }

        let mut attempts = Vec::with_capacity(candidates.len());
        for recipient in candidates {
            match session.send(envelope, recipient).await {
                Ok(()) => {
                    debug!(recipient = %recipient, code = envelope.code, "command delivered");
                    attempts.push(DispatchAttempt {
                        recipient: recipient.clone(),
                        ok: true,
                        error: None,
                    });
                    return Ok(DispatchOutcome {
                        recipient: recipient.clone(),
                        attempts,
                    });
                },
                Err(e) => {
                    debug!(recipient = %recipient, error = %e, "delivery attempt failed");
                    attempts.push(DispatchAttempt {
                        recipient: recipient.clone(),
                        ok: false,
                        error: Some(e.to_string()),
                    });
                },
            }
        }

        warn!(
            code = envelope.code,
            tried = attempts.len(),
            "command undeliverable, all candidates failed"
        );
        Err(DispatchError::AllFailed { attempts })
    }
}
