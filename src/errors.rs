//! Error types for the orchestrator core and its adapters.
//!
//! Adapter failures are classified at the boundary into transient and fatal;
//! everything downstream (the state machine, the retry scheduler) branches on
//! that classification alone and never inspects protocol details.

use std::time::Duration;

use thiserror::Error;

use crate::session::{IssueRef, Phase, SessionId};

/// Failure from a remote adapter (agent service, issue tracker).
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Worth retrying: network failures, timeouts, rate limits, 5xx.
    #[error("transient adapter error: {message}")]
    Transient {
        message: String,
        /// Server-suggested delay, when the response carried one.
        retry_after: Option<Duration>,
    },

    /// Not worth retrying: bad credentials, malformed requests, 4xx.
    #[error("fatal adapter error: {message}")]
    Fatal { message: String },
}

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Classify an HTTP error status. 429 is handled by callers that want the
    /// Retry-After header; here it still classifies as transient.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => Self::transient(format!("rate limited ({status}): {body}")),
            401 | 403 => Self::fatal(format!("authentication rejected ({status}): {body}")),
            500..=599 => Self::transient(format!("server error ({status}): {body}")),
            _ => Self::fatal(format!("request rejected ({status}): {body}")),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

// Connection resets, DNS failures, and client timeouts are all retryable.
impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        Self::transient(err.to_string())
    }
}

/// Failure from the orchestrator itself.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("an active {phase} session already exists for {issue}")]
    DuplicateActiveSession { issue: IssueRef, phase: Phase },

    #[error("no session {0}")]
    NotFound(SessionId),

    #[error("session {session} is {state}; chaining requires a succeeded {expected} session")]
    InvalidChain {
        session: SessionId,
        state: String,
        expected: Phase,
    },

    #[error("retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },

    #[error("session {0} changed during commit")]
    CommitConflict(SessionId),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Failure on the subscriber side of the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The subscriber fell behind and `missed` deltas were dropped; it must
    /// resubscribe for a fresh snapshot.
    #[error("subscriber overflowed; {missed} deltas dropped")]
    Overflow { missed: u64 },

    /// The orchestrator (the only sender) is gone.
    #[error("event bus closed")]
    Closed,
}
