//! Session domain types.
//!
//! A `SessionRecord` tracks one phase-run (triage, execute, or verify) of one
//! issue against the remote agent service. Records are created by the
//! orchestrator, mutated only through state machine transitions, and carry a
//! globally unique `sequence` stamped on every mutation so subscribers can
//! order and deduplicate deltas.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque unique identifier for a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// External issue identifier: tracker name plus issue number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueRef {
    pub tracker: String,
    pub number: i64,
}

impl IssueRef {
    pub fn new(tracker: impl Into<String>, number: i64) -> Self {
        Self {
            tracker: tracker.into(),
            number,
        }
    }
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tracker, self.number)
    }
}

/// A stage of the issue-resolution workflow.
///
/// Each phase runs as its own session record; a new phase means a new record
/// linked to its predecessor via `parent_session_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Triage,
    Execute,
    Verify,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::Execute => "execute",
            Self::Verify => "verify",
        }
    }

    /// The phase that chains after this one, if any.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Self::Triage => Some(Self::Execute),
            Self::Execute => Some(Self::Verify),
            Self::Verify => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "triage" => Ok(Self::Triage),
            "execute" => Ok(Self::Execute),
            "verify" => Ok(Self::Verify),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Lifecycle state of a session record.
///
/// States advance monotonically through the graph
/// `Pending → Dispatched → Running → {Succeeded, Failed, Cancelled}`,
/// except that any non-terminal state may detour through `Retrying` back
/// to `Dispatched` while the retry budget lasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, not yet dispatched to the agent service
    #[default]
    Pending,
    /// Remote session creation requested or acknowledged
    Dispatched,
    /// Remote session confirmed active
    Running,
    /// Waiting out a backoff before re-dispatch
    Retrying { attempt: u32 },
    /// Remote session finished successfully
    Succeeded,
    /// Fatal error or retry budget exhausted
    Failed,
    /// Cancelled by the operator
    Cancelled,
}

impl SessionState {
    /// Check if the state is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Check if the record should be on the poll schedule.
    pub fn is_pollable(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Retrying { .. } => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local tracked state for one phase-run against one issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub issue_ref: IssueRef,
    pub phase: Phase,
    /// Identifier assigned by the agent service; set at most once.
    pub remote_session_id: Option<String>,
    /// Browser URL for the remote session, if the service provides one.
    pub remote_session_url: Option<String>,
    pub state: SessionState,
    /// Transient-error retries consumed so far.
    pub retry_attempts: u32,
    /// Confidence score from the agent (triage); immutable once set.
    pub confidence: Option<f64>,
    pub plan_summary: Option<String>,
    pub result_summary: Option<String>,
    /// Change request (pull request) reference, once known.
    pub change_request: Option<String>,
    /// Previous phase's record, for chained sessions.
    pub parent_session_id: Option<SessionId>,
    /// Global mutation counter; strictly increasing per record and unique
    /// across all records.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Create a fresh `Pending` record. The table assigns `sequence`.
    pub fn new(issue_ref: IssueRef, phase: Phase, parent_session_id: Option<SessionId>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            issue_ref,
            phase,
            remote_session_id: None,
            remote_session_url: None,
            state: SessionState::Pending,
            retry_attempts: 0,
            confidence: None,
            plan_summary: None,
            result_summary: None,
            change_request: None,
            parent_session_id,
            sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Project this record into the delta shape published on the event bus.
    pub fn to_delta(&self) -> SessionDelta {
        SessionDelta {
            session_id: self.id,
            issue_ref: self.issue_ref.clone(),
            phase: self.phase,
            state: self.state.clone(),
            confidence: self.confidence,
            change_request: self.change_request.clone(),
            sequence: self.sequence,
            timestamp: self.updated_at,
        }
    }
}

/// One committed state change, as delivered to dashboard subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDelta {
    pub session_id: SessionId,
    pub issue_ref: IssueRef,
    pub phase: Phase,
    pub state: SessionState,
    pub confidence: Option<f64>,
    pub change_request: Option<String>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrip() {
        for s in &["triage", "execute", "verify"] {
            let parsed: Phase = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<Phase>().is_err());
    }

    #[test]
    fn test_phase_chain_order() {
        assert_eq!(Phase::Triage.next(), Some(Phase::Execute));
        assert_eq!(Phase::Execute.next(), Some(Phase::Verify));
        assert_eq!(Phase::Verify.next(), None);
    }

    #[test]
    fn test_state_terminal() {
        assert!(!SessionState::Pending.is_terminal());
        assert!(!SessionState::Dispatched.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(!SessionState::Retrying { attempt: 1 }.is_terminal());
        assert!(SessionState::Succeeded.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
    }

    #[test]
    fn test_state_pollable() {
        assert!(SessionState::Dispatched.is_pollable());
        assert!(SessionState::Running.is_pollable());
        assert!(!SessionState::Pending.is_pollable());
        assert!(!SessionState::Retrying { attempt: 1 }.is_pollable());
        assert!(!SessionState::Succeeded.is_pollable());
    }

    #[test]
    fn test_serde_produces_lowercase_strings() {
        assert_eq!(serde_json::to_string(&Phase::Triage).unwrap(), "\"triage\"");
        assert_eq!(
            serde_json::to_string(&SessionState::Running).unwrap(),
            "\"running\""
        );
        let json = serde_json::to_string(&SessionState::Retrying { attempt: 2 }).unwrap();
        assert!(json.contains("retrying"));
        assert!(json.contains("\"attempt\":2"));
    }

    #[test]
    fn test_issue_ref_display() {
        assert_eq!(IssueRef::new("github", 42).to_string(), "github#42");
    }

    #[test]
    fn test_new_record_is_pending() {
        let record = SessionRecord::new(IssueRef::new("github", 1), Phase::Triage, None);
        assert_eq!(record.state, SessionState::Pending);
        assert!(record.is_active());
        assert!(record.remote_session_id.is_none());
        assert_eq!(record.retry_attempts, 0);
    }

    #[test]
    fn test_delta_projection() {
        let mut record = SessionRecord::new(IssueRef::new("github", 7), Phase::Execute, None);
        record.sequence = 12;
        record.confidence = Some(0.85);
        let delta = record.to_delta();
        assert_eq!(delta.session_id, record.id);
        assert_eq!(delta.sequence, 12);
        assert_eq!(delta.confidence, Some(0.85));
        assert_eq!(delta.phase, Phase::Execute);
    }

    #[test]
    fn test_session_id_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
