//! In-memory session record table.
//!
//! The table is the single shared resource of the orchestrator. It is an
//! explicitly owned value (no singleton) guarded by one short-lived mutex;
//! no I/O ever happens inside its critical sections. Commits are optimistic:
//! a writer presents the sequence it read, and the commit fails if the record
//! has advanced since, in which case the orchestrator re-reads and re-applies.
//!
//! The table also owns the delta feed. Every mutation sends its delta on the
//! broadcast channel while the table mutex is still held, so sequence
//! assignment and publication are one atomic step: subscribers observe
//! commits in global sequence order, across records.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;

use crate::bus::Subscription;
use crate::errors::OrchestratorError;
use crate::machine::Transition;
use crate::session::{IssueRef, Phase, SessionDelta, SessionId, SessionRecord};

/// Feed buffer size when none is configured (tests, ad-hoc tables).
const DEFAULT_FEED_CAPACITY: usize = 256;

/// Filter for `SessionTable::list`.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub issue_ref: Option<IssueRef>,
    pub phase: Option<Phase>,
    pub state: Option<String>,
    pub active_only: bool,
}

impl SessionFilter {
    fn matches(&self, record: &SessionRecord) -> bool {
        if let Some(issue) = &self.issue_ref {
            if &record.issue_ref != issue {
                return false;
            }
        }
        if let Some(phase) = self.phase {
            if record.phase != phase {
                return false;
            }
        }
        if let Some(state) = &self.state {
            if record.state.as_str() != state {
                return false;
            }
        }
        if self.active_only && !record.is_active() {
            return false;
        }
        true
    }
}

#[derive(Default)]
struct Inner {
    records: HashMap<SessionId, SessionRecord>,
    /// Active (non-terminal) record per (issue, phase).
    active: HashMap<(IssueRef, Phase), SessionId>,
    /// Global mutation counter, shared across all records.
    next_sequence: u64,
}

/// Owned table of session records with a global mutation sequence.
pub struct SessionTable {
    inner: Mutex<Inner>,
    /// Delta feed. Sends happen under the `inner` lock so the feed carries
    /// commits in global sequence order.
    tx: broadcast::Sender<SessionDelta>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `capacity` bounds each subscriber's buffer; a subscriber that lets
    /// more than `capacity` deltas pile up overflows and must resync.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Mutex::default(),
            tx,
        }
    }

    /// Subscribe with a consistent snapshot of the table.
    ///
    /// The receiver is registered and the snapshot taken under the same lock
    /// acquisition, so the live stream starts exactly after the snapshot's
    /// watermark: no gap, no duplicate.
    pub fn subscribe(&self) -> Subscription {
        let inner = self.inner.lock().expect("session table poisoned");
        let rx = self.tx.subscribe();
        let mut snapshot: Vec<SessionRecord> = inner.records.values().cloned().collect();
        snapshot.sort_by_key(|r| (r.created_at, r.sequence));
        Subscription {
            snapshot,
            watermark: inner.next_sequence,
            rx,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Create a new `Pending` record.
    ///
    /// Fails with `DuplicateActiveSession` if an active record already exists
    /// for the same (issue, phase); the check and insert happen atomically
    /// under the table lock, so concurrent creates cannot both win.
    pub fn create(
        &self,
        issue_ref: IssueRef,
        phase: Phase,
        parent_session_id: Option<SessionId>,
    ) -> Result<SessionRecord, OrchestratorError> {
        let mut inner = self.inner.lock().expect("session table poisoned");
        let key = (issue_ref.clone(), phase);
        if let Some(existing) = inner.active.get(&key) {
            // The index can hold a stale entry if eviction raced us.
            if inner.records.get(existing).is_some_and(|r| r.is_active()) {
                return Err(OrchestratorError::DuplicateActiveSession {
                    issue: issue_ref,
                    phase,
                });
            }
        }

        let mut record = SessionRecord::new(issue_ref, phase, parent_session_id);
        inner.next_sequence += 1;
        record.sequence = inner.next_sequence;
        inner.active.insert(key, record.id);
        inner.records.insert(record.id, record.clone());
        let _ = self.tx.send(record.to_delta());
        Ok(record)
    }

    pub fn get(&self, id: SessionId) -> Result<SessionRecord, OrchestratorError> {
        self.inner
            .lock()
            .expect("session table poisoned")
            .records
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::NotFound(id))
    }

    /// Snapshot-consistent listing, ordered by creation time.
    pub fn list(&self, filter: &SessionFilter) -> Vec<SessionRecord> {
        let inner = self.inner.lock().expect("session table poisoned");
        let mut records: Vec<SessionRecord> = inner
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.created_at, r.sequence));
        records
    }

    /// Apply a committed transition to a record.
    ///
    /// `expected_sequence` is the optimistic-concurrency token: the commit
    /// fails with `CommitConflict` if the record mutated since the caller
    /// read it. On success the record receives the next global sequence, the
    /// delta goes out on the feed, and the updated copy is returned.
    pub fn commit(
        &self,
        id: SessionId,
        expected_sequence: u64,
        transition: &Transition,
    ) -> Result<SessionRecord, OrchestratorError> {
        let mut inner = self.inner.lock().expect("session table poisoned");
        inner.next_sequence += 1;
        let sequence = inner.next_sequence;

        let record = inner
            .records
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(id))?;
        if record.sequence != expected_sequence {
            // The reserved counter value is abandoned; gaps in the global
            // sequence are harmless, only ordering matters.
            return Err(OrchestratorError::CommitConflict(id));
        }

        record.state = transition.next.clone();
        record.retry_attempts = transition.retry_attempts;
        if record.remote_session_id.is_none() {
            record.remote_session_id = transition.remote_session_id.clone();
        }
        if record.remote_session_url.is_none() {
            record.remote_session_url = transition.remote_session_url.clone();
        }
        if record.confidence.is_none() {
            record.confidence = transition.confidence;
        }
        if let Some(plan) = &transition.plan_summary {
            record.plan_summary = Some(plan.clone());
        }
        if let Some(result) = &transition.result_summary {
            record.result_summary = Some(result.clone());
        }
        if record.change_request.is_none() {
            record.change_request = transition.change_request.clone();
        }
        record.sequence = sequence;
        record.updated_at = Utc::now();

        let updated = record.clone();
        if !updated.is_active() {
            inner
                .active
                .remove(&(updated.issue_ref.clone(), updated.phase));
        }
        let _ = self.tx.send(updated.to_delta());
        Ok(updated)
    }

    /// Record a change request discovered outside a state transition
    /// (Issue Source lookup after Execute succeeded). Bumps the sequence.
    pub fn set_change_request(
        &self,
        id: SessionId,
        change_request: &str,
    ) -> Result<SessionRecord, OrchestratorError> {
        let mut inner = self.inner.lock().expect("session table poisoned");
        inner.next_sequence += 1;
        let sequence = inner.next_sequence;
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(id))?;
        if record.change_request.is_none() {
            record.change_request = Some(change_request.to_string());
            record.sequence = sequence;
            record.updated_at = Utc::now();
            let delta = record.to_delta();
            let _ = self.tx.send(delta);
        }
        Ok(record.clone())
    }

    /// Evict terminal records whose last update is older than `retention`.
    /// Returns the evicted records (callers may persist them first).
    pub fn evict_expired(&self, retention: Duration, now: DateTime<Utc>) -> Vec<SessionRecord> {
        let mut inner = self.inner.lock().expect("session table poisoned");
        let expired: Vec<SessionId> = inner
            .records
            .values()
            .filter(|r| !r.is_active() && now - r.updated_at > retention)
            .map(|r| r.id)
            .collect();
        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(record) = inner.records.remove(&id) {
                let key = (record.issue_ref.clone(), record.phase);
                if inner.active.get(&key) == Some(&record.id) {
                    inner.active.remove(&key);
                }
                evicted.push(record);
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("session table poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
