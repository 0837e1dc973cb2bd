//! Session orchestrator.
//!
//! The orchestrator is the single writer of the session table. Every
//! externally triggered action — create, poll result, cancel, phase chain —
//! runs as one atomic step: read the record, compute the transition through
//! the pure state machine, commit it (optimistically, keyed on the sequence;
//! the table publishes the delta as part of the commit), and execute the
//! returned side effects.
//! Steps for the same record are serialized by a per-record lock; steps for
//! different records run concurrently. Adapter I/O never happens while a
//! step lock is held — dispatch, cancellation, and chaining effects run on
//! spawned tasks that feed their outcomes back in as new events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{AgentClient, IssueSource};
use crate::bus::Subscription;
use crate::config::ConductorConfig;
use crate::errors::{AdapterError, OrchestratorError};
use crate::machine::{self, Effect, Event, MachineCtx};
use crate::poller::retry_backoff;
use crate::prompts;
use crate::session::{IssueRef, Phase, SessionId, SessionRecord, SessionState};
use crate::table::{SessionFilter, SessionTable};

pub struct Orchestrator {
    table: Arc<SessionTable>,
    agent: Arc<dyn AgentClient>,
    issues: Arc<dyn IssueSource>,
    config: ConductorConfig,
    /// Per-record step serialization; entries are pruned on terminal commit.
    step_locks: Mutex<HashMap<SessionId, Arc<AsyncMutex<()>>>>,
    /// Cooperative cancellation for in-flight polls, keyed by record.
    cancel_tokens: Mutex<HashMap<SessionId, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        agent: Arc<dyn AgentClient>,
        issues: Arc<dyn IssueSource>,
        config: ConductorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: Arc::new(SessionTable::with_capacity(config.bus_capacity)),
            agent,
            issues,
            config,
            step_locks: Mutex::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn issues(&self) -> &Arc<dyn IssueSource> {
        &self.issues
    }

    pub fn agent(&self) -> &Arc<dyn AgentClient> {
        &self.agent
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn get(&self, id: SessionId) -> Result<SessionRecord, OrchestratorError> {
        self.table.get(id)
    }

    pub fn list(&self, filter: &SessionFilter) -> Vec<SessionRecord> {
        self.table.list(filter)
    }

    /// Snapshot + live feed subscription for a dashboard connection.
    pub fn subscribe(&self) -> Subscription {
        self.table.subscribe()
    }

    // ── Control actions ─────────────────────────────────────────────

    /// Create and dispatch a Triage session for an issue.
    pub async fn start_triage(
        self: &Arc<Self>,
        issue_ref: IssueRef,
    ) -> Result<SessionRecord, OrchestratorError> {
        let record = self.table.create(issue_ref, Phase::Triage, None)?;
        info!(session = %record.id, issue = %record.issue_ref, "triage session created");
        self.step(record.id, Event::Dispatch).await?;
        self.table.get(record.id)
    }

    /// Chain an Execute session off a succeeded Triage session.
    pub async fn start_execute(
        self: &Arc<Self>,
        triage_id: SessionId,
    ) -> Result<SessionRecord, OrchestratorError> {
        let parent = self.table.get(triage_id)?;
        if parent.phase != Phase::Triage || parent.state != SessionState::Succeeded {
            return Err(OrchestratorError::InvalidChain {
                session: triage_id,
                state: parent.state.to_string(),
                expected: Phase::Triage,
            });
        }
        let record = self
            .table
            .create(parent.issue_ref.clone(), Phase::Execute, Some(triage_id))?;
        info!(session = %record.id, issue = %record.issue_ref, "execute session created");
        self.step(record.id, Event::Dispatch).await?;
        self.table.get(record.id)
    }

    /// Chain a Verify session off a succeeded Execute session.
    ///
    /// The change request comes from the Execute session's structured output
    /// when present, otherwise from an Issue Source lookup.
    pub async fn start_verify(
        self: &Arc<Self>,
        execute_id: SessionId,
    ) -> Result<SessionRecord, OrchestratorError> {
        let parent = self.table.get(execute_id)?;
        if parent.phase != Phase::Execute || parent.state != SessionState::Succeeded {
            return Err(OrchestratorError::InvalidChain {
                session: execute_id,
                state: parent.state.to_string(),
                expected: Phase::Execute,
            });
        }
        let change_request = match &parent.change_request {
            Some(cr) => cr.clone(),
            None => self
                .issues
                .find_change_request(&parent.issue_ref)
                .await?
                .ok_or_else(|| {
                    AdapterError::fatal(format!(
                        "no change request found for {}",
                        parent.issue_ref
                    ))
                })?,
        };
        let record =
            self.table
                .create(parent.issue_ref.clone(), Phase::Verify, Some(execute_id))?;
        let record = self.table.set_change_request(record.id, &change_request)?;
        info!(session = %record.id, issue = %record.issue_ref, "verify session created");
        self.step(record.id, Event::Dispatch).await?;
        self.table.get(record.id)
    }

    /// Cancel a session: unschedule polling immediately, cancel any in-flight
    /// network operation, mark the record `Cancelled`, and best-effort cancel
    /// the remote session.
    pub async fn cancel(
        self: &Arc<Self>,
        id: SessionId,
    ) -> Result<SessionRecord, OrchestratorError> {
        if let Some(token) = self.cancel_tokens.lock().expect("token map poisoned").get(&id) {
            token.cancel();
        }
        self.step(id, Event::CancelRequested).await?;
        self.table.get(id)
    }

    // ── Step engine ─────────────────────────────────────────────────

    /// Apply one event to one record atomically.
    ///
    /// Returns `Ok(None)` when the machine discards the event (late poll
    /// results against a terminal record, stale acknowledgements).
    pub async fn step(
        self: &Arc<Self>,
        id: SessionId,
        event: Event,
    ) -> Result<Option<SessionRecord>, OrchestratorError> {
        let lock = self.step_lock(id);
        let _guard = lock.lock().await;

        loop {
            let record = self.table.get(id)?;
            let ctx = MachineCtx {
                phase: record.phase,
                retry_attempts: record.retry_attempts,
                has_confidence: record.confidence.is_some(),
                has_change_request: record.change_request.is_some(),
                retry_budget: self.config.retry_budget,
            };
            let Some(transition) = machine::apply(&record.state, &ctx, event.clone()) else {
                debug!(session = %id, state = %record.state, ?event, "event discarded");
                return Ok(None);
            };

            match self.table.commit(id, record.sequence, &transition) {
                Ok(updated) => {
                    debug!(
                        session = %id,
                        from = %record.state,
                        to = %updated.state,
                        sequence = updated.sequence,
                        "transition committed"
                    );
                    if updated.state.is_terminal() {
                        self.forget(id);
                    }
                    self.run_effects(&updated, transition.effects);
                    return Ok(Some(updated));
                }
                // A concurrent non-step mutation slipped in; re-read and
                // re-apply under the same step lock.
                Err(OrchestratorError::CommitConflict(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn step_lock(&self, id: SessionId) -> Arc<AsyncMutex<()>> {
        self.step_locks
            .lock()
            .expect("step lock map poisoned")
            .entry(id)
            .or_default()
            .clone()
    }

    /// The cancellation token guarding a record's in-flight remote calls.
    pub fn poll_token(&self, id: SessionId) -> CancellationToken {
        self.cancel_tokens
            .lock()
            .expect("token map poisoned")
            .entry(id)
            .or_default()
            .clone()
    }

    fn forget(&self, id: SessionId) {
        self.step_locks.lock().expect("step lock map poisoned").remove(&id);
        self.cancel_tokens.lock().expect("token map poisoned").remove(&id);
    }

    // ── Effect execution ────────────────────────────────────────────

    fn run_effects(self: &Arc<Self>, record: &SessionRecord, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::CreateRemoteSession => self.effect_dispatch(record.clone()),
                Effect::CancelRemoteSession => self.effect_cancel_remote(record.clone()),
                Effect::ScheduleRetry { attempt } => self.effect_schedule_retry(record.id, attempt),
                Effect::EvaluateTriageChain => self.effect_triage_chain(record.clone()),
                Effect::DetectChangeRequest => self.effect_detect_change_request(record.clone()),
            }
        }
    }

    /// Create the remote session and feed the acknowledgement back in.
    /// Skipped when the record already has one (a retry re-dispatch simply
    /// resumes polling the existing remote session).
    fn effect_dispatch(self: &Arc<Self>, record: SessionRecord) {
        if record.remote_session_id.is_some() {
            debug!(session = %record.id, "re-dispatch with existing remote session");
            return;
        }
        let orch = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = orch.create_remote_session(&record).await;
            let event = match outcome {
                Ok((remote_session_id, url)) => Event::RemoteAck {
                    remote_session_id,
                    url,
                },
                Err(AdapterError::Transient { message, .. }) => {
                    Event::TransientError { message }
                }
                Err(AdapterError::Fatal { message }) => Event::FatalError { message },
            };
            if let Err(err) = orch.step(record.id, event).await {
                warn!(session = %record.id, %err, "dispatch step failed");
            }
        });
    }

    async fn create_remote_session(
        &self,
        record: &SessionRecord,
    ) -> Result<(String, Option<String>), AdapterError> {
        let (title, prompt) = match record.phase {
            Phase::Triage => {
                let details = self.issues.fetch_issue(&record.issue_ref).await?;
                (
                    prompts::session_title("triage", &record.issue_ref, &details.title),
                    prompts::triage_prompt(&details),
                )
            }
            Phase::Execute => {
                let details = self.issues.fetch_issue(&record.issue_ref).await?;
                let plan = record
                    .parent_session_id
                    .and_then(|pid| self.table.get(pid).ok())
                    .and_then(|parent| parent.plan_summary);
                (
                    prompts::session_title("execute", &record.issue_ref, &details.title),
                    prompts::execute_prompt(&details, plan.as_deref()),
                )
            }
            Phase::Verify => {
                let change_request = record.change_request.clone().ok_or_else(|| {
                    AdapterError::fatal("verify session has no change request")
                })?;
                let checks = self.issues.get_checks_status(&change_request).await.ok();
                (
                    prompts::session_title("verify", &record.issue_ref, &change_request),
                    prompts::verify_prompt(&record.issue_ref, &change_request, checks),
                )
            }
        };
        let created = self
            .agent
            .create_session(record.phase, &title, &prompt)
            .await?;
        Ok((created.remote_session_id, created.url))
    }

    /// Best-effort remote cancellation; the local record is already terminal.
    fn effect_cancel_remote(self: &Arc<Self>, record: SessionRecord) {
        let Some(remote_id) = record.remote_session_id.clone() else {
            return;
        };
        let orch = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = orch.agent.cancel_session(&remote_id).await {
                warn!(session = %record.id, %err, "remote cancel failed; record stays cancelled");
            }
        });
    }

    /// Wait out the backoff, then re-dispatch. The step engine discards the
    /// dispatch if the record went terminal in the meantime.
    fn effect_schedule_retry(self: &Arc<Self>, id: SessionId, attempt: u32) {
        let orch = Arc::clone(self);
        let delay = retry_backoff(&self.config, attempt);
        let token = self.poll_token(id);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            debug!(session = %id, attempt, "retry backoff elapsed; re-dispatching");
            if let Err(err) = orch.step(id, Event::Dispatch).await {
                warn!(session = %id, %err, "retry dispatch failed");
            }
        });
    }

    /// Triage succeeded: auto-chain to Execute when the confidence clears the
    /// configured threshold. Below-threshold results stay visible on the
    /// dashboard for manual action.
    fn effect_triage_chain(self: &Arc<Self>, record: SessionRecord) {
        if !self.config.auto_chain {
            return;
        }
        let threshold = self.config.confidence_threshold;
        match record.confidence {
            Some(score) if score >= threshold => {
                let orch = Arc::clone(self);
                tokio::spawn(async move {
                    info!(
                        session = %record.id,
                        issue = %record.issue_ref,
                        score,
                        "triage confidence clears threshold; chaining execute"
                    );
                    match orch.start_execute(record.id).await {
                        Ok(_) => {}
                        Err(OrchestratorError::DuplicateActiveSession { .. }) => {
                            debug!(issue = %record.issue_ref, "execute already active; not chaining");
                        }
                        Err(err) => {
                            warn!(session = %record.id, %err, "execute auto-chain failed");
                        }
                    }
                });
            }
            Some(score) => {
                info!(
                    session = %record.id,
                    issue = %record.issue_ref,
                    score,
                    threshold,
                    "triage confidence below threshold; awaiting manual action"
                );
            }
            None => {
                warn!(session = %record.id, "triage succeeded without a confidence score");
            }
        }
    }

    /// Execute succeeded: make sure the change request is recorded, then
    /// chain Verify. When neither the structured output nor an existing open
    /// change request yields one, a change request is opened from the work
    /// branch the execute session pushed to.
    fn effect_detect_change_request(self: &Arc<Self>, record: SessionRecord) {
        let orch = Arc::clone(self);
        tokio::spawn(async move {
            let change_request = match &record.change_request {
                Some(cr) => Some(cr.clone()),
                None => match orch.issues.find_change_request(&record.issue_ref).await {
                    Ok(Some(found)) => Some(found),
                    Ok(None) => orch.open_change_request_from_branch(&record).await,
                    Err(err) => {
                        warn!(session = %record.id, %err, "change request lookup failed");
                        None
                    }
                },
            };
            let Some(change_request) = change_request else {
                info!(
                    session = %record.id,
                    issue = %record.issue_ref,
                    "execute succeeded but no change request detected; not chaining verify"
                );
                return;
            };
            if record.change_request.is_none() {
                if let Err(err) = orch.table.set_change_request(record.id, &change_request) {
                    warn!(session = %record.id, %err, "recording change request failed");
                }
            }
            if !orch.config.auto_chain {
                return;
            }
            match orch.start_verify(record.id).await {
                Ok(_) => {}
                Err(OrchestratorError::DuplicateActiveSession { .. }) => {
                    debug!(issue = %record.issue_ref, "verify already active; not chaining");
                }
                Err(err) => warn!(session = %record.id, %err, "verify auto-chain failed"),
            }
        });
    }

    /// Open a change request from the execute session's work branch, for runs
    /// where the agent pushed the branch but never opened one. Fails quietly:
    /// the branch may not exist either, and the record stays Succeeded with
    /// the gap visible on the dashboard.
    async fn open_change_request_from_branch(&self, record: &SessionRecord) -> Option<String> {
        let branch = prompts::work_branch(&record.issue_ref);
        let title = format!("Resolve {}", record.issue_ref);
        let body = record.result_summary.clone().unwrap_or_default();
        match self
            .issues
            .open_change_request(&record.issue_ref, &branch, &title, &body)
            .await
        {
            Ok(url) => {
                info!(session = %record.id, %branch, %url, "opened change request from work branch");
                Some(url)
            }
            Err(err) => {
                info!(session = %record.id, %branch, %err, "could not open a change request");
                None
            }
        }
    }
}
