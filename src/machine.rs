//! Pure phase state machine.
//!
//! `apply` maps (current state, incoming event) to the next state plus a list
//! of side effects. It performs no I/O and mutates nothing; effects are
//! returned as data and executed by the orchestrator only after the new state
//! has been committed, so the recorded state and the attempted side effect
//! can never disagree after a crash-and-restart.
//!
//! Transition graph:
//!
//! ```text
//! Pending ──Dispatch──> Dispatched ──PollResult──> Running ──┬─> Succeeded
//!    │                      │  ^                      │      ├─> Failed
//!    │                      │  └──Dispatch── Retrying <──────┘  (transient,
//!    │                      └────────────────────^              within budget)
//!    └──────────────── CancelRequested from any non-terminal ──> Cancelled
//! ```

use serde::{Deserialize, Serialize};

use crate::adapters::agent::StatusReport;
use crate::session::{Phase, SessionState};

/// Events fed into the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Start (or restart, after a retry backoff) remote dispatch.
    Dispatch,
    /// The agent service acknowledged session creation.
    RemoteAck {
        remote_session_id: String,
        url: Option<String>,
    },
    /// A poll against the agent service returned.
    PollResult(StatusReport),
    /// A retryable failure (network error, timeout, 5xx, rate limit).
    TransientError { message: String },
    /// A non-retryable failure (remote session failed, auth rejected).
    FatalError { message: String },
    /// Operator asked for cancellation.
    CancelRequested,
    /// An external scheduler gave up retrying.
    RetryBudgetExhausted,
}

/// Side effects requested by a transition, executed after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Call the agent service to create the remote session
    /// (skipped by the executor if the record already has one).
    CreateRemoteSession,
    /// Best-effort cancel of the remote session.
    CancelRemoteSession,
    /// Schedule a delayed re-dispatch; backoff derives from `attempt`.
    ScheduleRetry { attempt: u32 },
    /// Triage succeeded: compare confidence against the auto-chain threshold.
    EvaluateTriageChain,
    /// Execute succeeded: detect the change request, then chain Verify.
    DetectChangeRequest,
}

/// Record-derived context the pure function needs besides the state itself.
#[derive(Debug, Clone, Copy)]
pub struct MachineCtx {
    pub phase: Phase,
    /// Transient-error retries consumed so far.
    pub retry_attempts: u32,
    /// Confidence already attached (it is immutable once set).
    pub has_confidence: bool,
    /// Change request already recorded.
    pub has_change_request: bool,
    /// Fixed retry count; the attempt after this many transients fails.
    pub retry_budget: u32,
}

/// The computed next state plus field updates and effects.
///
/// Optional fields are "set if `Some`"; the orchestrator never clears a field
/// because a later transition omitted it (confidence in particular stays
/// immutable once attached).
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: SessionState,
    pub retry_attempts: u32,
    pub remote_session_id: Option<String>,
    pub remote_session_url: Option<String>,
    pub confidence: Option<f64>,
    pub plan_summary: Option<String>,
    pub result_summary: Option<String>,
    pub change_request: Option<String>,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: SessionState, ctx: &MachineCtx) -> Self {
        Self {
            next,
            retry_attempts: ctx.retry_attempts,
            remote_session_id: None,
            remote_session_url: None,
            confidence: None,
            plan_summary: None,
            result_summary: None,
            change_request: None,
            effects: Vec::new(),
        }
    }

    fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Apply one event to one record's state.
///
/// Returns `None` when the event does not produce a mutation: events against
/// terminal records (late poll results after cancellation), acknowledgements
/// in the wrong state, and in-progress polls that carry nothing new. A `None`
/// must not bump the record's sequence.
pub fn apply(state: &SessionState, ctx: &MachineCtx, event: Event) -> Option<Transition> {
    if state.is_terminal() {
        // One late event still matters: an acknowledgement arriving after the
        // record was cancelled carries the only copy of the remote session id.
        // Record it and cancel the remote session it names.
        if let (
            SessionState::Cancelled,
            Event::RemoteAck {
                remote_session_id,
                url,
            },
        ) = (state, event)
        {
            let mut t = Transition::to(SessionState::Cancelled, ctx)
                .with_effect(Effect::CancelRemoteSession);
            t.remote_session_id = Some(remote_session_id);
            t.remote_session_url = url;
            return Some(t);
        }
        return None;
    }

    match event {
        Event::CancelRequested => Some(
            Transition::to(SessionState::Cancelled, ctx).with_effect(Effect::CancelRemoteSession),
        ),

        Event::FatalError { message } => {
            let mut t = Transition::to(SessionState::Failed, ctx);
            t.result_summary = Some(message);
            Some(t)
        }

        Event::RetryBudgetExhausted => {
            let mut t = Transition::to(SessionState::Failed, ctx);
            t.result_summary = Some(format!(
                "retry budget exhausted after {} attempts",
                ctx.retry_attempts
            ));
            Some(t)
        }

        Event::TransientError { message } => Some(transient(ctx, message)),

        Event::Dispatch => match state {
            SessionState::Pending | SessionState::Retrying { .. } => Some(
                Transition::to(SessionState::Dispatched, ctx)
                    .with_effect(Effect::CreateRemoteSession),
            ),
            _ => None,
        },

        Event::RemoteAck {
            remote_session_id,
            url,
        } => match state {
            SessionState::Dispatched => {
                let mut t = Transition::to(SessionState::Dispatched, ctx);
                t.remote_session_id = Some(remote_session_id);
                t.remote_session_url = url;
                Some(t)
            }
            _ => None,
        },

        Event::PollResult(report) => match state {
            SessionState::Dispatched | SessionState::Running => poll_result(state, ctx, report),
            _ => None,
        },
    }
}

fn transient(ctx: &MachineCtx, message: String) -> Transition {
    if ctx.retry_attempts >= ctx.retry_budget {
        let mut t = Transition::to(SessionState::Failed, ctx);
        t.result_summary = Some(format!(
            "failed after {} transient errors: {}",
            ctx.retry_attempts + 1,
            message
        ));
        return t;
    }
    let attempt = ctx.retry_attempts + 1;
    let mut t = Transition::to(SessionState::Retrying { attempt }, ctx)
        .with_effect(Effect::ScheduleRetry { attempt });
    t.retry_attempts = attempt;
    t
}

fn poll_result(state: &SessionState, ctx: &MachineCtx, report: StatusReport) -> Option<Transition> {
    use crate::adapters::agent::RemoteStatus;

    // Unknown remote vocabulary degrades to a transient condition instead of
    // failing the record.
    if let RemoteStatus::Unknown(raw) = &report.status {
        return Some(transient(ctx, format!("unrecognized remote status: {raw}")));
    }

    let new_confidence = report.confidence.filter(|_| !ctx.has_confidence);
    let new_change_request = report.change_request.filter(|_| !ctx.has_change_request);

    if report.status.is_in_progress() {
        let confirms_running = *state == SessionState::Dispatched;
        if !confirms_running && new_confidence.is_none() && new_change_request.is_none() {
            return None; // nothing new; not a mutation
        }
        let mut t = Transition::to(SessionState::Running, ctx);
        t.confidence = new_confidence;
        t.change_request = new_change_request;
        return Some(t);
    }

    if report.status.is_success() {
        let mut t = Transition::to(SessionState::Succeeded, ctx);
        t.confidence = new_confidence;
        t.change_request = new_change_request;
        match ctx.phase {
            Phase::Triage => {
                t.plan_summary = report.summary;
                t.effects.push(Effect::EvaluateTriageChain);
            }
            Phase::Execute => {
                t.result_summary = report.summary;
                t.effects.push(Effect::DetectChangeRequest);
            }
            Phase::Verify => {
                t.result_summary = report.summary;
            }
        }
        return Some(t);
    }

    if report.status.is_failure() {
        let mut t = Transition::to(SessionState::Failed, ctx);
        t.result_summary = report
            .summary
            .or_else(|| Some(format!("remote session reported {}", report.status)));
        return Some(t);
    }

    // Remote-side cancellation.
    Some(Transition::to(SessionState::Cancelled, ctx))
}
