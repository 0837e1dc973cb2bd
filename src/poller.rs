//! Poll scheduler.
//!
//! A single scan loop walks the table on a short tick, decides which records
//! are due based on their state, and spawns one bounded poll task per due
//! record. `Dispatched` records poll fast (the remote session is still
//! confirming); `Running` records start at the slow interval and back off
//! toward a ceiling as they age. Poll outcomes are fed back into the
//! orchestrator as events; the poller itself never touches the table beyond
//! reading it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConductorConfig;
use crate::errors::AdapterError;
use crate::machine::Event;
use crate::orchestrator::Orchestrator;
use crate::session::{SessionId, SessionRecord, SessionState};
use crate::table::SessionFilter;

/// Running sessions double their poll interval every this long.
const RUNNING_BACKOFF_EVERY: Duration = Duration::from_secs(5 * 60);

/// How often the scan loop wakes to look for due records.
const SCAN_TICK: Duration = Duration::from_secs(1);

/// Exponential backoff with jitter for retry re-dispatch.
///
/// `attempt` is 1-based; jitter spreads simultaneous retries so a burst of
/// rate-limited records does not re-dispatch in lockstep.
pub(crate) fn retry_backoff(config: &ConductorConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = config
        .backoff_base
        .saturating_mul(2u32.saturating_pow(exp))
        .min(config.backoff_cap);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(jitter).min(config.backoff_cap)
}

/// Poll interval a record must wait out since its last update.
fn due_interval(record: &SessionRecord, config: &ConductorConfig, now: chrono::DateTime<Utc>) -> Option<Duration> {
    match record.state {
        SessionState::Dispatched => Some(config.poll_fast),
        SessionState::Running => {
            let age = (now - record.created_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let doublings =
                (age.as_secs() / RUNNING_BACKOFF_EVERY.as_secs().max(1)).min(16) as u32;
            let interval = config
                .poll_slow
                .saturating_mul(2u32.saturating_pow(doublings));
            Some(interval.min(config.poll_max))
        }
        _ => None,
    }
}

pub struct Poller {
    orchestrator: Arc<Orchestrator>,
    permits: Arc<Semaphore>,
    /// Records with a poll currently in flight; at most one each.
    in_flight: Arc<Mutex<HashSet<SessionId>>>,
}

impl Poller {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let permits = Arc::new(Semaphore::new(
            orchestrator.config().max_concurrent_polls,
        ));
        Self {
            orchestrator,
            permits,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run the scan loop until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("poller started");
        let mut tick = tokio::time::interval(SCAN_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_housekeeping = Utc::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("poller stopping");
                    return;
                }
                _ = tick.tick() => {}
            }
            self.scan();

            let now = Utc::now();
            if now - last_housekeeping > chrono::Duration::seconds(60) {
                last_housekeeping = now;
                self.housekeeping(now);
            }
        }
    }

    /// One pass over the table: spawn a poll for every due record.
    fn scan(&self) {
        let now = Utc::now();
        let config = self.orchestrator.config();
        let active = self.orchestrator.table().list(&SessionFilter {
            active_only: true,
            ..Default::default()
        });
        for record in active {
            if !record.state.is_pollable() {
                continue;
            }
            let Some(remote_id) = record.remote_session_id.clone() else {
                continue;
            };
            let Some(interval) = due_interval(&record, config, now) else {
                continue;
            };
            let elapsed = (now - record.updated_at).to_std().unwrap_or(Duration::ZERO);
            if elapsed < interval {
                continue;
            }
            if !self.in_flight.lock().expect("in-flight set poisoned").insert(record.id) {
                continue;
            }
            self.spawn_poll(record.id, remote_id);
        }
    }

    fn spawn_poll(&self, id: SessionId, remote_id: String) {
        let orch = Arc::clone(&self.orchestrator);
        let permits = Arc::clone(&self.permits);
        let in_flight = Arc::clone(&self.in_flight);
        let timeout = orch.config().poll_timeout;
        let token = orch.poll_token(id);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                // Semaphore closed only at shutdown.
                in_flight.lock().expect("in-flight set poisoned").remove(&id);
                return;
            };
            let event = tokio::select! {
                _ = token.cancelled() => {
                    debug!(session = %id, "poll cancelled before completion");
                    None
                }
                outcome = tokio::time::timeout(timeout, orch.agent().poll_status(&remote_id)) => {
                    Some(classify_poll(outcome))
                }
            };
            in_flight.lock().expect("in-flight set poisoned").remove(&id);
            if let Some(event) = event {
                if let Err(err) = orch.step(id, event).await {
                    warn!(session = %id, %err, "poll step failed");
                }
            }
        });
    }

    fn housekeeping(&self, now: chrono::DateTime<Utc>) {
        let retention = chrono::Duration::from_std(self.orchestrator.config().retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let evicted = self.orchestrator.table().evict_expired(retention, now);
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted expired terminal sessions");
        }
    }
}

fn classify_poll(
    outcome: Result<Result<crate::adapters::agent::StatusReport, AdapterError>, tokio::time::error::Elapsed>,
) -> Event {
    match outcome {
        Ok(Ok(report)) => Event::PollResult(report),
        Ok(Err(AdapterError::Transient { message, .. })) => Event::TransientError { message },
        Ok(Err(AdapterError::Fatal { message })) => Event::FatalError { message },
        Err(_) => Event::TransientError {
            message: "poll timed out".to_string(),
        },
    }
}
