//! Subscriber side of the session delta feed.
//!
//! The feed itself is a `tokio::sync::broadcast` channel owned by the
//! `SessionTable`, which sends every delta while still holding the table
//! lock; sequence assignment and publication are one atomic step. Delivery
//! is therefore at-least-once in non-decreasing global sequence order per
//! subscriber. A subscriber that falls behind its bounded buffer gets
//! `BusError::Overflow` and must resynchronize from a fresh snapshot.

use tokio::sync::broadcast;
use tracing::debug;

use crate::errors::BusError;
use crate::session::{SessionDelta, SessionRecord};

/// One subscriber's view: a snapshot plus the live stream after it.
pub struct Subscription {
    /// Table state as of `watermark`.
    pub snapshot: Vec<SessionRecord>,
    /// Highest global sequence reflected in `snapshot`.
    pub watermark: u64,
    pub(crate) rx: broadcast::Receiver<SessionDelta>,
}

impl Subscription {
    /// Receive the next live delta.
    ///
    /// Skips deltas already covered by the snapshot watermark. On overflow the
    /// subscriber must drop this subscription and resubscribe for a fresh
    /// snapshot; the receiver itself stays usable, but intervening deltas are
    /// gone.
    pub async fn recv(&mut self) -> Result<SessionDelta, BusError> {
        loop {
            match self.rx.recv().await {
                Ok(delta) if delta.sequence <= self.watermark => {
                    debug!(sequence = delta.sequence, "suppressing pre-watermark delta");
                    continue;
                }
                Ok(delta) => return Ok(delta),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(BusError::Overflow { missed });
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }
}
