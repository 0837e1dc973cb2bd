//! WebSocket live feed.
//!
//! Every connection starts with a `snapshot` message carrying the full table
//! and its sequence watermark, then streams `delta` messages in sequence
//! order. A client that falls behind its buffer gets a `resync` message
//! followed by a fresh snapshot; it should discard its local state and start
//! over from that snapshot.

use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::Subscription;
use crate::errors::BusError;
use crate::server::SharedState;
use crate::session::{SessionDelta, SessionRecord};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    /// Full table state as of `watermark`; sent on connect and after resync.
    Snapshot {
        sessions: Vec<SessionRecord>,
        watermark: u64,
    },
    /// One committed state change.
    Delta { delta: SessionDelta },
    /// The client fell behind and `missed` deltas were dropped; a fresh
    /// snapshot follows immediately.
    Resync { missed: u64 },
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let mut sub = state.orchestrator.subscribe();
    if send_snapshot(&mut sender, &sub).await.is_err() {
        return;
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("websocket pong timeout; closing");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Live feed forwarding ────────────────────────────────
            result = sub.recv() => {
                match result {
                    Ok(delta) => {
                        if send_message(&mut sender, &WsMessage::Delta { delta }).await.is_err() {
                            break;
                        }
                    }
                    Err(BusError::Overflow { missed }) => {
                        // Slow client: tell it to discard local state, then
                        // restart it from a fresh snapshot.
                        warn!(missed, "websocket subscriber overflowed; resyncing");
                        if send_message(&mut sender, &WsMessage::Resync { missed }).await.is_err() {
                            break;
                        }
                        sub = state.orchestrator.subscribe();
                        if send_snapshot(&mut sender, &sub).await.is_err() {
                            break;
                        }
                    }
                    Err(BusError::Closed) => break,
                }
            }

            // ── Client messages (pong, close, etc.) ─────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore other client messages.
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

async fn send_snapshot(
    sender: &mut SplitSink<WebSocket, Message>,
    sub: &Subscription,
) -> Result<(), axum::Error> {
    send_message(
        sender,
        &WsMessage::Snapshot {
            sessions: sub.snapshot.clone(),
            watermark: sub.watermark,
        },
    )
    .await
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &WsMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(err) => {
            warn!(%err, "failed to serialize websocket message");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{IssueRef, Phase};

    #[test]
    fn snapshot_serializes_with_watermark() {
        let record = SessionRecord::new(IssueRef::new("octo/repo", 1), Phase::Triage, None);
        let msg = WsMessage::Snapshot {
            sessions: vec![record],
            watermark: 7,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"snapshot\""));
        assert!(json.contains("\"watermark\":7"));
        assert!(json.contains("\"phase\":\"triage\""));
    }

    #[test]
    fn delta_serializes_with_sequence() {
        let mut record = SessionRecord::new(IssueRef::new("octo/repo", 2), Phase::Execute, None);
        record.sequence = 12;
        let msg = WsMessage::Delta {
            delta: record.to_delta(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"delta\""));
        assert!(json.contains("\"sequence\":12"));
    }

    #[test]
    fn resync_roundtrips() {
        let msg = WsMessage::Resync { missed: 40 };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"resync\""));
        let deser: WsMessage = serde_json::from_str(&json).unwrap();
        match deser {
            WsMessage::Resync { missed } => assert_eq!(missed, 40),
            _ => panic!("Expected Resync"),
        }
    }

    #[test]
    fn keepalive_constants_are_sensible() {
        // The pong deadline must exceed the ping cadence so a fresh
        // connection is never declared dead on its first ping.
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }
}
