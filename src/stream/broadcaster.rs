//! Per-session event fan-out.
//!
//! Each session with at least one viewer owns a broadcast channel.
//! Publishing is fire-and-forget: no viewers means the event is dropped,
//! and a send failure never propagates to the caller.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::session::types::{PaymentSession, PaymentStatus};

/// Buffered events per viewer before a slow consumer is considered
/// lagged and cut off.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Why a stream connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientDisconnect,
    CredentialExpired,
    MaxDurationExceeded,
    Lagged,
    ChannelClosed,
}

/// An event on a session status stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Snapshot {
        session_id: String,
        status: PaymentStatus,
        confirmations: Option<u64>,
        tx_hash: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        session_id: String,
        status: PaymentStatus,
        confirmations: Option<u64>,
        tx_hash: Option<String>,
    },
    Heartbeat {
        timestamp: i64,
    },
    Error {
        code: &'static str,
        message: String,
    },
    Closed {
        reason: CloseReason,
    },
}

impl StreamEvent {
    pub fn snapshot(session: &PaymentSession) -> Self {
        StreamEvent::Snapshot {
            session_id: session.id.clone(),
            status: session.status,
            confirmations: session.confirmations,
            tx_hash: session.tx_hash.clone(),
        }
    }

    pub fn status_changed(session: &PaymentSession) -> Self {
        StreamEvent::StatusChanged {
            session_id: session.id.clone(),
            status: session.status,
            confirmations: session.confirmations,
            tx_hash: session.tx_hash.clone(),
        }
    }

    pub fn heartbeat() -> Self {
        StreamEvent::Heartbeat {
            timestamp: Utc::now().timestamp(),
        }
    }
}

#[derive(Default)]
pub struct StatusBroadcaster {
    channels: StdMutex<HashMap<String, broadcast::Sender<StreamEvent>>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a session's feed, creating the channel on demand.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<StreamEvent> {
        let mut channels = self.channels.lock().expect("broadcaster mutex poisoned");
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a committed state to any viewers of this session.
    /// Channels with no remaining viewers are reaped on the way.
    pub fn publish(&self, session_id: &str, event: StreamEvent) {
        let mut channels = self.channels.lock().expect("broadcaster mutex poisoned");
        let stale = match channels.get(session_id) {
            // Send fails exactly when no receiver is left.
            Some(sender) => sender.send(event).is_err(),
            None => false,
        };
        if stale {
            debug!("no viewers left for session {session_id}, dropping channel");
            channels.remove(session_id);
        }
    }

    /// Committed-state convenience wrapper used by the orchestrator.
    pub fn publish_session(&self, session: &PaymentSession) {
        self.publish(&session.id, StreamEvent::status_changed(session));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{Currency, Network, TokenSymbol};
    use chrono::Duration;

    fn session(id: &str) -> PaymentSession {
        let now = Utc::now();
        PaymentSession {
            id: id.into(),
            owner_id: "owner-1".into(),
            status: PaymentStatus::Confirming,
            amount: 100,
            currency: Currency::Usd,
            network: Network::Polygon,
            token_symbol: TokenSymbol::Usdc,
            merchant_address: format!("0x{}", "ab".repeat(20)),
            customer_address: None,
            tx_hash: Some(format!("0x{}", "11".repeat(32))),
            block_number: Some(7),
            confirmations: Some(1),
            success_url: None,
            cancel_url: None,
            metadata: None,
            idempotency_key: None,
            created_at: now,
            expires_at: now + Duration::minutes(30),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let broadcaster = StatusBroadcaster::new();
        let mut rx = broadcaster.subscribe("ps_1");

        broadcaster.publish_session(&session("ps_1"));

        match rx.recv().await.unwrap() {
            StreamEvent::StatusChanged {
                session_id, status, ..
            } => {
                assert_eq!(session_id, "ps_1");
                assert_eq!(status, PaymentStatus::Confirming);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_viewers_is_a_no_op() {
        let broadcaster = StatusBroadcaster::new();
        broadcaster.publish_session(&session("ps_none"));

        // A dropped subscriber reaps the channel on the next publish.
        let rx = broadcaster.subscribe("ps_1");
        drop(rx);
        broadcaster.publish_session(&session("ps_1"));
        assert!(broadcaster
            .channels
            .lock()
            .unwrap()
            .get("ps_1")
            .is_none());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let broadcaster = StatusBroadcaster::new();
        let mut rx_a = broadcaster.subscribe("ps_a");
        let mut rx_b = broadcaster.subscribe("ps_b");

        broadcaster.publish_session(&session("ps_a"));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_event_wire_format() {
        let event = StreamEvent::snapshot(&session("ps_1"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["sessionId"], "ps_1");
        assert_eq!(json["status"], "confirming");
    }
}
