//! Stream connection lifecycle.
//!
//! After admission, every connection follows the same script: one
//! snapshot of current state, then committed status changes as they
//! happen, a heartbeat on a fixed interval that re-validates the
//! credential's expiry, and a hard maximum duration that closes the
//! connection regardless of activity. Terminal conditions are reported
//! in-band before closing, never as silent drops.
//!
//! The driver is generic over [`EventSink`] so the whole lifecycle is
//! testable without a socket.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::stream::broadcaster::{CloseReason, StreamEvent};

#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub heartbeat_interval: Duration,
    pub max_duration: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            max_duration: Duration::from_secs(30 * 60),
        }
    }
}

/// The sink half of a stream connection.
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: &StreamEvent) -> Result<(), SinkClosed>;
}

/// The peer is gone; no further events can be delivered.
#[derive(Debug)]
pub struct SinkClosed;

/// Drive one admitted connection to completion.
///
/// Returns the close reason once the connection is done. The caller is
/// responsible for releasing the admission ticket afterwards (exactly
/// once, however many triggers race).
pub async fn run_stream<S: EventSink>(
    sink: &mut S,
    mut events: broadcast::Receiver<StreamEvent>,
    snapshot: StreamEvent,
    credential_expires_at: DateTime<Utc>,
    config: &StreamConfig,
) -> CloseReason {
    if sink.send(&snapshot).await.is_err() {
        return CloseReason::ClientDisconnect;
    }

    let deadline = tokio::time::sleep(config.max_duration);
    tokio::pin!(deadline);

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; the snapshot already covers it.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                let _ = sink
                    .send(&StreamEvent::Closed { reason: CloseReason::MaxDurationExceeded })
                    .await;
                return CloseReason::MaxDurationExceeded;
            }

            _ = heartbeat.tick() => {
                if Utc::now() >= credential_expires_at {
                    let _ = sink
                        .send(&StreamEvent::Error {
                            code: "unauthorized",
                            message: "stream credential expired".into(),
                        })
                        .await;
                    return CloseReason::CredentialExpired;
                }
                if sink.send(&StreamEvent::heartbeat()).await.is_err() {
                    return CloseReason::ClientDisconnect;
                }
            }

            received = events.recv() => match received {
                Ok(event) => {
                    if sink.send(&event).await.is_err() {
                        return CloseReason::ClientDisconnect;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    let _ = sink
                        .send(&StreamEvent::Error {
                            code: "stream-lagged",
                            message: format!("dropped {missed} events; reconnect for a fresh snapshot"),
                        })
                        .await;
                    return CloseReason::Lagged;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = sink
                        .send(&StreamEvent::Closed { reason: CloseReason::ChannelClosed })
                        .await;
                    return CloseReason::ChannelClosed;
                }
            },
        }
    }
}
