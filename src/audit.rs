//! Fire-and-forget audit dispatch.
//!
//! Security-relevant actions are handed to a background task over an
//! unbounded channel; the transactional path never awaits delivery and a
//! full or dead sink can never fail an update.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

/// One security-relevant action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: &'static str,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &'static str, owner_id: impl Into<String>) -> Self {
        Self {
            action,
            owner_id: owner_id.into(),
            session_id: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Default sink: one structured line per event on the `audit` log target.
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(line) => info!(target: "audit", "{line}"),
            Err(e) => warn!("failed to serialize audit event: {e}"),
        }
    }
}

/// Cheap cloneable handle for emitting events.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl AuditHandle {
    /// Queue an event. Never blocks, never fails the caller.
    pub fn record(&self, event: AuditEvent) {
        let _ = self.tx.send(event);
    }

    /// A handle whose events go nowhere. For tests.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Spawns the drain task and hands back the emitting handle.
pub struct AuditDispatcher;

impl AuditDispatcher {
    pub fn spawn(sink: Arc<dyn AuditSink>) -> AuditHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.record(&event);
            }
        });
        AuditHandle { tx }
    }
}
