//! Session update orchestration.
//!
//! Composes the idempotency guard, transition table, ledger verification
//! and the store's exclusive row lock into single safe operations. All
//! concurrent updates to one session serialize on the row lock; the
//! second writer is evaluated against the first writer's committed
//! result, never its in-flight state.

use std::sync::Arc;

use chrono::{Duration, Utc};
use log::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditHandle};
use crate::ledger::verifier::SettlementVerifier;
use crate::session::error::{PaymentError, StoreError};
use crate::session::state;
use crate::session::types::{
    valid_eth_address, CreateOutcome, CreatePaymentRequest, PaymentSession, PaymentStatus,
    SessionFilter, SessionPage, UpdatePaymentRequest,
};
use crate::session::{idempotency, SessionStore};
use crate::stream::broadcaster::StatusBroadcaster;

/// Default lifetime of a session before the expiry override kicks in.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 30 * 60;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub session_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECS),
        }
    }
}

/// Outcome of the locked update operation. The expired variant reports a
/// forced `FAILED` transition that is already committed; the caller must
/// surface `session-expired` without rolling that commit back.
enum UpdateOutcome {
    Applied(PaymentSession),
    ExpiredForced(PaymentSession),
}

pub struct PaymentOrchestrator {
    store: Arc<dyn SessionStore>,
    verifier: SettlementVerifier,
    broadcaster: Arc<StatusBroadcaster>,
    audit: AuditHandle,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        verifier: SettlementVerifier,
        broadcaster: Arc<StatusBroadcaster>,
        audit: AuditHandle,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            broadcaster,
            audit,
            config,
        }
    }

    /// Create a session, deduplicating on the optional idempotency key.
    pub async fn create(
        &self,
        owner_id: &str,
        request: CreatePaymentRequest,
    ) -> Result<CreateOutcome, PaymentError> {
        validate_create(&request)?;

        if let Some(key) = &request.idempotency_key {
            idempotency::validate_key(key)?;
            if let Some(existing) =
                idempotency::resolve(self.store.as_ref(), owner_id, key, &request).await?
            {
                info!(
                    "idempotent replay of session {} for owner {owner_id}",
                    existing.id
                );
                self.audit
                    .record(AuditEvent::new("payment.replayed", owner_id).session(&existing.id));
                return Ok(CreateOutcome::Replayed(existing));
            }
        }

        let now = Utc::now();
        let session = PaymentSession {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            status: PaymentStatus::Pending,
            amount: request.amount,
            currency: request.currency,
            network: request.network,
            token_symbol: request.token_symbol,
            merchant_address: request.merchant_address.clone(),
            customer_address: None,
            tx_hash: None,
            block_number: None,
            confirmations: None,
            success_url: request.success_url.clone(),
            cancel_url: request.cancel_url.clone(),
            metadata: request.metadata.clone(),
            idempotency_key: request.idempotency_key.clone(),
            created_at: now,
            expires_at: now + self.config.session_ttl,
            completed_at: None,
        };

        match self.store.insert(session.clone()).await {
            Ok(()) => {}
            // Lost a creation race on the key: resolve against the winner.
            Err(StoreError::DuplicateIdempotencyKey) => {
                let key = request
                    .idempotency_key
                    .as_deref()
                    .expect("duplicate key implies a key was supplied");
                if let Some(existing) =
                    idempotency::resolve(self.store.as_ref(), owner_id, key, &request).await?
                {
                    self.audit.record(
                        AuditEvent::new("payment.replayed", owner_id).session(&existing.id),
                    );
                    return Ok(CreateOutcome::Replayed(existing));
                }
                return Err(StoreError::Backend(
                    "idempotency index and rows disagree".into(),
                )
                .into());
            }
            Err(other) => return Err(other.into()),
        }

        info!(
            "created session {} for owner {owner_id} ({} {:?} on {})",
            session.id, session.amount, session.token_symbol, session.network
        );
        self.audit
            .record(AuditEvent::new("payment.created", owner_id).session(&session.id));
        Ok(CreateOutcome::Created(session))
    }

    /// Fetch one session, owner-scoped.
    pub async fn get(&self, owner_id: &str, id: &str) -> Result<PaymentSession, PaymentError> {
        self.store
            .get(owner_id, id)
            .await?
            .ok_or_else(|| PaymentError::NotFound { id: id.to_string() })
    }

    /// List sessions for an owner with filters and pagination.
    pub async fn list(
        &self,
        owner_id: &str,
        filter: &SessionFilter,
    ) -> Result<SessionPage, PaymentError> {
        Ok(self.store.list(owner_id, filter).await?)
    }

    /// Apply a partial update under the session's exclusive row lock.
    pub async fn update(
        &self,
        owner_id: &str,
        id: &str,
        request: UpdatePaymentRequest,
    ) -> Result<PaymentSession, PaymentError> {
        let txn = self
            .store
            .lock_for_update(owner_id, id)
            .await?
            .ok_or_else(|| PaymentError::NotFound { id: id.to_string() })?;

        match self.apply_update(txn, &request).await? {
            UpdateOutcome::Applied(updated) => {
                self.notify(&updated, "payment.updated");
                Ok(updated)
            }
            UpdateOutcome::ExpiredForced(failed) => {
                warn!("session {id} expired; forced transition to failed");
                self.notify(&failed, "payment.expired");
                Err(PaymentError::SessionExpired { id: id.to_string() })
            }
        }
    }

    /// The locked portion of an update. Exactly one commit happens per
    /// call, or none when the request is rejected outright.
    async fn apply_update(
        &self,
        txn: Box<dyn crate::session::SessionTxn>,
        request: &UpdatePaymentRequest,
    ) -> Result<UpdateOutcome, PaymentError> {
        let current = txn.session().clone();

        // 1. Terminal sessions accept nothing further.
        if current.status.is_terminal() {
            return Err(PaymentError::Terminal {
                status: current.status,
            });
        }

        // 2. Expiry override: an expired session asked to advance is
        //    committed as FAILED and the request itself is rejected.
        let now = Utc::now();
        if state::expiry_forces_failure(&current, request.status, now) {
            let mut failed = current;
            failed.status = PaymentStatus::Failed;
            txn.commit(failed.clone()).await?;
            return Ok(UpdateOutcome::ExpiredForced(failed));
        }

        // 3. Settlement fields are writable only through a verified
        //    advancing transition.
        let advancing = request
            .status
            .is_some_and(|target| target.is_advancing_target());
        if request.touches_settlement_fields() && !advancing {
            return Err(PaymentError::SettlementFieldsWithoutTransition);
        }

        let mut updated = current.clone();

        // 4. Owner-mutable fields.
        if let Some(customer_address) = &request.customer_address {
            if !valid_eth_address(customer_address) {
                return Err(PaymentError::Validation {
                    field: "customerAddress",
                    reason: "expected 0x-prefixed 20-byte hex address".into(),
                });
            }
            updated.customer_address = Some(customer_address.clone());
        }
        if let Some(success_url) = &request.success_url {
            updated.success_url = Some(success_url.clone());
        }
        if let Some(cancel_url) = &request.cancel_url {
            updated.cancel_url = Some(cancel_url.clone());
        }
        if let Some(metadata) = &request.metadata {
            updated.metadata = Some(metadata.clone());
        }

        // 5. Status changes: table check, then verification for
        //    advancing targets. The ledger's answer replaces whatever the
        //    client claimed.
        if let Some(target) = request.status {
            state::check_transition(current.status, target)?;

            if target.is_advancing_target() {
                let settled = self
                    .verifier
                    .confirm(&current, request.tx_hash.as_deref(), target)
                    .await?;

                updated.tx_hash = Some(settled.tx_hash);
                updated.block_number = settled.block_number;
                updated.confirmations = Some(settled.confirmations);
                if let Some(sender) = settled.sender {
                    updated.customer_address = Some(sender);
                }
                if target == PaymentStatus::Completed && updated.completed_at.is_none() {
                    updated.completed_at = Some(now);
                }
            }
            updated.status = target;
        }

        // 6. Commit and hand back the representation we wrote.
        txn.commit(updated.clone()).await?;
        Ok(UpdateOutcome::Applied(updated))
    }

    /// Fire-and-forget side effects on a committed state. Failures here
    /// never fail the update.
    fn notify(&self, session: &PaymentSession, action: &'static str) {
        self.broadcaster.publish_session(session);
        self.audit
            .record(AuditEvent::new(action, &session.owner_id).session(&session.id));
    }
}

fn validate_create(request: &CreatePaymentRequest) -> Result<(), PaymentError> {
    if request.amount == 0 {
        return Err(PaymentError::Validation {
            field: "amount",
            reason: "must be strictly positive".into(),
        });
    }
    if !valid_eth_address(&request.merchant_address) {
        return Err(PaymentError::Validation {
            field: "merchantAddress",
            reason: "expected 0x-prefixed 20-byte hex address".into(),
        });
    }
    for (field, url) in [
        ("successUrl", request.success_url.as_deref()),
        ("cancelUrl", request.cancel_url.as_deref()),
    ] {
        if url.is_some_and(|url| url.len() > 2048) {
            return Err(PaymentError::Validation {
                field,
                reason: "redirect urls are limited to 2048 bytes".into(),
            });
        }
    }
    Ok(())
}
