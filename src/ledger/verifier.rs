//! Settlement verification adapter.
//!
//! [`SettlementVerifier`] sits between the orchestrator and a
//! [`LedgerVerifier`] implementation: it resolves the hash to check
//! (claimed or previously stored), maps the target status to its required
//! confirmation depth, bounds the verifier call with a timeout, and turns
//! a `valid = false` answer into the `invalid-transaction` rejection that
//! leaves the session untouched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};

use crate::ledger::error::VerifierError;
use crate::ledger::types::{VerificationOutcome, VerificationRequest, VerifiedSettlement};
use crate::session::error::PaymentError;
use crate::session::types::{valid_tx_hash, PaymentSession, PaymentStatus};

/// Confirmation depth required to enter `CONFIRMING`.
pub const CONFIRMING_DEPTH: u64 = 1;

/// Confirmation depth required to enter `COMPLETED`.
pub const COMPLETED_DEPTH: u64 = 12;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborator: inspects the distributed ledger for a claimed
/// transaction and reports authoritative settlement facts.
#[async_trait]
pub trait LedgerVerifier: Send + Sync {
    async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationOutcome, VerifierError>;
}

/// Confirmation depth demanded by an advancing target status.
pub fn required_confirmations(target: PaymentStatus) -> u64 {
    match target {
        PaymentStatus::Confirming => CONFIRMING_DEPTH,
        PaymentStatus::Completed => COMPLETED_DEPTH,
        PaymentStatus::Pending | PaymentStatus::Failed => 0,
    }
}

pub struct SettlementVerifier {
    inner: Arc<dyn LedgerVerifier>,
    call_timeout: Duration,
}

impl SettlementVerifier {
    pub fn new(inner: Arc<dyn LedgerVerifier>) -> Self {
        Self {
            inner,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(inner: Arc<dyn LedgerVerifier>, call_timeout: Duration) -> Self {
        Self {
            inner,
            call_timeout,
        }
    }

    /// Verify the settlement claim behind an advancing transition.
    ///
    /// Fails fast with `missing-tx-hash` when neither the request nor the
    /// session carries a hash; the verifier is never reached in that
    /// case. On rejection nothing is persisted by the caller.
    pub async fn confirm(
        &self,
        session: &PaymentSession,
        claimed_tx_hash: Option<&str>,
        target: PaymentStatus,
    ) -> Result<VerifiedSettlement, PaymentError> {
        let tx_hash = claimed_tx_hash
            .or(session.tx_hash.as_deref())
            .ok_or(PaymentError::MissingTxHash)?;

        if !valid_tx_hash(tx_hash) {
            return Err(PaymentError::Validation {
                field: "txHash",
                reason: "expected 0x-prefixed 32-byte hex hash".into(),
            });
        }

        let request = VerificationRequest {
            tx_hash: tx_hash.to_string(),
            network: session.network,
            merchant_address: session.merchant_address.clone(),
            required_confirmations: required_confirmations(target),
        };

        debug!(
            "verifying tx {} on {} for session {} (required depth {})",
            request.tx_hash, request.network, session.id, request.required_confirmations
        );

        let outcome = tokio::time::timeout(self.call_timeout, self.inner.verify(&request))
            .await
            .map_err(|_| PaymentError::Ledger(VerifierError::Timeout(self.call_timeout)))??;

        if !outcome.valid {
            let reason = outcome
                .error
                .unwrap_or_else(|| "transaction not accepted by ledger".into());
            warn!(
                "ledger rejected tx {} for session {}: {}",
                request.tx_hash, session.id, reason
            );
            return Err(PaymentError::InvalidTransaction { reason });
        }

        Ok(VerifiedSettlement {
            tx_hash: request.tx_hash,
            block_number: outcome.block_number,
            confirmations: outcome.confirmations,
            sender: outcome.sender,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{Currency, Network, TokenSymbol};
    use chrono::{Duration as ChronoDuration, Utc};

    struct FixedVerifier {
        outcome: VerificationOutcome,
    }

    #[async_trait]
    impl LedgerVerifier for FixedVerifier {
        async fn verify(
            &self,
            _request: &VerificationRequest,
        ) -> Result<VerificationOutcome, VerifierError> {
            Ok(self.outcome.clone())
        }
    }

    struct StalledVerifier;

    #[async_trait]
    impl LedgerVerifier for StalledVerifier {
        async fn verify(
            &self,
            _request: &VerificationRequest,
        ) -> Result<VerificationOutcome, VerifierError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("sleep never completes in this test")
        }
    }

    fn session(tx_hash: Option<&str>) -> PaymentSession {
        let now = Utc::now();
        PaymentSession {
            id: "ps_1".into(),
            owner_id: "owner-1".into(),
            status: PaymentStatus::Pending,
            amount: 100,
            currency: Currency::Usd,
            network: Network::Polygon,
            token_symbol: TokenSymbol::Usdc,
            merchant_address: format!("0x{}", "ab".repeat(20)),
            customer_address: None,
            tx_hash: tx_hash.map(Into::into),
            block_number: None,
            confirmations: None,
            success_url: None,
            cancel_url: None,
            metadata: None,
            idempotency_key: None,
            created_at: now,
            expires_at: now + ChronoDuration::minutes(30),
            completed_at: None,
        }
    }

    fn good_outcome() -> VerificationOutcome {
        VerificationOutcome {
            valid: true,
            confirmations: 14,
            block_number: Some(19_000_101),
            sender: Some(format!("0x{}", "cd".repeat(20))),
            error: None,
        }
    }

    #[test]
    fn test_required_depth_mapping() {
        assert_eq!(required_confirmations(PaymentStatus::Confirming), 1);
        assert_eq!(required_confirmations(PaymentStatus::Completed), 12);
    }

    #[tokio::test]
    async fn test_missing_hash_never_reaches_the_verifier() {
        let verifier = SettlementVerifier::new(Arc::new(StalledVerifier));
        let err = verifier
            .confirm(&session(None), None, PaymentStatus::Confirming)
            .await
            .expect_err("must fail fast");
        assert!(matches!(err, PaymentError::MissingTxHash));
    }

    #[tokio::test]
    async fn test_stored_hash_is_used_when_none_claimed() {
        let hash = format!("0x{}", "11".repeat(32));
        let verifier = SettlementVerifier::new(Arc::new(FixedVerifier {
            outcome: good_outcome(),
        }));
        let settled = verifier
            .confirm(&session(Some(&hash)), None, PaymentStatus::Completed)
            .await
            .unwrap();
        assert_eq!(settled.tx_hash, hash);
        assert_eq!(settled.confirmations, 14);
    }

    #[tokio::test]
    async fn test_malformed_hash_is_a_validation_error() {
        let verifier = SettlementVerifier::new(Arc::new(StalledVerifier));
        let err = verifier
            .confirm(&session(None), Some("0xnothex"), PaymentStatus::Confirming)
            .await
            .expect_err("must reject");
        assert!(matches!(err, PaymentError::Validation { field: "txHash", .. }));
    }

    #[tokio::test]
    async fn test_invalid_outcome_maps_to_invalid_transaction() {
        let hash = format!("0x{}", "22".repeat(32));
        let verifier = SettlementVerifier::new(Arc::new(FixedVerifier {
            outcome: VerificationOutcome::invalid("insufficient confirmations: 3 < 12"),
        }));
        let err = verifier
            .confirm(&session(None), Some(&hash), PaymentStatus::Completed)
            .await
            .expect_err("must reject");
        match err {
            PaymentError::InvalidTransaction { reason } => {
                assert!(reason.contains("insufficient confirmations"))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_verifier_call_is_time_bounded() {
        let hash = format!("0x{}", "33".repeat(32));
        let verifier =
            SettlementVerifier::with_timeout(Arc::new(StalledVerifier), Duration::from_secs(5));
        let err = verifier
            .confirm(&session(None), Some(&hash), PaymentStatus::Confirming)
            .await
            .expect_err("must time out");
        assert!(matches!(
            err,
            PaymentError::Ledger(VerifierError::Timeout(_))
        ));
    }
}
