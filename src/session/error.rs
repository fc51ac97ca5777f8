//! Error taxonomy for the payment-session core.

use thiserror::Error;

use crate::ledger::error::VerifierError;
use crate::session::types::PaymentStatus;

/// Business and infrastructure errors raised by the session core.
///
/// Every variant maps to a stable machine-readable code via [`code`].
/// Infrastructure variants (`Store`, `Ledger`) surface as generic internal
/// failures at the API boundary; their detail is logged, not leaked.
///
/// [`code`]: PaymentError::code
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("idempotency key reused with a different {field}")]
    IdempotencyParamsMismatch { field: &'static str },

    #[error("payment session not found: {id}")]
    NotFound { id: String },

    #[error("payment session {id} has expired")]
    SessionExpired { id: String },

    #[error("a transaction hash is required for this status transition")]
    MissingTxHash,

    #[error("ledger rejected the claimed transaction: {reason}")]
    InvalidTransaction { reason: String },

    #[error("illegal status transition: {from} -> {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("session is {status}; no further updates are accepted")]
    Terminal { status: PaymentStatus },

    #[error("settlement fields require an advancing status transition")]
    SettlementFieldsWithoutTransition,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("ledger verifier unavailable: {0}")]
    Ledger(#[from] VerifierError),
}

impl PaymentError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::Validation { .. } => "validation-error",
            PaymentError::IdempotencyParamsMismatch { .. } => "idempotency-params-mismatch",
            PaymentError::NotFound { .. } => "payment-not-found",
            PaymentError::SessionExpired { .. } => "session-expired",
            PaymentError::MissingTxHash => "missing-tx-hash",
            PaymentError::InvalidTransaction { .. } => "invalid-transaction",
            PaymentError::InvalidTransition { .. } | PaymentError::Terminal { .. } => {
                "invalid-status-transition"
            }
            PaymentError::SettlementFieldsWithoutTransition => {
                "blockchain-fields-require-status-transition"
            }
            PaymentError::Store(_) | PaymentError::Ledger(_) => "internal",
        }
    }

    /// True for unexpected infrastructure failures, as opposed to
    /// business-rule violations.
    pub fn is_internal(&self) -> bool {
        matches!(self, PaymentError::Store(_) | PaymentError::Ledger(_))
    }
}

/// Errors from the transactional session store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a session already exists for this owner and idempotency key")]
    DuplicateIdempotencyKey,

    #[error("store backend failure: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            PaymentError::Validation {
                field: "amount",
                reason: "must be positive".into()
            }
            .code(),
            "validation-error"
        );
        assert_eq!(
            PaymentError::IdempotencyParamsMismatch { field: "amount" }.code(),
            "idempotency-params-mismatch"
        );
        assert_eq!(PaymentError::MissingTxHash.code(), "missing-tx-hash");
        assert_eq!(
            PaymentError::SettlementFieldsWithoutTransition.code(),
            "blockchain-fields-require-status-transition"
        );
        assert_eq!(
            PaymentError::Terminal {
                status: PaymentStatus::Completed
            }
            .code(),
            "invalid-status-transition"
        );
        assert!(PaymentError::Store(StoreError::Backend("down".into())).is_internal());
    }
}
