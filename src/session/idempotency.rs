//! Creation idempotency guard.
//!
//! Deduplicates creation requests on `(owner_id, idempotency_key)`. A
//! replay with identical fixed parameters resolves to the existing
//! session; any drift in the compared set is a hard conflict no matter
//! how often it is retried. Lookup is side-effect-free.
//!
//! The compared set is deliberately narrow: amount, currency, network,
//! token and merchant address. `success_url`/`cancel_url`/`metadata` may
//! drift on replay and the stored session wins.

use crate::session::error::PaymentError;
use crate::session::store::SessionStore;
use crate::session::types::{CreatePaymentRequest, PaymentSession};

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 64;

/// Reject malformed keys before any persistence: 1..=64 chars from
/// `[A-Za-z0-9_-]`.
pub fn validate_key(key: &str) -> Result<(), PaymentError> {
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(PaymentError::Validation {
            field: "idempotencyKey",
            reason: format!("length must be 1..={MAX_IDEMPOTENCY_KEY_LEN}"),
        });
    }
    if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(PaymentError::Validation {
            field: "idempotencyKey",
            reason: "only [A-Za-z0-9_-] is allowed".into(),
        });
    }
    Ok(())
}

/// Compare the fixed parameter set of an existing session against an
/// incoming request, naming the first mismatching field.
pub fn check_fixed_params(
    existing: &PaymentSession,
    request: &CreatePaymentRequest,
) -> Result<(), PaymentError> {
    if existing.amount != request.amount {
        return Err(PaymentError::IdempotencyParamsMismatch { field: "amount" });
    }
    if existing.currency != request.currency {
        return Err(PaymentError::IdempotencyParamsMismatch { field: "currency" });
    }
    if existing.network != request.network {
        return Err(PaymentError::IdempotencyParamsMismatch { field: "network" });
    }
    if existing.token_symbol != request.token_symbol {
        return Err(PaymentError::IdempotencyParamsMismatch {
            field: "tokenSymbol",
        });
    }
    if !existing
        .merchant_address
        .eq_ignore_ascii_case(&request.merchant_address)
    {
        return Err(PaymentError::IdempotencyParamsMismatch {
            field: "merchantAddress",
        });
    }
    Ok(())
}

/// Resolve a keyed creation request against prior sessions.
///
/// Returns `Ok(Some(existing))` for an exact replay, `Ok(None)` when no
/// prior session holds the key, and the mismatch error on parameter
/// drift.
pub async fn resolve(
    store: &dyn SessionStore,
    owner_id: &str,
    key: &str,
    request: &CreatePaymentRequest,
) -> Result<Option<PaymentSession>, PaymentError> {
    match store.find_by_idempotency_key(owner_id, key).await? {
        Some(existing) => {
            check_fixed_params(&existing, request)?;
            Ok(Some(existing))
        }
        None => Ok(None),
    }
}
