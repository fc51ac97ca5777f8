//! Status transition rules.
//!
//! Legality is decided purely on the `(current, requested)` pair:
//!
//! ```text
//! PENDING ──▶ CONFIRMING ──▶ COMPLETED
//!    │             │
//!    └──────▶ FAILED ◀───────┘
//! ```
//!
//! No edge targets `PENDING`; no edge leaves a terminal state. The expiry
//! override is a separate decision applied by the orchestrator before the
//! table is consulted.

use chrono::{DateTime, Utc};

use crate::session::error::PaymentError;
use crate::session::types::{PaymentSession, PaymentStatus};

/// Whether `from -> to` is a legal edge of the transition table.
pub fn transition_allowed(from: PaymentStatus, to: PaymentStatus) -> bool {
    use PaymentStatus::*;
    matches!(
        (from, to),
        (Pending, Confirming) | (Pending, Failed) | (Confirming, Completed) | (Confirming, Failed)
    )
}

/// Check a requested transition, returning the structured error on an
/// illegal edge.
pub fn check_transition(from: PaymentStatus, to: PaymentStatus) -> Result<(), PaymentError> {
    if transition_allowed(from, to) {
        Ok(())
    } else {
        Err(PaymentError::InvalidTransition { from, to })
    }
}

/// The expiry override: an expired, not-yet-terminal session asked to
/// advance is forced to `FAILED` instead, and the original request is
/// rejected. Non-advancing requests on an expired session proceed
/// normally.
pub fn expiry_forces_failure(
    session: &PaymentSession,
    requested: Option<PaymentStatus>,
    now: DateTime<Utc>,
) -> bool {
    !session.status.is_terminal()
        && session.is_expired(now)
        && requested.is_some_and(|target| target.is_advancing_target())
}
