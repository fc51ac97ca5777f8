//! Types for ledger verification.

use serde::{Deserialize, Serialize};

use crate::session::types::Network;

/// What the verifier is asked to check.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    /// Claimed transaction hash, `0x` + 64 hex chars.
    pub tx_hash: String,

    /// Network the session settles on.
    pub network: Network,

    /// Merchant address the funds must have been sent to.
    pub merchant_address: String,

    /// Minimum confirmation depth for this request: 1 for `CONFIRMING`,
    /// 12 for `COMPLETED`.
    pub required_confirmations: u64,
}

/// The ledger's authoritative answer.
///
/// On `valid = false` the fields besides `error` are best-effort context;
/// nothing from an invalid outcome is ever persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub valid: bool,
    pub confirmations: u64,
    pub block_number: Option<u64>,
    /// Transaction sender, mapped to the session's customer address.
    pub sender: Option<String>,
    pub error: Option<String>,
}

impl VerificationOutcome {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            confirmations: 0,
            block_number: None,
            sender: None,
            error: Some(reason.into()),
        }
    }
}

/// Settlement facts that passed verification, ready to merge into the
/// session row.
#[derive(Debug, Clone)]
pub struct VerifiedSettlement {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub confirmations: u64,
    pub sender: Option<String>,
}
