//! Ledger connectivity errors.
//!
//! These cover transport and protocol failures only. A transaction that
//! the ledger inspected and rejected is not an error at this layer; it is
//! a `valid = false` outcome.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("failed to connect to ledger RPC at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("ledger RPC request failed: {0}")]
    Rpc(String),

    #[error("malformed ledger RPC response: {0}")]
    Decode(String),

    #[error("ledger verification timed out after {0:?}")]
    Timeout(std::time::Duration),
}
