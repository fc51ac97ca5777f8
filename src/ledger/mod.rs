//! Ledger-driven settlement verification.
//!
//! Client-submitted settlement data is never trusted: before a session
//! may advance to `CONFIRMING` or `COMPLETED`, the claimed transaction
//! hash is checked against the distributed ledger and only the ledger's
//! answer (block number, confirmation count, sender) is persisted.
//!
//! [`LedgerVerifier`] is the external collaborator boundary; the
//! [`RpcLedgerVerifier`] implementation speaks JSON-RPC to a node over a
//! WebSocket, and tests script their own implementations.

pub mod client;
pub mod error;
pub mod types;
pub mod verifier;

pub use client::RpcLedgerVerifier;
pub use error::VerifierError;
pub use types::{VerificationOutcome, VerificationRequest, VerifiedSettlement};
pub use verifier::{LedgerVerifier, SettlementVerifier};
