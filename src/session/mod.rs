//! Payment-session lifecycle core.
//!
//! A `PaymentSession` tracks one settlement attempt from creation to a
//! terminal outcome. All mutation goes through [`PaymentOrchestrator`],
//! which serializes concurrent updates per session via the store's
//! exclusive row lock and treats client-submitted settlement data as
//! untrusted until the ledger verifier has confirmed it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌────────────────────┐     ┌──────────────────┐
//! │ IdempotencyGuard │────▶│ PaymentOrchestrator│────▶│ SettlementVerifier│
//! │  (create path)   │     │  (locked updates)  │     │   (ledger facts)  │
//! └──────────────────┘     └────────────────────┘     └──────────────────┘
//!                                    │
//!                                    ▼
//!                          ┌────────────────────┐
//!                          │   SessionStore     │
//!                          │ (lock → mutate →   │
//!                          │      commit)       │
//!                          └────────────────────┘
//! ```

pub mod error;
pub mod idempotency;
pub mod orchestrator;
pub mod state;
pub mod store;
pub mod types;

pub use error::{PaymentError, StoreError};
pub use orchestrator::{OrchestratorConfig, PaymentOrchestrator};
pub use store::{InMemorySessionStore, SessionStore, SessionTxn};
pub use types::{
    CreateOutcome, CreatePaymentRequest, Currency, Network, PaymentSession, PaymentStatus,
    SessionFilter, SessionPage, TokenSymbol, UpdatePaymentRequest,
};
