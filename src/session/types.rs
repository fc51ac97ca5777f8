//! Core types for the payment-session lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payment session status.
///
/// `Pending` is the only initial state. `Completed` and `Failed` are
/// terminal: no transition is accepted out of them. The legal edges are
/// enforced by [`crate::session::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Confirming,
    Completed,
    Failed,
}

impl PaymentStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Failed)
    }

    /// Advancing targets require ledger verification before commit.
    pub fn is_advancing_target(self) -> bool {
        matches!(self, PaymentStatus::Confirming | PaymentStatus::Completed)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentStatus::Pending => write!(f, "pending"),
            PaymentStatus::Confirming => write!(f, "confirming"),
            PaymentStatus::Completed => write!(f, "completed"),
            PaymentStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Supported settlement currencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
}

/// Supported settlement networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Ethereum,
    Polygon,
    Base,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Ethereum => write!(f, "ethereum"),
            Network::Polygon => write!(f, "polygon"),
            Network::Base => write!(f, "base"),
        }
    }
}

/// Supported settlement tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenSymbol {
    Usdc,
    Usdt,
    Dai,
}

/// A payment session: one settlement attempt from creation to terminal
/// outcome.
///
/// `amount`, `currency`, `network`, `token_symbol` and `merchant_address`
/// are fixed at creation. `tx_hash`, `block_number` and `confirmations`
/// only ever change together with a verified advancing status transition,
/// and always carry the ledger's authoritative values, never the client's.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    pub id: String,
    pub owner_id: String,
    pub status: PaymentStatus,
    /// Amount in the currency's minor unit. Strictly positive.
    pub amount: u64,
    pub currency: Currency,
    pub network: Network,
    pub token_symbol: TokenSymbol,
    pub merchant_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Settlement parameters for session creation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    pub amount: u64,
    pub currency: Currency,
    pub network: Network,
    pub token_symbol: TokenSymbol,
    pub merchant_address: String,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
}

/// Partial update for an existing session.
///
/// Strict on unknown fields so the whitelist stays honest: a request
/// naming any field outside this set is rejected at deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdatePaymentRequest {
    pub status: Option<PaymentStatus>,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub confirmations: Option<u64>,
    pub customer_address: Option<String>,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl UpdatePaymentRequest {
    /// True when the request attempts to write any ledger-owned field.
    pub fn touches_settlement_fields(&self) -> bool {
        self.tx_hash.is_some() || self.block_number.is_some() || self.confirmations.is_some()
    }
}

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Listing filters and pagination.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFilter {
    pub status: Option<PaymentStatus>,
    pub network: Option<Network>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl SessionFilter {
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT)
    }

    pub fn effective_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    pub fn matches(&self, session: &PaymentSession) -> bool {
        if let Some(status) = self.status {
            if session.status != status {
                return false;
            }
        }
        if let Some(network) = self.network {
            if session.network != network {
                return false;
            }
        }
        if let Some(from) = self.created_from {
            if session.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if session.created_at > to {
                return false;
            }
        }
        true
    }
}

/// One page of listed sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage {
    pub items: Vec<PaymentSession>,
    pub limit: u32,
    pub offset: u32,
    pub total: u64,
    pub has_more: bool,
}

/// Result of a creation request. The caller uses the variant to pick the
/// success signal: `201 Created` for `Created`, `200 OK` for `Replayed`.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(PaymentSession),
    Replayed(PaymentSession),
}

impl CreateOutcome {
    pub fn session(&self) -> &PaymentSession {
        match self {
            CreateOutcome::Created(s) | CreateOutcome::Replayed(s) => s,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, CreateOutcome::Replayed(_))
    }
}

/// 0x-prefixed, 40 hex chars.
pub fn valid_eth_address(value: &str) -> bool {
    let Some(hex) = value.strip_prefix("0x") else {
        return false;
    };
    hex.len() == 40 && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

/// 0x-prefixed, 64 hex chars.
pub fn valid_tx_hash(value: &str) -> bool {
    let Some(hex) = value.strip_prefix("0x") else {
        return false;
    };
    hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit())
}
