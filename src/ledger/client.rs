//! JSON-RPC ledger client.
//!
//! Speaks the EVM JSON-RPC surface (`eth_getTransactionReceipt`,
//! `eth_blockNumber`) to a node over a WebSocket. The connection is
//! established lazily on first use and dropped on any transport error so
//! the next call reconnects.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::ledger::error::VerifierError;
use crate::ledger::types::{VerificationOutcome, VerificationRequest};
use crate::ledger::verifier::LedgerVerifier;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    id: Option<u64>,
    result: Option<serde_json::Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    status: Option<String>,
    block_number: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

/// Ledger verifier backed by a node's JSON-RPC WebSocket endpoint.
pub struct RpcLedgerVerifier {
    rpc_url: String,
    stream: Mutex<Option<WsStream>>,
    next_id: AtomicU64,
}

impl RpcLedgerVerifier {
    /// Connection is established lazily on the first query.
    pub fn new(rpc_url: String) -> Self {
        Self {
            rpc_url,
            stream: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run one request/response round trip. The connection is taken out
    /// of its slot for the duration of the call and only restored on a
    /// clean reply, so any transport failure forces a reconnect.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, VerifierError> {
        let mut slot = self.stream.lock().await;

        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => {
                info!("connecting to ledger RPC at {}", self.rpc_url);
                let (stream, _) = connect_async(&self.rpc_url).await.map_err(|e| {
                    VerifierError::ConnectionFailed {
                        url: self.rpc_url.clone(),
                        reason: e.to_string(),
                    }
                })?;
                stream
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| VerifierError::Decode(e.to_string()))?;

        if let Err(e) = stream.send(Message::Text(body)).await {
            return Err(VerifierError::Rpc(format!("send failed: {e}")));
        }

        loop {
            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(VerifierError::Rpc(format!("recv failed: {e}"))),
                None => return Err(VerifierError::Rpc("connection closed by node".into())),
            };

            match message {
                Message::Text(text) => {
                    let response: RpcResponse = serde_json::from_str(&text)
                        .map_err(|e| VerifierError::Decode(e.to_string()))?;
                    if response.id != Some(id) {
                        // Subscription noise or a stale reply; keep waiting.
                        continue;
                    }
                    let result = match response.error {
                        Some(error) => Err(VerifierError::Rpc(format!(
                            "{} (code {})",
                            error.message, error.code
                        ))),
                        None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
                    };
                    *slot = Some(stream);
                    return result;
                }
                Message::Close(_) => {
                    return Err(VerifierError::Rpc("connection closed by node".into()))
                }
                // Pings are answered by the protocol layer.
                _ => continue,
            }
        }
    }

    async fn current_block(&self) -> Result<u64, VerifierError> {
        let result = self.call("eth_blockNumber", serde_json::json!([])).await?;
        let quantity = result
            .as_str()
            .ok_or_else(|| VerifierError::Decode("eth_blockNumber: expected string".into()))?;
        parse_quantity(quantity)
    }
}

#[async_trait]
impl LedgerVerifier for RpcLedgerVerifier {
    async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationOutcome, VerifierError> {
        let result = self
            .call(
                "eth_getTransactionReceipt",
                serde_json::json!([request.tx_hash]),
            )
            .await?;

        if result.is_null() {
            return Ok(VerificationOutcome::invalid("transaction not found"));
        }

        let receipt: TransactionReceipt = serde_json::from_value(result)
            .map_err(|e| VerifierError::Decode(format!("receipt: {e}")))?;

        if receipt.status.as_deref() != Some("0x1") {
            return Ok(VerificationOutcome::invalid("transaction reverted"));
        }

        let recipient_matches = receipt
            .to
            .as_deref()
            .is_some_and(|to| to.eq_ignore_ascii_case(&request.merchant_address));
        if !recipient_matches {
            warn!(
                "tx {} recipient does not match merchant {}",
                request.tx_hash, request.merchant_address
            );
            return Ok(VerificationOutcome::invalid("recipient mismatch"));
        }

        let block_number = match receipt.block_number.as_deref() {
            Some(quantity) => parse_quantity(quantity)?,
            // Known but not yet mined: zero confirmations.
            None => {
                return Ok(VerificationOutcome {
                    valid: false,
                    confirmations: 0,
                    block_number: None,
                    sender: receipt.from,
                    error: Some("transaction not yet mined".into()),
                });
            }
        };

        let current = self.current_block().await?;
        let confirmations = current.saturating_sub(block_number) + 1;

        debug!(
            "tx {} mined at block {block_number}, {confirmations} confirmations (required {})",
            request.tx_hash, request.required_confirmations
        );

        if confirmations < request.required_confirmations {
            return Ok(VerificationOutcome {
                valid: false,
                confirmations,
                block_number: Some(block_number),
                sender: receipt.from,
                error: Some(format!(
                    "insufficient confirmations: {confirmations} < {}",
                    request.required_confirmations
                )),
            });
        }

        Ok(VerificationOutcome {
            valid: true,
            confirmations,
            block_number: Some(block_number),
            sender: receipt.from,
            error: None,
        })
    }
}

/// Parse an EVM hex quantity (`0x1a2b`) into a u64.
fn parse_quantity(value: &str) -> Result<u64, VerifierError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| VerifierError::Decode(format!("quantity without 0x prefix: {value}")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| VerifierError::Decode(format!("bad hex quantity {value}: {e}")))
}
