/// Payment-session API endpoints.
///
/// Thin HTTP/WebSocket surface over the orchestrator and broadcaster.
/// Every handler authenticates a capability token, calls into the core,
/// and maps structured errors to machine-readable responses.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::audit::{AuditEvent, AuditHandle};
use crate::modules::capability::{
    self, CapabilityClaims, CapabilityError, TokenPurpose, BEARER_PREFIX,
};
use crate::session::orchestrator::PaymentOrchestrator;
use crate::session::types::{
    CreateOutcome, CreatePaymentRequest, SessionFilter, UpdatePaymentRequest,
};
use crate::session::PaymentError;
use crate::stream::admission::{admit, AdmissionControl, AdmissionError, AdmissionTicket};
use crate::stream::broadcaster::{CloseReason, StatusBroadcaster, StreamEvent};
use crate::stream::connection::{run_stream, EventSink, SinkClosed, StreamConfig};
use crate::stream::rate_limit::{limiter_key, StreamRateLimiter};

/// Shared state for the payment API endpoints.
pub struct PaymentApiState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub admission: Arc<dyn AdmissionControl>,
    pub rate_limiter: StreamRateLimiter,
    pub audit: AuditHandle,
    pub token_secret: Vec<u8>,
    pub stream_config: StreamConfig,
}

pub fn router(state: Arc<PaymentApiState>) -> Router {
    Router::new()
        .route("/payments", post(create_payment).get(list_payments))
        .route("/payments/:id", get(get_payment).patch(update_payment))
        .route("/payments/:id/stream", get(payment_stream))
        .with_state(state)
}

// ==================== Error mapping ====================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = match self.error.as_str() {
            "validation-error" | "missing-tx-hash" | "blockchain-fields-require-status-transition" => {
                StatusCode::BAD_REQUEST
            }
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "forbidden" => StatusCode::FORBIDDEN,
            "payment-not-found" => StatusCode::NOT_FOUND,
            "idempotency-params-mismatch" | "invalid-status-transition" => StatusCode::CONFLICT,
            "session-expired" => StatusCode::GONE,
            "invalid-transaction" => StatusCode::UNPROCESSABLE_ENTITY,
            "too-many-connections" | "rate-limited" => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<PaymentError> for ErrorResponse {
    fn from(err: PaymentError) -> Self {
        if err.is_internal() {
            // Detail stays in the log; the wire gets a generic failure.
            error!("internal failure: {err}");
            return ErrorResponse::new("internal", "internal error");
        }
        ErrorResponse::new(err.code(), err.to_string())
    }
}

impl From<CapabilityError> for ErrorResponse {
    fn from(err: CapabilityError) -> Self {
        ErrorResponse::new(err.code(), err.to_string())
    }
}

impl From<AdmissionError> for ErrorResponse {
    fn from(err: AdmissionError) -> Self {
        if let AdmissionError::Backend(detail) = &err {
            error!("admission backend failure: {detail}");
            return ErrorResponse::new("internal", "internal error");
        }
        ErrorResponse::new(err.code(), err.to_string())
    }
}

fn authenticate(headers: &HeaderMap, secret: &[u8]) -> Result<CapabilityClaims, ErrorResponse> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ErrorResponse::new("unauthorized", "missing bearer token"))?;
    let token = value
        .strip_prefix(BEARER_PREFIX)
        .ok_or_else(|| ErrorResponse::new("unauthorized", "expected a bearer token"))?;
    capability::verify_token(token, secret, TokenPurpose::Api).map_err(Into::into)
}

// ==================== REST handlers ====================

async fn create_payment(
    State(state): State<Arc<PaymentApiState>>,
    headers: HeaderMap,
    Json(request): Json<CreatePaymentRequest>,
) -> Response {
    let claims = match authenticate(&headers, &state.token_secret) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };

    match state.orchestrator.create(&claims.sub, request).await {
        // Distinct success signals: fresh creation vs idempotent replay.
        Ok(CreateOutcome::Created(session)) => {
            (StatusCode::CREATED, Json(session)).into_response()
        }
        Ok(CreateOutcome::Replayed(session)) => (StatusCode::OK, Json(session)).into_response(),
        Err(e) => ErrorResponse::from(e).into_response(),
    }
}

async fn list_payments(
    State(state): State<Arc<PaymentApiState>>,
    headers: HeaderMap,
    Query(filter): Query<SessionFilter>,
) -> Response {
    let claims = match authenticate(&headers, &state.token_secret) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };

    match state.orchestrator.list(&claims.sub, &filter).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => ErrorResponse::from(e).into_response(),
    }
}

async fn get_payment(
    State(state): State<Arc<PaymentApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let claims = match authenticate(&headers, &state.token_secret) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };

    match state.orchestrator.get(&claims.sub, &id).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => ErrorResponse::from(e).into_response(),
    }
}

async fn update_payment(
    State(state): State<Arc<PaymentApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UpdatePaymentRequest>,
) -> Response {
    let claims = match authenticate(&headers, &state.token_secret) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };

    match state.orchestrator.update(&claims.sub, &id, request).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => ErrorResponse::from(e).into_response(),
    }
}

// ==================== Stream handler ====================

#[derive(Debug, Deserialize)]
struct StreamQuery {
    token: Option<String>,
}

/// Open the status stream for one session.
///
/// Admission is two distinct layers: a cheap pre-auth rate limit keyed
/// on the unverified token subject (falling back to the peer address),
/// then full capability verification, ownership and capacity checks.
async fn payment_stream(
    State(state): State<Arc<PaymentApiState>>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    // Layer 1: pre-auth limiter.
    let key = limiter_key(query.token.as_deref(), peer.ip());
    if !state.rate_limiter.check(&key) {
        warn!("stream connection rate limited for {key}");
        return ErrorResponse::new("rate-limited", "too many stream connection attempts")
            .into_response();
    }

    // Layer 2: full capability, ownership and capacity checks.
    let Some(token) = query.token else {
        return ErrorResponse::new("unauthorized", "missing stream token").into_response();
    };
    let claims = match capability::verify_token(&token, &state.token_secret, TokenPurpose::Stream)
    {
        Ok(claims) => claims,
        Err(e) => return ErrorResponse::from(e).into_response(),
    };
    if let Err(e) = capability::require_scope(&claims, &id) {
        return ErrorResponse::from(e).into_response();
    }

    // Owner-scoped fetch: a foreign session reads as not-found.
    let session = match state.orchestrator.get(&claims.sub, &id).await {
        Ok(session) => session,
        Err(e) => return ErrorResponse::from(e).into_response(),
    };

    let ticket = match admit(state.admission.clone(), &claims.sub).await {
        Ok(ticket) => ticket,
        Err(e) => {
            state.audit.record(
                AuditEvent::new("stream.rejected", &claims.sub)
                    .session(&id)
                    .detail(e.to_string()),
            );
            return ErrorResponse::from(e).into_response();
        }
    };

    state
        .audit
        .record(AuditEvent::new("stream.admitted", &claims.sub).session(&id));

    let events = state.broadcaster.subscribe(&id);
    let snapshot = StreamEvent::snapshot(&session);
    let config = state.stream_config;
    let expires_at = claims.expires_at();
    let audit = state.audit.clone();
    let owner_id = claims.sub.clone();

    ws.on_upgrade(move |socket| {
        drive_stream(
            socket, snapshot, events, expires_at, config, ticket, audit, owner_id, id,
        )
    })
}

struct WsEventSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait::async_trait]
impl EventSink for WsEventSink {
    async fn send(&mut self, event: &StreamEvent) -> Result<(), SinkClosed> {
        let body = serde_json::to_string(event).map_err(|_| SinkClosed)?;
        self.inner
            .send(Message::Text(body))
            .await
            .map_err(|_| SinkClosed)
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_stream(
    socket: WebSocket,
    snapshot: StreamEvent,
    events: broadcast::Receiver<StreamEvent>,
    credential_expires_at: DateTime<Utc>,
    config: StreamConfig,
    ticket: AdmissionTicket,
    audit: AuditHandle,
    owner_id: String,
    session_id: String,
) {
    let (sender, mut receiver) = socket.split();
    let mut sink = WsEventSink { inner: sender };

    let reason = tokio::select! {
        reason = run_stream(&mut sink, events, snapshot, credential_expires_at, &config) => reason,
        _ = wait_for_disconnect(&mut receiver) => CloseReason::ClientDisconnect,
    };

    info!("stream for session {session_id} closed: {reason:?}");
    audit.record(
        AuditEvent::new("stream.closed", &owner_id)
            .session(&session_id)
            .detail(format!("{reason:?}")),
    );
    // Whichever trigger won the race above, the slot is given back once.
    ticket.release().await;
}

async fn wait_for_disconnect(receiver: &mut SplitStream<WebSocket>) {
    while let Some(Ok(message)) = receiver.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_to_status_mapping() {
        let cases = [
            ("validation-error", StatusCode::BAD_REQUEST),
            ("missing-tx-hash", StatusCode::BAD_REQUEST),
            (
                "blockchain-fields-require-status-transition",
                StatusCode::BAD_REQUEST,
            ),
            ("unauthorized", StatusCode::UNAUTHORIZED),
            ("forbidden", StatusCode::FORBIDDEN),
            ("payment-not-found", StatusCode::NOT_FOUND),
            ("idempotency-params-mismatch", StatusCode::CONFLICT),
            ("invalid-status-transition", StatusCode::CONFLICT),
            ("session-expired", StatusCode::GONE),
            ("invalid-transaction", StatusCode::UNPROCESSABLE_ENTITY),
            ("too-many-connections", StatusCode::TOO_MANY_REQUESTS),
            ("rate-limited", StatusCode::TOO_MANY_REQUESTS),
            ("internal", StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (code, expected) in cases {
            let response = ErrorResponse::new(code, "test").into_response();
            assert_eq!(response.status(), expected, "code {code}");
        }
    }

    #[test]
    fn test_authenticate_requires_bearer_header() {
        let secret = b"secret";
        let headers = HeaderMap::new();
        assert!(authenticate(&headers, secret).is_err());

        let now = Utc::now().timestamp();
        let token = capability::sign_token(
            &CapabilityClaims {
                sub: "owner-1".into(),
                purpose: TokenPurpose::Api,
                scope: None,
                iat: now,
                exp: now + 60,
            },
            secret,
        )
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        let claims = authenticate(&headers, secret).unwrap();
        assert_eq!(claims.sub, "owner-1");

        // A stream-purpose token is not valid for general API access.
        let stream_token = capability::sign_token(
            &CapabilityClaims {
                sub: "owner-1".into(),
                purpose: TokenPurpose::Stream,
                scope: Some("ps_1".into()),
                iat: now,
                exp: now + 60,
            },
            secret,
        )
        .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {stream_token}").parse().unwrap(),
        );
        let err = authenticate(&headers, secret).unwrap_err();
        assert_eq!(err.error, "forbidden");
    }
}
