use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use paygate::audit::{AuditDispatcher, LogAuditSink};
use paygate::ledger::{LedgerVerifier, RpcLedgerVerifier, SettlementVerifier};
use paygate::modules::payments_api::{self, PaymentApiState};
use paygate::session::orchestrator::{OrchestratorConfig, DEFAULT_SESSION_TTL_SECS};
use paygate::session::{InMemorySessionStore, PaymentOrchestrator};
use paygate::stream::{
    AdmissionControl, InMemoryAdmission, RedisAdmission, StatusBroadcaster, StreamConfig,
    StreamRateLimiter,
};

#[derive(Debug, Clone)]
struct ServerSettings {
    port: u16,
    token_secret: String,
    ledger_rpc_url: String,
    redis_url: Option<String>,
    session_ttl_secs: i64,
    verifier_timeout_secs: u64,
    heartbeat_secs: u64,
    stream_max_secs: u64,
    max_streams_per_owner: u32,
    max_streams_global: u32,
    stream_rate_limit: u32,
    stream_rate_window_secs: u64,
}

fn load_config() -> Result<ServerSettings, Box<dyn std::error::Error>> {
    Ok(ServerSettings {
        port: env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()?,
        token_secret: env::var("TOKEN_SECRET")?,
        ledger_rpc_url: env::var("LEDGER_RPC_URL")
            .unwrap_or_else(|_| "ws://localhost:8546".to_string()),
        redis_url: env::var("REDIS_URL").ok(),
        session_ttl_secs: env::var("SESSION_TTL_SECS")
            .unwrap_or_else(|_| DEFAULT_SESSION_TTL_SECS.to_string())
            .parse()?,
        verifier_timeout_secs: env::var("VERIFIER_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?,
        heartbeat_secs: env::var("STREAM_HEARTBEAT_SECS")
            .unwrap_or_else(|_| "15".to_string())
            .parse()?,
        stream_max_secs: env::var("STREAM_MAX_DURATION_SECS")
            .unwrap_or_else(|_| "1800".to_string())
            .parse()?,
        max_streams_per_owner: env::var("MAX_STREAMS_PER_OWNER")
            .unwrap_or_else(|_| "5".to_string())
            .parse()?,
        max_streams_global: env::var("MAX_STREAMS_GLOBAL")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()?,
        stream_rate_limit: env::var("STREAM_RATE_LIMIT")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?,
        stream_rate_window_secs: env::var("STREAM_RATE_WINDOW_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()?,
    })
}

/// Shared admission counters when Redis is configured and reachable;
/// process-local counters otherwise. The in-memory fallback means caps
/// are per instance, not fleet-wide.
fn build_admission(settings: &ServerSettings) -> Arc<dyn AdmissionControl> {
    if let Some(url) = &settings.redis_url {
        match redis::Client::open(url.as_str()) {
            Ok(client) => {
                info!("stream admission counters backed by redis at {url}");
                return Arc::new(RedisAdmission::new(
                    Arc::new(client),
                    settings.max_streams_per_owner,
                    settings.max_streams_global,
                ));
            }
            Err(e) => {
                warn!("redis unavailable ({e}); falling back to in-memory admission counters");
            }
        }
    }
    Arc::new(InMemoryAdmission::new(
        settings.max_streams_per_owner,
        settings.max_streams_global,
    ))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = load_config()?;

    let store = Arc::new(InMemorySessionStore::new());
    let broadcaster = Arc::new(StatusBroadcaster::new());
    let audit = AuditDispatcher::spawn(Arc::new(LogAuditSink));
    let admission = build_admission(&settings);

    let ledger: Arc<dyn LedgerVerifier> =
        Arc::new(RpcLedgerVerifier::new(settings.ledger_rpc_url.clone()));
    let verifier = SettlementVerifier::with_timeout(
        ledger,
        Duration::from_secs(settings.verifier_timeout_secs),
    );

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        store,
        verifier,
        broadcaster.clone(),
        audit.clone(),
        OrchestratorConfig {
            session_ttl: chrono::Duration::seconds(settings.session_ttl_secs),
        },
    ));

    let state = Arc::new(PaymentApiState {
        orchestrator,
        broadcaster,
        admission,
        rate_limiter: StreamRateLimiter::new(
            settings.stream_rate_limit,
            Duration::from_secs(settings.stream_rate_window_secs),
        ),
        audit,
        token_secret: settings.token_secret.clone().into_bytes(),
        stream_config: StreamConfig {
            heartbeat_interval: Duration::from_secs(settings.heartbeat_secs),
            max_duration: Duration::from_secs(settings.stream_max_secs),
        },
    });

    let app = payments_api::router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", settings.port)).await?;
    info!("listening on 0.0.0.0:{}", settings.port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
