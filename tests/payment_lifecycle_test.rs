//! End-to-end lifecycle scenarios against the in-memory store and a
//! scripted ledger verifier.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;

use paygate::audit::AuditHandle;
use paygate::ledger::{
    LedgerVerifier, SettlementVerifier, VerificationOutcome, VerificationRequest, VerifierError,
};
use paygate::session::orchestrator::OrchestratorConfig;
use paygate::session::{
    CreateOutcome, CreatePaymentRequest, Currency, InMemorySessionStore, Network,
    PaymentOrchestrator, PaymentStatus, TokenSymbol, UpdatePaymentRequest,
};
use paygate::stream::{StatusBroadcaster, StreamEvent};

/// Pops scripted outcomes in order, falling back to the default, and
/// counts every call it receives.
struct ScriptedVerifier {
    queue: Mutex<VecDeque<VerificationOutcome>>,
    default: VerificationOutcome,
    calls: AtomicUsize,
}

impl ScriptedVerifier {
    fn with_default(default: VerificationOutcome) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            default,
            calls: AtomicUsize::new(0),
        })
    }

    fn push(&self, outcome: VerificationOutcome) {
        self.queue.lock().unwrap().push_back(outcome);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerVerifier for ScriptedVerifier {
    async fn verify(
        &self,
        _request: &VerificationRequest,
    ) -> Result<VerificationOutcome, VerifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.queue.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| self.default.clone()))
    }
}

fn valid_outcome(confirmations: u64) -> VerificationOutcome {
    VerificationOutcome {
        valid: true,
        confirmations,
        block_number: Some(19_000_101),
        sender: Some(customer_address()),
        error: None,
    }
}

fn merchant_address() -> String {
    format!("0x{}", "ab".repeat(20))
}

fn customer_address() -> String {
    format!("0x{}", "cd".repeat(20))
}

fn tx_hash() -> String {
    format!("0x{}", "11".repeat(32))
}

fn harness(
    verifier: Arc<ScriptedVerifier>,
    session_ttl: ChronoDuration,
) -> (Arc<PaymentOrchestrator>, Arc<StatusBroadcaster>) {
    let broadcaster = Arc::new(StatusBroadcaster::new());
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        Arc::new(InMemorySessionStore::new()),
        SettlementVerifier::new(verifier),
        broadcaster.clone(),
        AuditHandle::disabled(),
        OrchestratorConfig { session_ttl },
    ));
    (orchestrator, broadcaster)
}

fn create_request(key: Option<&str>) -> CreatePaymentRequest {
    CreatePaymentRequest {
        amount: 100,
        currency: Currency::Usd,
        network: Network::Polygon,
        token_symbol: TokenSymbol::Usdc,
        merchant_address: merchant_address(),
        success_url: None,
        cancel_url: None,
        metadata: None,
        idempotency_key: key.map(Into::into),
    }
}

#[tokio::test]
async fn test_create_replay_and_conflict() {
    let verifier = ScriptedVerifier::with_default(valid_outcome(1));
    let (orchestrator, _) = harness(verifier, ChronoDuration::minutes(30));

    let created = orchestrator
        .create("owner-1", create_request(Some("abc123")))
        .await
        .unwrap();
    let CreateOutcome::Created(session) = &created else {
        panic!("first call must create");
    };
    assert_eq!(session.status, PaymentStatus::Pending);

    // Identical call replays the same session with the replay signal.
    let replayed = orchestrator
        .create("owner-1", create_request(Some("abc123")))
        .await
        .unwrap();
    assert!(replayed.is_replay());
    assert_eq!(replayed.session().id, session.id);

    // Same key, different amount: a conflict, however often it is retried.
    for _ in 0..3 {
        let mut drifted = create_request(Some("abc123"));
        drifted.amount = 200;
        let err = orchestrator.create("owner-1", drifted).await.unwrap_err();
        assert_eq!(err.code(), "idempotency-params-mismatch");
    }

    // Another owner can use the same key independently.
    let other = orchestrator
        .create("owner-2", create_request(Some("abc123")))
        .await
        .unwrap();
    assert!(!other.is_replay());
    assert_ne!(other.session().id, session.id);
}

#[tokio::test]
async fn test_unkeyed_creation_never_deduplicates() {
    let verifier = ScriptedVerifier::with_default(valid_outcome(1));
    let (orchestrator, _) = harness(verifier, ChronoDuration::minutes(30));

    let first = orchestrator
        .create("owner-1", create_request(None))
        .await
        .unwrap();
    let second = orchestrator
        .create("owner-1", create_request(None))
        .await
        .unwrap();
    assert!(!first.is_replay());
    assert!(!second.is_replay());
    assert_ne!(first.session().id, second.session().id);
}

#[tokio::test]
async fn test_malformed_idempotency_key_is_rejected_before_persistence() {
    let verifier = ScriptedVerifier::with_default(valid_outcome(1));
    let (orchestrator, _) = harness(verifier, ChronoDuration::minutes(30));

    let err = orchestrator
        .create("owner-1", create_request(Some("spaces are bad")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation-error");

    // Nothing was stored under the malformed key.
    let listed = orchestrator
        .list("owner-1", &Default::default())
        .await
        .unwrap();
    assert_eq!(listed.total, 0);
}

#[tokio::test]
async fn test_confirm_then_complete_uses_ledger_facts() {
    let verifier = ScriptedVerifier::with_default(valid_outcome(1));
    let (orchestrator, _) = harness(verifier.clone(), ChronoDuration::minutes(30));

    let session = orchestrator
        .create("owner-1", create_request(None))
        .await
        .unwrap()
        .session()
        .clone();

    // Client claims bogus settlement values alongside the transition;
    // only the ledger's answer may be persisted.
    verifier.push(VerificationOutcome {
        valid: true,
        confirmations: 1,
        block_number: Some(19_000_101),
        sender: Some(customer_address()),
        error: None,
    });
    let confirming = orchestrator
        .update(
            "owner-1",
            &session.id,
            UpdatePaymentRequest {
                status: Some(PaymentStatus::Confirming),
                tx_hash: Some(tx_hash()),
                block_number: Some(999),
                confirmations: Some(999),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(confirming.status, PaymentStatus::Confirming);
    assert_eq!(confirming.tx_hash, Some(tx_hash()));
    assert_eq!(confirming.block_number, Some(19_000_101));
    assert_eq!(confirming.confirmations, Some(1));
    assert_eq!(confirming.customer_address, Some(customer_address()));
    assert!(confirming.completed_at.is_none());

    // Completion re-verifies at depth 12 using the stored hash.
    verifier.push(valid_outcome(12));
    let completed = orchestrator
        .update(
            "owner-1",
            &session.id,
            UpdatePaymentRequest {
                status: Some(PaymentStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(completed.status, PaymentStatus::Completed);
    assert_eq!(completed.confirmations, Some(12));
    assert!(completed.completed_at.is_some());
    assert_eq!(verifier.calls(), 2);
}

#[tokio::test]
async fn test_terminal_sessions_reject_every_update() {
    let verifier = ScriptedVerifier::with_default(valid_outcome(12));
    let (orchestrator, _) = harness(verifier, ChronoDuration::minutes(30));

    let session = orchestrator
        .create("owner-1", create_request(None))
        .await
        .unwrap()
        .session()
        .clone();

    orchestrator
        .update(
            "owner-1",
            &session.id,
            UpdatePaymentRequest {
                status: Some(PaymentStatus::Confirming),
                tx_hash: Some(tx_hash()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    orchestrator
        .update(
            "owner-1",
            &session.id,
            UpdatePaymentRequest {
                status: Some(PaymentStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Completed is terminal: even a bare metadata patch is rejected.
    let err = orchestrator
        .update(
            "owner-1",
            &session.id,
            UpdatePaymentRequest {
                metadata: Some(serde_json::json!({"note": "late"})),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid-status-transition");

    let err = orchestrator
        .update(
            "owner-1",
            &session.id,
            UpdatePaymentRequest {
                status: Some(PaymentStatus::Failed),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid-status-transition");
}

#[tokio::test]
async fn test_expired_session_forces_failed_on_advance() {
    let verifier = ScriptedVerifier::with_default(valid_outcome(1));
    let (orchestrator, _) = harness(verifier.clone(), ChronoDuration::seconds(-1));

    let session = orchestrator
        .create("owner-1", create_request(None))
        .await
        .unwrap()
        .session()
        .clone();

    let err = orchestrator
        .update(
            "owner-1",
            &session.id,
            UpdatePaymentRequest {
                status: Some(PaymentStatus::Confirming),
                tx_hash: Some(tx_hash()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "session-expired");

    // The forced FAILED transition was committed despite the rejection,
    // and the verifier was never consulted.
    let after = orchestrator.get("owner-1", &session.id).await.unwrap();
    assert_eq!(after.status, PaymentStatus::Failed);
    assert_eq!(verifier.calls(), 0);
}

#[tokio::test]
async fn test_expired_session_still_accepts_non_advancing_updates() {
    let verifier = ScriptedVerifier::with_default(valid_outcome(1));
    let (orchestrator, _) = harness(verifier, ChronoDuration::seconds(-1));

    let session = orchestrator
        .create("owner-1", create_request(None))
        .await
        .unwrap()
        .session()
        .clone();

    // A metadata patch does not trust time-sensitive settlement data.
    let updated = orchestrator
        .update(
            "owner-1",
            &session.id,
            UpdatePaymentRequest {
                metadata: Some(serde_json::json!({"order": 7})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, PaymentStatus::Pending);

    // Requesting FAILED outright is non-advancing and proceeds.
    let failed = orchestrator
        .update(
            "owner-1",
            &session.id,
            UpdatePaymentRequest {
                status: Some(PaymentStatus::Failed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(failed.status, PaymentStatus::Failed);
}

#[tokio::test]
async fn test_settlement_fields_require_advancing_transition() {
    let verifier = ScriptedVerifier::with_default(valid_outcome(1));
    let (orchestrator, _) = harness(verifier.clone(), ChronoDuration::minutes(30));

    let session = orchestrator
        .create("owner-1", create_request(None))
        .await
        .unwrap()
        .session()
        .clone();

    let attempts = [
        UpdatePaymentRequest {
            tx_hash: Some(tx_hash()),
            ..Default::default()
        },
        UpdatePaymentRequest {
            block_number: Some(123),
            ..Default::default()
        },
        UpdatePaymentRequest {
            confirmations: Some(99),
            ..Default::default()
        },
        // FAILED is not an advancing target.
        UpdatePaymentRequest {
            status: Some(PaymentStatus::Failed),
            tx_hash: Some(tx_hash()),
            ..Default::default()
        },
    ];
    for request in attempts {
        let err = orchestrator
            .update("owner-1", &session.id, request)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "blockchain-fields-require-status-transition");
    }

    let after = orchestrator.get("owner-1", &session.id).await.unwrap();
    assert_eq!(after.status, PaymentStatus::Pending);
    assert!(after.tx_hash.is_none());
    assert_eq!(verifier.calls(), 0);
}

#[tokio::test]
async fn test_missing_tx_hash_fails_before_the_verifier() {
    let verifier = ScriptedVerifier::with_default(valid_outcome(1));
    let (orchestrator, _) = harness(verifier.clone(), ChronoDuration::minutes(30));

    let session = orchestrator
        .create("owner-1", create_request(None))
        .await
        .unwrap()
        .session()
        .clone();

    let err = orchestrator
        .update(
            "owner-1",
            &session.id,
            UpdatePaymentRequest {
                status: Some(PaymentStatus::Confirming),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "missing-tx-hash");
    assert_eq!(verifier.calls(), 0);
}

#[tokio::test]
async fn test_racing_updates_commit_exactly_one_verified_transition() {
    let verifier = ScriptedVerifier::with_default(valid_outcome(1));
    let (orchestrator, _) = harness(verifier.clone(), ChronoDuration::minutes(30));

    let session = orchestrator
        .create("owner-1", create_request(None))
        .await
        .unwrap()
        .session()
        .clone();

    let race = |orchestrator: Arc<PaymentOrchestrator>, id: String| {
        tokio::spawn(async move {
            orchestrator
                .update(
                    "owner-1",
                    &id,
                    UpdatePaymentRequest {
                        status: Some(PaymentStatus::Confirming),
                        tx_hash: Some(tx_hash()),
                        ..Default::default()
                    },
                )
                .await
        })
    };

    let first = race(orchestrator.clone(), session.id.clone());
    let second = race(orchestrator.clone(), session.id.clone());
    let results = [first.await.unwrap(), second.await.unwrap()];

    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "exactly one transition may commit");

    // The loser was evaluated against the winner's committed state.
    let loser = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one racer must lose");
    assert_eq!(loser.code(), "invalid-status-transition");

    // One verification, and its authoritative fields survived the race.
    assert_eq!(verifier.calls(), 1);
    let after = orchestrator.get("owner-1", &session.id).await.unwrap();
    assert_eq!(after.status, PaymentStatus::Confirming);
    assert_eq!(after.block_number, Some(19_000_101));
    assert_eq!(after.confirmations, Some(1));
    assert_eq!(after.customer_address, Some(customer_address()));
}

#[tokio::test]
async fn test_committed_updates_reach_stream_subscribers() {
    let verifier = ScriptedVerifier::with_default(valid_outcome(1));
    let (orchestrator, broadcaster) = harness(verifier, ChronoDuration::minutes(30));

    let session = orchestrator
        .create("owner-1", create_request(None))
        .await
        .unwrap()
        .session()
        .clone();

    let mut events = broadcaster.subscribe(&session.id);

    orchestrator
        .update(
            "owner-1",
            &session.id,
            UpdatePaymentRequest {
                status: Some(PaymentStatus::Confirming),
                tx_hash: Some(tx_hash()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    match events.recv().await.unwrap() {
        StreamEvent::StatusChanged {
            session_id,
            status,
            confirmations,
            ..
        } => {
            assert_eq!(session_id, session.id);
            assert_eq!(status, PaymentStatus::Confirming);
            assert_eq!(confirmations, Some(1));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_listing_filters_by_status_and_paginates() {
    let verifier = ScriptedVerifier::with_default(valid_outcome(1));
    let (orchestrator, _) = harness(verifier, ChronoDuration::minutes(30));

    for _ in 0..4 {
        orchestrator
            .create("owner-1", create_request(None))
            .await
            .unwrap();
    }

    let page = orchestrator
        .list(
            "owner-1",
            &paygate::session::SessionFilter {
                status: Some(PaymentStatus::Pending),
                limit: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.items.len(), 3);
    assert!(page.has_more);

    let rest = orchestrator
        .list(
            "owner-1",
            &paygate::session::SessionFilter {
                status: Some(PaymentStatus::Pending),
                limit: Some(3),
                offset: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rest.items.len(), 1);
    assert!(!rest.has_more);
}
