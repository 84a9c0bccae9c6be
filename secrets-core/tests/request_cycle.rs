#[path = "support/mod.rs"]
mod support;

use std::sync::Arc;
use std::time::Duration;

use secrets_core::{
    Abort, CallerKind, CallerSession, CryptoError, ErrorCode, MemoryStore, Orchestrator,
    RequestEnvelope, ResponsePayload, ScopePolicy, SecretQuery, SecretValue, ServiceKeyPair,
    Stage, StoreDefaults, ValueEncoding,
};
use support::auth::TestAuth;
use support::store::SpyStore;

fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.insert("prod", "proj-1", "API_KEY", SecretValue::new("s3cr3t"));
    store.insert("prod", "proj-1", "CERT", SecretValue::new(vec![0xde, 0xad, 0xbe, 0xef]));
    store.insert("prod", "proj-1", "LOCKED", SecretValue::new("nope"));
    store.deny("prod", "proj-1", "LOCKED");
    store
}

fn orchestrator(auth: &TestAuth, store: SpyStore) -> Orchestrator<SpyStore> {
    Orchestrator::new(
        Arc::new(ServiceKeyPair::generate()),
        Arc::new(auth.validator()),
        store,
    )
    .with_defaults(StoreDefaults {
        environment: "prod".into(),
        project_scope: "proj-1".into(),
    })
}

async fn round_trip(
    orchestrator: &Orchestrator<SpyStore>,
    query: &SecretQuery,
    token: &str,
) -> (ResponsePayload, Stage) {
    let session = CallerSession::from_encoded(&orchestrator.server_xkey()).expect("session");
    let envelope = session.seal_request(query, token).expect("seal");
    let raw = envelope.to_vec().expect("encode envelope");
    let mut sealed = orchestrator.handle_get(&raw).await.expect("sealed response");
    sealed.mark_sent().expect("mark sent");
    let payload = session.open_response(&sealed.envelope).expect("open");
    (payload, sealed.stage())
}

#[tokio::test]
async fn valid_request_returns_the_secret() {
    let auth = TestAuth::new();
    let spy = SpyStore::new(seeded_store());
    let orchestrator = orchestrator(&auth, spy.clone());

    let query = SecretQuery::new("API_KEY", "prod", "proj-1");
    let (payload, stage) = round_trip(&orchestrator, &query, &auth.component_token()).await;

    match payload {
        ResponsePayload::Secret(body) => {
            assert_eq!(body.name, "API_KEY");
            assert_eq!(body.value, "s3cr3t");
            assert_eq!(body.encoding, ValueEncoding::Utf8);
        }
        other => panic!("expected secret, got {other:?}"),
    }
    assert_eq!(stage, Stage::Sent);
    assert_eq!(spy.calls(), vec!["prod/proj-1/API_KEY".to_string()]);
}

#[tokio::test]
async fn binary_secrets_survive_the_trip() {
    let auth = TestAuth::new();
    let orchestrator = orchestrator(&auth, SpyStore::new(seeded_store()));

    let query = SecretQuery::new("CERT", "", "");
    let (payload, _) = round_trip(&orchestrator, &query, &auth.provider_token()).await;
    let ResponsePayload::Secret(body) = payload else {
        panic!("expected secret");
    };
    assert_eq!(body.encoding, ValueEncoding::Base64);
    assert_eq!(body.decoded_value().unwrap().as_slice(), &[0xde, 0xad, 0xbe, 0xef]);
}

#[tokio::test]
async fn auth_failures_never_reach_the_store() {
    let auth = TestAuth::new();
    let stranger = TestAuth::new();
    let spy = SpyStore::new(seeded_store());
    let orchestrator = orchestrator(&auth, spy.clone());
    let query = SecretQuery::new("API_KEY", "prod", "proj-1");

    let cases = [
        (auth.expired_token(), ErrorCode::AuthExpired),
        (stranger.component_token(), ErrorCode::AuthBadSignature),
        ("not-a-token".to_string(), ErrorCode::AuthMalformed),
        (auth.unclassified_token(), ErrorCode::AuthUnknownKind),
    ];
    for (token, expected) in cases {
        let (payload, stage) = round_trip(&orchestrator, &query, &token).await;
        assert_eq!(payload.error_code(), Some(expected));
        assert_eq!(stage, Stage::Errored(expected));
    }
    assert!(spy.calls().is_empty());
}

#[tokio::test]
async fn missing_and_denied_secrets_are_indistinguishable() {
    let auth = TestAuth::new();
    let orchestrator = orchestrator(&auth, SpyStore::new(seeded_store()));
    let token = auth.component_token();

    let (missing, _) =
        round_trip(&orchestrator, &SecretQuery::new("NOPE", "prod", "proj-1"), &token).await;
    let (denied, _) =
        round_trip(&orchestrator, &SecretQuery::new("LOCKED", "prod", "proj-1"), &token).await;

    assert_eq!(missing.error_code(), Some(ErrorCode::NotFound));
    assert_eq!(missing, denied);
}

#[tokio::test]
async fn mismatched_caller_key_is_a_decryption_failure() {
    let auth = TestAuth::new();
    let spy = SpyStore::new(seeded_store());
    let orchestrator = orchestrator(&auth, spy.clone());
    let server_key = orchestrator.server_xkey();

    let sealer = CallerSession::from_encoded(&server_key).unwrap();
    let claimed = CallerSession::from_encoded(&server_key).unwrap();
    let mut envelope = sealer
        .seal_request(
            &SecretQuery::new("API_KEY", "prod", "proj-1"),
            &auth.component_token(),
        )
        .unwrap();
    envelope.caller_public_key = claimed.public_key().to_vec();

    let sealed = orchestrator.handle_envelope(&envelope).await.unwrap();
    assert_eq!(sealed.error_code(), Some(ErrorCode::DecryptionFailed));
    let payload = claimed.open_response(&sealed.envelope).unwrap();
    assert_eq!(payload.error_code(), Some(ErrorCode::DecryptionFailed));
    assert!(sealer.open_response(&sealed.envelope).is_err());
    assert!(spy.calls().is_empty());
}

#[tokio::test]
async fn unusable_caller_keys_abort_without_reply() {
    let auth = TestAuth::new();
    let orchestrator = orchestrator(&auth, SpyStore::new(seeded_store()));

    let envelope = RequestEnvelope {
        caller_public_key: vec![0u8; 32],
        nonce: vec![0u8; 24],
        ciphertext: vec![1, 2, 3],
        token: auth.component_token(),
    };
    let err = orchestrator.handle_envelope(&envelope).await.unwrap_err();
    assert!(matches!(err, Abort::Crypto(CryptoError::InvalidPeerKey)));

    let err = orchestrator.handle_get(b"{not json").await.unwrap_err();
    assert!(matches!(err, Abort::Envelope(_)));
}

#[tokio::test]
async fn store_outages_and_timeouts_are_unavailable() {
    let auth = TestAuth::new();
    let token = auth.component_token();
    let query = SecretQuery::new("API_KEY", "prod", "proj-1");

    let failing = orchestrator(&auth, SpyStore::new(seeded_store()).failing("connection reset"));
    let (payload, _) = round_trip(&failing, &query, &token).await;
    assert_eq!(payload.error_code(), Some(ErrorCode::Unavailable));

    let slow = orchestrator(
        &auth,
        SpyStore::new(seeded_store()).with_delay(Duration::from_millis(500)),
    )
    .with_store_timeout(Duration::from_millis(20));
    let (payload, stage) = round_trip(&slow, &query, &token).await;
    assert_eq!(payload.error_code(), Some(ErrorCode::Unavailable));
    assert_eq!(stage, Stage::Errored(ErrorCode::Unavailable));
}

#[tokio::test]
async fn policy_denials_look_like_missing_secrets() {
    let auth = TestAuth::new();
    let spy = SpyStore::new(seeded_store());
    let orchestrator = Orchestrator::with_policy(
        Arc::new(ServiceKeyPair::generate()),
        Arc::new(auth.validator()),
        spy.clone(),
        ScopePolicy::new().allow_kind(CallerKind::Component),
    );

    let session = CallerSession::from_encoded(&orchestrator.server_xkey()).unwrap();
    let envelope = session
        .seal_request(
            &SecretQuery::new("API_KEY", "prod", "proj-1"),
            &auth.provider_token(),
        )
        .unwrap();
    let sealed = orchestrator.handle_envelope(&envelope).await.unwrap();
    let payload = session.open_response(&sealed.envelope).unwrap();
    assert_eq!(payload.error_code(), Some(ErrorCode::NotFound));
    assert!(spy.calls().is_empty());
}

#[tokio::test]
async fn server_xkey_is_stable() {
    let auth = TestAuth::new();
    let orchestrator = orchestrator(&auth, SpyStore::new(seeded_store()));
    let first = orchestrator.server_xkey();
    let second = orchestrator.server_xkey();
    assert_eq!(first, second);
    assert_eq!(first, orchestrator.keys().public_key_encoded());
}

#[tokio::test]
async fn concurrent_requests_do_not_interfere() {
    let auth = TestAuth::new();
    let orchestrator = Arc::new(orchestrator(&auth, SpyStore::new(seeded_store())));
    let token = auth.component_token();

    let mut handles = Vec::new();
    for idx in 0..16 {
        let orchestrator = orchestrator.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            let name = if idx % 2 == 0 { "API_KEY" } else { "NOPE" };
            let query = SecretQuery::new(name, "prod", "proj-1");
            round_trip(&orchestrator, &query, &token).await.0
        }));
    }
    for (idx, handle) in handles.into_iter().enumerate() {
        let payload = handle.await.unwrap();
        if idx % 2 == 0 {
            assert!(matches!(payload, ResponsePayload::Secret(_)));
        } else {
            assert_eq!(payload.error_code(), Some(ErrorCode::NotFound));
        }
    }
}
