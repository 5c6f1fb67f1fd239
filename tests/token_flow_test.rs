use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use chrono::Duration;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use justification_api::audit::{
    AuditAction, AuditLogger, AuditQuery, AuditStorage, MemoryAuditStorage,
};
use justification_api::auth::{
    Justification, JustificationClaims, JustificationRequest, JustificationValidator,
    PublicKeyDiscovery, SigningPipeline, VerificationUtility,
};
use justification_api::certs::lifecycle::lifecycle_labels;
use justification_api::certs::{
    BackendState, CertificateActionService, LifecycleLabel, RotationEngine, RotationPolicy,
    SigningAlgorithm, SigningBackend, SoftwareKmsBackend, create_backend,
};
use justification_api::config::parse_config;
use justification_api::error::JvsError;
use justification_api::handlers::certificate_actions::{
    ACTOR_HEADER, CertificateAction, CertificateActionRequest,
};
use justification_api::handlers::{self, ApiError, AppState};
use justification_api::models::CategoryRule;
use std::sync::Arc;

const KEY: &str = "projects/p/locations/global/keyRings/jvs/cryptoKeys/signer";
const ISSUER: &str = "jvs.example.com";
const AUDIENCE: &str = "dev.example.jvs";

struct Harness {
    backend: Arc<SoftwareKmsBackend>,
    engine: Arc<RotationEngine>,
    pipeline: SigningPipeline,
    verifier: VerificationUtility,
    audit: Arc<AuditLogger>,
}

async fn harness() -> Harness {
    let backend = Arc::new(SoftwareKmsBackend::new());
    backend.create_key(KEY, SigningAlgorithm::EcSignP256Sha256).await;
    let engine = Arc::new(RotationEngine::new(backend.clone(), RotationPolicy::default()));
    engine.rotate(KEY).await.unwrap();

    let audit = Arc::new(AuditLogger::new(Arc::new(MemoryAuditStorage::new())));
    let validator =
        JustificationValidator::new(&[CategoryRule::new("explanation", true)], Duration::hours(1));
    let pipeline = SigningPipeline::new(
        engine.clone(),
        KEY,
        ISSUER,
        vec![AUDIENCE.to_string()],
        validator,
    )
    .with_audit(audit.clone());
    let verifier = VerificationUtility::new(engine.clone(), ISSUER, vec![AUDIENCE.to_string()]);

    Harness {
        backend,
        engine,
        pipeline,
        verifier,
        audit,
    }
}

fn explanation(text: &str) -> Vec<Justification> {
    vec![Justification::new("explanation", text)]
}

/// A ten minute token carries the justifications verbatim and verifies.
#[tokio::test]
async fn test_ten_minute_token_round_trip() {
    let h = harness().await;
    let request =
        JustificationRequest::new(explanation("reading customer ticket"), Duration::minutes(10));

    let token = h.pipeline.create_token(&request).await.unwrap();
    let claims = h.verifier.verify_token(KEY, &token).await.unwrap();

    assert_eq!(claims.exp - claims.iat, 600);
    assert_eq!(claims.iss, ISSUER);
    assert_eq!(claims.aud, vec![AUDIENCE.to_string()]);
    assert_eq!(claims.justs, request.justifications);

    let issued = h
        .audit
        .storage()
        .query(AuditQuery {
            action: Some(AuditAction::TokenIssued),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].resource_id.as_deref(), Some(claims.jti.as_str()));
}

/// Every violation of a bad request is reported, and nothing is signed.
#[tokio::test]
async fn test_invalid_requests_are_rejected_completely() {
    let h = harness().await;
    let before = h.backend.mutation_count();

    let cases = [
        (JustificationRequest::new(vec![], Duration::minutes(5)), 1),
        (
            JustificationRequest {
                justifications: explanation("incident"),
                ..Default::default()
            },
            1,
        ),
        (JustificationRequest::new(explanation("  "), Duration::minutes(5)), 1),
        (
            JustificationRequest {
                justifications: vec![
                    Justification::new("ticket", "T-1"),
                    Justification::new("explanation", ""),
                ],
                ttl_secs: Some(7200),
                ..Default::default()
            },
            3,
        ),
    ];

    for (request, expected) in cases {
        match h.pipeline.create_token(&request).await {
            Err(JvsError::Validation(errors)) => {
                assert_eq!(errors.len(), expected, "violations: {:?}", errors.violations());
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    assert_eq!(h.backend.mutation_count(), before);
}

/// A relying party holding only the published JWK set can verify tokens.
#[tokio::test]
async fn test_external_verification_with_jwks() {
    let h = harness().await;
    let discovery = PublicKeyDiscovery::new(h.engine.clone(), vec![KEY.to_string()], vec![]);
    let token = h
        .pipeline
        .create_token(&JustificationRequest::new(explanation("audit"), Duration::minutes(10)))
        .await
        .unwrap();

    let jwks = discovery.jwks().await.unwrap();
    let kid = decode_header(&token).unwrap().kid.unwrap();
    let jwk = jwks.find(&kid).expect("signing version is published");
    assert_eq!(jwk.kty, "EC");
    assert_eq!(jwk.crv, "P-256");
    assert_eq!(jwk.alg, "ES256");

    let key = DecodingKey::from_ec_components(&jwk.x, &jwk.y).unwrap();
    let mut validation = Validation::new(Algorithm::ES256);
    validation.set_issuer(&[ISSUER]);
    validation.set_audience(&[AUDIENCE]);
    let data = decode::<JustificationClaims>(&token, &key, &validation).unwrap();
    assert_eq!(data.claims.justs, explanation("audit"));
}

#[tokio::test]
async fn test_force_disable_refuses_to_orphan_key() {
    let h = harness().await;
    let actions = CertificateActionService::new(h.engine.clone(), h.audit.clone());
    let primary = h.engine.get_primary(KEY).await.unwrap();

    let err = actions
        .force_disable(&primary.id, "alice", "suspected leak")
        .await
        .unwrap_err();
    assert!(matches!(err, JvsError::WouldOrphanKey { .. }));
    assert!(err.is_lifecycle_violation());

    let still = h.engine.get_primary(KEY).await.unwrap();
    assert_eq!(still.id, primary.id);
    assert_eq!(still.state, BackendState::Enabled);

    let audited = h
        .audit
        .storage()
        .query(AuditQuery {
            action: Some(AuditAction::ForceDisable),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(audited.len(), 1);
    assert!(!audited[0].success);
}

/// Disabling the primary hands signing to a fresh version and revokes
/// tokens signed by the disabled one.
#[tokio::test]
async fn test_force_disable_primary_promotes_replacement() {
    let h = harness().await;
    let actions = CertificateActionService::new(h.engine.clone(), h.audit.clone());
    let old_token = h
        .pipeline
        .create_token(&JustificationRequest::new(explanation("before"), Duration::minutes(10)))
        .await
        .unwrap();

    // A second enabled version so the key is never orphaned.
    h.backend
        .create_version(KEY, lifecycle_labels(LifecycleLabel::New, h.engine.now()))
        .await
        .unwrap();
    let primary = h.engine.get_primary(KEY).await.unwrap();

    let outcome = actions
        .force_disable(&primary.id, "alice", "suspected leak")
        .await
        .unwrap();
    assert_eq!(outcome.state, BackendState::Disabled);
    assert!(outcome.rotation_error.is_none());
    let replacement = outcome.replacement.expect("key rotated after disable");
    assert_ne!(replacement, primary.id);
    assert_eq!(h.engine.get_primary(KEY).await.unwrap().id, replacement);

    assert!(matches!(
        h.verifier.verify_token(KEY, &old_token).await,
        Err(JvsError::SignatureInvalid)
    ));

    let new_token = h
        .pipeline
        .create_token(&JustificationRequest::new(explanation("after"), Duration::minutes(10)))
        .await
        .unwrap();
    assert!(h.verifier.verify_token(KEY, &new_token).await.is_ok());
}

fn config_yaml() -> String {
    format!(
        r#"
issuer: {ISSUER}
audiences: [{AUDIENCE}]
max_ttl_secs: 3600
signing_key: {KEY}
key_names: [{KEY}]
categories:
  - name: explanation
    value_required: true
"#
    )
}

async fn app_state() -> AppState {
    let config = Arc::new(parse_config(&config_yaml()).unwrap());
    let backend = create_backend(&config.backend, &config.key_names)
        .await
        .unwrap();
    let audit = Arc::new(AuditLogger::new(Arc::new(MemoryAuditStorage::new())));
    AppState::new(config, backend, audit)
}

#[tokio::test]
async fn test_handlers_issue_and_verify() {
    let state = app_state().await;

    let (status, _) = handlers::rotation::rotate(State(state.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = handlers::health::health_check(State(state.clone())).await;
    assert_eq!(status, StatusCode::OK);

    let request = JustificationRequest::new(explanation("deploy review"), Duration::minutes(10));
    let Json(body) = handlers::tokens::create_token(State(state.clone()), Json(request))
        .await
        .unwrap();
    let token = body["token"].as_str().unwrap().to_string();

    let verify: handlers::tokens::VerifyRequest =
        serde_json::from_value(serde_json::json!({ "token": token })).unwrap();
    let Json(claims) = handlers::tokens::verify_token(State(state.clone()), Json(verify))
        .await
        .unwrap();
    assert_eq!(claims.justs, explanation("deploy review"));

    let Json(jwks) = handlers::jwks::jwks(State(state)).await.unwrap();
    assert_eq!(jwks.keys.len(), 1);
}

#[tokio::test]
async fn test_handlers_map_errors() {
    let state = app_state().await;

    // No primary yet.
    let (status, _) = handlers::health::health_check(State(state.clone())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    state.scheduler.run_once().await.unwrap();

    let request = JustificationRequest::default();
    match handlers::tokens::create_token(State(state.clone()), Json(request)).await {
        Err(ApiError::InvalidArgument(violations)) => assert_eq!(violations.len(), 2),
        other => panic!("expected invalid argument, got {:?}", other.map(|j| j.0)),
    }

    let unmanaged: handlers::tokens::VerifyRequest = serde_json::from_value(serde_json::json!({
        "token": "a.b.c",
        "key": "projects/p/locations/global/keyRings/jvs/cryptoKeys/other",
    }))
    .unwrap();
    assert!(matches!(
        handlers::tokens::verify_token(State(state.clone()), Json(unmanaged)).await,
        Err(ApiError::NotFound(_))
    ));

    let primary = state.engine.get_primary(KEY).await.unwrap();
    let request = CertificateActionRequest {
        version: primary.id.clone(),
        action: CertificateAction::Disable,
        reason: String::new(),
    };
    match handlers::certificate_actions::certificate_action(
        State(state.clone()),
        HeaderMap::new(),
        Json(request),
    )
    .await
    {
        Err(ApiError::InvalidArgument(violations)) => assert_eq!(violations.len(), 2),
        other => panic!("expected invalid argument, got {:?}", other.map(|j| j.0)),
    }

    let mut headers = HeaderMap::new();
    headers.insert(ACTOR_HEADER, HeaderValue::from_static("alice"));
    let request = CertificateActionRequest {
        version: primary.id,
        action: CertificateAction::Disable,
        reason: "rotation drill".to_string(),
    };
    assert!(matches!(
        handlers::certificate_actions::certificate_action(State(state), headers, Json(request))
            .await,
        Err(ApiError::FailedPrecondition(_))
    ));
}
