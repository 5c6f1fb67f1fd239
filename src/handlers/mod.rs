pub mod certificate_actions;
pub mod error;
pub mod health;
pub mod jwks;
pub mod rotation;
pub mod tokens;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::audit::AuditLogger;
use crate::auth::{JustificationValidator, PublicKeyDiscovery, SigningPipeline, VerificationUtility};
use crate::certs::{CertificateActionService, RotationEngine, RotationScheduler, SigningBackend};
use crate::metrics;
use crate::models::AppConfig;

pub use error::{ApiError, ErrorResponse};

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<RotationEngine>,
    pub pipeline: Arc<SigningPipeline>,
    pub verifier: Arc<VerificationUtility>,
    pub discovery: Arc<PublicKeyDiscovery>,
    pub scheduler: Arc<RotationScheduler>,
    pub actions: Arc<CertificateActionService>,
}

impl AppState {
    /// Wires the core services over `backend`.
    pub fn new(
        config: Arc<AppConfig>,
        backend: Arc<dyn SigningBackend>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let mut engine = RotationEngine::new(backend, config.rotation.policy.to_policy())
            .with_call_timeout(config.rotation.call_timeout());
        for (key, policy) in &config.key_policies {
            engine = engine.with_policy(key.clone(), policy.to_policy());
        }
        Self::with_engine(config, Arc::new(engine), audit)
    }

    /// Wires the core services around an existing engine.
    pub fn with_engine(
        config: Arc<AppConfig>,
        engine: Arc<RotationEngine>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let validator = JustificationValidator::new(&config.categories, config.max_ttl());
        let pipeline = SigningPipeline::new(
            engine.clone(),
            config.signing_key.clone(),
            config.issuer.clone(),
            config.audiences.clone(),
            validator,
        )
        .with_audit(audit.clone());
        let verifier = VerificationUtility::new(
            engine.clone(),
            config.issuer.clone(),
            config.audiences.clone(),
        );
        let discovery = PublicKeyDiscovery::new(
            engine.clone(),
            config.key_names.clone(),
            config.key_rings.clone(),
        );
        let scheduler = RotationScheduler::new(
            engine.clone(),
            config.key_names.clone(),
            config.key_rings.clone(),
        )
        .with_check_interval(config.rotation.check_interval())
        .with_audit(audit.clone())
        .with_audit_retention(config.audit_retention());
        let actions = CertificateActionService::new(engine.clone(), audit);

        Self {
            config,
            engine,
            pipeline: Arc::new(pipeline),
            verifier: Arc::new(verifier),
            discovery: Arc::new(discovery),
            scheduler: Arc::new(scheduler),
            actions: Arc::new(actions),
        }
    }
}

/// All routes of the service.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/v1/token", post(tokens::create_token))
        .route("/v1/token/verify", post(tokens::verify_token))
        .route("/.well-known/jwks", get(jwks::jwks))
        .route("/v1/rotate", post(rotation::rotate))
        .route(
            "/v1/certificate-actions",
            post(certificate_actions::certificate_action),
        )
        .with_state(state)
}
