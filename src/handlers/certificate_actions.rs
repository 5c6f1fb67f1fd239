use axum::{
    Json,
    extract::State,
    http::HeaderMap,
};
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::certs::CertificateActionOutcome;

/// Header naming the operator behind a certificate action.
pub const ACTOR_HEADER: &str = "x-actor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateAction {
    Disable,
    Destroy,
}

#[derive(Debug, Deserialize)]
pub struct CertificateActionRequest {
    pub version: String,
    pub action: CertificateAction,
    #[serde(default)]
    pub reason: String,
}

/// POST /v1/certificate-actions
pub async fn certificate_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CertificateActionRequest>,
) -> Result<Json<CertificateActionOutcome>, ApiError> {
    let actor = headers
        .get(ACTOR_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|a| !a.is_empty());

    let mut violations = Vec::new();
    if actor.is_none() {
        violations.push(format!("missing {} header", ACTOR_HEADER));
    }
    if request.reason.trim().is_empty() {
        violations.push("reason must be non-empty".to_string());
    }
    if request.version.is_empty() {
        violations.push("version must be non-empty".to_string());
    }
    let Some(actor) = actor.filter(|_| violations.is_empty()) else {
        return Err(ApiError::InvalidArgument(violations));
    };

    let outcome = match request.action {
        CertificateAction::Disable => {
            state
                .actions
                .force_disable(&request.version, actor, &request.reason)
                .await?
        }
        CertificateAction::Destroy => {
            state
                .actions
                .force_destroy(&request.version, actor, &request.reason)
                .await?
        }
    };

    Ok(Json(outcome))
}
