use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{ApiError, AppState};
use crate::auth::{JustificationClaims, JustificationRequest};

/// POST /v1/token
pub async fn create_token(
    State(state): State<AppState>,
    Json(request): Json<JustificationRequest>,
) -> Result<Json<Value>, ApiError> {
    debug!(
        justifications = request.justifications.len(),
        "Token issuance request"
    );
    let token = state.pipeline.create_token(&request).await?;
    Ok(Json(json!({ "token": token })))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub token: String,
    /// Key to verify against, defaults to the signing key.
    #[serde(default)]
    pub key: Option<String>,
}

/// POST /v1/token/verify
pub async fn verify_token(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<JustificationClaims>, ApiError> {
    let key = request
        .key
        .as_deref()
        .unwrap_or(state.pipeline.signing_key());
    if !state.config.manages_key(key) {
        return Err(ApiError::NotFound(format!("key '{}' is not managed", key)));
    }

    let claims = state.verifier.verify_token(key, &request.token).await?;
    Ok(Json(claims))
}
