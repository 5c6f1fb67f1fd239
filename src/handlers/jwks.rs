use axum::{Json, extract::State};
use tracing::debug;

use super::{ApiError, AppState};
use crate::auth::JwkSet;

/// GET /.well-known/jwks
pub async fn jwks(State(state): State<AppState>) -> Result<Json<JwkSet>, ApiError> {
    debug!("JWKS request");
    let set = state.discovery.jwks().await?;
    Ok(Json(set))
}
