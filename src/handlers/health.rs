use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};
use tracing::warn;

use super::AppState;

/// GET /health
///
/// Degraded when any managed key has no usable primary version.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (keys, failures) = state
        .engine
        .resolve_keys(&state.config.key_names, &state.config.key_rings)
        .await;

    let mut problems: Vec<Value> = failures
        .iter()
        .map(|f| json!({ "key": f.key, "error": f.error.to_string() }))
        .collect();
    for key in &keys {
        if let Err(e) = state.engine.get_primary(key).await {
            warn!(key = %key, error = %e, "Health check found key without primary");
            problems.push(json!({ "key": key, "error": e.to_string() }));
        }
    }

    let (status, label) = if problems.is_empty() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(json!({
            "status": label,
            "service": "justification-api",
            "version": env!("CARGO_PKG_VERSION"),
            "keys": keys.len(),
            "problems": problems,
        })),
    )
}
