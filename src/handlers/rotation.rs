use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};
use tracing::info;

use super::AppState;

/// POST /v1/rotate
///
/// Runs one rotation pass over every managed key. Responds 500 listing the
/// failed keys when any key failed; the other keys were still rotated.
pub async fn rotate(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    info!("Rotation triggered over HTTP");
    match state.scheduler.run_once().await {
        Ok(outcomes) => (StatusCode::OK, Json(json!({ "outcomes": outcomes }))),
        Err(err) => {
            let failures: Vec<Value> = err
                .failures
                .iter()
                .map(|f| {
                    json!({
                        "key": f.key,
                        "error": f.error.to_string(),
                        "retryable": f.error.is_retryable(),
                    })
                })
                .collect();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "rotation failed for one or more keys",
                    "failures": failures,
                    "outcomes": err.succeeded,
                })),
            )
        }
    }
}
