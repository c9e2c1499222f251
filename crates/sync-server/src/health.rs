use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::AppState;

/// `/health` (§4.8, §7): serves the most recent `sync:health` snapshot
/// verbatim. Absence of a snapshot (nothing has run yet, or it expired)
/// reads as `starting` rather than a 404 — external probes should see a
/// status, not an error, while the daemon comes up.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get("sync:health").await {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)),
        None => (
            StatusCode::OK,
            Json(json!({
                "status": "starting",
                "last_upload_at": null,
                "last_download_at": null,
                "pending_depth": 0,
                "failed_depth": 0,
                "backoff_until": null,
                "last_error": null,
            })),
        ),
    }
}
