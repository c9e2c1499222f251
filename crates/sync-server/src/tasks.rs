use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};

use crate::AppState;

/// Out-of-core read/write proxy (§4.8): lets an external caller read or
/// write a task's canonical JSON directly against the store, the same
/// record the Sync Engine itself reads and writes. A PUT here is
/// indistinguishable from a local agent writing the key and publishing
/// on `tasks:updates` — it goes through the identical path.
pub async fn get_task(State(state): State<AppState>, Path(local_id): Path<String>) -> impl IntoResponse {
    match state.store.get(&format!("task:{local_id}")).await {
        Some(task) => (StatusCode::OK, Json(task)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn put_task(
    State(state): State<AppState>,
    Path(local_id): Path<String>,
    Json(task): Json<Value>,
) -> impl IntoResponse {
    if state.store.set(&format!("task:{local_id}"), task, None).await.is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    state
        .bus
        .publish(sync_core::channels::TASKS_UPDATES, json!({ "local_id": local_id }))
        .await;
    StatusCode::ACCEPTED.into_response()
}
