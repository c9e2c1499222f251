use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde_json::json;
use sync_types::{HealthSnapshot, HealthStatus};
use tokio_util::sync::CancellationToken;

use super::SyncEngine;

const REPORT_INTERVAL: StdDuration = StdDuration::from_secs(60);
const SNAPSHOT_TTL: StdDuration = StdDuration::from_secs(300);

/// Health reporter (§7): writes a fresh `HealthSnapshot` to `sync:health`
/// every minute, served as-is by the HTTP surface's `/health` endpoint.
pub async fn run(engine: Arc<SyncEngine>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => write_snapshot(&engine).await,
        }
    }
}

async fn write_snapshot(engine: &Arc<SyncEngine>) {
    let snapshot = build_snapshot(engine, false).await;
    let _ = engine
        .store
        .set("sync:health", json!(snapshot), Some(SNAPSHOT_TTL))
        .await;
}

/// Written once on graceful shutdown so `/health` reflects `stopped`
/// rather than a stale `healthy` snapshot until the next daemon starts.
pub async fn write_stopped_snapshot(engine: &Arc<SyncEngine>) {
    let mut snapshot = build_snapshot(engine, true).await;
    snapshot.status = HealthStatus::Stopped;
    let _ = engine
        .store
        .set("sync:health", json!(snapshot), Some(SNAPSHOT_TTL))
        .await;
}

async fn build_snapshot(engine: &Arc<SyncEngine>, stopping: bool) -> HealthSnapshot {
    let pending_depth = engine.store.list_len("sync:pending").await as u64;
    let failed_depth = engine.store.list_len("sync:failed").await as u64;
    let backoff_until = engine.governor.backoff_until();
    let last_error = engine.last_error.read().await.clone();
    let last_upload_at = *engine.last_upload_at.read().await;
    let last_download_at = *engine.last_download_at.read().await;

    let status = if stopping {
        HealthStatus::Stopped
    } else if engine.writes_are_halted() {
        HealthStatus::Degraded
    } else if backoff_until.is_some() {
        HealthStatus::Throttled
    } else if last_upload_at.is_none() && last_download_at.is_none() {
        HealthStatus::Starting
    } else {
        HealthStatus::Healthy
    };

    HealthSnapshot {
        status,
        last_upload_at,
        last_download_at,
        pending_depth,
        failed_depth,
        backoff_until,
        last_error,
    }
}
