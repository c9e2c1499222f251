use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};
use sync_types::FailureRecord;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{delete, upload, SyncEngine};

const POP_TIMEOUT: StdDuration = StdDuration::from_secs(5);
const MAX_ATTEMPTS: u32 = 8;
const FAILED_LIST_MAX: usize = 1000;
const PROCESSED_TTL: StdDuration = StdDuration::from_secs(2 * 24 * 3600);

fn processed_key() -> String {
    format!("sync:processed:{}", Utc::now().format("%Y-%m-%d"))
}

/// Enqueues a retryable operation (§4.7.5). `kind` is `"upload"` or
/// `"delete"`; `payload` carries whatever the handler needs to replay it.
pub async fn enqueue(engine: &Arc<SyncEngine>, kind: &str, payload: Value) {
    let op_id = Uuid::new_v4().to_string();
    let envelope = json!({
        "op_id": op_id,
        "kind": kind,
        "payload": payload,
        "attempt": 0,
    });
    if let Err(err) = engine.store.push("sync:pending", envelope).await {
        tracing::error!(error = %err, "failed to enqueue pending op");
    }
}

/// Blocking-pop worker (§4.7.5): at-least-once delivery with idempotency
/// checked against a day-bucketed processed-set, exponential-backoff
/// requeue up to `MAX_ATTEMPTS`, then a bounded dead-letter list.
pub async fn run(engine: Arc<SyncEngine>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let popped = tokio::select! {
            _ = cancel.cancelled() => return,
            popped = engine.store.pop_front_blocking("sync:pending", POP_TIMEOUT) => popped,
        };
        let Some(envelope) = popped else { continue };
        process_one(&engine, envelope).await;
    }
}

async fn process_one(engine: &Arc<SyncEngine>, envelope: Value) {
    let Some(op_id) = envelope.get("op_id").and_then(|v| v.as_str()).map(str::to_string) else {
        return;
    };
    if engine.store.set_contains(&processed_key(), &op_id).await {
        return;
    }

    let kind = envelope.get("kind").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let payload = envelope.get("payload").cloned().unwrap_or(Value::Null);
    let attempt = envelope.get("attempt").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

    let outcome = dispatch(engine, &kind, &payload).await;

    match outcome {
        Ok(()) => {
            let _ = engine.store.set_add(&processed_key(), &op_id, Some(PROCESSED_TTL)).await;
        }
        Err(reason) => {
            if attempt + 1 >= MAX_ATTEMPTS {
                dead_letter(engine, &op_id, &kind, &reason).await;
            } else {
                requeue_with_backoff(engine, op_id, kind, payload, attempt + 1);
            }
        }
    }
}

async fn dispatch(engine: &Arc<SyncEngine>, kind: &str, payload: &Value) -> Result<(), String> {
    match kind {
        "upload" => {
            let local_id = payload
                .get("local_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| "missing local_id".to_string())?;
            upload::retry_via_pending(engine, local_id)
                .await
                .map_err(|e| e.to_string())
        }
        "delete" => {
            let external_id = payload
                .get("external_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| "missing external_id".to_string())?;
            let local_id = payload.get("local_id").and_then(|v| v.as_str()).unwrap_or("");
            delete::retry_via_pending(engine, local_id, external_id)
                .await
                .map_err(|e| e.to_string())
        }
        "webhook_replay" => {
            let channel = payload
                .get("channel")
                .and_then(|v| v.as_str())
                .ok_or_else(|| "missing channel".to_string())?;
            let notification = payload.get("notification").cloned().unwrap_or(Value::Null);
            if engine.bus.publish(channel, notification).await {
                Ok(())
            } else {
                Err("still no subscribers on replay".to_string())
            }
        }
        other => Err(format!("unknown pending op kind: {other}")),
    }
}

/// Requeues with an exponential delay off the main blocking-pop hot path,
/// so a string of throttled retries doesn't spin the worker. §4.7.5:
/// `min(600 s, 2^attempts · base) + jitter`.
fn requeue_with_backoff(engine: &Arc<SyncEngine>, op_id: String, kind: String, payload: Value, attempt: u32) {
    let engine = engine.clone();
    let base = 2u64.saturating_pow(attempt).min(600);
    let jitter = rand::thread_rng().gen_range(0..=(base / 2).max(1));
    let delay = StdDuration::from_secs((base + jitter).min(600));
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let envelope = json!({ "op_id": op_id, "kind": kind, "payload": payload, "attempt": attempt });
        let _ = engine.store.push("sync:pending", envelope).await;
    });
}

async fn dead_letter(engine: &Arc<SyncEngine>, op_id: &str, kind: &str, reason: &str) {
    tracing::error!(op_id, kind, reason, "pending op exhausted retries, dead-lettering");
    let record = FailureRecord {
        op_id: op_id.to_string(),
        kind: kind.to_string(),
        reason: reason.to_string(),
        payload_hash: None,
        failed_at: Utc::now(),
    };
    let _ = engine.store.push("sync:failed", json!(record)).await;
    let _ = engine.store.trim_list_front("sync:failed", FAILED_LIST_MAX).await;
}

/// For errors already known to be terminal (§4.7.7: a capacity-exhausted
/// 403 "is not retried; it is moved to `sync:failed` with that reason"),
/// skipping the backoff-and-requeue cycle entirely rather than waiting out
/// `MAX_ATTEMPTS` to reach the same place.
pub(super) async fn dead_letter_now(engine: &Arc<SyncEngine>, kind: &str, reason: &str) {
    let op_id = Uuid::new_v4().to_string();
    dead_letter(engine, &op_id, kind, reason).await;
}
