use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use sync_adapter::{from_planner, resolve_conflict};
use sync_observability::{emit_event, SyncEvent};
use sync_wire::{PlannerTask, PlannerTaskDetails};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::bus::channels;
use crate::planner_api::Versioned;
use crate::PlannerError;

use super::SyncEngine;

/// Slow path (§4.7.3): a ticker re-lists every accessible plan as a safety
/// net, independent of webhook delivery. Interval is already floored at 5
/// minutes by `EngineConfig::from_env`.
pub async fn run_timed_loop(engine: Arc<SyncEngine>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(engine.config.planner_poll_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(err) = sweep_all_plans(&engine).await {
                    engine.record_error(err.to_string()).await;
                    tracing::warn!(error = %err, "timed download sweep failed");
                }
            }
        }
    }
}

async fn sweep_all_plans(engine: &Arc<SyncEngine>) -> Result<(), PlannerError> {
    let plans = engine.planner.list_accessible_plans().await?;
    for plan in plans {
        if engine.capacity.is_inaccessible(&plan.id).await {
            continue;
        }
        if !should_quick_poll(engine, &plan.id).await {
            continue;
        }
        let tasks = engine.planner.list_plan_tasks(&plan.id).await?;
        for remote in tasks {
            let details = engine.planner.get_task_details(&remote.id).await.ok();
            let etag = remote.etag.clone().unwrap_or_default();
            let _ = reconcile_remote(engine, Versioned { value: remote, etag }, details).await;
        }
        gate_quick_poll(engine, &plan.id).await;
    }
    engine.record_download_success().await;
    Ok(())
}

/// §4.7.3 fast path: consumes normalized notifications the Webhook Router
/// publishes to `bus:planner:webhook` after `clientState` validation.
pub async fn run_webhook_loop(engine: Arc<SyncEngine>, cancel: CancellationToken) {
    let mut rx = engine.bus.subscribe(channels::PLANNER_WEBHOOK).await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = rx.recv() => {
                match received {
                    Ok(payload) => handle_notification(&engine, payload).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

async fn handle_notification(engine: &Arc<SyncEngine>, payload: serde_json::Value) {
    let Some(resource_id) = payload
        .get("resourceData")
        .and_then(|d| d.get("id"))
        .and_then(|v| v.as_str())
    else {
        return;
    };
    let change_type = payload.get("changeType").and_then(|v| v.as_str()).unwrap_or("updated");

    if change_type == "deleted" {
        super::delete::handle_planner_delete_notification(engine, resource_id).await;
        return;
    }

    let fetched = match engine.planner.get_task(resource_id).await {
        Ok(fetched) => fetched,
        Err(PlannerError::NotFound) => {
            super::delete::handle_planner_delete_notification(engine, resource_id).await;
            return;
        }
        Err(err) => {
            engine.record_error(err.to_string()).await;
            return;
        }
    };
    let details = engine.planner.get_task_details(resource_id).await.ok();
    let plan_id = fetched.value.plan_id.clone();
    if let Err(err) = reconcile_remote(engine, fetched, details).await {
        engine.record_error(err.to_string()).await;
    } else {
        // §4.7.3: a webhook-driven reconcile for this plan gates its next
        // quick re-poll the same way the slow-path sweep does.
        gate_quick_poll(engine, &plan_id).await;
    }
    engine.record_download_success().await;
}

/// Applies one remote task — found via webhook fast path or the slow-path
/// safety net — against local state: create-local for unmapped ids
/// (invariant 4), conflict-resolve for known ids, and publish so local
/// agents observe the change via `tasks:updates`.
async fn reconcile_remote(
    engine: &Arc<SyncEngine>,
    remote: Versioned<PlannerTask>,
    details: Option<Versioned<PlannerTaskDetails>>,
) -> Result<(), PlannerError> {
    let external_id = remote.value.id.clone();
    let details_value = details.as_ref().map(|d| &d.value);
    let remote_last_modified = remote
        .value
        .last_modified_date_time
        .unwrap_or(remote.value.created_date_time);

    match engine.crosswalk.external_to_local(&external_id).await {
        Some(local_id) => {
            let existing = engine.read_task(&local_id).await;
            let remote_as_local = from_planner(
                &remote.value,
                details_value,
                &engine.config.reverse_user_name_map(),
                existing.as_ref(),
                &local_id,
            );

            let merged = match (engine.read_baseline(&local_id).await, existing.clone()) {
                (Some(baseline), Some(local)) => {
                    resolve_conflict(&baseline, &local, &remote_as_local, remote_last_modified)
                }
                _ => remote_as_local,
            };

            engine.write_task(&merged).await.ok();
            engine.write_baseline(&merged).await.ok();
            engine.crosswalk.set_etag(&external_id, &remote.etag).await.ok();
            engine.publish_task_update(&local_id).await;
            emit_event(
                Level::INFO,
                SyncEvent {
                    event: "download.reconcile",
                    component: "engine.download",
                    local_id: Some(&local_id),
                    external_id: Some(&external_id),
                    op_id: None,
                    status: Some("merged"),
                    error_kind: None,
                    detail: None,
                },
            );
        }
        None => {
            // Invariant 4: an external id with no reverse mapping is
            // always a create-local, never an update.
            let local_id = format!("L-{}", &external_id);
            let local = from_planner(
                &remote.value,
                details_value,
                &engine.config.reverse_user_name_map(),
                None,
                &local_id,
            );
            engine.write_task(&local).await.ok();
            engine.write_baseline(&local).await.ok();
            engine.crosswalk.link(&local_id, &external_id, &remote.etag).await.ok();
            engine.publish_task_update(&local_id).await;
            emit_event(
                Level::INFO,
                SyncEvent {
                    event: "download.reconcile",
                    component: "engine.download",
                    local_id: Some(&local_id),
                    external_id: Some(&external_id),
                    op_id: None,
                    status: Some("created_local"),
                    error_kind: None,
                    detail: None,
                },
            );
        }
    }
    Ok(())
}

/// §4.7.3 quick-poll suppression: a plan just reconciled via the webhook
/// fast path doesn't need the slow-path sweep to re-cover it again inside
/// `MIN_QUICK_POLL_INTERVAL_SECONDS`.
async fn should_quick_poll(engine: &Arc<SyncEngine>, plan_id: &str) -> bool {
    let gate = engine.quick_poll_gate.read().await;
    match gate.get(plan_id) {
        Some(next_allowed) => Utc::now() >= *next_allowed,
        None => true,
    }
}

async fn gate_quick_poll(engine: &Arc<SyncEngine>, plan_id: &str) {
    let jitter_secs = rand::thread_rng().gen_range(0..30);
    let next_allowed: DateTime<Utc> =
        Utc::now() + chrono::Duration::from_std(engine.config.min_quick_poll_interval).unwrap_or_default()
            + chrono::Duration::seconds(jitter_secs);
    engine
        .quick_poll_gate
        .write()
        .await
        .insert(plan_id.to_string(), next_allowed);
}
