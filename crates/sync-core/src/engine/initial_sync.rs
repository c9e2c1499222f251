use std::collections::HashSet;
use std::sync::Arc;

use sync_adapter::from_planner;
use sync_types::CanonicalTask;

use super::SyncEngine;

/// Full-sync pass run once at startup (§4.7.1): discovers every accessible
/// plan, reconciles the intersection of local and remote tasks, creates
/// local records for remote tasks with no reverse mapping, and enqueues
/// uploads for local tasks the remote side has never seen.
pub async fn run_once(engine: Arc<SyncEngine>) {
    let plans = match engine.planner.list_accessible_plans().await {
        Ok(plans) => plans,
        Err(err) => {
            tracing::error!(error = %err, "initial sync: failed to list accessible plans");
            return;
        }
    };

    let mut seen_external_ids = HashSet::new();

    for plan in &plans {
        let tasks = match engine.planner.list_plan_tasks(&plan.id).await {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::warn!(plan_id = %plan.id, error = %err, "initial sync: failed to list plan tasks");
                continue;
            }
        };

        for remote in tasks {
            seen_external_ids.insert(remote.id.clone());
            let details = engine.planner.get_task_details(&remote.id).await.ok();
            let etag = remote.etag.clone().unwrap_or_default();

            match engine.crosswalk.external_to_local(&remote.id).await {
                Some(local_id) => {
                    reconcile_known(&engine, &local_id, &remote, details.as_ref().map(|d| &d.value)).await;
                    let _ = engine.crosswalk.set_etag(&remote.id, &etag).await;
                }
                None => {
                    let local_id = format!("L-{}", remote.id);
                    let local = from_planner(
                        &remote,
                        details.as_ref().map(|d| &d.value),
                        &engine.config.reverse_user_name_map(),
                        None,
                        &local_id,
                    );
                    if engine.write_task(&local).await.is_ok() {
                        let _ = engine.write_baseline(&local).await;
                        let _ = engine.crosswalk.link(&local_id, &remote.id, &etag).await;
                    }
                }
            }
        }
    }

    enqueue_unmapped_local_tasks(&engine, &seen_external_ids).await;
    tracing::info!(plan_count = plans.len(), "initial sync complete");
}

/// A local id already crosswalked to a known external id: compare content
/// and prefer whichever side is newer rather than running the full
/// baseline-aware conflict resolver (there is no prior baseline yet on the
/// very first sync).
async fn reconcile_known(
    engine: &Arc<SyncEngine>,
    local_id: &str,
    remote: &sync_wire::PlannerTask,
    details: Option<&sync_wire::PlannerTaskDetails>,
) {
    let existing = engine.read_task(local_id).await;
    let remote_as_local = from_planner(
        remote,
        details,
        &engine.config.reverse_user_name_map(),
        existing.as_ref(),
        local_id,
    );

    let local_wins = matches!(&existing, Some(local) if local.updated_at > remote_as_local.updated_at);
    let winner = if local_wins {
        existing.clone().expect("local_wins implies existing is Some")
    } else {
        remote_as_local
    };

    if content_differs(existing.as_ref(), &winner) {
        let _ = engine.write_task(&winner).await;
    }
    let _ = engine.write_baseline(&winner).await;

    // §4.7.1: whichever side is newer by `updated_at` wins the local
    // record, but a local win must still be pushed to the planner — this
    // is the only reconciliation pass that compares both sides directly
    // rather than going through the normal upload/download flow.
    if local_wins {
        engine.enqueue_upload(local_id).await;
    }
}

fn content_differs(existing: Option<&CanonicalTask>, candidate: &CanonicalTask) -> bool {
    match existing {
        None => true,
        Some(existing) => {
            existing.title != candidate.title
                || existing.status != candidate.status
                || existing.percent_complete != candidate.percent_complete
                || existing.priority != candidate.priority
                || existing.assigned_to != candidate.assigned_to
                || existing.due_date != candidate.due_date
                || existing.description != candidate.description
                || existing.checklist_items != candidate.checklist_items
        }
    }
}

/// Local tasks that are sync-eligible but have never been linked to a
/// planner id go through the normal upload batcher rather than a
/// bespoke bulk-create path, so they get the same capacity/backoff
/// handling as any other upload.
async fn enqueue_unmapped_local_tasks(engine: &Arc<SyncEngine>, seen_external_ids: &HashSet<String>) {
    let Some(aggregate) = engine.store.get("tasks:aggregate").await else {
        return;
    };
    let Some(buckets) = aggregate.as_object() else {
        return;
    };

    for bucket in buckets.values() {
        let Some(tasks) = bucket.as_object() else { continue };
        for (local_id, raw) in tasks {
            let Ok(task) = serde_json::from_value::<CanonicalTask>(raw.clone()) else {
                continue;
            };
            if !task.list_type.is_sync_eligible() || task.is_checklist_subitem() {
                continue;
            }
            match &task.external_id {
                Some(external_id) if seen_external_ids.contains(external_id) => continue,
                _ => engine.enqueue_upload(local_id).await,
            }
        }
    }
}
