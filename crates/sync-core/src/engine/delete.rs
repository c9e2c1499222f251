use std::sync::Arc;

use serde_json::json;

use crate::planner_api::IfMatch;
use crate::PlannerError;

use super::{pending_ops, SyncEngine};

/// Local-initiated delete (§4.7.9): the caller already removed `local_id`'s
/// task key; this issues the corresponding planner DELETE and tears down
/// the crosswalk entry. A stale `If-Match` gets one refetch-and-retry
/// before falling back to `If-Match: *`.
pub async fn delete_local(engine: &Arc<SyncEngine>, local_id: &str) -> Result<(), PlannerError> {
    let Some(external_id) = engine.crosswalk.local_to_external(local_id).await else {
        // Never uploaded, or already unlinked — nothing remote to remove.
        engine.delete_task_record(local_id).await.ok();
        return Ok(());
    };

    match attempt_delete(engine, &external_id).await {
        Ok(()) => {
            engine.crosswalk.unlink(local_id, &external_id).await.ok();
            engine.delete_task_record(local_id).await.ok();
            Ok(())
        }
        Err(PlannerError::NotFound) => {
            // Already gone remotely — treat as success (§8: delete is
            // idempotent from the caller's perspective).
            engine.crosswalk.unlink(local_id, &external_id).await.ok();
            engine.delete_task_record(local_id).await.ok();
            Ok(())
        }
        Err(err) => {
            pending_ops::enqueue(
                engine,
                "delete",
                json!({ "local_id": local_id, "external_id": external_id }),
            )
            .await;
            Err(err)
        }
    }
}

async fn attempt_delete(engine: &Arc<SyncEngine>, external_id: &str) -> Result<(), PlannerError> {
    let etag = engine.crosswalk.etag(external_id).await;
    let first_attempt = match etag {
        Some(etag) => engine.planner.delete_task(external_id, &IfMatch::Etag(etag)).await,
        None => engine.planner.delete_task(external_id, &IfMatch::Any).await,
    };

    match first_attempt {
        Err(PlannerError::PreconditionFailed) => {
            // Stale ETag: refetch once, retry with the fresh value, then
            // give up to `If-Match: *` rather than loop forever (§4.7.9:
            // "on second 412, fall back to If-Match: * as a last resort").
            let retry = match engine.planner.get_task(external_id).await {
                Ok(fetched) => {
                    engine
                        .planner
                        .delete_task(external_id, &IfMatch::Etag(fetched.etag))
                        .await
                }
                Err(_) => Err(PlannerError::PreconditionFailed),
            };
            match retry {
                Err(PlannerError::PreconditionFailed) => {
                    engine.planner.delete_task(external_id, &IfMatch::Any).await
                }
                other => other,
            }
        }
        other => other,
    }
}

/// Remote-initiated delete notification (§4.5, §4.7.9): the planner side
/// reported the task gone. Removes the crosswalk entry and the local
/// record without ever calling back out to the planner.
pub async fn handle_planner_delete_notification(engine: &Arc<SyncEngine>, external_id: &str) {
    let Some(local_id) = engine.crosswalk.external_to_local(external_id).await else {
        return;
    };
    engine.crosswalk.unlink(&local_id, external_id).await.ok();
    engine.delete_task_record(&local_id).await.ok();
    engine.publish_task_update(&local_id).await;
}

pub async fn retry_via_pending(
    engine: &Arc<SyncEngine>,
    local_id: &str,
    external_id: &str,
) -> Result<(), PlannerError> {
    match attempt_delete(engine, external_id).await {
        Ok(()) | Err(PlannerError::NotFound) => {
            engine.crosswalk.unlink(local_id, external_id).await.ok();
            engine.delete_task_record(local_id).await.ok();
            Ok(())
        }
        Err(err) => Err(err),
    }
}
