use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde_json::json;
use sync_adapter::to_planner;
use sync_observability::{emit_event, SyncEvent};
use sync_types::CanonicalTask;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::bus::channels;
use crate::planner_api::IfMatch;
use crate::PlannerError;

use super::{last_upload_key, pending_ops, SyncEngine};

const LAST_UPLOAD_TTL: StdDuration = StdDuration::from_secs(7 * 24 * 3600);

/// Event-driven upload path (§4.7.2): reacts to `tasks:updates` published
/// either by local agents writing a task key directly, or by the download
/// path after folding a remote change into the local store.
pub async fn run_event_loop(engine: Arc<SyncEngine>, cancel: CancellationToken) {
    let mut rx = engine.bus.subscribe(channels::TASKS_UPDATES).await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = rx.recv() => {
                match received {
                    Ok(payload) => {
                        if let Some(local_id) = payload.get("local_id").and_then(|v| v.as_str()) {
                            handle_candidate(&engine, local_id).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

async fn handle_candidate(engine: &Arc<SyncEngine>, local_id: &str) {
    let Some(task) = engine.read_task(local_id).await else {
        return;
    };
    if !task.list_type.is_sync_eligible() {
        return;
    }

    let target_id = if task.is_checklist_subitem() {
        match fold_into_parent_checklist(engine, &task).await {
            Some(parent_id) => parent_id,
            None => return,
        }
    } else {
        local_id.to_string()
    };

    if is_coalesced(engine, &target_id).await {
        return;
    }

    engine.enqueue_upload(&target_id).await;
}

/// §4.7.8: a checklist-subitem entry is never uploaded as a standalone
/// planner task. Its text/checked state is folded into the parent's
/// `checklist_items` and the parent, not the subitem, is queued.
async fn fold_into_parent_checklist(engine: &Arc<SyncEngine>, subitem: &CanonicalTask) -> Option<String> {
    let parent_id = subitem.subitem_parent_id()?;
    let mut parent = engine.read_task(&parent_id).await?;

    if let Some(existing) = parent
        .checklist_items
        .iter_mut()
        .find(|item| item.text == subitem.title)
    {
        existing.checked = subitem.status == sync_types::TaskStatus::Completed;
    } else {
        parent.checklist_items.push(sync_types::ChecklistItem {
            text: subitem.title.clone(),
            checked: subitem.status == sync_types::TaskStatus::Completed,
        });
    }
    parent.updated_at = Utc::now();
    let _ = engine.write_task(&parent).await;
    Some(parent_id)
}

/// §4.7.2 step 1: skip if the coalescing guard shows an upload already
/// covers this version of the task.
async fn is_coalesced(engine: &Arc<SyncEngine>, local_id: &str) -> bool {
    let Some(task) = engine.read_task(local_id).await else {
        return true;
    };
    let Some(stamped) = engine.store.get(&last_upload_key(local_id)).await else {
        return false;
    };
    let Some(stamped_at) = stamped.as_str().and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok()) else {
        return false;
    };
    stamped_at >= task.updated_at
}

pub fn schedule_linger_drain(engine: Arc<SyncEngine>) {
    if engine
        .batch_scheduled
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    let linger = engine.config.upload_batch_linger;
    tokio::spawn(async move {
        tokio::time::sleep(linger).await;
        engine.batch_scheduled.store(false, Ordering::Release);
        drain(engine.clone()).await;
    });
}

pub fn spawn_immediate_drain(engine: Arc<SyncEngine>) {
    tokio::spawn(drain(engine));
}

/// §5: `batch_processing` is a single-holder mutex — a drain already in
/// flight means this call just returns, the batch catches it next time.
async fn drain(engine: Arc<SyncEngine>) {
    if engine
        .batch_processing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    loop {
        let next = {
            let mut batch = engine.batch.lock().await;
            let id = batch.iter().next().cloned();
            if let Some(id) = &id {
                batch.remove(id);
            }
            id
        };
        let Some(local_id) = next else { break };

        if !engine.governor.acquire() {
            engine.batch.lock().await.insert(local_id);
            break;
        }

        if let Err(err) = attempt_upload(&engine, &local_id).await {
            match &err {
                _ if err.kind().is_process_visible() => {}
                _ if err.kind().is_terminal() => {
                    pending_ops::dead_letter_now(&engine, "upload", &err.to_string()).await;
                }
                _ => enqueue_for_retry(&engine, &local_id, &err.to_string()).await,
            }
        }
    }

    engine.batch_processing.store(false, Ordering::Release);
}

/// Performs one upload attempt (create-or-update) for `local_id`. Used
/// both by the batch drain and by the pending-op worker's retry path
/// (§4.7.5). On success the coalescing stamp and crosswalk move forward;
/// on failure the caller is responsible for dead-lettering.
pub async fn attempt_upload(engine: &Arc<SyncEngine>, local_id: &str) -> Result<(), PlannerError> {
    let Some(task) = engine.read_task(local_id).await else {
        return Ok(());
    };

    let result = match &task.external_id {
        Some(external_id) => update_existing(engine, &task, external_id).await,
        None => create_new(engine, &task).await,
    };

    match &result {
        Ok(()) => {
            engine.governor.report_result(false, None);
            let _ = engine
                .store
                .set(
                    &last_upload_key(local_id),
                    json!(Utc::now().to_rfc3339()),
                    Some(LAST_UPLOAD_TTL),
                )
                .await;
            engine.record_upload_success().await;
            if let Some(latest) = engine.read_task(local_id).await {
                engine.write_baseline(&latest).await.ok();
            }
            emit_event(
                Level::INFO,
                SyncEvent {
                    event: "upload.apply",
                    component: "engine.upload",
                    local_id: Some(local_id),
                    external_id: task.external_id.as_deref(),
                    op_id: None,
                    status: Some("applied"),
                    error_kind: None,
                    detail: None,
                },
            );
        }
        Err(err) => {
            engine.governor.report_result(
                matches!(err, PlannerError::Throttled { .. }),
                match err {
                    PlannerError::Throttled { retry_after_secs: Some(s) } => {
                        Some(StdDuration::from_secs(*s))
                    }
                    _ => None,
                },
            );
            engine.record_error(err.to_string()).await;
            let kind = err.kind();
            if kind.is_process_visible() {
                engine.halt_writes();
            }
            emit_event(
                Level::WARN,
                SyncEvent {
                    event: "upload.apply",
                    component: "engine.upload",
                    local_id: Some(local_id),
                    external_id: task.external_id.as_deref(),
                    op_id: None,
                    status: Some("failed"),
                    error_kind: Some(kind.as_str()),
                    detail: Some(&err.to_string()),
                },
            );
        }
    }
    result
}

async fn update_existing(
    engine: &Arc<SyncEngine>,
    task: &CanonicalTask,
    external_id: &str,
) -> Result<(), PlannerError> {
    let etag = match engine.crosswalk.etag(external_id).await {
        Some(etag) => etag,
        None => {
            let fetched = engine.planner.get_task(external_id).await?;
            engine.crosswalk.set_etag(external_id, &fetched.etag).await.ok();
            fetched.etag
        }
    };

    // Updates never move a task between plans/buckets, so the adapter's
    // plan/bucket fields are unused here — only the patchable fields below
    // are sent.
    let (create_body, details_body) = to_planner(task, "", "", &engine.config.user_name_map);

    let patch = json!({
        "title": create_body.title,
        "percentComplete": create_body.percent_complete,
        "priority": create_body.priority,
        "assignments": create_body.assignments,
        "dueDateTime": create_body.due_date_time,
        "conversationThreadId": create_body.conversation_thread_id,
    });

    let new_etag = engine
        .planner
        .update_task(external_id, &patch, &IfMatch::Etag(etag))
        .await?;
    engine.crosswalk.set_etag(external_id, &new_etag).await.ok();

    let details_etag = match engine.planner.get_task_details(external_id).await {
        Ok(details) => details.etag,
        Err(_) => new_etag.clone(),
    };
    engine
        .planner
        .update_task_details(external_id, &details_body, &IfMatch::Etag(details_etag))
        .await?;
    Ok(())
}

async fn create_new(engine: &Arc<SyncEngine>, task: &CanonicalTask) -> Result<(), PlannerError> {
    let plan_id = engine.plan_for(task).await?;
    if engine.capacity.is_blocked(&plan_id).await {
        return Err(PlannerError::CapacityExhausted(format!(
            "plan {plan_id} at capacity"
        )));
    }

    let bucket_id = engine.bucket_for(&plan_id).await?;
    let (create_body, details_body) = to_planner(task, &plan_id, &bucket_id, &engine.config.user_name_map);

    let created = engine.planner.create_task(&create_body).await;
    let created = match created {
        Ok(c) => c,
        Err(PlannerError::CapacityExhausted(reason)) => {
            engine.capacity.mark_exhausted(&plan_id).await.ok();
            return Err(PlannerError::CapacityExhausted(reason));
        }
        Err(PlannerError::Forbidden(reason)) => {
            engine.capacity.mark_inaccessible(&plan_id).await.ok();
            return Err(PlannerError::Forbidden(reason));
        }
        Err(e) => return Err(e),
    };

    engine
        .crosswalk
        .link(&task.id, &created.value.id, &created.etag)
        .await
        .ok();

    engine
        .planner
        .update_task_details(&created.value.id, &details_body, &IfMatch::Etag(created.etag.clone()))
        .await?;

    let mut stored = task.clone();
    stored.external_id = Some(created.value.id.clone());
    engine.write_task(&stored).await.ok();
    Ok(())
}

impl SyncEngine {
    /// Resolves the target plan for a create: the configured default if
    /// it's usable, otherwise the first accessible plan with headroom
    /// (§4.7.7 scenario 5: "a different accessible plan is chosen if
    /// `DEFAULT_PLAN_ID` allows").
    pub(super) async fn plan_for(&self, _task: &CanonicalTask) -> Result<String, PlannerError> {
        if let Some(default_plan) = &self.config.default_plan_id {
            if !self.capacity.is_inaccessible(default_plan).await
                && !self.capacity.is_blocked(default_plan).await
            {
                return Ok(default_plan.clone());
            }
        }

        let plans = self.planner.list_accessible_plans().await?;
        for plan in plans {
            if self.capacity.is_inaccessible(&plan.id).await {
                continue;
            }
            if self.capacity.is_blocked(&plan.id).await {
                continue;
            }
            return Ok(plan.id);
        }
        Err(PlannerError::CapacityExhausted(
            "no accessible plan with headroom".to_string(),
        ))
    }

    pub(super) async fn bucket_for(&self, plan_id: &str) -> Result<String, PlannerError> {
        let cache_key = format!("graph:buckets:{plan_id}");
        if let Some(cached) = self.store.get(&cache_key).await {
            if let Some(first) = cached.as_array().and_then(|a| a.first()) {
                if let Some(id) = first.get("id").and_then(|v| v.as_str()) {
                    return Ok(id.to_string());
                }
            }
        }
        let buckets = self.planner.list_plan_buckets(plan_id).await?;
        let first = buckets
            .first()
            .ok_or_else(|| PlannerError::Transient(format!("plan {plan_id} has no buckets")))?
            .clone();
        let _ = self
            .store
            .set(&cache_key, json!(buckets), Some(StdDuration::from_secs(300)))
            .await;
        Ok(first.id)
    }
}

/// Retried from the pending-op worker after a failed drain attempt
/// (§4.7.5): same logic, dead-lettered by the caller on exhaustion.
pub async fn retry_via_pending(engine: &Arc<SyncEngine>, local_id: &str) -> Result<(), PlannerError> {
    attempt_upload(engine, local_id).await
}

pub(super) async fn enqueue_for_retry(engine: &Arc<SyncEngine>, local_id: &str, reason: &str) {
    pending_ops::enqueue(
        engine,
        "upload",
        json!({ "local_id": local_id, "reason": reason }),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use serde_json::Value;
    use uuid::Uuid;

    use sync_types::{ListType, Priority, TaskStatus};
    use sync_wire::{
        BucketSummary, PlanSummary, PlannerCreateBody, PlannerDetailsBody, PlannerTask,
        PlannerTaskDetails,
    };

    use crate::planner_api::{IfMatch, PlannerApi, Versioned};
    use crate::{Bus, Crosswalk, EngineConfig, RateGovernor, StoreGateway};

    use super::*;

    struct NoCreatePlanner;

    #[async_trait]
    impl PlannerApi for NoCreatePlanner {
        async fn list_accessible_plans(&self) -> Result<Vec<PlanSummary>, PlannerError> {
            Ok(vec![])
        }
        async fn list_plan_buckets(&self, _: &str) -> Result<Vec<BucketSummary>, PlannerError> {
            Ok(vec![])
        }
        async fn list_plan_tasks(&self, _: &str) -> Result<Vec<PlannerTask>, PlannerError> {
            Ok(vec![])
        }
        async fn get_task(&self, _: &str) -> Result<Versioned<PlannerTask>, PlannerError> {
            Err(PlannerError::NotFound)
        }
        async fn get_task_details(&self, _: &str) -> Result<Versioned<PlannerTaskDetails>, PlannerError> {
            Err(PlannerError::NotFound)
        }
        async fn create_task(&self, _: &PlannerCreateBody) -> Result<Versioned<PlannerTask>, PlannerError> {
            panic!("capacity guard should have refused this before any HTTP call")
        }
        async fn update_task(&self, _: &str, _: &Value, _: &IfMatch) -> Result<String, PlannerError> {
            Err(PlannerError::NotFound)
        }
        async fn update_task_details(
            &self,
            _: &str,
            _: &PlannerDetailsBody,
            _: &IfMatch,
        ) -> Result<String, PlannerError> {
            Err(PlannerError::NotFound)
        }
        async fn delete_task(&self, _: &str, _: &IfMatch) -> Result<(), PlannerError> {
            Ok(())
        }
    }

    fn sample_local_task(id: &str) -> CanonicalTask {
        CanonicalTask {
            id: id.to_string(),
            external_id: None,
            list_type: ListType::UserTasks,
            title: "needs uploading".to_string(),
            description: None,
            output: None,
            status: TaskStatus::NotStarted,
            percent_complete: 0.0,
            priority: Priority::Normal,
            assigned_to: Vec::new(),
            due_date: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            conversation_id: None,
            checklist_items: Vec::new(),
        }
    }

    async fn test_engine() -> Arc<SyncEngine> {
        let path = std::env::temp_dir().join(format!("sync-core-upload-{}.json", Uuid::new_v4()));
        let store = Arc::new(StoreGateway::new(path).await.expect("store"));
        let config = Arc::new(EngineConfig {
            tenant_id: "t".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
            agent_username: "u".into(),
            agent_password: "p".into(),
            agent_user_id: None,
            default_plan_id: Some("plan-1".into()),
            user_name_map: HashMap::new(),
            planner_poll_interval: StdDuration::from_secs(3600),
            min_quick_poll_interval: StdDuration::from_secs(300),
            upload_batch_size: 20,
            upload_batch_linger: StdDuration::from_millis(100),
            max_tasks_per_plan: 200,
            housekeeping_dry_run: true,
            notification_url: "https://example.com/webhook/planner".into(),
        });
        SyncEngine::new(
            config,
            store.clone(),
            Bus::new(),
            RateGovernor::new(),
            Arc::new(Crosswalk::new(store)),
            Arc::new(NoCreatePlanner),
        )
    }

    #[tokio::test]
    async fn capacity_exhausted_dead_letters_immediately_without_retry_backoff() {
        let engine = test_engine().await;
        engine.capacity.mark_exhausted("plan-1").await.unwrap();

        let task = sample_local_task("L1");
        engine.write_task(&task).await.unwrap();
        engine.batch.lock().await.insert("L1".to_string());

        drain(engine.clone()).await;

        assert_eq!(engine.store.list_len("sync:pending").await, 0);
        assert_eq!(engine.store.list_len("sync:failed").await, 1);
    }

    #[tokio::test]
    async fn checklist_subitem_folds_into_parent_instead_of_uploading_standalone() {
        let engine = test_engine().await;
        let parent = sample_local_task("Task-conv1-parentA");
        engine.write_task(&parent).await.unwrap();

        let mut subitem = sample_local_task("Task-conv1-parentA-childB");
        subitem.title = "buy milk".to_string();
        subitem.status = TaskStatus::Completed;
        engine.write_task(&subitem).await.unwrap();

        handle_candidate(&engine, "Task-conv1-parentA-childB").await;

        let updated_parent = engine.read_task("Task-conv1-parentA").await.unwrap();
        assert_eq!(updated_parent.checklist_items.len(), 1);
        assert_eq!(updated_parent.checklist_items[0].text, "buy milk");
        assert!(updated_parent.checklist_items[0].checked);
        assert!(engine.batch.lock().await.contains("Task-conv1-parentA"));
        assert!(!engine.batch.lock().await.contains("Task-conv1-parentA-childB"));
    }

    #[tokio::test]
    async fn coalesced_candidate_is_skipped() {
        let engine = test_engine().await;
        let task = sample_local_task("L1");
        engine.write_task(&task).await.unwrap();
        engine
            .store
            .set(
                &last_upload_key("L1"),
                json!((task.updated_at + chrono::Duration::seconds(1)).to_rfc3339()),
                None,
            )
            .await
            .unwrap();

        handle_candidate(&engine, "L1").await;

        assert!(!engine.batch.lock().await.contains("L1"));
    }
}
