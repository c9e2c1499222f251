mod capacity;
mod delete;
mod download;
mod health;
mod housekeeping;
mod initial_sync;
mod pending_ops;
mod upload;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sync_types::CanonicalTask;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bus::{channels, Bus};
use crate::config::EngineConfig;
use crate::crosswalk::Crosswalk;
use crate::planner_api::PlannerApi;
use crate::rate_governor::RateGovernor;
use crate::store::StoreGateway;

pub use capacity::CapacityGuard;

const AGGREGATE_KEY: &str = "tasks:aggregate";

fn task_key(local_id: &str) -> String {
    format!("task:{local_id}")
}

fn last_upload_key(local_id: &str) -> String {
    format!("sync:last_upload:{local_id}")
}

/// Last state both sides agreed on, used by the conflict resolver to
/// compute which fields changed on which side since (§4.7.4). Updated
/// after every successful reconcile or upload — never user-visible.
fn baseline_key(local_id: &str) -> String {
    format!("sync:baseline:{local_id}")
}

/// The aggregate's bucket name for a `list_type` (§3.1): the same
/// snake_case vocabulary the wire/store JSON uses, not `{:?}`'s
/// `UserTasks`-style `Debug` rendering.
fn list_type_key(list_type: sync_types::ListType) -> String {
    serde_json::to_value(list_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

/// The reconciliation core (§4.7): initial full sync, event-driven upload
/// path, timed download path, conflict resolver, upload batcher,
/// pending-op worker, housekeeping, and health reporter, all as
/// independent cooperative loops fanned out from `start` (§9 "Async/
/// coroutine control flow").
pub struct SyncEngine {
    pub config: Arc<EngineConfig>,
    pub store: Arc<StoreGateway>,
    pub bus: Bus,
    pub governor: Arc<RateGovernor>,
    pub crosswalk: Arc<Crosswalk>,
    pub planner: Arc<dyn PlannerApi>,
    pub capacity: CapacityGuard,

    /// Local ids queued for upload. A `HashSet` instead of a list because
    /// the upload batcher re-reads the canonical record at drain time —
    /// queuing the same id twice just collapses to one drain (§5: "a
    /// later update to the same local_id supersedes earlier ones in the
    /// same batch by keying the batch as a map").
    batch: Mutex<HashSet<String>>,
    batch_processing: Arc<AtomicBool>,
    batch_scheduled: Arc<AtomicBool>,

    last_upload_at: RwLock<Option<DateTime<Utc>>>,
    last_download_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    writes_halted: Arc<AtomicBool>,

    /// Per-plan gate for quick-poll suppression (§4.7.3): next time a
    /// webhook-driven quick re-poll for that plan is allowed to run.
    quick_poll_gate: RwLock<std::collections::HashMap<String, DateTime<Utc>>>,
}

impl SyncEngine {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<StoreGateway>,
        bus: Bus,
        governor: Arc<RateGovernor>,
        crosswalk: Arc<Crosswalk>,
        planner: Arc<dyn PlannerApi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            capacity: CapacityGuard::new(store.clone(), config.max_tasks_per_plan),
            config,
            store,
            bus,
            governor,
            crosswalk,
            planner,
            batch: Mutex::new(HashSet::new()),
            batch_processing: Arc::new(AtomicBool::new(false)),
            batch_scheduled: Arc::new(AtomicBool::new(false)),
            last_upload_at: RwLock::new(None),
            last_download_at: RwLock::new(None),
            last_error: RwLock::new(None),
            writes_halted: Arc::new(AtomicBool::new(false)),
            quick_poll_gate: RwLock::new(std::collections::HashMap::new()),
        })
    }

    /// Fans every cooperating loop out onto its own task and returns the
    /// `JoinSet` plus the `CancellationToken` that stops them (§9:
    /// `Start()` fans loops out and waits, `Stop()` cancels in reverse
    /// order — here, dropping/cancelling the token and awaiting drains in
    /// the order the caller chooses).
    pub fn start(self: &Arc<Self>) -> (JoinSet<()>, CancellationToken) {
        let cancel = CancellationToken::new();
        let mut set = JoinSet::new();

        set.spawn(initial_sync::run_once(self.clone()));
        set.spawn(upload::run_event_loop(self.clone(), cancel.clone()));
        set.spawn(download::run_timed_loop(self.clone(), cancel.clone()));
        set.spawn(download::run_webhook_loop(self.clone(), cancel.clone()));
        set.spawn(pending_ops::run(self.clone(), cancel.clone()));
        set.spawn(housekeeping::run(self.clone(), cancel.clone()));
        set.spawn(health::run(self.clone(), cancel.clone()));
        set.spawn(capacity::run_refresh_loop(self.clone(), cancel.clone()));

        (set, cancel)
    }

    /// Graceful shutdown (§5): stop accepting new webhook work is the
    /// caller's responsibility (it owns the HTTP listener); here we drain
    /// the upload batch with a bounded deadline and write a final
    /// `status=stopped` health snapshot.
    pub async fn stop(self: &Arc<Self>, cancel: CancellationToken, mut tasks: JoinSet<()>) {
        cancel.cancel();
        let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
        tokio::pin!(drain_deadline);
        loop {
            tokio::select! {
                _ = &mut drain_deadline => {
                    tracing::warn!("shutdown: upload batch drain deadline reached, stopping anyway");
                    break;
                }
                joined = tasks.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }
        tasks.abort_all();
        health::write_stopped_snapshot(self).await;
    }

    pub async fn read_task(&self, local_id: &str) -> Option<CanonicalTask> {
        let value = self.store.get(&task_key(local_id)).await?;
        serde_json::from_value(value).ok()
    }

    pub async fn write_task(&self, task: &CanonicalTask) -> anyhow::Result<()> {
        self.store.set(&task_key(&task.id), json!(task), None).await?;
        self.mirror_into_aggregate(task).await?;
        Ok(())
    }

    pub async fn delete_task_record(&self, local_id: &str) -> anyhow::Result<()> {
        self.store.delete(&task_key(local_id)).await?;
        self.remove_from_aggregate(local_id).await?;
        Ok(())
    }

    /// Keeps the best-effort aggregate mirror (§3.1) in step with the
    /// authoritative per-task key. The aggregate may be absent entirely;
    /// a failure mirroring into it is logged, never fatal.
    async fn mirror_into_aggregate(&self, task: &CanonicalTask) -> anyhow::Result<()> {
        let mut aggregate = self
            .store
            .get(AGGREGATE_KEY)
            .await
            .unwrap_or_else(|| json!({}));
        let list_key = list_type_key(task.list_type);
        let bucket = aggregate
            .as_object_mut()
            .map(|obj| obj.entry(list_key).or_insert_with(|| json!({})))
            .and_then(Value::as_object_mut);
        if let Some(bucket) = bucket {
            bucket.insert(task.id.clone(), json!(task));
        }
        self.store.set(AGGREGATE_KEY, aggregate, None).await
    }

    async fn remove_from_aggregate(&self, local_id: &str) -> anyhow::Result<()> {
        let Some(mut aggregate) = self.store.get(AGGREGATE_KEY).await else {
            return Ok(());
        };
        if let Some(obj) = aggregate.as_object_mut() {
            for (_, bucket) in obj.iter_mut() {
                if let Some(bucket) = bucket.as_object_mut() {
                    bucket.remove(local_id);
                }
            }
        }
        self.store.set(AGGREGATE_KEY, aggregate, None).await
    }

    pub async fn read_baseline(&self, local_id: &str) -> Option<CanonicalTask> {
        let value = self.store.get(&baseline_key(local_id)).await?;
        serde_json::from_value(value).ok()
    }

    pub async fn write_baseline(&self, task: &CanonicalTask) -> anyhow::Result<()> {
        self.store.set(&baseline_key(&task.id), json!(task), None).await
    }

    pub async fn publish_task_update(&self, local_id: &str) {
        self.bus
            .publish(channels::TASKS_UPDATES, json!({ "local_id": local_id }))
            .await;
    }

    pub async fn enqueue_upload(self: &Arc<Self>, local_id: &str) {
        {
            let mut batch = self.batch.lock().await;
            batch.insert(local_id.to_string());
            if batch.len() >= self.config.upload_batch_size {
                drop(batch);
                upload::spawn_immediate_drain(self.clone());
                return;
            }
        }
        upload::schedule_linger_drain(self.clone());
    }

    async fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write().await = Some(message.into());
    }

    async fn record_upload_success(&self) {
        *self.last_upload_at.write().await = Some(Utc::now());
    }

    async fn record_download_success(&self) {
        *self.last_download_at.write().await = Some(Utc::now());
    }

    fn halt_writes(&self) {
        self.writes_halted.store(true, Ordering::Release);
    }

    fn writes_are_halted(&self) -> bool {
        self.writes_halted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use serde_json::Value;
    use sync_types::{ListType, Priority, TaskStatus};
    use sync_wire::{
        BucketSummary, PlanSummary, PlannerCreateBody, PlannerDetailsBody, PlannerTask,
        PlannerTaskDetails,
    };
    use uuid::Uuid;

    use crate::planner_api::{IfMatch, PlannerApi, Versioned};
    use crate::PlannerError;

    struct NoopPlanner;

    #[async_trait]
    impl PlannerApi for NoopPlanner {
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
            Err(PlannerError::NotFound)
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

    async fn test_engine() -> Arc<SyncEngine> {
        let path = std::env::temp_dir().join(format!("sync-core-engine-{}.json", Uuid::new_v4()));
        let store = Arc::new(StoreGateway::new(path).await.expect("store"));
        let config = Arc::new(EngineConfig {
            tenant_id: "t".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
            agent_username: "u".into(),
            agent_password: "p".into(),
            agent_user_id: None,
            default_plan_id: None,
            user_name_map: HashMap::new(),
            planner_poll_interval: std::time::Duration::from_secs(3600),
            min_quick_poll_interval: std::time::Duration::from_secs(300),
            upload_batch_size: 20,
            upload_batch_linger: std::time::Duration::from_millis(100),
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
            Arc::new(NoopPlanner),
        )
    }

    fn sample_task(id: &str, list_type: ListType) -> CanonicalTask {
        CanonicalTask {
            id: id.to_string(),
            external_id: None,
            list_type,
            title: "t".to_string(),
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

    #[tokio::test]
    async fn aggregate_mirror_groups_by_the_wire_level_snake_case_list_type() {
        let engine = test_engine().await;
        let task = sample_task("T1", ListType::ResearchTasks);
        engine.write_task(&task).await.unwrap();

        let aggregate = engine.store.get(AGGREGATE_KEY).await.expect("aggregate written");
        let bucket = aggregate
            .get("research_tasks")
            .and_then(|b| b.get("T1"))
            .expect("task nested under snake_case list_type bucket");
        assert_eq!(bucket["id"], "T1");
    }

    #[tokio::test]
    async fn delete_task_record_removes_the_task_from_every_aggregate_bucket() {
        let engine = test_engine().await;
        let task = sample_task("T1", ListType::UserTasks);
        engine.write_task(&task).await.unwrap();

        engine.delete_task_record("T1").await.unwrap();

        let aggregate = engine.store.get(AGGREGATE_KEY).await.expect("aggregate written");
        assert!(aggregate["user_tasks"].get("T1").is_none());
    }
}
