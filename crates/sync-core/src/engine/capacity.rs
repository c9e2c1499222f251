use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::planner_api::PlannerApi;
use crate::store::StoreGateway;

use super::SyncEngine;

const COUNT_TTL: Duration = Duration::from_secs(300);
const INACCESSIBLE_TTL: Duration = Duration::from_secs(600);

fn count_key(plan_id: &str) -> String {
    format!("graph:plan_task_count:{plan_id}")
}

/// Before-create admission control (§4.7.7): refuses further creates into
/// a plan once its cached task count reaches `max_tasks_per_plan`, and
/// memoizes plans a generic 403 marked inaccessible for 10 minutes.
pub struct CapacityGuard {
    store: Arc<StoreGateway>,
    max_tasks_per_plan: u32,
}

impl CapacityGuard {
    pub fn new(store: Arc<StoreGateway>, max_tasks_per_plan: u32) -> Self {
        Self {
            store,
            max_tasks_per_plan,
        }
    }

    /// Returns `true` if a create into `plan_id` should be refused without
    /// ever issuing the HTTP call.
    pub async fn is_blocked(&self, plan_id: &str) -> bool {
        match self.store.get(&count_key(plan_id)).await {
            Some(value) => value.as_u64().unwrap_or(0) >= self.max_tasks_per_plan as u64,
            None => false,
        }
    }

    /// Refreshes the cached count from the planner if the cache has
    /// expired or was never populated (§4.7.7: "refreshed every 5
    /// minutes").
    pub async fn refresh(
        &self,
        plan_id: &str,
        planner: &Arc<dyn PlannerApi>,
    ) -> anyhow::Result<u32> {
        if let Some(value) = self.store.get(&count_key(plan_id)).await {
            if let Some(count) = value.as_u64() {
                return Ok(count as u32);
            }
        }
        let tasks = planner
            .list_plan_tasks(plan_id)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let count = tasks.len() as u32;
        self.store
            .set(&count_key(plan_id), json!(count), Some(COUNT_TTL))
            .await?;
        Ok(count)
    }

    /// §4.7.7: a 403 `MaximumActiveTasksInProject` forces the cached count
    /// to `MAX` immediately, without waiting for the next refresh.
    pub async fn mark_exhausted(&self, plan_id: &str) -> anyhow::Result<()> {
        self.store
            .set(
                &count_key(plan_id),
                json!(self.max_tasks_per_plan),
                Some(COUNT_TTL),
            )
            .await
    }

    pub async fn is_inaccessible(&self, plan_id: &str) -> bool {
        self.store
            .set_contains("planner:inaccessible_plans", plan_id)
            .await
    }

    pub async fn mark_inaccessible(&self, plan_id: &str) -> anyhow::Result<()> {
        self.store
            .set_add("planner:inaccessible_plans", plan_id, Some(INACCESSIBLE_TTL))
            .await
    }
}

/// Proactive refresh tick (§4.7.7): re-derives every accessible plan's
/// cached task count on the same `COUNT_TTL` cadence the store entry
/// itself expires on, so the guard can refuse an over-capacity create
/// before the first real 403 ever happens rather than only reacting to one
/// via `mark_exhausted`.
pub async fn run_refresh_loop(engine: Arc<SyncEngine>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(COUNT_TTL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => refresh_all(&engine).await,
        }
    }
}

async fn refresh_all(engine: &Arc<SyncEngine>) {
    let plans = match engine.planner.list_accessible_plans().await {
        Ok(plans) => plans,
        Err(err) => {
            tracing::warn!(error = %err, "capacity refresh: failed to list accessible plans");
            return;
        }
    };
    for plan in plans {
        if engine.capacity.is_inaccessible(&plan.id).await {
            continue;
        }
        if let Err(err) = engine.capacity.refresh(&plan.id, &engine.planner).await {
            tracing::warn!(plan_id = %plan.id, error = %err, "capacity refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn temp_store() -> Arc<StoreGateway> {
        let path = std::env::temp_dir().join(format!("sync-core-capacity-{}.json", Uuid::new_v4()));
        Arc::new(StoreGateway::new(path).await.expect("store"))
    }

    #[tokio::test]
    async fn blocked_once_cached_count_reaches_max() {
        let store = temp_store().await;
        let guard = CapacityGuard::new(store.clone(), 200);
        store
            .set("graph:plan_task_count:P1", json!(200), None)
            .await
            .unwrap();
        assert!(guard.is_blocked("P1").await);
    }

    #[tokio::test]
    async fn mark_exhausted_forces_block_without_an_http_call() {
        let store = temp_store().await;
        let guard = CapacityGuard::new(store, 200);
        guard.mark_exhausted("P1").await.unwrap();
        assert!(guard.is_blocked("P1").await);
    }

    #[tokio::test]
    async fn inaccessible_plans_are_memoized() {
        let store = temp_store().await;
        let guard = CapacityGuard::new(store, 200);
        assert!(!guard.is_inaccessible("P2").await);
        guard.mark_inaccessible("P2").await.unwrap();
        assert!(guard.is_inaccessible("P2").await);
    }

    #[tokio::test]
    async fn refresh_populates_the_cached_count_from_the_planner() {
        use async_trait::async_trait;
        use std::collections::HashMap;
        use sync_wire::{BucketSummary, PlanSummary, PlannerCreateBody, PlannerDetailsBody, PlannerTask, PlannerTaskDetails};

        use crate::planner_api::{IfMatch, PlannerApi, Versioned};
        use crate::PlannerError;

        struct FakePlanner;

        #[async_trait]
        impl PlannerApi for FakePlanner {
            async fn list_accessible_plans(&self) -> Result<Vec<PlanSummary>, PlannerError> {
                Ok(vec![PlanSummary { id: "P1".into(), title: "Plan".into() }])
            }
            async fn list_plan_buckets(&self, _: &str) -> Result<Vec<BucketSummary>, PlannerError> {
                Ok(vec![])
            }
            async fn list_plan_tasks(&self, _: &str) -> Result<Vec<PlannerTask>, PlannerError> {
                Ok(vec![
                    PlannerTask {
                        id: "T1".into(),
                        plan_id: "P1".into(),
                        bucket_id: "B1".into(),
                        title: "t".into(),
                        percent_complete: 0,
                        priority: 5,
                        assignments: HashMap::new(),
                        due_date_time: None,
                        created_date_time: chrono::Utc::now(),
                        completed_date_time: None,
                        last_modified_date_time: None,
                        conversation_thread_id: None,
                        etag: None,
                        extra: HashMap::new(),
                    },
                ])
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
            async fn update_task(&self, _: &str, _: &serde_json::Value, _: &IfMatch) -> Result<String, PlannerError> {
                Err(PlannerError::NotFound)
            }
            async fn update_task_details(&self, _: &str, _: &PlannerDetailsBody, _: &IfMatch) -> Result<String, PlannerError> {
                Err(PlannerError::NotFound)
            }
            async fn delete_task(&self, _: &str, _: &IfMatch) -> Result<(), PlannerError> {
                Ok(())
            }
        }

        let store = temp_store().await;
        let guard = CapacityGuard::new(store, 200);
        let planner: Arc<dyn PlannerApi> = Arc::new(FakePlanner);
        let count = guard.refresh("P1", &planner).await.unwrap();
        assert_eq!(count, 1);
        assert!(!guard.is_blocked("P1").await);
    }
}
