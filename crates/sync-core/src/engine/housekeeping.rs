use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::SyncEngine;

const TICK_INTERVAL: StdDuration = StdDuration::from_secs(30 * 60);
const FAILED_LIST_MAX: usize = 1000;

/// Periodic cleanup (§4.7.6): gated behind `housekeeping_dry_run` so a new
/// deployment can observe what it *would* do before it starts mutating the
/// store. Every pass, dry-run or not, refreshes `cleanup:stats`.
pub async fn run(engine: Arc<SyncEngine>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => run_once(&engine).await,
        }
    }
}

async fn run_once(engine: &Arc<SyncEngine>) {
    let dry_run = engine.config.housekeeping_dry_run;
    let mut log_lines = Vec::new();

    let expired = engine.store.sweep_expired().await.unwrap_or(0);
    log_lines.push(format!("swept {expired} expired keys"));

    let normalized = if dry_run {
        0
    } else {
        engine.crosswalk.normalize_legacy_serializations().await.unwrap_or(0)
    };
    log_lines.push(format!(
        "{} {normalized} legacy crosswalk serializations",
        if dry_run { "would normalize" } else { "normalized" }
    ));

    let orphaned_etags = if dry_run {
        0
    } else {
        engine.crosswalk.gc_orphaned_forward_entries().await.unwrap_or(0)
    };
    log_lines.push(format!(
        "{} {orphaned_etags} orphaned crosswalk entries and their ETags",
        if dry_run { "would collect" } else { "collected" }
    ));

    let trimmed = if dry_run {
        0
    } else {
        engine
            .store
            .trim_list_front("sync:failed", FAILED_LIST_MAX)
            .await
            .unwrap_or(0)
    };
    log_lines.push(format!(
        "{} {trimmed} overflow entries from sync:failed",
        if dry_run { "would trim" } else { "trimmed" }
    ));

    tracing::info!(dry_run, entries = ?log_lines, "housekeeping pass complete");

    let _ = engine
        .store
        .set(
            "cleanup:log",
            json!({ "ran_at": Utc::now(), "dry_run": dry_run, "entries": log_lines }),
            None,
        )
        .await;
    let _ = engine
        .store
        .set(
            "cleanup:stats",
            json!({
                "expired_keys_swept": expired,
                "crosswalk_entries_normalized": normalized,
                "orphaned_crosswalk_entries_collected": orphaned_etags,
                "failed_list_trimmed": trimmed,
            }),
            None,
        )
        .await;
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use serde_json::Value;
    use uuid::Uuid;

    use sync_wire::{
        BucketSummary, PlanSummary, PlannerCreateBody, PlannerDetailsBody, PlannerTask,
        PlannerTaskDetails,
    };

    use crate::planner_api::{IfMatch, PlannerApi, Versioned};
    use crate::{Bus, Crosswalk, EngineConfig, PlannerError, RateGovernor, StoreGateway};

    use super::*;

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

    async fn test_engine(dry_run: bool) -> Arc<SyncEngine> {
        let path = std::env::temp_dir().join(format!("sync-core-housekeeping-{}.json", Uuid::new_v4()));
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
            planner_poll_interval: StdDuration::from_secs(3600),
            min_quick_poll_interval: StdDuration::from_secs(300),
            upload_batch_size: 20,
            upload_batch_linger: StdDuration::from_millis(100),
            max_tasks_per_plan: 200,
            housekeeping_dry_run: dry_run,
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

    #[tokio::test]
    async fn dry_run_reports_counts_but_does_not_mutate_the_store() {
        let engine = test_engine(true).await;
        engine.crosswalk.link("L1", "E1", "W/\"v1\"").await.unwrap();
        engine.store.delete("sync:id_map:ext:E1").await.unwrap();
        engine
            .store
            .set("sync:id_map:local:L2", json!(["E2"]), None)
            .await
            .unwrap();

        run_once(&engine).await;

        // Dry run must not have touched the orphaned entry or the legacy
        // array serialization it would otherwise have rewritten.
        assert_eq!(engine.crosswalk.etag("E1").await, Some("W/\"v1\"".to_string()));
        assert_eq!(engine.store.get("sync:id_map:local:L2").await, Some(json!(["E2"])));

        let stats = engine.store.get("cleanup:stats").await.expect("stats written");
        assert_eq!(stats["crosswalk_entries_normalized"], 0);
        assert_eq!(stats["orphaned_crosswalk_entries_collected"], 0);
        assert!(engine.store.get("cleanup:log").await.is_some());
    }

    #[tokio::test]
    async fn live_run_collects_orphaned_crosswalk_entries_and_normalizes_legacy_ones() {
        let engine = test_engine(false).await;
        engine.crosswalk.link("L1", "E1", "W/\"v1\"").await.unwrap();
        engine.store.delete("sync:id_map:ext:E1").await.unwrap();
        engine
            .store
            .set("sync:id_map:local:L2", json!(["E2"]), None)
            .await
            .unwrap();

        run_once(&engine).await;

        assert_eq!(engine.crosswalk.etag("E1").await, None);
        assert_eq!(engine.store.get("sync:id_map:local:L2").await, Some(json!("E2")));

        let stats = engine.store.get("cleanup:stats").await.expect("stats written");
        assert_eq!(stats["crosswalk_entries_normalized"], 1);
        assert_eq!(stats["orphaned_crosswalk_entries_collected"], 1);
    }
}
