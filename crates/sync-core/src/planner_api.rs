use async_trait::async_trait;

use sync_wire::{BucketSummary, PlanSummary, PlannerCreateBody, PlannerDetailsBody, PlannerTask, PlannerTaskDetails};

use crate::errors::PlannerError;

/// ETag precondition for a write. `Any` is the delete path's last resort
/// after two failed `If-Match` attempts (§4.7.9).
#[derive(Debug, Clone)]
pub enum IfMatch {
    Etag(String),
    Any,
}

/// A planner task together with the ETag the server returned alongside it,
/// since every write needs the ETag but the adapter only wants the task.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub etag: String,
}

/// The outbound planner REST surface the Sync Engine drives (§4.7, §6).
/// Kept as a trait so the engine's loops are testable against an in-memory
/// fake without a network; `sync-planner` is the production implementation
/// backed by `reqwest` and the `TokenCache`.
#[async_trait]
pub trait PlannerApi: Send + Sync {
    async fn list_accessible_plans(&self) -> Result<Vec<PlanSummary>, PlannerError>;

    async fn list_plan_buckets(&self, plan_id: &str) -> Result<Vec<BucketSummary>, PlannerError>;

    /// Lists tasks in a plan with a server-side `$select` to the fields
    /// the adapter needs (§4.7.1).
    async fn list_plan_tasks(&self, plan_id: &str) -> Result<Vec<PlannerTask>, PlannerError>;

    async fn get_task(&self, external_id: &str) -> Result<Versioned<PlannerTask>, PlannerError>;

    async fn get_task_details(
        &self,
        external_id: &str,
    ) -> Result<Versioned<PlannerTaskDetails>, PlannerError>;

    async fn create_task(
        &self,
        body: &PlannerCreateBody,
    ) -> Result<Versioned<PlannerTask>, PlannerError>;

    async fn update_task(
        &self,
        external_id: &str,
        patch: &serde_json::Value,
        if_match: &IfMatch,
    ) -> Result<String, PlannerError>;

    async fn update_task_details(
        &self,
        external_id: &str,
        body: &PlannerDetailsBody,
        if_match: &IfMatch,
    ) -> Result<String, PlannerError>;

    async fn delete_task(&self, external_id: &str, if_match: &IfMatch) -> Result<(), PlannerError>;
}
