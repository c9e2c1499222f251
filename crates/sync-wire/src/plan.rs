use serde::{Deserialize, Serialize};

/// A plan the service account can see, as returned by plan discovery
/// (§4.7.1 initial sync, §3.3 `graph:plans:index` cache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub id: String,
    pub title: String,
}

/// A bucket within a plan (§3.3 `graph:buckets:{plan_id}` cache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "planId")]
    pub plan_id: String,
}
