use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The single JSON document written to `sync:health` (§7), also served by
/// the HTTP surface's `/health` endpoint. Shared between `sync-core`'s
/// health reporter loop and `sync-server` so both sides agree on shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upload_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_download_at: Option<DateTime<Utc>>,
    pub pending_depth: u64,
    pub failed_depth: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Throttled,
    Degraded,
    Stopped,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            status: HealthStatus::Starting,
            last_upload_at: None,
            last_download_at: None,
            pending_depth: 0,
            failed_depth: 0,
            backoff_until: None,
            last_error: None,
        }
    }
}

/// A single entry in the bounded `sync:failed` dead-letter list (§3.3, §8
/// invariant 4: `|sync:failed| <= 1000`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub op_id: String,
    pub kind: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
    pub failed_at: DateTime<Utc>,
}
