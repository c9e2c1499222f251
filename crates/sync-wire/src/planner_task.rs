use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The remote (planner) task shape, §3.2. Fields the planner sends that
/// we don't model explicitly are preserved in `extra` so round-trips
/// through `FromPlanner`/`ToPlanner` never silently drop data (§9 "Dynamic
/// shape at the boundary").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerTask {
    pub id: String,
    #[serde(rename = "planId")]
    pub plan_id: String,
    #[serde(rename = "bucketId")]
    pub bucket_id: String,
    pub title: String,
    #[serde(rename = "percentComplete")]
    pub percent_complete: i32,
    pub priority: i32,
    #[serde(default)]
    pub assignments: HashMap<String, PlannerAssignment>,
    #[serde(rename = "dueDateTime", default, skip_serializing_if = "Option::is_none")]
    pub due_date_time: Option<String>,
    #[serde(rename = "createdDateTime")]
    pub created_date_time: DateTime<Utc>,
    #[serde(
        rename = "completedDateTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_date_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "lastModifiedDateTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "conversationThreadId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_thread_id: Option<String>,
    #[serde(rename = "@odata.etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Unknown fields the planner sent, preserved verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerAssignment {
    #[serde(rename = "@odata.type")]
    pub odata_type: String,
    #[serde(rename = "orderHint")]
    pub order_hint: String,
}

impl PlannerAssignment {
    pub fn new(order_hint: impl Into<String>) -> Self {
        Self {
            odata_type: "#microsoft.graph.plannerAssignment".to_string(),
            order_hint: order_hint.into(),
        }
    }
}

/// The sibling "task details" resource (§3.2): notes, checklist, and its
/// own ETag, fetched and written independently of the task body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlannerTaskDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub checklist: HashMap<String, PlannerChecklistItem>,
    #[serde(rename = "@odata.etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerChecklistItem {
    pub title: String,
    #[serde(rename = "isChecked")]
    pub is_checked: bool,
    #[serde(rename = "orderHint", default, skip_serializing_if = "Option::is_none")]
    pub order_hint: Option<String>,
}

/// Body sent for a create; the details body is submitted as a separate
/// PATCH against the task-details resource (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerCreateBody {
    #[serde(rename = "planId")]
    pub plan_id: String,
    #[serde(rename = "bucketId")]
    pub bucket_id: String,
    pub title: String,
    #[serde(rename = "percentComplete")]
    pub percent_complete: i32,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub assignments: HashMap<String, PlannerAssignment>,
    #[serde(rename = "dueDateTime", default, skip_serializing_if = "Option::is_none")]
    pub due_date_time: Option<String>,
    #[serde(
        rename = "conversationThreadId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlannerDetailsBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub checklist: HashMap<String, PlannerChecklistItem>,
}
