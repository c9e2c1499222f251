use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// `list_type` values the engine is willing to sync. Anything else is left
/// alone by the upload path (see `4.7.1`/`4.7.2` of the sync contract).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ListType {
    UserTasks,
    ResearchTasks,
    SystemTwoTasks,
}

impl ListType {
    pub fn is_sync_eligible(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Planner's integer encoding: 1=urgent, 3=high, 5=normal, 9=low.
    pub fn to_planner_int(self) -> i32 {
        match self {
            Priority::Urgent => 1,
            Priority::High => 3,
            Priority::Normal => 5,
            Priority::Low => 9,
        }
    }

    pub fn from_planner_int(value: i32) -> Priority {
        match value {
            0..=2 => Priority::Urgent,
            3..=4 => Priority::High,
            5..=8 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecklistItem {
    pub text: String,
    pub checked: bool,
}

/// The canonical, local-authoritative task record (§3.1). This is what
/// every component other than the adapter and the planner client operates
/// on; loosely-typed JSON is confined to the wire boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalTask {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub list_type: ListType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub status: TaskStatus,
    pub percent_complete: f64,
    pub priority: Priority,
    #[serde(default)]
    pub assigned_to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub checklist_items: Vec<ChecklistItem>,
}

impl CanonicalTask {
    /// Matches the `Task-<conv>-<parent>-<child>` checklist-subitem id
    /// pattern (§4.7.8). These never get uploaded as standalone planner
    /// tasks; the adapter folds them into the parent's checklist instead.
    pub fn is_checklist_subitem(&self) -> bool {
        subitem_parts(&self.id).is_some()
    }

    pub fn subitem_parent_id(&self) -> Option<String> {
        subitem_parts(&self.id).map(|(conv, parent, _child)| format!("Task-{conv}-{parent}"))
    }
}

fn subitem_parts(id: &str) -> Option<(String, String, String)> {
    let rest = id.strip_prefix("Task-")?;
    let mut parts = rest.splitn(3, '-');
    let conv = parts.next()?.to_string();
    let parent = parts.next()?.to_string();
    let child = parts.next()?.to_string();
    if conv.is_empty() || parent.is_empty() || child.is_empty() {
        return None;
    }
    Some((conv, parent, child))
}
