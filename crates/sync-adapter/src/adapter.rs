use std::collections::HashMap;

use chrono::Utc;
use sync_types::{CanonicalTask, ChecklistItem, Priority, TaskStatus};
use sync_wire::{
    PlannerAssignment, PlannerChecklistItem, PlannerCreateBody, PlannerDetailsBody,
    PlannerTask, PlannerTaskDetails,
};

/// Line that separates the agent-authored `description` from the
/// appended `output` inside planner notes (§4.4). Re-splitting on this
/// marker every `from_planner` call is the current, deliberately loose,
/// behavior — see the open question about a stricter marker.
pub const OUTPUT_DELIMITER: &str = "\n---\n";

/// `orderHint` the adapter assigns to every assignment it creates.
/// Planner only cares that hints sort consistently within a task; a
/// constant value is fine since the engine never reorders assignees.
const ASSIGNMENT_ORDER_HINT: &str = " !";

/// `ToPlanner`: translate a canonical task into the two bodies the
/// planner client PATCHes/POSTs (§4.4). Pure — no I/O, no clock reads
/// beyond what's already on `local`.
pub fn to_planner(
    local: &CanonicalTask,
    plan_id: &str,
    bucket_id: &str,
    user_name_to_id: &HashMap<String, String>,
) -> (PlannerCreateBody, PlannerDetailsBody) {
    let percent_complete = (local.percent_complete * 100.0).round() as i32;

    let mut assignments = HashMap::new();
    for name in &local.assigned_to {
        match user_name_to_id.get(name) {
            Some(user_id) => {
                assignments.insert(user_id.clone(), PlannerAssignment::new(ASSIGNMENT_ORDER_HINT));
            }
            None => {
                tracing::warn!(display_name = %name, "dropping unmapped assignee on upload");
            }
        }
    }

    let due_date_time = local
        .due_date
        .map(|date| format!("{}T00:00:00Z", date.format("%Y-%m-%d")));

    let notes = compose_notes(local.description.as_deref(), local.output.as_deref());

    let checklist = local
        .checklist_items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            (
                checklist_item_id(local.id.as_str(), index),
                PlannerChecklistItem {
                    title: item.text.clone(),
                    is_checked: item.checked,
                    order_hint: Some(ASSIGNMENT_ORDER_HINT.to_string()),
                },
            )
        })
        .collect();

    let create_body = PlannerCreateBody {
        plan_id: plan_id.to_string(),
        bucket_id: bucket_id.to_string(),
        title: local.title.clone(),
        percent_complete,
        priority: local.priority.to_planner_int(),
        assignments,
        due_date_time,
        conversation_thread_id: local.conversation_id.clone(),
    };
    let details_body = PlannerDetailsBody {
        description: notes,
        checklist,
    };
    (create_body, details_body)
}

/// `FromPlanner`: translate the remote shape back into a canonical task.
/// `existing` is the pre-existing local record, if any, consulted to
/// restore fields the planner cannot carry at all (`list_type`,
/// `conversation_id`) and display names that failed to map on the way
/// out (§4.4's round-trip law).
pub fn from_planner(
    remote: &PlannerTask,
    details: Option<&PlannerTaskDetails>,
    user_id_to_name: &HashMap<String, String>,
    existing: Option<&CanonicalTask>,
    local_id: &str,
) -> CanonicalTask {
    let percent_complete = remote.percent_complete as f64 / 100.0;
    let status = derive_status(remote.percent_complete);
    let completed_at = if status == TaskStatus::Completed {
        Some(remote.completed_date_time.unwrap_or_else(Utc::now))
    } else {
        None
    };

    let assigned_to = remote
        .assignments
        .keys()
        .map(|user_id| {
            user_id_to_name
                .get(user_id)
                .cloned()
                .unwrap_or_else(|| user_id.clone())
        })
        .collect();

    let (description, output) = details
        .and_then(|d| d.description.as_deref())
        .map(split_notes)
        .unwrap_or((None, None));

    let checklist_items = details
        .map(|d| {
            let mut entries: Vec<_> = d.checklist.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            entries
                .into_iter()
                .map(|(_, item)| ChecklistItem {
                    text: item.title.clone(),
                    checked: item.is_checked,
                })
                .collect()
        })
        .unwrap_or_default();

    let due_date = remote
        .due_date_time
        .as_deref()
        .and_then(|raw| raw.split('T').next())
        .and_then(|date| date.parse().ok());

    CanonicalTask {
        id: local_id.to_string(),
        external_id: Some(remote.id.clone()),
        list_type: existing
            .map(|task| task.list_type)
            .unwrap_or(sync_types::ListType::UserTasks),
        title: remote.title.clone(),
        description,
        output,
        status,
        percent_complete,
        priority: Priority::from_planner_int(remote.priority),
        assigned_to,
        due_date,
        created_at: existing
            .map(|task| task.created_at)
            .unwrap_or(remote.created_date_time),
        updated_at: remote
            .last_modified_date_time
            .unwrap_or(remote.created_date_time),
        completed_at,
        conversation_id: existing
            .and_then(|task| task.conversation_id.clone())
            .or_else(|| remote.conversation_thread_id.clone()),
        checklist_items,
    }
}

fn derive_status(percent_complete: i32) -> TaskStatus {
    match percent_complete {
        100 => TaskStatus::Completed,
        0 => TaskStatus::NotStarted,
        _ => TaskStatus::InProgress,
    }
}

fn compose_notes(description: Option<&str>, output: Option<&str>) -> Option<String> {
    match (description, output) {
        (None, None) => None,
        (Some(d), None) => Some(d.to_string()),
        (None, Some(o)) if !o.is_empty() => Some(format!("{OUTPUT_DELIMITER}{o}")),
        (None, Some(_)) => None,
        (Some(d), Some(o)) if !o.is_empty() => Some(format!("{d}{OUTPUT_DELIMITER}{o}")),
        (Some(d), Some(_)) => Some(d.to_string()),
    }
}

fn split_notes(notes: &str) -> (Option<String>, Option<String>) {
    match notes.split_once(OUTPUT_DELIMITER) {
        Some((description, output)) => {
            let description = if description.is_empty() {
                None
            } else {
                Some(description.to_string())
            };
            let output = if output.is_empty() {
                None
            } else {
                Some(output.to_string())
            };
            (description, output)
        }
        None if notes.is_empty() => (None, None),
        None => (Some(notes.to_string()), None),
    }
}

/// Deterministic planner checklist-item key. The planner requires one;
/// deriving it from the owning task id and position keeps re-uploads of
/// an unchanged checklist stable instead of minting new ids every time.
fn checklist_item_id(task_id: &str, index: usize) -> String {
    format!("{task_id}-chk-{index:04}")
}
