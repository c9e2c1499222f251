use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use sync_types::CanonicalTask;

/// Tolerance window within which near-simultaneous edits are declared a
/// tie and resolved in the remote's favor (§4.7.4, §9 open question:
/// the window is heuristic and may need telemetry-driven tuning).
pub const DEAD_BAND: Duration = Duration::seconds(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    Title,
    Description,
    Output,
    StatusAndProgress,
    Priority,
    AssignedTo,
    DueDate,
    Checklist,
}

const ALL_FIELDS: [Field; 8] = [
    Field::Title,
    Field::Description,
    Field::Output,
    Field::StatusAndProgress,
    Field::Priority,
    Field::AssignedTo,
    Field::DueDate,
    Field::Checklist,
];

fn changed_fields(baseline: &CanonicalTask, candidate: &CanonicalTask) -> HashSet<Field> {
    ALL_FIELDS
        .into_iter()
        .filter(|field| match field {
            Field::Title => baseline.title != candidate.title,
            Field::Description => baseline.description != candidate.description,
            Field::Output => baseline.output != candidate.output,
            Field::StatusAndProgress => {
                baseline.status != candidate.status
                    || baseline.percent_complete != candidate.percent_complete
            }
            Field::Priority => baseline.priority != candidate.priority,
            Field::AssignedTo => baseline.assigned_to != candidate.assigned_to,
            Field::DueDate => baseline.due_date != candidate.due_date,
            Field::Checklist => baseline.checklist_items != candidate.checklist_items,
        })
        .collect()
}

fn apply_field(target: &mut CanonicalTask, source: &CanonicalTask, field: Field) {
    match field {
        Field::Title => target.title = source.title.clone(),
        Field::Description => target.description = source.description.clone(),
        Field::Output => target.output = source.output.clone(),
        Field::StatusAndProgress => {
            target.status = source.status;
            target.percent_complete = source.percent_complete;
            target.completed_at = source.completed_at;
        }
        Field::Priority => target.priority = source.priority,
        Field::AssignedTo => target.assigned_to = source.assigned_to.clone(),
        Field::DueDate => target.due_date = source.due_date,
        Field::Checklist => target.checklist_items = source.checklist_items.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Winner {
    Local,
    Remote,
}

fn winner(local_updated_at: DateTime<Utc>, remote_last_modified: DateTime<Utc>) -> Winner {
    let delta = local_updated_at - remote_last_modified;
    if delta.abs() <= DEAD_BAND {
        Winner::Remote
    } else if delta > Duration::zero() {
        Winner::Local
    } else {
        Winner::Remote
    }
}

/// Resolve a task that has changed on both sides since `baseline`, the
/// last state both sides agreed on. Disjoint field changes merge
/// cleanly; overlapping fields fall to whichever side the timestamp
/// rule declares the winner (§4.7.4).
///
/// `remote_as_local` is the remote state already translated through
/// `from_planner`, so this function only ever compares `CanonicalTask`s.
pub fn resolve(
    baseline: &CanonicalTask,
    local: &CanonicalTask,
    remote_as_local: &CanonicalTask,
    remote_last_modified: DateTime<Utc>,
) -> CanonicalTask {
    let local_changed = changed_fields(baseline, local);
    let remote_changed = changed_fields(baseline, remote_as_local);

    if remote_changed.is_empty() {
        return local.clone();
    }
    if local_changed.is_empty() {
        return remote_as_local.clone();
    }

    let winner = winner(local.updated_at, remote_last_modified);
    let mut merged = baseline.clone();
    merged.id = local.id.clone();
    merged.external_id = local.external_id.clone().or_else(|| remote_as_local.external_id.clone());

    for field in ALL_FIELDS {
        let in_local = local_changed.contains(&field);
        let in_remote = remote_changed.contains(&field);
        match (in_local, in_remote) {
            (true, true) => {
                let source = if winner == Winner::Local { local } else { remote_as_local };
                apply_field(&mut merged, source, field);
            }
            (true, false) => apply_field(&mut merged, local, field),
            (false, true) => apply_field(&mut merged, remote_as_local, field),
            (false, false) => {}
        }
    }

    merged.updated_at = local.updated_at.max(remote_last_modified);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use sync_types::{ChecklistItem, ListType, Priority, TaskStatus};

    fn base() -> CanonicalTask {
        CanonicalTask {
            id: "T1".to_string(),
            external_id: Some("E1".to_string()),
            list_type: ListType::UserTasks,
            title: "original title".to_string(),
            description: None,
            output: None,
            status: TaskStatus::InProgress,
            percent_complete: 0.25,
            priority: Priority::Normal,
            assigned_to: Vec::new(),
            due_date: NaiveDate::from_ymd_opt(2025, 1, 1),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            conversation_id: None,
            checklist_items: vec![ChecklistItem {
                text: "step".to_string(),
                checked: false,
            }],
        }
    }

    #[test]
    fn disjoint_changes_merge_both_sides() {
        let baseline = base();
        let t0 = baseline.updated_at;

        let mut local = baseline.clone();
        local.title = "local title".to_string();
        local.updated_at = t0 + Duration::seconds(10);

        let mut remote = baseline.clone();
        remote.percent_complete = 0.75;
        remote.status = TaskStatus::InProgress;
        let remote_last_modified = t0 + Duration::seconds(13);
        remote.updated_at = remote_last_modified;

        let merged = resolve(&baseline, &local, &remote, remote_last_modified);
        assert_eq!(merged.title, "local title");
        assert_eq!(merged.percent_complete, 0.75);
    }

    #[test]
    fn overlapping_change_goes_to_the_newer_side() {
        let baseline = base();
        let t0 = baseline.updated_at;

        let mut local = baseline.clone();
        local.title = "local title".to_string();
        local.updated_at = t0 + Duration::seconds(10);

        let mut remote = baseline.clone();
        remote.title = "remote title".to_string();
        let remote_last_modified = t0 + Duration::seconds(20);

        let merged = resolve(&baseline, &local, &remote, remote_last_modified);
        assert_eq!(merged.title, "remote title");
    }

    #[test]
    fn near_simultaneous_overlap_falls_to_remote() {
        let baseline = base();
        let t0 = baseline.updated_at;

        let mut local = baseline.clone();
        local.title = "local title".to_string();
        local.updated_at = t0 + Duration::seconds(10);

        let mut remote = baseline.clone();
        remote.title = "remote title".to_string();
        let remote_last_modified = t0 + Duration::seconds(11);

        let merged = resolve(&baseline, &local, &remote, remote_last_modified);
        assert_eq!(merged.title, "remote title");
    }

    #[test]
    fn only_remote_changed_returns_remote_wholesale() {
        let baseline = base();
        let mut remote = baseline.clone();
        remote.percent_complete = 1.0;
        remote.status = TaskStatus::Completed;

        let merged = resolve(&baseline, &baseline, &remote, Utc::now());
        assert_eq!(merged.percent_complete, 1.0);
    }
}
