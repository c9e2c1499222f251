use serde::{Deserialize, Serialize};

/// The error-kind taxonomy from §7. Every component that talks to the
/// planner classifies its failures into one of these so the pending-op
/// worker and health reporter can apply a uniform policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    Throttled,
    PreconditionFailed,
    NotFound,
    Forbidden,
    CapacityExhausted,
    BadRequest,
    Transient,
    ConsentRequired,
    BadCredentials,
    ValidationFailed,
}

impl SyncErrorKind {
    /// Stable lowercase tag for structured log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::Throttled => "throttled",
            SyncErrorKind::PreconditionFailed => "precondition_failed",
            SyncErrorKind::NotFound => "not_found",
            SyncErrorKind::Forbidden => "forbidden",
            SyncErrorKind::CapacityExhausted => "capacity_exhausted",
            SyncErrorKind::BadRequest => "bad_request",
            SyncErrorKind::Transient => "transient",
            SyncErrorKind::ConsentRequired => "consent_required",
            SyncErrorKind::BadCredentials => "bad_credentials",
            SyncErrorKind::ValidationFailed => "validation_failed",
        }
    }

    /// §7: only these two halt writes and surface to `sync:health`; every
    /// other kind is handled locally by retry/backoff/dead-letter policy.
    pub fn is_process_visible(&self) -> bool {
        matches!(
            self,
            SyncErrorKind::ConsentRequired | SyncErrorKind::BadCredentials
        )
    }

    /// Kinds that are terminal for the op on first occurrence — never
    /// retried, moved straight to `sync:failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncErrorKind::CapacityExhausted
                | SyncErrorKind::BadRequest
                | SyncErrorKind::ConsentRequired
                | SyncErrorKind::BadCredentials
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_visible_kinds_are_also_terminal() {
        assert!(SyncErrorKind::ConsentRequired.is_process_visible());
        assert!(SyncErrorKind::ConsentRequired.is_terminal());
        assert!(!SyncErrorKind::Throttled.is_process_visible());
        assert!(!SyncErrorKind::Throttled.is_terminal());
    }

    #[test]
    fn as_str_is_the_serde_snake_case_tag() {
        let value = serde_json::to_value(SyncErrorKind::CapacityExhausted).unwrap();
        assert_eq!(value.as_str(), Some(SyncErrorKind::CapacityExhausted.as_str()));
    }
}
