use thiserror::Error;

use sync_types::SyncErrorKind;

/// Typed planner-facing error, matching the kind table in §7. Every
/// component that issues planner HTTP calls returns this so the pending-op
/// worker and health reporter can apply one uniform policy regardless of
/// which crate raised it.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("throttled, retry_after={retry_after_secs:?}")]
    Throttled { retry_after_secs: Option<u64> },

    #[error("precondition failed (stale etag)")]
    PreconditionFailed,

    #[error("resource not found")]
    NotFound,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("consent required")]
    ConsentRequired,

    #[error("bad credentials")]
    BadCredentials,
}

impl PlannerError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            PlannerError::Throttled { .. } => SyncErrorKind::Throttled,
            PlannerError::PreconditionFailed => SyncErrorKind::PreconditionFailed,
            PlannerError::NotFound => SyncErrorKind::NotFound,
            PlannerError::Forbidden(_) => SyncErrorKind::Forbidden,
            PlannerError::CapacityExhausted(_) => SyncErrorKind::CapacityExhausted,
            PlannerError::BadRequest(_) => SyncErrorKind::BadRequest,
            PlannerError::Transient(_) => SyncErrorKind::Transient,
            PlannerError::ConsentRequired => SyncErrorKind::ConsentRequired,
            PlannerError::BadCredentials => SyncErrorKind::BadCredentials,
        }
    }

    /// §7: a 403 whose body names `MaximumActiveTasksInProject` is terminal
    /// capacity exhaustion, not a generic `Forbidden`.
    pub fn from_forbidden_body(body: &str) -> PlannerError {
        if body.contains("MaximumActiveTasksInProject") {
            PlannerError::CapacityExhausted(body.to_string())
        } else {
            PlannerError::Forbidden(body.to_string())
        }
    }
}

/// Failure kinds the Token Cache surfaces (§4.1). `Throttled`/`Transient`
/// are retried with backoff by the caller; the other two are fatal to
/// writes and propagate straight to `sync:health`.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("consent required")]
    ConsentRequired,
    #[error("bad credentials")]
    BadCredentials,
    #[error("throttled")]
    Throttled,
    #[error("transient token endpoint failure: {0}")]
    Transient(String),
}
