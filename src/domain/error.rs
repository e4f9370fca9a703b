//! Error taxonomy for the operations core (`spec.md` §7).

use uuid::Uuid;

/// The nine-member error taxonomy consumed by the HTTP surface, the audit
/// log, and the task executor's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state: expected transition from current state to proceed, got {0}")]
    InvalidState(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OpsError {
    /// §7: `UpstreamUnavailable`/`RateLimited`/`Timeout` are retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable(_) | Self::RateLimited { .. } | Self::Timeout(_)
        )
    }

    /// §7: `BudgetExceeded`/`Denied` never retry at the task level.
    #[must_use]
    pub const fn is_policy_terminal(&self) -> bool {
        matches!(self, Self::BudgetExceeded(_) | Self::Denied(_))
    }

    /// HTTP status for the thin HTTP surface (`spec.md` §6).
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::NotFound { .. } => 404,
            Self::InvalidState(_) => 409,
            Self::UpstreamUnavailable(_) => 503,
            Self::BudgetExceeded(_) | Self::Denied(_) => 403,
            Self::RateLimited { .. } => 429,
            Self::Timeout(_) => 504,
            Self::Internal(_) => 500,
        }
    }

    /// Stable kind string used in audit payloads and HTTP error bodies.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidState(_) => "invalid_state",
            Self::NotFound { .. } => "not_found",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::Denied(_) => "denied",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }
}

/// Narrow error type behind the Store port; converted to `OpsError` at the
/// service boundary (`#[from] sqlx::Error` mirrors the teacher's
/// `DatabaseError` pattern).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

impl StoreError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Query(_))
    }
}

impl From<StoreError> for OpsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => OpsError::NotFound { entity, id },
            StoreError::ConstraintViolation(msg) => OpsError::InvalidState(msg),
            other => OpsError::Internal(other.to_string()),
        }
    }
}

pub type OpsResult<T> = Result<T, OpsError>;
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_matches_spec_taxonomy() {
        assert!(OpsError::Timeout(5).is_retryable());
        assert!(OpsError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(OpsError::UpstreamUnavailable("down".into()).is_retryable());
        assert!(!OpsError::Internal("boom".into()).is_retryable());
        assert!(!OpsError::InvalidInput("bad".into()).is_retryable());
    }

    #[test]
    fn policy_denied_never_retries() {
        assert!(OpsError::BudgetExceeded("over".into()).is_policy_terminal());
        assert!(OpsError::Denied("policy".into()).is_policy_terminal());
        assert!(!OpsError::Timeout(1).is_policy_terminal());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(OpsError::InvalidInput("x".into()).http_status(), 400);
        assert_eq!(
            OpsError::NotFound { entity: "goal", id: Uuid::nil() }.http_status(),
            404
        );
        assert_eq!(OpsError::InvalidState("x".into()).http_status(), 409);
        assert_eq!(OpsError::UpstreamUnavailable("x".into()).http_status(), 503);
    }
}
