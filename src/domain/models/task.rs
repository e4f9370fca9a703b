//! Task — node of the execution DAG (`spec.md` §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::OpsError;
use crate::domain::money::Usd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl TaskPriority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Task lifecycle: `pending -> in_progress -> (completed|failed)`, with an
/// optional `pending -> skipped` branch (`spec.md` §3 Task invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    fn valid_transitions(self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::InProgress, Self::Skipped],
            Self::InProgress => &[Self::Completed, Self::Failed, Self::Pending],
            Self::Completed | Self::Failed | Self::Skipped => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// A single handler failure taxonomy member, attached to `Task.error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UpstreamUnavailable,
    RateLimited,
    InvalidInput,
    PolicyDenied,
    Timeout,
    Internal,
}

impl FailureReason {
    /// §4.11: "The first two are retryable by default."
    #[must_use]
    pub const fn retryable_by_default(self) -> bool {
        matches!(self, Self::UpstreamUnavailable | Self::RateLimited)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::RateLimited => "rate_limited",
            Self::InvalidInput => "invalid_input",
            Self::PolicyDenied => "policy_denied",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub reason: FailureReason,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskResult {
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub kind: String,
    pub title: String,
    pub priority: TaskPriority,
    pub depends_on: Vec<Uuid>,
    pub status: TaskStatus,
    pub budget_allocated_usd: Usd,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Task {
    #[must_use]
    pub fn new(
        project_id: Uuid,
        kind: impl Into<String>,
        title: impl Into<String>,
        priority: TaskPriority,
        depends_on: Vec<Uuid>,
        budget_allocated_usd: Usd,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            kind: kind.into(),
            title: title.into(),
            priority,
            depends_on,
            status: TaskStatus::Pending,
            budget_allocated_usd,
            result: None,
            error: None,
            attempts: 0,
            max_attempts,
            metadata: HashMap::new(),
            created_at: now,
            started_at: None,
            finished_at: None,
            deadline: None,
            version: 1,
        }
    }

    pub fn transition_to(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<(), OpsError> {
        if !self.status.can_transition_to(next) {
            return Err(OpsError::InvalidState(format!(
                "task {} cannot transition {} -> {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        if next == TaskStatus::InProgress {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        self.version += 1;
        Ok(())
    }

    /// §4.10 retry policy: increments `attempts`; returns `true` if the
    /// task should go back to `pending` rather than terminally `failed`.
    pub fn record_failure(&mut self, error: TaskError, now: DateTime<Utc>) -> Result<bool, OpsError> {
        self.attempts += 1;
        self.error = Some(error.clone());

        let retryable = error.reason.retryable_by_default() && self.attempts < self.max_attempts;
        if retryable {
            self.transition_to(TaskStatus::Pending, now)?;
        } else {
            self.transition_to(TaskStatus::Failed, now)?;
        }
        self.version += 1;
        Ok(retryable)
    }

    #[must_use]
    pub fn record_success(&mut self, result: TaskResult, now: DateTime<Utc>) -> Result<(), OpsError> {
        self.result = Some(result);
        self.transition_to(TaskStatus::Completed, now)
    }

    #[must_use]
    pub fn is_ready(&self, completed_parents: &std::collections::HashSet<Uuid>) -> bool {
        self.status == TaskStatus::Pending
            && self.depends_on.iter().all(|p| completed_parents.contains(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn task() -> Task {
        Task::new(Uuid::new_v4(), "search", "Search", TaskPriority::High, vec![], Usd::from_dollars(1.0), 3, now())
    }

    #[test]
    fn pending_to_in_progress_sets_started_at() {
        let mut t = task();
        t.transition_to(TaskStatus::InProgress, now()).unwrap();
        assert!(t.started_at.is_some());
        assert_eq!(t.status, TaskStatus::InProgress);
    }

    #[test]
    fn self_transition_rejected() {
        let mut t = task();
        assert!(t.transition_to(TaskStatus::Pending, now()).is_err());
    }

    #[test]
    fn terminal_state_has_no_outgoing_transitions() {
        let mut t = task();
        t.transition_to(TaskStatus::InProgress, now()).unwrap();
        t.transition_to(TaskStatus::Completed, now()).unwrap();
        assert!(t.transition_to(TaskStatus::Failed, now()).is_err());
        assert!(t.finished_at.is_some());
    }

    #[test]
    fn retryable_failure_returns_to_pending() {
        let mut t = task();
        t.transition_to(TaskStatus::InProgress, now()).unwrap();
        let retried = t
            .record_failure(TaskError { reason: FailureReason::UpstreamUnavailable, message: "down".into() }, now())
            .unwrap();
        assert!(retried);
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.attempts, 1);
    }

    #[test]
    fn exhausted_retries_marks_failed() {
        let mut t = task();
        t.max_attempts = 1;
        t.transition_to(TaskStatus::InProgress, now()).unwrap();
        let retried = t
            .record_failure(TaskError { reason: FailureReason::UpstreamUnavailable, message: "down".into() }, now())
            .unwrap();
        assert!(!retried);
        assert_eq!(t.status, TaskStatus::Failed);
    }

    #[test]
    fn policy_denied_never_retries_even_with_attempts_left() {
        let mut t = task();
        t.transition_to(TaskStatus::InProgress, now()).unwrap();
        let retried = t
            .record_failure(TaskError { reason: FailureReason::PolicyDenied, message: "denied".into() }, now())
            .unwrap();
        assert!(!retried);
        assert_eq!(t.status, TaskStatus::Failed);
    }

    #[test]
    fn readiness_requires_all_parents_complete() {
        let parent_a = Uuid::new_v4();
        let parent_b = Uuid::new_v4();
        let mut t = task();
        t.depends_on = vec![parent_a, parent_b];

        let mut completed = std::collections::HashSet::new();
        completed.insert(parent_a);
        assert!(!t.is_ready(&completed));

        completed.insert(parent_b);
        assert!(t.is_ready(&completed));
    }
}
