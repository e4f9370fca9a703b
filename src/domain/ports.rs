//! Store port: the transactional persistence contract (`spec.md` §4.3).
//!
//! Components hold no entity state between transactions; they re-read
//! under the transaction that will write. Implementations must make
//! `claim_ready_tasks` atomic under concurrent callers (§8 property 5).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::error::StoreResult;
use crate::domain::models::{
    AuditEvent, Goal, GoalKind, GoalOutcome, GoalStatus, LedgerEntry, LedgerFilter, LedgerRange, Project, Task,
    TaskStatus,
};

#[derive(Debug, Clone, Default)]
pub struct GoalFilter {
    pub status: Option<GoalStatus>,
    pub kind: Option<GoalKind>,
}

/// The full Store contract used by the core. A single `sqlx::SqlitePool`
/// implementation (`crate::store::sqlite`) backs this trait; it is a trait
/// so tests can substitute an in-memory fake where that's cheaper than a
/// migrated pool.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Goals --
    async fn create_goal(&self, goal: &Goal) -> StoreResult<()>;
    async fn get_goal(&self, id: Uuid) -> StoreResult<Option<Goal>>;
    async fn update_goal(&self, goal: &Goal) -> StoreResult<()>;
    async fn list_goals(&self, filter: GoalFilter, limit: i64) -> StoreResult<Vec<Goal>>;
    async fn list_non_terminal_goals_by_source_tag(&self, source_tag: &str) -> StoreResult<Vec<Goal>>;
    async fn goals_due_for_measurement(&self, now: DateTime<Utc>, window_days: i64) -> StoreResult<Vec<Goal>>;

    // -- Projects --
    /// §4.3: serialisable read against `Goal` and `Project`, used by
    /// `ProjectGenerator` to find goals that still need a project.
    async fn find_approved_goals_without_project(&self) -> StoreResult<Vec<Goal>>;
    async fn create_project_with_tasks(&self, project: &Project, tasks: &[Task]) -> StoreResult<()>;
    async fn get_project(&self, id: Uuid) -> StoreResult<Option<Project>>;
    async fn get_project_by_goal(&self, goal_id: Uuid) -> StoreResult<Option<Project>>;
    async fn update_project(&self, project: &Project) -> StoreResult<()>;

    // -- Tasks --
    /// Atomically selects up to `limit` tasks whose status is `pending` and
    /// whose parents are all `completed`, marks them `in_progress`, and
    /// returns them (§4.3, §8 property 5).
    async fn claim_ready_tasks(&self, limit: i64, now: DateTime<Utc>) -> StoreResult<Vec<Task>>;
    async fn get_task(&self, id: Uuid) -> StoreResult<Option<Task>>;
    async fn update_task(&self, task: &Task) -> StoreResult<()>;
    async fn list_tasks_for_project(&self, project_id: Uuid) -> StoreResult<Vec<Task>>;
    /// Cross-project scan used by `OpportunityDetector`'s failure-pattern
    /// and knowledge-gap strategies (`spec.md` §4.7).
    async fn list_tasks_by_status_since(&self, status: TaskStatus, since: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Task>>;

    // -- Budget ledger --
    async fn ledger_append(&self, entry: &LedgerEntry) -> StoreResult<()>;
    async fn ledger_sum(&self, range: LedgerRange, filter: LedgerFilter) -> StoreResult<crate::domain::money::Usd>;

    // -- Goal outcomes --
    /// Upsert, one row per goal (§4.3).
    async fn record_outcome(&self, outcome: &GoalOutcome) -> StoreResult<()>;
    async fn get_outcome(&self, goal_id: Uuid) -> StoreResult<Option<GoalOutcome>>;
    async fn recent_outcomes_by_kind(&self, kind: GoalKind, limit: i64) -> StoreResult<Vec<GoalOutcome>>;

    // -- Audit --
    async fn append_audit_event(&self, event: &AuditEvent) -> StoreResult<()>;
}
