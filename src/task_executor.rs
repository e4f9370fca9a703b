//! C10: TaskExecutor — claims ready tasks and drives them through a
//! registered `Handler` with retry, budget accounting, and project rollup
//! (`spec.md` §4.10).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use backoff::ExponentialBackoffBuilder;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::clock::Clock;
use crate::domain::models::{Actor, FailureReason, GoalKind, Project, Task, TaskError, TaskStatus, DEFAULT_OVERSPEND_TOLERANCE};
use crate::domain::ports::Store;
use crate::domain::{OpsResult, Usd};
use crate::handlers::HandlerRegistry;
use crate::project_generator::REQUIRES_HUMAN_APPROVAL_KEY;

const APPROVED_METADATA_KEY: &str = "approved";

#[derive(Debug, Clone)]
pub struct TaskExecutorConfig {
    pub claim_batch_size: i64,
    pub global_concurrency: usize,
    pub per_kind_concurrency: usize,
    pub retry_initial_backoff: StdDuration,
    pub retry_max_backoff: StdDuration,
    /// Overspend tolerance per goal kind (`spec.md` §3: "configurable per
    /// kind"); kinds absent here fall back to `default_overspend_tolerance`.
    pub overspend_tolerance: HashMap<GoalKind, f64>,
    pub default_overspend_tolerance: f64,
}

impl TaskExecutorConfig {
    #[must_use]
    pub fn overspend_tolerance_for(&self, kind: GoalKind) -> f64 {
        self.overspend_tolerance.get(&kind).copied().unwrap_or(self.default_overspend_tolerance)
    }
}

impl Default for TaskExecutorConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: 10,
            global_concurrency: 8,
            per_kind_concurrency: 3,
            retry_initial_backoff: StdDuration::from_millis(200),
            retry_max_backoff: StdDuration::from_secs(30),
            overspend_tolerance: HashMap::new(),
            default_overspend_tolerance: DEFAULT_OVERSPEND_TOLERANCE,
        }
    }
}

/// Claims ready tasks from the Store and drives each to a terminal state.
/// Concurrency is capped globally and per task kind; each task's retries
/// happen in-process with exponential backoff, so a task is claimed once
/// per lifetime rather than re-claimed on a timer.
pub struct TaskExecutor {
    config: TaskExecutorConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    handlers: Arc<HandlerRegistry>,
    global_semaphore: Arc<Semaphore>,
    kind_semaphores: tokio::sync::Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl TaskExecutor {
    #[must_use]
    pub fn new(config: TaskExecutorConfig, store: Arc<dyn Store>, clock: Arc<dyn Clock>, audit: Arc<AuditLog>, handlers: Arc<HandlerRegistry>) -> Self {
        let global_semaphore = Arc::new(Semaphore::new(config.global_concurrency));
        Self { config, store, clock, audit, handlers, global_semaphore, kind_semaphores: tokio::sync::Mutex::new(HashMap::new()) }
    }

    async fn kind_semaphore(&self, kind: &str) -> Arc<Semaphore> {
        let mut guard = self.kind_semaphores.lock().await;
        guard.entry(kind.to_string()).or_insert_with(|| Arc::new(Semaphore::new(self.config.per_kind_concurrency))).clone()
    }

    /// Claims up to `claim_batch_size` ready tasks and dispatches each
    /// concurrently, waiting for all of them to reach a terminal state (or
    /// be held for approval) before returning.
    pub async fn run_once(&self) -> OpsResult<usize> {
        let now = self.clock.now();
        let tasks = self.store.claim_ready_tasks(self.config.claim_batch_size, now).await?;
        let count = tasks.len();

        let mut join_set = tokio::task::JoinSet::new();
        for task in tasks {
            let global = self.global_semaphore.clone();
            let kind_sem = self.kind_semaphore(&task.kind).await;
            let store = self.store.clone();
            let clock = self.clock.clone();
            let audit = self.audit.clone();
            let handlers = self.handlers.clone();
            let config = self.config.clone();

            join_set.spawn(async move {
                let _global_permit = global.acquire_owned().await.expect("semaphore never closed");
                let _kind_permit = kind_sem.acquire_owned().await.expect("semaphore never closed");
                process_task(task, store, clock, audit, handlers, config).await
            });
        }

        while let Some(res) = join_set.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::error!(error = %err, "task processing failed");
            }
        }

        Ok(count)
    }
}

async fn process_task(
    task: Task,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    handlers: Arc<HandlerRegistry>,
    config: TaskExecutorConfig,
) -> OpsResult<()> {
    let now = clock.now();

    if requires_unapproved_human_approval(&task) {
        let mut t = task;
        t.transition_to(TaskStatus::Pending, now)?;
        store.update_task(&t).await?;
        audit.emit(Actor::System, "task_held_for_approval", Some(t.id), serde_json::json!({"kind": t.kind}), now);
        return Ok(());
    }

    let Some(handler) = handlers.get(&task.kind) else {
        let mut t = task;
        t.record_failure(TaskError { reason: FailureReason::Internal, message: format!("no handler registered for kind {}", t.kind) }, now)?;
        store.update_task(&t).await?;
        finalize_project(&store, &clock, t.project_id, false).await?;
        return Ok(());
    };

    let mut t = task;
    let attempts_counter = Arc::new(AtomicU32::new(t.attempts));
    let max_attempts = t.max_attempts;
    let backoff_policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.retry_initial_backoff)
        .with_max_interval(config.retry_max_backoff)
        .with_multiplier(2.0)
        .with_max_elapsed_time(None)
        .build();

    let task_ref = &t;
    let outcome = backoff::future::retry(backoff_policy, || {
        let attempts_counter = attempts_counter.clone();
        let handler = handler.clone();
        async move {
            let attempt = attempts_counter.fetch_add(1, Ordering::SeqCst) + 1;
            match handler.handle(task_ref).await {
                Ok(out) => Ok(out),
                Err(err) if err.reason.retryable_by_default() && attempt < max_attempts => {
                    Err(backoff::Error::Transient { err, retry_after: None })
                }
                Err(err) => Err(backoff::Error::Permanent(err)),
            }
        }
    })
    .await;

    let final_attempts = attempts_counter.load(Ordering::SeqCst);
    let now = clock.now();
    let mut overspent = false;
    match outcome {
        Ok(result) => {
            t.attempts = final_attempts;
            t.record_success(result.result, now)?;
            store.update_task(&t).await?;
            // A settlement error means the spend exceeded tolerance, not
            // that the spend itself failed to persist — it already has
            // (settle_spend always writes the ledger entry and the
            // project's running total). Don't let it swallow the project
            // rollup below.
            overspent = settle_spend(&store, &t, result.cost_usd, now, &config).await.is_err();
        }
        Err(err) => {
            t.attempts = final_attempts.saturating_sub(1);
            t.record_failure(err, now)?;
            store.update_task(&t).await?;
        }
    }

    finalize_project(&store, &clock, t.project_id, overspent).await?;
    Ok(())
}

fn requires_unapproved_human_approval(task: &Task) -> bool {
    task.metadata.get(REQUIRES_HUMAN_APPROVAL_KEY).is_some_and(|v| v == "true")
        && task.metadata.get(APPROVED_METADATA_KEY).is_none_or(|v| v != "true")
}

/// Appends the ledger entry and rolls it into the project's running total.
/// The project update always happens, even when the new total exceeds
/// tolerance, so `budget_spent_usd` stays equal to the ledger sum
/// (`spec.md` §8 Testable Property 3); the `Err` only signals the caller
/// that the project needs to fail.
async fn settle_spend(store: &Arc<dyn Store>, task: &Task, cost: Usd, now: chrono::DateTime<chrono::Utc>, config: &TaskExecutorConfig) -> OpsResult<()> {
    let entry = crate::domain::models::LedgerEntry::new(Some(task.project_id), Some(task.id), cost, format!("task:{}", task.kind), now);
    store.ledger_append(&entry).await?;

    let Some(mut project) = store.get_project(task.project_id).await? else { return Ok(()) };
    let tolerance = match store.get_goal(project.goal_id).await? {
        Some(goal) => config.overspend_tolerance_for(goal.kind),
        None => config.default_overspend_tolerance,
    };
    let result = project.record_spend(cost, tolerance);
    store.update_project(&project).await?;
    result
}

/// Rolls a project to `completed`/`failed` once every task is terminal,
/// or immediately to `failed` when `forced_failure` is set (an overspend
/// on an otherwise-successful task still leaves sibling tasks running).
async fn finalize_project(store: &Arc<dyn Store>, clock: &Arc<dyn Clock>, project_id: Uuid, forced_failure: bool) -> OpsResult<()> {
    let tasks = store.list_tasks_for_project(project_id).await?;
    if !forced_failure && (tasks.is_empty() || !tasks.iter().all(|t| t.status.is_terminal())) {
        return Ok(());
    }
    let Some(mut project) = store.get_project(project_id).await? else { return Ok(()) };
    if project.status.is_terminal() {
        return Ok(());
    }
    let all_ok = !forced_failure && tasks.iter().all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Skipped));
    let now = clock.now();
    project.rollup(all_ok, now);
    store.update_project(&project).await?;

    // A failed project leaves its goal `approved`, not `completed` — per
    // spec.md §7, effectiveness measurement never runs for it.
    if all_ok {
        if let Some(mut goal) = store.get_goal(project.goal_id).await? {
            if goal.status == crate::domain::models::GoalStatus::Approved {
                goal.transition_to(crate::domain::models::GoalStatus::Completed, now, None, None)?;
                store.update_goal(&goal).await?;
            }
        }
    }
    Ok(())
}

/// Marks a task held by `REQUIRES_HUMAN_APPROVAL_KEY` as approved so the
/// next claim cycle will dispatch it (`spec.md` §4.9 fabrication template).
pub async fn approve_held_task(store: &Arc<dyn Store>, task_id: Uuid, actor: &str, audit: &AuditLog, now: chrono::DateTime<chrono::Utc>) -> OpsResult<Task> {
    let mut task = store.get_task(task_id).await?.ok_or(crate::domain::OpsError::NotFound { entity: "task", id: task_id })?;
    task.metadata.insert(APPROVED_METADATA_KEY.to_string(), "true".to_string());
    store.update_task(&task).await?;
    audit.emit(Actor::User(actor.to_string()), "task_approved", Some(task_id), serde_json::json!({}), now);
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{SimulatedKnowledgeStore, SimulatedSearch, SimulatedSynthesize, SimulatedVcs};
    use crate::clock::VirtualClock;
    use crate::domain::models::{Goal, GoalKind, GoalStatus, ProjectStatus, TaskPriority};
    use chrono::{TimeZone, Utc};

    async fn fixture() -> (TaskExecutor, Arc<dyn Store>, Arc<VirtualClock>) {
        let pool = crate::store::create_migrated_test_pool().await.unwrap();
        let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::new(pool));
        let clock = Arc::new(VirtualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let (audit, _handle) = AuditLog::spawn(store.clone(), clock.clone() as Arc<dyn Clock>);
        let handlers = Arc::new(HandlerRegistry::new(
            Arc::new(SimulatedSearch),
            Arc::new(SimulatedSynthesize),
            Arc::new(SimulatedKnowledgeStore),
            Arc::new(SimulatedVcs),
        ));
        let executor = TaskExecutor::new(TaskExecutorConfig::default(), store.clone(), clock.clone() as Arc<dyn Clock>, Arc::new(audit), handlers);
        (executor, store, clock)
    }

    async fn seed_project(store: &Arc<dyn Store>, now: chrono::DateTime<chrono::Utc>, kind: &str) -> Uuid {
        seed_project_with_budget(store, now, kind, Usd::from_dollars(10.0), Usd::from_dollars(2.0)).await
    }

    async fn seed_project_with_budget(
        store: &Arc<dyn Store>,
        now: chrono::DateTime<chrono::Utc>,
        kind: &str,
        project_budget: Usd,
        task_budget: Usd,
    ) -> Uuid {
        let goal = Goal::new(GoalKind::Research, "desc", "tag", 50.0, HashMap::new(), now);
        store.create_goal(&goal).await.unwrap();
        goal_status_approved(store, &goal, now).await;
        let project = Project::new(goal.id, "t", project_budget, now);
        let task = Task::new(project.id, kind, "Do the thing", TaskPriority::Medium, vec![], task_budget, 3, now);
        store.create_project_with_tasks(&project, &[task]).await.unwrap();
        project.id
    }

    async fn goal_status_approved(store: &Arc<dyn Store>, goal: &Goal, now: chrono::DateTime<chrono::Utc>) {
        let mut g = store.get_goal(goal.id).await.unwrap().unwrap();
        g.transition_to(GoalStatus::Approved, now, Some("test"), None).unwrap();
        store.update_goal(&g).await.unwrap();
    }

    #[tokio::test]
    async fn successful_task_settles_ledger_and_rolls_up_project() {
        let (executor, store, clock) = fixture().await;
        let project_id = seed_project(&store, clock.now(), "search").await;

        let claimed = executor.run_once().await.unwrap();
        assert_eq!(claimed, 1);

        let tasks = store.list_tasks_for_project(project_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);

        let project = store.get_project(project_id).await.unwrap().unwrap();
        assert!(project.status.is_terminal());
        assert!(project.budget_spent_usd.as_micros() > 0);
    }

    #[tokio::test]
    async fn unknown_kind_fails_without_panicking() {
        let (executor, store, clock) = fixture().await;
        let project_id = seed_project(&store, clock.now(), "no_such_handler").await;

        executor.run_once().await.unwrap();
        let tasks = store.list_tasks_for_project(project_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Failed);
    }

    /// A task that completes successfully but whose cost blows through the
    /// project's tolerance must still be ledgered, still roll the project
    /// up (to `failed`, immediately), and never leave `finalize_project`
    /// unreached (the bug this test guards against: `BudgetExceeded`
    /// propagating out of `process_task` via `?` and skipping rollup).
    #[tokio::test]
    async fn overspent_task_completes_ledgers_spend_and_fails_project() {
        let (executor, store, clock) = fixture().await;
        let project_id =
            seed_project_with_budget(&store, clock.now(), "search", Usd::from_dollars(0.10), Usd::from_dollars(2.0)).await;

        let claimed = executor.run_once().await.unwrap();
        assert_eq!(claimed, 1);

        let tasks = store.list_tasks_for_project(project_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed, "the task itself still succeeded");

        let project = store.get_project(project_id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Failed, "overspend forces the project to fail");
        assert_eq!(project.budget_spent_usd, Usd::from_dollars(1.0), "spend is ledgered even though it exceeds tolerance");

        let ledger_sum = store
            .ledger_sum(
                crate::domain::models::LedgerRange::last_n_days(clock.now() + chrono::Duration::days(1), 2),
                crate::domain::models::LedgerFilter { project_id: Some(project_id) },
            )
            .await
            .unwrap();
        assert_eq!(ledger_sum, Usd::from_dollars(1.0), "the ledger entry was appended despite the overspend");
    }

    #[tokio::test]
    async fn per_kind_overspend_tolerance_overrides_default() {
        let pool = crate::store::create_migrated_test_pool().await.unwrap();
        let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::new(pool));
        let clock = Arc::new(VirtualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let (audit, _handle) = AuditLog::spawn(store.clone(), clock.clone() as Arc<dyn Clock>);
        let handlers = Arc::new(HandlerRegistry::new(
            Arc::new(SimulatedSearch),
            Arc::new(SimulatedSynthesize),
            Arc::new(SimulatedKnowledgeStore),
            Arc::new(SimulatedVcs),
        ));
        let mut overspend_tolerance = HashMap::new();
        overspend_tolerance.insert(GoalKind::Research, 20.0);
        let config = TaskExecutorConfig { overspend_tolerance, ..TaskExecutorConfig::default() };
        let executor = TaskExecutor::new(config, store.clone(), clock.clone() as Arc<dyn Clock>, Arc::new(audit), handlers);

        let project_id =
            seed_project_with_budget(&store, clock.now(), "search", Usd::from_dollars(0.10), Usd::from_dollars(2.0)).await;

        executor.run_once().await.unwrap();

        let project = store.get_project(project_id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Completed, "a generous per-kind tolerance absorbs the overage");
    }
}
