//! C9: ProjectGenerator — turns an approved `Goal` into a `Project` with a
//! linear task chain (`spec.md` §4.9).

use std::sync::Arc;

use uuid::Uuid;

#[cfg(test)]
use std::collections::HashMap;

use crate::audit::AuditLog;
use crate::clock::Clock;
use crate::domain::models::{Actor, Goal, GoalKind, Project, Task, TaskPriority};
use crate::domain::ports::Store;
use crate::domain::{OpsResult, Usd};

/// `requires_human_approval` task metadata key; `queue_print` tasks carry
/// this so the executor/handler layer holds them for an explicit approval
/// instead of dispatching automatically (`spec.md` §4.9 fabrication template).
pub const REQUIRES_HUMAN_APPROVAL_KEY: &str = "requires_human_approval";

struct TaskTemplate {
    kind: &'static str,
    weight: f64,
    requires_human_approval: bool,
}

fn template_for(kind: GoalKind) -> &'static [TaskTemplate] {
    const RESEARCH: &[TaskTemplate] = &[
        TaskTemplate { kind: "search", weight: 0.40, requires_human_approval: false },
        TaskTemplate { kind: "synthesize", weight: 0.20, requires_human_approval: false },
        TaskTemplate { kind: "kb_write", weight: 0.20, requires_human_approval: false },
        TaskTemplate { kind: "commit", weight: 0.20, requires_human_approval: false },
    ];
    const IMPROVEMENT: &[TaskTemplate] = &[
        TaskTemplate { kind: "research", weight: 0.50, requires_human_approval: false },
        TaskTemplate { kind: "update_guide", weight: 0.50, requires_human_approval: false },
    ];
    const OPTIMIZATION: &[TaskTemplate] = &[
        TaskTemplate { kind: "analyze", weight: 0.50, requires_human_approval: false },
        TaskTemplate { kind: "document", weight: 0.50, requires_human_approval: false },
    ];
    const PROCUREMENT: &[TaskTemplate] = &[
        TaskTemplate { kind: "quote", weight: 1.0 / 3.0, requires_human_approval: false },
        TaskTemplate { kind: "decide", weight: 1.0 / 3.0, requires_human_approval: false },
        TaskTemplate { kind: "order", weight: 1.0 / 3.0, requires_human_approval: false },
    ];
    const FABRICATION: &[TaskTemplate] = &[
        TaskTemplate { kind: "cad", weight: 1.0 / 3.0, requires_human_approval: false },
        TaskTemplate { kind: "review_safety", weight: 1.0 / 3.0, requires_human_approval: false },
        TaskTemplate { kind: "queue_print", weight: 1.0 / 3.0, requires_human_approval: true },
    ];

    match kind {
        GoalKind::Research => RESEARCH,
        GoalKind::Improvement => IMPROVEMENT,
        GoalKind::Optimization => OPTIMIZATION,
        GoalKind::Procurement => PROCUREMENT,
        GoalKind::Fabrication => FABRICATION,
    }
}

/// Builds one `Project` plus its linear task chain per approved goal that
/// doesn't already have one (`spec.md` §4.9). Commits in a single Store
/// transaction so a project is never left without its tasks.
pub struct ProjectGenerator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
}

impl ProjectGenerator {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, audit: Arc<AuditLog>) -> Self {
        Self { store, clock, audit }
    }

    /// Generates projects for every approved goal lacking one. Idempotent:
    /// a goal that already has a project (per the Store's `NOT EXISTS`
    /// query) is skipped, so rerunning with no new approved goals is a
    /// no-op and no goal ever gets two projects.
    pub async fn run(&self) -> OpsResult<Vec<Project>> {
        let goals = self.store.find_approved_goals_without_project().await?;
        let mut created = Vec::with_capacity(goals.len());
        for goal in goals {
            created.push(self.generate_for(&goal).await?);
        }
        Ok(created)
    }

    async fn generate_for(&self, goal: &Goal) -> OpsResult<Project> {
        let now = self.clock.now();
        let template = template_for(goal.kind);

        let budget = if goal.estimated_budget_usd == Usd::ZERO { Usd::from_dollars(100.0) } else { goal.estimated_budget_usd };
        let project = Project::new(goal.id, format!("{}: {}", goal.kind.as_str(), goal.description), budget, now);

        let mut tasks = Vec::with_capacity(template.len());
        let mut previous: Option<Uuid> = None;
        for step in template {
            let task_budget = Usd::micros((budget.as_micros() as f64 * step.weight).round() as i64);
            let depends_on = previous.into_iter().collect::<Vec<_>>();
            let mut task = Task::new(project.id, step.kind, step.kind, TaskPriority::Medium, depends_on, task_budget, 3, now);
            for (key, value) in &goal.metadata {
                task.metadata.insert(key.clone(), value.clone());
            }
            if step.requires_human_approval {
                task.metadata.insert(REQUIRES_HUMAN_APPROVAL_KEY.to_string(), "true".to_string());
            }
            previous = Some(task.id);
            tasks.push(task);
        }

        self.store.create_project_with_tasks(&project, &tasks).await?;
        self.audit.emit(
            Actor::System,
            "project_generated",
            Some(project.id),
            serde_json::json!({"goal_id": goal.id, "task_count": tasks.len()}),
            now,
        );
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::domain::models::GoalStatus;
    use chrono::{TimeZone, Utc};

    async fn fixture() -> (ProjectGenerator, Arc<dyn Store>, Arc<VirtualClock>) {
        let pool = crate::store::create_migrated_test_pool().await.unwrap();
        let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::new(pool));
        let clock = Arc::new(VirtualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let (audit, _handle) = AuditLog::spawn(store.clone(), clock.clone() as Arc<dyn Clock>);
        (ProjectGenerator::new(store.clone(), clock.clone() as Arc<dyn Clock>, Arc::new(audit)), store, clock)
    }

    #[tokio::test]
    async fn research_goal_produces_four_task_chain() {
        let (gen, store, clock) = fixture().await;
        let mut goal = Goal::new(GoalKind::Research, "desc", "tag", 80.0, HashMap::new(), clock.now());
        goal.transition_to(GoalStatus::Approved, clock.now(), Some("alice"), None).unwrap();
        store.create_goal(&goal).await.unwrap();

        let created = gen.run().await.unwrap();
        assert_eq!(created.len(), 1);

        let tasks = store.list_tasks_for_project(created[0].id).await.unwrap();
        assert_eq!(tasks.len(), 4);
        let by_kind: Vec<&str> = {
            let mut ordered = tasks.clone();
            ordered.sort_by_key(|t| t.created_at);
            ordered.iter().map(|t| t.kind.as_str()).collect()
        };
        assert_eq!(by_kind, vec!["search", "synthesize", "kb_write", "commit"]);

        let queue_print = tasks.iter().find(|t| t.kind == "commit").unwrap();
        assert!(!queue_print.metadata.contains_key(REQUIRES_HUMAN_APPROVAL_KEY));
    }

    #[tokio::test]
    async fn fabrication_queue_print_requires_human_approval() {
        let (gen, store, clock) = fixture().await;
        let mut goal = Goal::new(GoalKind::Fabrication, "print bracket", "tag", 80.0, HashMap::new(), clock.now());
        goal.transition_to(GoalStatus::Approved, clock.now(), Some("alice"), None).unwrap();
        store.create_goal(&goal).await.unwrap();

        let created = gen.run().await.unwrap();
        let tasks = store.list_tasks_for_project(created[0].id).await.unwrap();
        let queue_print = tasks.iter().find(|t| t.kind == "queue_print").unwrap();
        assert_eq!(queue_print.metadata.get(REQUIRES_HUMAN_APPROVAL_KEY).map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn task_metadata_is_derived_from_goal_metadata() {
        let (gen, store, clock) = fixture().await;
        let mut metadata = HashMap::new();
        metadata.insert("material".to_string(), "nylon".to_string());
        let mut goal = Goal::new(GoalKind::Research, "desc", "knowledge_gap", 80.0, metadata, clock.now());
        goal.transition_to(GoalStatus::Approved, clock.now(), Some("alice"), None).unwrap();
        store.create_goal(&goal).await.unwrap();

        let created = gen.run().await.unwrap();
        let tasks = store.list_tasks_for_project(created[0].id).await.unwrap();
        assert!(tasks.iter().all(|t| t.metadata.get("material").map(String::as_str) == Some("nylon")));
    }

    #[tokio::test]
    async fn rerunning_does_not_duplicate_project() {
        let (gen, store, clock) = fixture().await;
        let mut goal = Goal::new(GoalKind::Optimization, "desc", "tag", 80.0, HashMap::new(), clock.now());
        goal.transition_to(GoalStatus::Approved, clock.now(), Some("alice"), None).unwrap();
        store.create_goal(&goal).await.unwrap();

        let first = gen.run().await.unwrap();
        assert_eq!(first.len(), 1);
        let second = gen.run().await.unwrap();
        assert!(second.is_empty());
    }

    proptest::proptest! {
        /// Every template produces a single linear chain: each task depends
        /// on at most the immediately preceding task, and no task ever
        /// depends on an id that hasn't been generated yet.
        #[test]
        fn prop_generated_chain_is_a_linear_dag(kind_idx in 0usize..5, budget_dollars in 1.0f64..10_000.0) {
            let kinds = [GoalKind::Research, GoalKind::Improvement, GoalKind::Optimization, GoalKind::Procurement, GoalKind::Fabrication];
            let kind = kinds[kind_idx];
            let template = template_for(kind);
            let now = Utc::now();
            let budget = Usd::from_dollars(budget_dollars);

            let mut seen = std::collections::HashSet::new();
            let mut previous: Option<Uuid> = None;
            for step in template {
                let task_budget = Usd::micros((budget.as_micros() as f64 * step.weight).round() as i64);
                let depends_on = previous.into_iter().collect::<Vec<_>>();
                proptest::prop_assert!(depends_on.len() <= 1);
                if let Some(dep) = depends_on.first() {
                    proptest::prop_assert!(seen.contains(dep));
                }
                let task = Task::new(Uuid::new_v4(), step.kind, step.kind, TaskPriority::Medium, depends_on, task_budget, 3, now);
                proptest::prop_assert!(!seen.contains(&task.id));
                seen.insert(task.id);
                previous = Some(task.id);
            }
        }
    }
}
