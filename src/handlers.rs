//! C11: Handlers — dynamic dispatch on `Task.kind` (`spec.md` §4.11).
//!
//! One handler per task kind named in the `ProjectGenerator` templates.
//! Registered into a static lookup at startup rather than matched by a
//! giant `match` in the executor, so a new task kind is a new `Handler`
//! impl plus one registry entry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::capabilities::{KnowledgeStore, Search, Synthesize, Vcs};
use crate::domain::models::{FailureReason, Task, TaskError, TaskResult};
use crate::domain::{OpsError, Usd};

pub struct HandlerOutcome {
    pub result: TaskResult,
    pub cost_usd: Usd,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<HandlerOutcome, TaskError>;
}

fn ops_error_to_task_error(err: OpsError) -> TaskError {
    let reason = match &err {
        OpsError::UpstreamUnavailable(_) => FailureReason::UpstreamUnavailable,
        OpsError::RateLimited { .. } => FailureReason::RateLimited,
        OpsError::InvalidInput(_) => FailureReason::InvalidInput,
        OpsError::Denied(_) | OpsError::BudgetExceeded(_) => FailureReason::PolicyDenied,
        OpsError::Timeout(_) => FailureReason::Timeout,
        OpsError::InvalidState(_) | OpsError::NotFound { .. } | OpsError::Internal(_) => FailureReason::Internal,
    };
    TaskError { reason, message: err.to_string() }
}

/// A fixed fraction of the task's allocated budget, since the simulated
/// capabilities have no real per-call cost signal to report.
fn nominal_cost(task: &Task) -> Usd {
    Usd::micros((task.budget_allocated_usd.as_micros() as f64 * 0.5).round() as i64)
}

struct SearchHandler(Arc<dyn Search>);
#[async_trait]
impl Handler for SearchHandler {
    async fn handle(&self, task: &Task) -> Result<HandlerOutcome, TaskError> {
        let results = self.0.search(&task.title).await.map_err(ops_error_to_task_error)?;
        Ok(HandlerOutcome { result: TaskResult { data: serde_json::json!({"results": results}) }, cost_usd: nominal_cost(task) })
    }
}

struct SynthesizeHandler(Arc<dyn Synthesize>);
#[async_trait]
impl Handler for SynthesizeHandler {
    async fn handle(&self, task: &Task) -> Result<HandlerOutcome, TaskError> {
        let sources = vec![task.title.clone()];
        let synthesis = self.0.synthesize(&sources).await.map_err(ops_error_to_task_error)?;
        Ok(HandlerOutcome { result: TaskResult { data: serde_json::json!({"synthesis": synthesis}) }, cost_usd: nominal_cost(task) })
    }
}

struct KbWriteHandler(Arc<dyn KnowledgeStore>);
#[async_trait]
impl Handler for KbWriteHandler {
    async fn handle(&self, task: &Task) -> Result<HandlerOutcome, TaskError> {
        self.0.write(&task.id.to_string(), &task.title).await.map_err(ops_error_to_task_error)?;
        Ok(HandlerOutcome { result: TaskResult { data: serde_json::json!({"written": true}) }, cost_usd: nominal_cost(task) })
    }
}

struct CommitHandler(Arc<dyn Vcs>);
#[async_trait]
impl Handler for CommitHandler {
    async fn handle(&self, task: &Task) -> Result<HandlerOutcome, TaskError> {
        let sha = self.0.commit(&task.title, &serde_json::json!({"task_id": task.id})).await.map_err(ops_error_to_task_error)?;
        Ok(HandlerOutcome { result: TaskResult { data: serde_json::json!({"commit": sha}) }, cost_usd: nominal_cost(task) })
    }
}

/// Generic handler for task kinds with no external capability dependency
/// (`update_guide`, `analyze`, `document`, `quote`, `decide`, `order`,
/// `cad`, `review_safety`, `queue_print`). Each produces a deterministic
/// acknowledgement; the interesting behavior for these kinds lives in the
/// project template and the approval gating, not in I/O.
struct AcknowledgeHandler {
    note: &'static str,
}
#[async_trait]
impl Handler for AcknowledgeHandler {
    async fn handle(&self, task: &Task) -> Result<HandlerOutcome, TaskError> {
        Ok(HandlerOutcome {
            result: TaskResult { data: serde_json::json!({"note": self.note, "task": task.title}) },
            cost_usd: nominal_cost(task),
        })
    }
}

/// Static registry of `Handler`s keyed by `Task.kind`.
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new(search: Arc<dyn Search>, synthesize: Arc<dyn Synthesize>, knowledge_store: Arc<dyn KnowledgeStore>, vcs: Arc<dyn Vcs>) -> Self {
        let mut handlers: HashMap<&'static str, Arc<dyn Handler>> = HashMap::new();
        handlers.insert("search", Arc::new(SearchHandler(search)));
        handlers.insert("synthesize", Arc::new(SynthesizeHandler(synthesize)));
        handlers.insert("kb_write", Arc::new(KbWriteHandler(knowledge_store)));
        handlers.insert("commit", Arc::new(CommitHandler(vcs)));
        handlers.insert("research", Arc::new(AcknowledgeHandler { note: "research complete" }));
        handlers.insert("update_guide", Arc::new(AcknowledgeHandler { note: "guide updated" }));
        handlers.insert("analyze", Arc::new(AcknowledgeHandler { note: "analysis complete" }));
        handlers.insert("document", Arc::new(AcknowledgeHandler { note: "documentation complete" }));
        handlers.insert("quote", Arc::new(AcknowledgeHandler { note: "quote obtained" }));
        handlers.insert("decide", Arc::new(AcknowledgeHandler { note: "decision recorded" }));
        handlers.insert("order", Arc::new(AcknowledgeHandler { note: "order placed" }));
        handlers.insert("cad", Arc::new(AcknowledgeHandler { note: "cad model ready" }));
        handlers.insert("review_safety", Arc::new(AcknowledgeHandler { note: "safety review passed" }));
        handlers.insert("queue_print", Arc::new(AcknowledgeHandler { note: "queued for printing" }));
        Self { handlers }
    }

    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(kind).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{SimulatedKnowledgeStore, SimulatedSearch, SimulatedSynthesize, SimulatedVcs};
    use crate::domain::models::TaskPriority;
    use chrono::Utc;
    use uuid::Uuid;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new(Arc::new(SimulatedSearch), Arc::new(SimulatedSynthesize), Arc::new(SimulatedKnowledgeStore), Arc::new(SimulatedVcs))
    }

    fn task(kind: &str) -> Task {
        Task::new(Uuid::new_v4(), kind, "Do the thing", TaskPriority::Medium, vec![], Usd::from_dollars(2.0), 3, Utc::now())
    }

    #[tokio::test]
    async fn search_handler_reports_cost_and_results() {
        let reg = registry();
        let handler = reg.get("search").unwrap();
        let outcome = handler.handle(&task("search")).await.unwrap();
        assert_eq!(outcome.cost_usd, Usd::from_dollars(1.0));
        assert!(outcome.result.data["results"].is_array());
    }

    #[tokio::test]
    async fn unknown_kind_has_no_handler() {
        let reg = registry();
        assert!(reg.get("unknown_kind").is_none());
    }

    #[tokio::test]
    async fn queue_print_handler_acknowledges() {
        let reg = registry();
        let handler = reg.get("queue_print").unwrap();
        let outcome = handler.handle(&task("queue_print")).await.unwrap();
        assert_eq!(outcome.result.data["note"], "queued for printing");
    }
}
