//! C8: ApprovalGate — human sign-off on identified goals (`spec.md` §4.8).

use std::sync::Arc;

use uuid::Uuid;

use crate::audit::AuditLog;
use crate::clock::Clock;
use crate::domain::models::{Actor, Goal, GoalKind, GoalStatus};
use crate::domain::ports::{GoalFilter, Store};
use crate::domain::{OpsError, OpsResult};

#[derive(Debug, Clone)]
pub struct AutoApprovePolicy {
    pub enabled: bool,
    pub auto_approve_age_h: f64,
}

impl Default for AutoApprovePolicy {
    /// Off by default (`spec.md` §4.8: "never applies to fabrication or
    /// procurement goals" even when enabled).
    fn default() -> Self {
        Self { enabled: false, auto_approve_age_h: 48.0 }
    }
}

/// Lists, approves, and rejects goals, with an optional age-based
/// auto-approve policy restricted to `research` goals (`spec.md` §4.8).
pub struct ApprovalGate {
    policy: AutoApprovePolicy,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
}

impl ApprovalGate {
    #[must_use]
    pub fn new(policy: AutoApprovePolicy, store: Arc<dyn Store>, clock: Arc<dyn Clock>, audit: Arc<AuditLog>) -> Self {
        Self { policy, store, clock, audit }
    }

    pub async fn list_pending(&self, limit: i64) -> OpsResult<Vec<Goal>> {
        Ok(self.store.list_goals(GoalFilter { status: Some(GoalStatus::Identified), kind: None }, limit).await?)
    }

    pub async fn get(&self, id: Uuid) -> OpsResult<Option<Goal>> {
        Ok(self.store.get_goal(id).await?)
    }

    pub async fn approve(&self, id: Uuid, actor: &str, notes: Option<&str>) -> OpsResult<Goal> {
        let mut goal = self.store.get_goal(id).await?.ok_or(OpsError::NotFound { entity: "goal", id })?;
        let now = self.clock.now();
        goal.transition_to(GoalStatus::Approved, now, Some(actor), notes)?;
        self.store.update_goal(&goal).await?;
        self.audit.emit(Actor::User(actor.to_string()), "goal_approved", Some(goal.id), serde_json::json!({"notes": notes}), now);
        Ok(goal)
    }

    pub async fn reject(&self, id: Uuid, actor: &str, notes: Option<&str>) -> OpsResult<Goal> {
        let mut goal = self.store.get_goal(id).await?.ok_or(OpsError::NotFound { entity: "goal", id })?;
        let now = self.clock.now();
        goal.transition_to(GoalStatus::Rejected, now, Some(actor), notes)?;
        self.store.update_goal(&goal).await?;
        self.audit.emit(Actor::User(actor.to_string()), "goal_rejected", Some(goal.id), serde_json::json!({"notes": notes}), now);
        Ok(goal)
    }

    /// Auto-approves eligible `research` goals older than
    /// `auto_approve_age_h`. Intended to be invoked by a scheduler job; a
    /// no-op when the policy is disabled or no goal qualifies.
    pub async fn run_auto_approve(&self) -> OpsResult<Vec<Goal>> {
        if !self.policy.enabled {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let pending = self.store.list_goals(GoalFilter { status: Some(GoalStatus::Identified), kind: Some(GoalKind::Research) }, 500).await?;

        let mut approved = Vec::new();
        for mut goal in pending {
            let age_h = (now - goal.identified_at).num_minutes() as f64 / 60.0;
            if age_h < self.policy.auto_approve_age_h {
                continue;
            }
            goal.transition_to(GoalStatus::Approved, now, Some("auto_approve_policy"), Some("age threshold exceeded"))?;
            self.store.update_goal(&goal).await?;
            self.audit.emit(Actor::System, "goal_auto_approved", Some(goal.id), serde_json::json!({"age_h": age_h}), now);
            approved.push(goal);
        }
        Ok(approved)
    }
}
