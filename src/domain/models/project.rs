//! Project — durable plan generated from an approved goal (`spec.md` §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::OpsError;
use crate::domain::money::Usd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Proposed,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl ProjectStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "proposed" => Some(Self::Proposed),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Default overspend tolerance: `budget_spent <= budget_allocated * 1.0`.
pub const DEFAULT_OVERSPEND_TOLERANCE: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub goal_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: ProjectStatus,
    pub budget_allocated_usd: Usd,
    pub budget_spent_usd: Usd,
    pub actual_duration_h: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Project {
    #[must_use]
    pub fn new(goal_id: Uuid, title: impl Into<String>, budget_allocated_usd: Usd, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal_id,
            title: title.into(),
            description: String::new(),
            status: ProjectStatus::Proposed,
            budget_allocated_usd,
            budget_spent_usd: Usd::ZERO,
            actual_duration_h: None,
            created_at: now,
            completed_at: None,
            version: 1,
        }
    }

    /// Records additional spend and enforces the overspend-tolerance
    /// invariant (`spec.md` §3 Project invariant).
    pub fn record_spend(&mut self, amount: Usd, tolerance: f64) -> Result<(), OpsError> {
        let new_total = self.budget_spent_usd + amount;
        self.budget_spent_usd = new_total;
        self.version += 1;
        if !new_total.within_tolerance(self.budget_allocated_usd, tolerance) {
            return Err(OpsError::BudgetExceeded(format!(
                "project {} spend {new_total} exceeds allocated {} at tolerance {tolerance}",
                self.id, self.budget_allocated_usd
            )));
        }
        Ok(())
    }

    /// Rolls the project to `completed` or `failed` based on terminal task
    /// outcomes, per §4.10 step 5. `all_completed_or_skipped` determines
    /// which terminal status applies; callers pass pre-computed task status
    /// aggregates from the Store.
    pub fn rollup(&mut self, all_completed_or_skipped: bool, now: DateTime<Utc>) {
        self.status = if all_completed_or_skipped {
            ProjectStatus::Completed
        } else {
            ProjectStatus::Failed
        };
        self.completed_at = Some(now);
        self.version += 1;
    }
}
