//! Goal — a proposed unit of autonomous work (`spec.md` §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::OpsError;
use crate::domain::money::Usd;

/// The kind of autonomous work a goal represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalKind {
    Research,
    Improvement,
    Optimization,
    Fabrication,
    Procurement,
}

impl GoalKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Improvement => "improvement",
            Self::Optimization => "optimization",
            Self::Fabrication => "fabrication",
            Self::Procurement => "procurement",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "research" => Some(Self::Research),
            "improvement" => Some(Self::Improvement),
            "optimization" => Some(Self::Optimization),
            "fabrication" => Some(Self::Fabrication),
            "procurement" => Some(Self::Procurement),
            _ => None,
        }
    }
}

/// Goal lifecycle status. Transitions are monotonic:
/// `identified -> (approved|rejected) -> completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Identified,
    Approved,
    Rejected,
    Completed,
}

impl GoalStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Identified => "identified",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "identified" => Some(Self::Identified),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Whether this status is at or past `approved` in the monotonic order.
    #[must_use]
    pub const fn at_least_approved(self) -> bool {
        matches!(self, Self::Approved | Self::Completed)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Completed)
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Identified, Self::Approved)
                | (Self::Identified, Self::Rejected)
                | (Self::Approved, Self::Completed)
        )
    }
}

/// A proposed unit of autonomous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub kind: GoalKind,
    pub description: String,
    pub rationale: String,
    pub estimated_budget_usd: Usd,
    pub estimated_duration_h: f64,
    pub status: GoalStatus,
    pub impact_score: f64,
    pub source_tag: String,
    pub metadata: HashMap<String, String>,
    pub identified_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub approval_notes: Option<String>,
    pub effectiveness_score: Option<f64>,
    pub outcome_measured_at: Option<DateTime<Utc>>,
    pub learn_from: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Goal {
    #[must_use]
    pub fn new(
        kind: GoalKind,
        description: impl Into<String>,
        source_tag: impl Into<String>,
        impact_score: f64,
        metadata: HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            description: description.into(),
            rationale: String::new(),
            estimated_budget_usd: Usd::ZERO,
            estimated_duration_h: 0.0,
            status: GoalStatus::Identified,
            impact_score: impact_score.clamp(0.0, 100.0),
            source_tag: source_tag.into(),
            metadata,
            identified_at: now,
            approved_at: None,
            approved_by: None,
            approval_notes: None,
            effectiveness_score: None,
            outcome_measured_at: None,
            learn_from: true,
            completed_at: None,
            version: 1,
        }
    }

    /// Applies a monotonic status transition, validating it against
    /// `identified -> (approved|rejected) -> completed` and maintaining the
    /// `approved_at` iff `status >= approved` invariant.
    pub fn transition_to(
        &mut self,
        next: GoalStatus,
        now: DateTime<Utc>,
        actor: Option<&str>,
        notes: Option<&str>,
    ) -> Result<(), OpsError> {
        if !self.status.can_transition_to(next) {
            return Err(OpsError::InvalidState(format!(
                "goal {} cannot transition {} -> {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }

        if next == GoalStatus::Approved {
            self.approved_at = Some(now);
            self.approved_by = actor.map(str::to_string);
            self.approval_notes = notes.map(str::to_string);
        }
        if next == GoalStatus::Completed {
            self.completed_at = Some(now);
        }

        self.status = next;
        self.version += 1;
        Ok(())
    }

    #[must_use]
    pub fn eligible_for_measurement(&self, now: DateTime<Utc>, window_days: i64) -> bool {
        self.status == GoalStatus::Completed
            && self
                .completed_at
                .is_some_and(|ts| (now.date_naive() - ts.date_naive()).num_days() == window_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn new_goal_starts_identified() {
        let g = Goal::new(GoalKind::Research, "desc", "failure_pattern", 68.0, HashMap::new(), now());
        assert_eq!(g.status, GoalStatus::Identified);
        assert!(g.approved_at.is_none());
    }

    #[test]
    fn approve_then_complete_succeeds() {
        let mut g = Goal::new(GoalKind::Research, "desc", "tag", 50.0, HashMap::new(), now());
        g.transition_to(GoalStatus::Approved, now(), Some("alice"), None).unwrap();
        assert!(g.status.at_least_approved());
        assert_eq!(g.approved_by.as_deref(), Some("alice"));

        g.transition_to(GoalStatus::Completed, now(), None, None).unwrap();
        assert!(g.status.is_terminal());
        assert!(g.completed_at.is_some());
    }

    #[test]
    fn reject_is_terminal_and_skips_completed() {
        let mut g = Goal::new(GoalKind::Research, "desc", "tag", 50.0, HashMap::new(), now());
        g.transition_to(GoalStatus::Rejected, now(), Some("bob"), Some("no")).unwrap();
        assert!(g.status.is_terminal());
        assert!(g.transition_to(GoalStatus::Completed, now(), None, None).is_err());
    }

    #[test]
    fn out_of_order_transition_rejected() {
        let mut g = Goal::new(GoalKind::Research, "desc", "tag", 50.0, HashMap::new(), now());
        let err = g.transition_to(GoalStatus::Completed, now(), None, None).unwrap_err();
        assert!(matches!(err, OpsError::InvalidState(_)));
    }

    #[test]
    fn impact_score_clamped() {
        let g = Goal::new(GoalKind::Research, "desc", "tag", 150.0, HashMap::new(), now());
        assert!((g.impact_score - 100.0).abs() < f64::EPSILON);
        let g2 = Goal::new(GoalKind::Research, "desc", "tag", -10.0, HashMap::new(), now());
        assert!((g2.impact_score - 0.0).abs() < f64::EPSILON);
    }
}
