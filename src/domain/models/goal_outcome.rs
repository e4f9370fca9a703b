//! GoalOutcome — measurement record for a completed goal (`spec.md` §3, §4.12).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalOutcome {
    pub goal_id: Uuid,
    pub baseline_date: DateTime<Utc>,
    pub measurement_date: DateTime<Utc>,
    pub baseline_metrics: HashMap<String, f64>,
    pub outcome_metrics: HashMap<String, f64>,
    pub impact: f64,
    pub roi: f64,
    pub adoption: f64,
    pub quality: f64,
    pub effectiveness_score: f64,
    pub measurement_method: String,
    pub notes: String,
}

/// Sub-score weights for the combined effectiveness score (`spec.md` §4.12).
pub const IMPACT_WEIGHT: f64 = 0.40;
pub const ROI_WEIGHT: f64 = 0.30;
pub const ADOPTION_WEIGHT: f64 = 0.20;
pub const QUALITY_WEIGHT: f64 = 0.10;

impl GoalOutcome {
    /// Combines the four clamped sub-scores into `effectiveness_score`.
    #[must_use]
    pub fn compose(
        goal_id: Uuid,
        baseline_date: DateTime<Utc>,
        measurement_date: DateTime<Utc>,
        baseline_metrics: HashMap<String, f64>,
        outcome_metrics: HashMap<String, f64>,
        impact: f64,
        roi: f64,
        adoption: f64,
        quality: f64,
        measurement_method: impl Into<String>,
    ) -> Self {
        let impact = impact.clamp(0.0, 100.0);
        let roi = roi.clamp(0.0, 100.0);
        let adoption = adoption.clamp(0.0, 100.0);
        let quality = quality.clamp(0.0, 100.0);
        let effectiveness_score =
            IMPACT_WEIGHT * impact + ROI_WEIGHT * roi + ADOPTION_WEIGHT * adoption + QUALITY_WEIGHT * quality;

        Self {
            goal_id,
            baseline_date,
            measurement_date,
            baseline_metrics,
            outcome_metrics,
            impact,
            roi,
            adoption,
            quality,
            effectiveness_score,
            measurement_method: measurement_method.into(),
            notes: String::new(),
        }
    }
}
