//! C13: FeedbackLoop — rolling per-kind effectiveness mean that scales
//! `OpportunityDetector` candidate scores (`spec.md` §4.13).

use std::sync::Arc;

use crate::domain::models::GoalKind;
use crate::domain::ports::Store;
use crate::domain::OpsResult;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct AdjustmentBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for AdjustmentBounds {
    fn default() -> Self {
        Self { min: 0.5, max: 1.5 }
    }
}

#[derive(Debug, Clone)]
pub struct FeedbackLoopConfig {
    pub sample_window: i64,
    pub min_samples: usize,
    pub pivot: f64,
    pub bounds: AdjustmentBounds,
}

impl Default for FeedbackLoopConfig {
    fn default() -> Self {
        Self { sample_window: 20, min_samples: 10, pivot: 70.0, bounds: AdjustmentBounds::default() }
    }
}

/// The slope mapping a rolling mean to an adjustment factor: every point of
/// mean effectiveness above/below the pivot moves the factor by this much.
/// Calibrated against `spec.md` S6 (mean 82.5 at the default pivot of 70
/// yields `adjustment(research) ≈ 1.15`).
const SLOPE_PER_POINT: f64 = 0.012;

/// Computes `adjustment(kind)` from the last `sample_window` outcomes per
/// goal kind (`spec.md` §4.13). Holds no state between calls; every call
/// re-reads the Store.
pub struct FeedbackLoop {
    config: FeedbackLoopConfig,
    store: Arc<dyn Store>,
}

impl FeedbackLoop {
    #[must_use]
    pub fn new(config: FeedbackLoopConfig, store: Arc<dyn Store>) -> Self {
        Self { config, store }
    }

    /// `1.0` (no adjustment) until at least `min_samples` outcomes exist for
    /// `kind`; otherwise the rolling mean mapped linearly around the pivot
    /// and clamped to `bounds`.
    pub async fn adjustment(&self, kind: GoalKind) -> OpsResult<f64> {
        let outcomes = self.store.recent_outcomes_by_kind(kind, self.config.sample_window).await?;
        if outcomes.len() < self.config.min_samples {
            return Ok(1.0);
        }

        let mean = outcomes.iter().map(|o| o.effectiveness_score).sum::<f64>() / outcomes.len() as f64;
        let factor = 1.0 + (mean - self.config.pivot) * SLOPE_PER_POINT;
        Ok(factor.clamp(self.config.bounds.min, self.config.bounds.max))
    }
}
