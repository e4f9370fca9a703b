//! BudgetLedger — append-only spend record (`spec.md` §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::money::Usd;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub project_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub amount_usd: Usd,
    pub reason: String,
}

impl LedgerEntry {
    #[must_use]
    pub fn new(
        project_id: Option<Uuid>,
        task_id: Option<Uuid>,
        amount_usd: Usd,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self { id: Uuid::new_v4(), ts: now, project_id, task_id, amount_usd, reason: reason.into() }
    }
}

/// A half-open `[start, end)` range used for daily/per-project sums.
#[derive(Debug, Clone, Copy)]
pub struct LedgerRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl LedgerRange {
    #[must_use]
    pub fn day_containing(ts: DateTime<Utc>) -> Self {
        let start = ts.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        let end = start + chrono::Duration::days(1);
        Self { start, end }
    }

    #[must_use]
    pub fn last_n_days(now: DateTime<Utc>, n: i64) -> Self {
        Self { start: now - chrono::Duration::days(n), end: now }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerFilter {
    pub project_id: Option<Uuid>,
}
