//! C5: ResourceManager — admission decisions from the budget ledger, host
//! metrics, and idle timers (`spec.md` §4.5).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::domain::models::{LedgerFilter, LedgerRange};
use crate::domain::ports::Store;
use crate::domain::Usd;

/// The declared class of a unit of work submitted to the Scheduler or
/// TaskExecutor (`spec.md` §4.5, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    Scheduled,
    Interactive,
    Research,
    Fabrication,
}

#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    pub daily_budget_usd: Usd,
    pub idle_threshold_min: i64,
    pub cpu_ceiling_pct: f32,
    pub mem_ceiling_pct: f32,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            daily_budget_usd: Usd::from_dollars(50.0),
            idle_threshold_min: 10,
            cpu_ceiling_pct: 80.0,
            mem_ceiling_pct: 85.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionDecision {
    pub allow: bool,
    pub reason: String,
}

impl AdmissionDecision {
    fn allow() -> Self {
        Self { allow: true, reason: "within budget and resource thresholds".to_string() }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self { allow: false, reason: reason.into() }
    }
}

/// Host CPU/memory/idle-time snapshot capability (`spec.md` §6).
#[async_trait]
pub trait HostMetrics: Send + Sync {
    async fn snapshot(&self) -> HostSnapshot;
}

#[derive(Debug, Clone, Copy)]
pub struct HostSnapshot {
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub idle_min: i64,
}

/// `sysinfo`-backed `HostMetrics`, in the style of the teacher's
/// `ResourceMonitor`. Idle time is tracked as "time since the last call to
/// `record_activity`" rather than OS input idle time, since this process has
/// no UI surface of its own.
pub struct SysinfoHostMetrics {
    system: RwLock<System>,
    last_activity: RwLock<DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl SysinfoHostMetrics {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let refresh = RefreshKind::new().with_cpu(CpuRefreshKind::everything()).with_memory(MemoryRefreshKind::everything());
        let now = clock.now();
        Self { system: RwLock::new(System::new_with_specifics(refresh)), last_activity: RwLock::new(now), clock }
    }

    pub async fn record_activity(&self) {
        *self.last_activity.write().await = self.clock.now();
    }
}

#[async_trait]
impl HostMetrics for SysinfoHostMetrics {
    async fn snapshot(&self) -> HostSnapshot {
        let (cpu_pct, mem_pct) = {
            let mut sys = self.system.write().await;
            sys.refresh_cpu_all();
            sys.refresh_memory();
            let mem_pct = if sys.total_memory() == 0 {
                0.0
            } else {
                (sys.used_memory() as f32 / sys.total_memory() as f32) * 100.0
            };
            (sys.global_cpu_usage(), mem_pct)
        };
        let idle_min = (self.clock.now() - *self.last_activity.read().await).num_minutes();
        HostSnapshot { cpu_pct, mem_pct, idle_min }
    }
}

/// Composes the budget ledger, host metrics, and idle tracking into a
/// single `AdmissionDecision` conjunction (`spec.md` §4.5).
pub struct ResourceManager {
    config: ResourceManagerConfig,
    store: Arc<dyn Store>,
    host: Arc<dyn HostMetrics>,
    clock: Arc<dyn Clock>,
}

impl ResourceManager {
    #[must_use]
    pub fn new(config: ResourceManagerConfig, store: Arc<dyn Store>, host: Arc<dyn HostMetrics>, clock: Arc<dyn Clock>) -> Self {
        Self { config, store, host, clock }
    }

    pub async fn admit(&self, workload: WorkloadClass) -> AdmissionDecision {
        let now = self.clock.now();

        let spent_today = match self.store.ledger_sum(LedgerRange::day_containing(now), LedgerFilter::default()).await {
            Ok(sum) => sum,
            Err(err) => return AdmissionDecision::deny(format!("ledger query failed: {err}")),
        };
        if !spent_today.within_tolerance(self.config.daily_budget_usd, 1.0) {
            return AdmissionDecision::deny(format!(
                "daily spend {spent_today} has reached the {} budget",
                self.config.daily_budget_usd
            ));
        }

        let snapshot = self.host.snapshot().await;

        if matches!(workload, WorkloadClass::Scheduled) && snapshot.idle_min < self.config.idle_threshold_min {
            return AdmissionDecision::deny(format!(
                "host idle for {} min, below {} min threshold",
                snapshot.idle_min, self.config.idle_threshold_min
            ));
        }

        if snapshot.cpu_pct > self.config.cpu_ceiling_pct {
            return AdmissionDecision::deny(format!("cpu at {:.1}% exceeds ceiling {:.1}%", snapshot.cpu_pct, self.config.cpu_ceiling_pct));
        }
        if snapshot.mem_pct > self.config.mem_ceiling_pct {
            return AdmissionDecision::deny(format!("memory at {:.1}% exceeds ceiling {:.1}%", snapshot.mem_pct, self.config.mem_ceiling_pct));
        }

        AdmissionDecision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::domain::models::{AuditEvent, Goal, GoalKind, GoalOutcome, GoalStatus, LedgerEntry, Project, Task};
    use crate::domain::ports::GoalFilter;
    use crate::domain::error::StoreResult;
    use uuid::Uuid;

    struct FakeHost(HostSnapshot);

    #[async_trait]
    impl HostMetrics for FakeHost {
        async fn snapshot(&self) -> HostSnapshot {
            self.0
        }
    }

    struct FakeStore {
        spent: Usd,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn create_goal(&self, _: &Goal) -> StoreResult<()> { Ok(()) }
        async fn get_goal(&self, _: Uuid) -> StoreResult<Option<Goal>> { Ok(None) }
        async fn update_goal(&self, _: &Goal) -> StoreResult<()> { Ok(()) }
        async fn list_goals(&self, _: GoalFilter, _: i64) -> StoreResult<Vec<Goal>> { Ok(vec![]) }
        async fn list_non_terminal_goals_by_source_tag(&self, _: &str) -> StoreResult<Vec<Goal>> { Ok(vec![]) }
        async fn goals_due_for_measurement(&self, _: DateTime<Utc>, _: i64) -> StoreResult<Vec<Goal>> { Ok(vec![]) }
        async fn find_approved_goals_without_project(&self) -> StoreResult<Vec<Goal>> { Ok(vec![]) }
        async fn create_project_with_tasks(&self, _: &Project, _: &[Task]) -> StoreResult<()> { Ok(()) }
        async fn get_project(&self, _: Uuid) -> StoreResult<Option<Project>> { Ok(None) }
        async fn get_project_by_goal(&self, _: Uuid) -> StoreResult<Option<Project>> { Ok(None) }
        async fn update_project(&self, _: &Project) -> StoreResult<()> { Ok(()) }
        async fn claim_ready_tasks(&self, _: i64, _: DateTime<Utc>) -> StoreResult<Vec<Task>> { Ok(vec![]) }
        async fn get_task(&self, _: Uuid) -> StoreResult<Option<Task>> { Ok(None) }
        async fn update_task(&self, _: &Task) -> StoreResult<()> { Ok(()) }
        async fn list_tasks_for_project(&self, _: Uuid) -> StoreResult<Vec<Task>> { Ok(vec![]) }
        async fn list_tasks_by_status_since(&self, _: crate::domain::models::TaskStatus, _: DateTime<Utc>, _: i64) -> StoreResult<Vec<Task>> { Ok(vec![]) }
        async fn ledger_append(&self, _: &LedgerEntry) -> StoreResult<()> { Ok(()) }
        async fn ledger_sum(&self, _: LedgerRange, _: LedgerFilter) -> StoreResult<Usd> { Ok(self.spent) }
        async fn record_outcome(&self, _: &GoalOutcome) -> StoreResult<()> { Ok(()) }
        async fn get_outcome(&self, _: Uuid) -> StoreResult<Option<GoalOutcome>> { Ok(None) }
        async fn recent_outcomes_by_kind(&self, _: GoalKind, _: i64) -> StoreResult<Vec<GoalOutcome>> { Ok(vec![]) }
        async fn append_audit_event(&self, _: &AuditEvent) -> StoreResult<()> { Ok(()) }
    }

    #[tokio::test]
    async fn denies_scheduled_work_when_host_not_idle_enough() {
        let rm = ResourceManager::new(
            ResourceManagerConfig::default(),
            Arc::new(FakeStore { spent: Usd::ZERO }),
            Arc::new(FakeHost(HostSnapshot { cpu_pct: 5.0, mem_pct: 5.0, idle_min: 1 })),
            Arc::new(SystemClock),
        );
        let decision = rm.admit(WorkloadClass::Scheduled).await;
        assert!(!decision.allow);
    }

    #[tokio::test]
    async fn denies_when_daily_budget_exhausted() {
        let rm = ResourceManager::new(
            ResourceManagerConfig { daily_budget_usd: Usd::from_dollars(10.0), ..Default::default() },
            Arc::new(FakeStore { spent: Usd::from_dollars(10.0) }),
            Arc::new(FakeHost(HostSnapshot { cpu_pct: 5.0, mem_pct: 5.0, idle_min: 60 })),
            Arc::new(SystemClock),
        );
        let decision = rm.admit(WorkloadClass::Interactive).await;
        assert!(!decision.allow);
    }

    #[tokio::test]
    async fn allows_when_all_thresholds_satisfied() {
        let rm = ResourceManager::new(
            ResourceManagerConfig::default(),
            Arc::new(FakeStore { spent: Usd::ZERO }),
            Arc::new(FakeHost(HostSnapshot { cpu_pct: 5.0, mem_pct: 5.0, idle_min: 60 })),
            Arc::new(SystemClock),
        );
        assert!(rm.admit(WorkloadClass::Scheduled).await.allow);
    }
}
