//! C6: Scheduler — job registry and trigger loop (`spec.md` §4.6).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};

use crate::audit::AuditLog;
use crate::clock::{in_window, Clock};
use crate::domain::models::Actor;
use crate::resource_manager::{ResourceManager, WorkloadClass};

#[derive(Debug, Clone)]
pub enum Trigger {
    /// `(minute, hour, day-of-week)` in `zone`; `dow` is `0 = Sunday`.
    Cron { minute: u32, hour: u32, dow: Option<u32>, zone: Tz },
    Interval { period: StdDuration, jitter: StdDuration },
}

impl Trigger {
    fn is_due(&self, job_name: &str, now: DateTime<Utc>, last_fired: Option<DateTime<Utc>>) -> bool {
        match *self {
            Trigger::Cron { minute, hour, dow, zone } => {
                let local = now.with_timezone(&zone);
                if let Some(dow) = dow {
                    if local.weekday().num_days_from_sunday() != dow {
                        return false;
                    }
                }
                let Some(scheduled_local) = zone
                    .with_ymd_and_hms(local.year(), local.month(), local.day(), hour, minute, 0)
                    .single()
                else {
                    return false;
                };
                let scheduled_utc = scheduled_local.with_timezone(&Utc);
                if now < scheduled_utc {
                    return false;
                }
                last_fired.is_none_or(|lf| lf < scheduled_utc)
            }
            Trigger::Interval { period, jitter } => {
                let offset = jitter_offset(job_name, jitter);
                let period = chrono::Duration::from_std(period).unwrap_or_default() + offset;
                last_fired.is_none_or(|lf| now >= lf + period)
            }
        }
    }
}

fn jitter_offset(job_name: &str, jitter: StdDuration) -> chrono::Duration {
    if jitter.is_zero() {
        return chrono::Duration::zero();
    }
    let mut hasher = DefaultHasher::new();
    job_name.hash(&mut hasher);
    let millis = (hasher.finish() % jitter.as_millis().max(1) as u64) as i64;
    chrono::Duration::milliseconds(millis)
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: &'static str,
    pub trigger: Trigger,
    pub workload: WorkloadClass,
    pub gated_by_maintenance_window: bool,
}

pub struct JobContext {
    pub clock: Arc<dyn Clock>,
    pub deadline: DateTime<Utc>,
}

#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LastStatus {
    Succeeded,
    Failed,
    Skipped,
}

struct JobRuntime {
    spec: JobSpec,
    job: Arc<dyn Job>,
    running: Arc<AtomicBool>,
    last_fired: RwLock<Option<DateTime<Utc>>>,
    last_status: Arc<RwLock<Option<LastStatus>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub trigger: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<LastStatus>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub maintenance_window_start_hour: u32,
    pub maintenance_window_end_hour: u32,
    pub maintenance_window_zone: Tz,
    pub full_time_mode: bool,
    pub worker_pool_size: usize,
    pub backlog_capacity: usize,
    pub job_deadline: StdDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            maintenance_window_start_hour: 4,
            maintenance_window_end_hour: 6,
            maintenance_window_zone: chrono_tz::UTC,
            full_time_mode: false,
            worker_pool_size: 4,
            backlog_capacity: 8,
            job_deadline: StdDuration::from_secs(900),
        }
    }
}

/// Registry + trigger loop (`spec.md` §4.6). Non-reentrant per job, bounded
/// worker pool with a bounded backlog beyond which ticks are dropped.
pub struct Scheduler {
    config: SchedulerConfig,
    jobs: RwLock<Vec<JobRuntime>>,
    resource_manager: Arc<ResourceManager>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    worker_semaphore: Arc<Semaphore>,
    backlog_count: Arc<AtomicUsize>,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig, resource_manager: Arc<ResourceManager>, clock: Arc<dyn Clock>, audit: Arc<AuditLog>) -> Self {
        let worker_semaphore = Arc::new(Semaphore::new(config.worker_pool_size));
        Self {
            config,
            jobs: RwLock::new(Vec::new()),
            resource_manager,
            clock,
            audit,
            worker_semaphore,
            backlog_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn register(&self, spec: JobSpec, job: Arc<dyn Job>) {
        let mut jobs = self.jobs.write().await;
        jobs.push(JobRuntime {
            spec,
            job,
            running: Arc::new(AtomicBool::new(false)),
            last_fired: RwLock::new(None),
            last_status: Arc::new(RwLock::new(None)),
        });
    }

    /// One scheduler tick: checks every registered job's trigger and
    /// dispatches the ones that are due, subject to non-reentrance,
    /// maintenance-window gating, and resource admission.
    pub async fn tick(&self) {
        let now = self.clock.now();
        let jobs = self.jobs.read().await;
        for runtime in jobs.iter() {
            let last_fired = *runtime.last_fired.read().await;
            if !runtime.spec.trigger.is_due(runtime.spec.name, now, last_fired) {
                continue;
            }

            if runtime.running.swap(true, Ordering::AcqRel) {
                self.audit.emit(Actor::System, "scheduler_job_dropped_non_reentrant", None, serde_json::json!({"job": runtime.spec.name}), now);
                continue;
            }

            if runtime.spec.gated_by_maintenance_window && !self.config.full_time_mode {
                let in_window = in_window(now, self.config.maintenance_window_start_hour, self.config.maintenance_window_end_hour, &self.config.maintenance_window_zone);
                if !in_window {
                    runtime.running.store(false, Ordering::Release);
                    *runtime.last_status.write().await = Some(LastStatus::Skipped);
                    self.audit.emit(Actor::System, "scheduler_job_skipped_maintenance_window", None, serde_json::json!({"job": runtime.spec.name}), now);
                    continue;
                }
            }

            let decision = self.resource_manager.admit(runtime.spec.workload).await;
            if !decision.allow {
                runtime.running.store(false, Ordering::Release);
                *runtime.last_status.write().await = Some(LastStatus::Skipped);
                self.audit.emit(
                    Actor::System,
                    "scheduler_job_denied_admission",
                    None,
                    serde_json::json!({"job": runtime.spec.name, "reason": decision.reason}),
                    now,
                );
                continue;
            }

            *runtime.last_fired.write().await = Some(now);
            self.dispatch(runtime, now).await;
        }
    }

    async fn dispatch(&self, runtime: &JobRuntime, now: DateTime<Utc>) {
        let job = runtime.job.clone();
        let running = runtime.running.clone();
        let last_status = runtime.last_status.clone();
        let name = runtime.spec.name;
        let clock = self.clock.clone();
        let audit = self.audit.clone();
        let deadline = now + chrono::Duration::from_std(self.config.job_deadline).unwrap_or_default();

        let run = move |permit: tokio::sync::OwnedSemaphorePermit| async move {
            let outcome = job.run(JobContext { clock: clock.clone(), deadline }).await;
            running.store(false, Ordering::Release);
            match &outcome {
                Ok(()) => {
                    *last_status.write().await = Some(LastStatus::Succeeded);
                    audit.emit(Actor::Job(name.to_string()), "job_succeeded", None, serde_json::json!({}), clock.now());
                }
                Err(err) => {
                    *last_status.write().await = Some(LastStatus::Failed);
                    audit.emit(Actor::Job(name.to_string()), "job_failed", None, serde_json::json!({"error": err.to_string()}), clock.now());
                }
            }
            drop(permit);
        };

        if let Ok(permit) = self.worker_semaphore.clone().try_acquire_owned() {
            tokio::spawn(run(permit));
        } else if self.backlog_count.fetch_add(1, Ordering::AcqRel) < self.config.backlog_capacity {
            let semaphore = self.worker_semaphore.clone();
            let backlog_count = self.backlog_count.clone();
            tokio::spawn(async move {
                let permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                backlog_count.fetch_sub(1, Ordering::AcqRel);
                run(permit).await;
            });
        } else {
            self.backlog_count.fetch_sub(1, Ordering::AcqRel);
            runtime.running.store(false, Ordering::Release);
            self.audit.emit(Actor::System, "scheduler_backlog_full", None, serde_json::json!({"job": runtime.spec.name}), now);
        }
    }

    pub async fn job_statuses(&self) -> Vec<JobStatus> {
        let jobs = self.jobs.read().await;
        let mut statuses = Vec::with_capacity(jobs.len());
        for runtime in jobs.iter() {
            statuses.push(JobStatus {
                name: runtime.spec.name.to_string(),
                trigger: match &runtime.spec.trigger {
                    Trigger::Cron { .. } => "cron".to_string(),
                    Trigger::Interval { .. } => "interval".to_string(),
                },
                next_run_at: None,
                last_run_at: *runtime.last_fired.read().await,
                last_status: *runtime.last_status.read().await,
            });
        }
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::domain::ports::Store;
    use crate::resource_manager::{HostMetrics, HostSnapshot, ResourceManagerConfig};
    use chrono::TimeZone;
    use std::sync::atomic::AtomicU32;

    struct CountingJob(Arc<AtomicU32>, StdDuration);

    #[async_trait]
    impl Job for CountingJob {
        async fn run(&self, _ctx: JobContext) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.1).await;
            Ok(())
        }
    }

    struct AlwaysIdleHost;
    #[async_trait]
    impl HostMetrics for AlwaysIdleHost {
        async fn snapshot(&self) -> HostSnapshot {
            HostSnapshot { cpu_pct: 1.0, mem_pct: 1.0, idle_min: 60 }
        }
    }

    #[tokio::test]
    async fn scheduler_non_reentrant_drops_overlapping_tick() {
        let clock = Arc::new(VirtualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let count = Arc::new(AtomicU32::new(0));
        let job = Arc::new(CountingJob(count.clone(), StdDuration::from_millis(200)));

        // Minimal in-memory store stub via the sqlite test pool keeps this test self-contained.
        let pool = crate::store::create_migrated_test_pool().await.unwrap();
        let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::new(pool));
        let rm = Arc::new(ResourceManager::new(ResourceManagerConfig::default(), store.clone(), Arc::new(AlwaysIdleHost), clock.clone() as Arc<dyn Clock>));
        let (audit, _handle) = AuditLog::spawn(store, clock.clone() as Arc<dyn Clock>);
        let scheduler = Scheduler::new(SchedulerConfig::default(), rm, clock.clone() as Arc<dyn Clock>, Arc::new(audit));

        scheduler
            .register(
                JobSpec { name: "fleet_health", trigger: Trigger::Interval { period: StdDuration::from_secs(1), jitter: StdDuration::ZERO }, workload: WorkloadClass::Scheduled, gated_by_maintenance_window: false },
                job,
            )
            .await;

        scheduler.tick().await;
        scheduler.tick().await;
        tokio::time::sleep(StdDuration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cron_trigger_fires_once_per_slot() {
        let zone = chrono_tz::UTC;
        let trigger = Trigger::Cron { minute: 0, hour: 4, dow: None, zone };
        let before = Utc.with_ymd_and_hms(2026, 1, 1, 3, 59, 0).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 4, 0, 0).unwrap();
        assert!(!trigger.is_due("daily_health", before, None));
        assert!(trigger.is_due("daily_health", at, None));
        assert!(!trigger.is_due("daily_health", at, Some(at)));
    }
}
