//! Application lifecycle: builds every component in dependency order and
//! drives the scheduler tick loop and HTTP surface until shutdown.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;

use crate::approval_gate::{ApprovalGate, AutoApprovePolicy};
use crate::audit::AuditLog;
use crate::capabilities::{SimulatedKnowledgeStore, SimulatedSearch, SimulatedSynthesize, SimulatedTelemetry, SimulatedVcs};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connection_pool::ConnectionPool;
use crate::domain::ports::Store;
use crate::feedback_loop::{FeedbackLoop, FeedbackLoopConfig};
use crate::handlers::HandlerRegistry;
use crate::http::{self, AppState};
use crate::jobs::{
    DailyHealthJob, FleetHealthJob, KnowledgeRefreshJob, OpportunityCycleJob, OutcomeMeasurementJob, ProjectGenerationJob, TaskExecutionJob,
};
use crate::opportunity_detector::{OpportunityDetector, OpportunityDetectorConfig};
use crate::outcome_tracker::{OutcomeTracker, OutcomeTrackerConfig};
use crate::project_generator::ProjectGenerator;
use crate::resource_manager::{ResourceManager, ResourceManagerConfig, SysinfoHostMetrics, WorkloadClass};
use crate::scheduler::{JobSpec, Scheduler, SchedulerConfig, Trigger};
use crate::store::{initialize_database, SqliteStore};
use crate::task_executor::{TaskExecutor, TaskExecutorConfig};

/// Owns every long-lived component and the background tasks driving them.
/// Constructed once at startup; `run` blocks until a shutdown signal is
/// received.
pub struct Application {
    scheduler: Arc<Scheduler>,
    http_state: Arc<AppState>,
    http_bind: String,
    audit_handle: tokio::task::JoinHandle<()>,
}

impl Application {
    pub async fn bootstrap(config: Config) -> anyhow::Result<Self> {
        let database_url = format!("sqlite:{}", config.database_path);
        let pool = initialize_database(&database_url).await.context("failed to initialize database")?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (audit, audit_handle) = AuditLog::spawn(store.clone(), clock.clone());
        let audit = Arc::new(audit);

        let host_metrics = Arc::new(SysinfoHostMetrics::new(clock.clone()));
        let resource_manager = Arc::new(ResourceManager::new(
            ResourceManagerConfig {
                daily_budget_usd: config.daily_budget_usd,
                idle_threshold_min: config.idle_threshold_min,
                cpu_ceiling_pct: config.cpu_ceiling_pct,
                mem_ceiling_pct: config.mem_ceiling_pct,
            },
            store.clone(),
            host_metrics,
            clock.clone(),
        ));

        let connection_pool = Arc::new(ConnectionPool::new(config.pool_defaults.to_pool_defaults(), clock.clone()));

        let feedback = Arc::new(FeedbackLoop::new(
            FeedbackLoopConfig { sample_window: 20, min_samples: config.feedback_min_samples, pivot: 70.0, bounds: config.adjustment_bounds },
            store.clone(),
        ));

        let knowledge_store = Arc::new(SimulatedKnowledgeStore);
        let telemetry = Arc::new(SimulatedTelemetry);

        let opportunity_detector = Arc::new(OpportunityDetector::new(
            OpportunityDetectorConfig {
                lookback_days: config.lookback_days,
                min_pattern_count: config.min_pattern_count,
                min_impact_score: config.min_impact_score,
                weights: config.strategy_weights,
                ..OpportunityDetectorConfig::default()
            },
            store.clone(),
            clock.clone(),
            audit.clone(),
            feedback,
            telemetry,
            knowledge_store.clone(),
        ));

        let approval_gate = Arc::new(ApprovalGate::new(AutoApprovePolicy::default(), store.clone(), clock.clone(), audit.clone()));

        let project_generator = Arc::new(ProjectGenerator::new(store.clone(), clock.clone(), audit.clone()));

        let handlers = Arc::new(HandlerRegistry::new(Arc::new(SimulatedSearch), Arc::new(SimulatedSynthesize), knowledge_store, Arc::new(SimulatedVcs)));

        let overspend_tolerance = config
            .overspend_tolerance
            .iter()
            .filter_map(|(kind, tolerance)| crate::domain::models::GoalKind::from_str(kind).map(|k| (k, *tolerance)))
            .collect();

        let task_executor = Arc::new(TaskExecutor::new(
            TaskExecutorConfig {
                retry_max_backoff: config.retry_defaults.max_backoff,
                overspend_tolerance,
                default_overspend_tolerance: config.default_overspend_tolerance,
                ..TaskExecutorConfig::default()
            },
            store.clone(),
            clock.clone(),
            audit.clone(),
            handlers,
        ));

        let outcome_tracker = Arc::new(OutcomeTracker::new(
            OutcomeTrackerConfig { measurement_window_days: config.measurement_window_days, ..OutcomeTrackerConfig::default() },
            store.clone(),
            clock.clone(),
            audit.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig {
                maintenance_window_start_hour: config.maintenance_window.start_hour,
                maintenance_window_end_hour: config.maintenance_window.end_hour,
                maintenance_window_zone: config.maintenance_window.zone,
                full_time_mode: config.full_time_mode,
                ..SchedulerConfig::default()
            },
            resource_manager,
            clock.clone(),
            audit.clone(),
        ));

        register_jobs(&scheduler, connection_pool.clone(), opportunity_detector, approval_gate.clone(), project_generator, task_executor, outcome_tracker).await;

        let http_state = Arc::new(AppState { store, approval_gate, scheduler: scheduler.clone(), connection_pool });

        Ok(Self { scheduler, http_state, http_bind: config.http_bind, audit_handle })
    }

    /// Drives the scheduler tick loop and HTTP surface until `shutdown`
    /// resolves, then waits for the audit writer to drain.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let router = http::build_router(self.http_state);
        let listener = tokio::net::TcpListener::bind(&self.http_bind).await.context("failed to bind HTTP listener")?;
        tracing::info!(addr = %self.http_bind, "http surface listening");

        let scheduler = self.scheduler;
        let mut tick_interval = tokio::time::interval(StdDuration::from_secs(30));
        let (tick_stop_tx, mut tick_stop_rx) = tokio::sync::oneshot::channel::<()>();
        let tick_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tick_interval.tick() => scheduler.tick().await,
                    _ = &mut tick_stop_rx => break,
                }
            }
        });

        axum::serve(listener, router).with_graceful_shutdown(shutdown).await.context("http server error")?;

        let _ = tick_stop_tx.send(());
        let _ = tick_task.await;
        drop(self.audit_handle);
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn register_jobs(
    scheduler: &Scheduler,
    connection_pool: Arc<ConnectionPool>,
    opportunity_detector: Arc<OpportunityDetector>,
    approval_gate: Arc<ApprovalGate>,
    project_generator: Arc<ProjectGenerator>,
    task_executor: Arc<TaskExecutor>,
    outcome_tracker: Arc<OutcomeTracker>,
) {
    scheduler
        .register(
            JobSpec {
                name: "daily_health",
                trigger: Trigger::Cron { minute: 0, hour: 4, dow: None, zone: chrono_tz::UTC },
                workload: WorkloadClass::Scheduled,
                gated_by_maintenance_window: false,
            },
            Arc::new(DailyHealthJob(connection_pool.clone())),
        )
        .await;

    scheduler
        .register(
            JobSpec {
                name: "opportunity_cycle",
                trigger: Trigger::Cron { minute: 0, hour: 5, dow: Some(1), zone: chrono_tz::UTC },
                workload: WorkloadClass::Scheduled,
                gated_by_maintenance_window: false,
            },
            Arc::new(OpportunityCycleJob(opportunity_detector)),
        )
        .await;

    scheduler
        .register(
            JobSpec {
                name: "knowledge_refresh",
                trigger: Trigger::Cron { minute: 0, hour: 6, dow: Some(1), zone: chrono_tz::UTC },
                workload: WorkloadClass::Scheduled,
                gated_by_maintenance_window: false,
            },
            Arc::new(KnowledgeRefreshJob(approval_gate)),
        )
        .await;

    scheduler
        .register(
            JobSpec {
                name: "fleet_health",
                trigger: Trigger::Interval { period: StdDuration::from_secs(4 * 3600), jitter: StdDuration::from_secs(120) },
                workload: WorkloadClass::Scheduled,
                gated_by_maintenance_window: false,
            },
            Arc::new(FleetHealthJob(connection_pool)),
        )
        .await;

    scheduler
        .register(
            JobSpec {
                name: "project_generation",
                trigger: Trigger::Interval { period: StdDuration::from_secs(4 * 3600), jitter: StdDuration::from_secs(60) },
                workload: WorkloadClass::Scheduled,
                gated_by_maintenance_window: true,
            },
            Arc::new(ProjectGenerationJob { generator: project_generator, outcomes: outcome_tracker.clone() }),
        )
        .await;

    scheduler
        .register(
            JobSpec {
                name: "task_execution",
                trigger: Trigger::Interval { period: StdDuration::from_secs(15 * 60), jitter: StdDuration::from_secs(30) },
                workload: WorkloadClass::Scheduled,
                gated_by_maintenance_window: true,
            },
            Arc::new(TaskExecutionJob(task_executor)),
        )
        .await;

    scheduler
        .register(
            JobSpec {
                name: "outcome_measurement",
                trigger: Trigger::Cron { minute: 0, hour: 6, dow: None, zone: chrono_tz::UTC },
                workload: WorkloadClass::Scheduled,
                gated_by_maintenance_window: false,
            },
            Arc::new(OutcomeMeasurementJob(outcome_tracker)),
        )
        .await;
}
