//! Standard scheduler jobs registered at startup (`spec.md` §4.6 table).
//! Each wraps one already-built component; the job's only responsibility
//! is adapting that component's `Result` into the `Job` trait.

use std::sync::Arc;

use async_trait::async_trait;

use crate::approval_gate::ApprovalGate;
use crate::connection_pool::ConnectionPool;
use crate::opportunity_detector::OpportunityDetector;
use crate::outcome_tracker::OutcomeTracker;
use crate::project_generator::ProjectGenerator;
use crate::scheduler::{Job, JobContext};
use crate::task_executor::TaskExecutor;

/// `daily_health`: sweeps expired connection pool entries (`spec.md` §4.4
/// idle expiry), a liveness cross-check independent of `fleet_health`'s
/// 4-hourly cadence.
pub struct DailyHealthJob(pub Arc<ConnectionPool>);
#[async_trait]
impl Job for DailyHealthJob {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<()> {
        self.0.sweep_idle().await;
        Ok(())
    }
}

/// `opportunity_cycle`: runs the three detection strategies (C7).
pub struct OpportunityCycleJob(pub Arc<OpportunityDetector>);
#[async_trait]
impl Job for OpportunityCycleJob {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<()> {
        self.0.detect().await?;
        Ok(())
    }
}

/// `knowledge_refresh`: auto-approves aged `research` goals so their
/// knowledge-gap work reaches `project_generation` without waiting on a
/// human (`spec.md` §4.8's optional auto-approve policy, scheduled weekly
/// alongside the detector that produces most `research` goals).
pub struct KnowledgeRefreshJob(pub Arc<ApprovalGate>);
#[async_trait]
impl Job for KnowledgeRefreshJob {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<()> {
        self.0.run_auto_approve().await?;
        Ok(())
    }
}

/// `fleet_health`: the 4-hourly connection pool idle-expiry sweep
/// (`spec.md` §4.4).
pub struct FleetHealthJob(pub Arc<ConnectionPool>);
#[async_trait]
impl Job for FleetHealthJob {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<()> {
        self.0.sweep_idle().await;
        Ok(())
    }
}

/// `project_generation`: projectises every approved goal (C9), then
/// captures baselines for any goal newly eligible (C12's approval-time
/// snapshot happens on the same cadence since both key off `approved`
/// goals).
pub struct ProjectGenerationJob {
    pub generator: Arc<ProjectGenerator>,
    pub outcomes: Arc<OutcomeTracker>,
}
#[async_trait]
impl Job for ProjectGenerationJob {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<()> {
        self.outcomes.capture_baselines().await?;
        self.generator.run().await?;
        Ok(())
    }
}

/// `task_execution`: claims and drives ready tasks (C10).
pub struct TaskExecutionJob(pub Arc<TaskExecutor>);
#[async_trait]
impl Job for TaskExecutionJob {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<()> {
        self.0.run_once().await?;
        Ok(())
    }
}

/// `outcome_measurement`: daily effectiveness measurement pass (C12).
pub struct OutcomeMeasurementJob(pub Arc<OutcomeTracker>);
#[async_trait]
impl Job for OutcomeMeasurementJob {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<()> {
        self.0.run_measurement().await?;
        Ok(())
    }
}
