//! C7: OpportunityDetector — turns recent operational history into
//! candidate `Goal`s (`spec.md` §4.7).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::audit::AuditLog;
use crate::capabilities::{KnowledgeStore, RoutingTier, Telemetry};
use crate::clock::Clock;
use crate::domain::models::{Actor, Goal, GoalKind};
use crate::domain::ports::Store;
use crate::domain::Usd;
use crate::feedback_loop::FeedbackLoop;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct StrategyWeights {
    pub frequency: f64,
    pub severity: f64,
    pub cost_savings: f64,
    pub knowledge_gap: f64,
    pub strategic_value: f64,
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self { frequency: 0.20, severity: 0.25, cost_savings: 0.20, knowledge_gap: 0.20, strategic_value: 0.15 }
    }
}

/// Strategy A tuning: failure-pattern goals, grouped by the free-form
/// `reason` on `task_failure` operational events (not `task.kind`).
#[derive(Debug, Clone)]
pub struct FailurePatternConfig {
    /// Failures/day at which `frequency` saturates to 1.0.
    pub frequency_ceiling_per_day: f64,
    /// Per-reason severity lookup; reasons absent here use `default_severity`.
    pub severity_table: HashMap<String, f64>,
    pub default_severity: f64,
    pub cost_per_failure_usd: Usd,
    pub cost_savings_ceiling_usd: Usd,
    pub knowledge_gap: f64,
    pub strategic_value: f64,
}

impl Default for FailurePatternConfig {
    fn default() -> Self {
        let mut severity_table = HashMap::new();
        severity_table.insert("first_layer".to_string(), 0.8);
        Self {
            frequency_ceiling_per_day: 0.2,
            severity_table,
            default_severity: 0.45,
            cost_per_failure_usd: Usd::from_dollars(5.0),
            cost_savings_ceiling_usd: Usd::from_dollars(50.0),
            knowledge_gap: 0.1,
            strategic_value: 0.6,
        }
    }
}

/// Strategy B tuning: knowledge-gap goals, one candidate per configured
/// domain entry that `KnowledgeStore.exists` reports missing.
#[derive(Debug, Clone)]
pub struct KnowledgeGapConfig {
    /// `(category, slug)` pairs the fleet expects the knowledge base to
    /// carry; each absent entry becomes a research-goal candidate.
    pub expected_entries: Vec<(String, String)>,
    pub frequency: f64,
    pub severity: f64,
    pub cost_savings: f64,
    pub knowledge_gap: f64,
    pub strategic_value: f64,
}

impl Default for KnowledgeGapConfig {
    fn default() -> Self {
        Self {
            expected_entries: vec![("materials".to_string(), "nylon".to_string())],
            frequency: 0.6,
            severity: 0.5,
            cost_savings: 0.3,
            knowledge_gap: 0.95,
            strategic_value: 0.9,
        }
    }
}

/// Strategy C tuning: cost-optimization goals, triggered when frontier-tier
/// routing spend dominates over the lookback window.
#[derive(Debug, Clone)]
pub struct CostOptimizationConfig {
    pub frontier_share_threshold: f64,
    pub frontier_cost_threshold_usd: Usd,
    pub severity_cost_ceiling_usd: Usd,
    pub cost_savings_ceiling_usd: Usd,
    pub knowledge_gap: f64,
    pub strategic_value: f64,
}

impl Default for CostOptimizationConfig {
    fn default() -> Self {
        Self {
            frontier_share_threshold: 0.30,
            frontier_cost_threshold_usd: Usd::from_dollars(5.0),
            severity_cost_ceiling_usd: Usd::from_dollars(5.0),
            cost_savings_ceiling_usd: Usd::from_dollars(25.0),
            knowledge_gap: 0.1,
            strategic_value: 0.9,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpportunityDetectorConfig {
    pub lookback_days: i64,
    pub min_pattern_count: u32,
    pub min_impact_score: f64,
    pub weights: StrategyWeights,
    pub failure_pattern: FailurePatternConfig,
    pub knowledge_gap: KnowledgeGapConfig,
    pub cost_optimization: CostOptimizationConfig,
}

impl Default for OpportunityDetectorConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            min_pattern_count: 3,
            min_impact_score: 40.0,
            weights: StrategyWeights::default(),
            failure_pattern: FailurePatternConfig::default(),
            knowledge_gap: KnowledgeGapConfig::default(),
            cost_optimization: CostOptimizationConfig::default(),
        }
    }
}

struct Candidate {
    source_tag: &'static str,
    kind: GoalKind,
    description: String,
    frequency: f64,
    severity: f64,
    cost_savings: f64,
    knowledge_gap: f64,
    strategic_value: f64,
    metadata: HashMap<String, String>,
    /// Narrows dedup below the coarse `source_tag`: a goal with the same
    /// `source_tag` only counts as a duplicate of this candidate if its
    /// metadata also carries a matching value for this key. `None` means
    /// any non-terminal goal with the same `source_tag` is a duplicate.
    discriminator: Option<(&'static str, String)>,
}

impl Candidate {
    fn impact_score(&self, w: StrategyWeights) -> f64 {
        let raw = w.frequency * self.frequency
            + w.severity * self.severity
            + w.cost_savings * self.cost_savings
            + w.knowledge_gap * self.knowledge_gap
            + w.strategic_value * self.strategic_value;
        (raw * 100.0).clamp(0.0, 100.0)
    }
}

/// Runs the three detection strategies and writes new, deduplicated `Goal`s
/// (`spec.md` §4.7). Holds no state between runs: every call re-reads the
/// lookback window from the Store/Telemetry/KnowledgeStore.
pub struct OpportunityDetector {
    config: OpportunityDetectorConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    feedback: Arc<FeedbackLoop>,
    telemetry: Arc<dyn Telemetry>,
    knowledge_store: Arc<dyn KnowledgeStore>,
}

impl OpportunityDetector {
    #[must_use]
    pub fn new(
        config: OpportunityDetectorConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        feedback: Arc<FeedbackLoop>,
        telemetry: Arc<dyn Telemetry>,
        knowledge_store: Arc<dyn KnowledgeStore>,
    ) -> Self {
        Self { config, store, clock, audit, feedback, telemetry, knowledge_store }
    }

    /// Runs all strategies once and returns the goals newly created.
    pub async fn detect(&self) -> anyhow::Result<Vec<Goal>> {
        let now = self.clock.now();
        let since = now - chrono::Duration::days(self.config.lookback_days);

        let mut candidates = Vec::new();
        candidates.extend(self.failure_pattern_candidates(since).await?);
        candidates.extend(self.knowledge_gap_candidates().await?);
        candidates.extend(self.cost_optimization_candidates(since).await?);

        let mut created = Vec::new();
        for candidate in candidates {
            let raw_score = candidate.impact_score(self.config.weights);
            let adjustment = self.feedback.adjustment(candidate.kind).await?;
            let impact_score = (raw_score * adjustment).clamp(0.0, 100.0);
            if impact_score < self.config.min_impact_score {
                continue;
            }

            let existing = self.store.list_non_terminal_goals_by_source_tag(candidate.source_tag).await?;
            let is_duplicate = match &candidate.discriminator {
                Some((key, value)) => existing.iter().any(|g| g.metadata.get(*key).is_some_and(|v| v == value)),
                None => !existing.is_empty(),
            };
            if is_duplicate {
                continue;
            }

            let goal = Goal::new(candidate.kind, candidate.description, candidate.source_tag, impact_score, candidate.metadata, now);
            self.store.create_goal(&goal).await?;
            self.audit.emit(
                Actor::System,
                "opportunity_detected",
                Some(goal.id),
                serde_json::json!({"source_tag": candidate.source_tag, "impact_score": impact_score}),
                now,
            );
            created.push(goal);
        }

        Ok(created)
    }

    /// Strategy A: repeated operational failures sharing the same free-form
    /// `reason` (e.g. `"first_layer"`) suggest an improvement goal to
    /// harden whatever step that reason names.
    async fn failure_pattern_candidates(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Candidate>> {
        let cfg = &self.config.failure_pattern;
        let events = self.telemetry.operational_history("task_failure", since).await?;

        let mut by_reason: HashMap<String, u32> = HashMap::new();
        for event in &events {
            *by_reason.entry(event.reason.clone()).or_default() += 1;
        }

        let mut candidates = Vec::new();
        for (reason, count) in by_reason {
            if count < self.config.min_pattern_count {
                continue;
            }
            let per_day = f64::from(count) / self.config.lookback_days.max(1) as f64;
            let frequency = (per_day / cfg.frequency_ceiling_per_day).min(1.0);
            let severity = cfg.severity_table.get(&reason).copied().unwrap_or(cfg.default_severity);
            let cost_savings = ((f64::from(count) * cfg.cost_per_failure_usd.as_dollars()) / cfg.cost_savings_ceiling_usd.as_dollars()).min(1.0);

            let mut metadata = HashMap::new();
            metadata.insert("reason".to_string(), reason.clone());
            metadata.insert("count".to_string(), count.to_string());

            candidates.push(Candidate {
                source_tag: "failure_pattern",
                kind: GoalKind::Improvement,
                description: format!("{reason} failures occurred {count} times in the last {} days; harden that step", self.config.lookback_days),
                frequency,
                severity,
                cost_savings,
                knowledge_gap: cfg.knowledge_gap,
                strategic_value: cfg.strategic_value,
                metadata,
                discriminator: Some(("reason", reason)),
            });
        }
        Ok(candidates)
    }

    /// Strategy B: a configured domain entry missing from the knowledge
    /// base suggests a research goal to fill it.
    async fn knowledge_gap_candidates(&self) -> anyhow::Result<Vec<Candidate>> {
        let cfg = &self.config.knowledge_gap;
        let mut candidates = Vec::new();
        for (category, slug) in &cfg.expected_entries {
            if self.knowledge_store.exists(category, slug).await? {
                continue;
            }

            let mut metadata = HashMap::new();
            metadata.insert("material".to_string(), slug.clone());
            metadata.insert("category".to_string(), category.clone());

            candidates.push(Candidate {
                source_tag: "knowledge_gap",
                kind: GoalKind::Research,
                description: format!("no knowledge base entry for {category}/{slug}; research and document it"),
                frequency: cfg.frequency,
                severity: cfg.severity,
                cost_savings: cfg.cost_savings,
                knowledge_gap: cfg.knowledge_gap,
                strategic_value: cfg.strategic_value,
                metadata,
                discriminator: Some(("material", slug.clone())),
            });
        }
        Ok(candidates)
    }

    /// Strategy C: when frontier-tier routing dominates spend over the
    /// lookback window, suggest an optimization goal to shift load to
    /// cheaper tiers.
    async fn cost_optimization_candidates(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Candidate>> {
        let cfg = &self.config.cost_optimization;
        let events = self.telemetry.operational_history("routing_spend", since).await?;

        let mut total_cost = Usd::ZERO;
        let mut frontier_cost = Usd::ZERO;
        for event in &events {
            total_cost += event.cost_usd;
            if event.tier == Some(RoutingTier::Frontier) {
                frontier_cost += event.cost_usd;
            }
        }
        if total_cost == Usd::ZERO {
            return Ok(Vec::new());
        }

        let frontier_share = frontier_cost.as_dollars() / total_cost.as_dollars();
        if frontier_share <= cfg.frontier_share_threshold || frontier_cost.as_dollars() <= cfg.frontier_cost_threshold_usd.as_dollars() {
            return Ok(Vec::new());
        }

        let frequency = (frontier_share / cfg.frontier_share_threshold).min(1.0);
        let severity = (frontier_cost.as_dollars() / cfg.severity_cost_ceiling_usd.as_dollars()).min(1.0);
        let cost_savings = (frontier_cost.as_dollars() / cfg.cost_savings_ceiling_usd.as_dollars()).min(1.0);

        let mut metadata = HashMap::new();
        metadata.insert("frontier_share".to_string(), format!("{frontier_share:.3}"));
        metadata.insert("frontier_cost_usd".to_string(), format!("{:.2}", frontier_cost.as_dollars()));

        Ok(vec![Candidate {
            source_tag: "cost_optimization",
            kind: GoalKind::Optimization,
            description: format!(
                "frontier-tier routing spent ${:.2} ({:.1}% of capability spend) in the last {} days; shift load to cheaper tiers",
                frontier_cost.as_dollars(),
                frontier_share * 100.0,
                self.config.lookback_days
            ),
            frequency,
            severity,
            cost_savings,
            knowledge_gap: cfg.knowledge_gap,
            strategic_value: cfg.strategic_value,
            metadata,
            discriminator: None,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{OperationalEvent, UsageStats};
    use crate::clock::VirtualClock;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::Mutex;

    async fn new_store_and_clock() -> (Arc<dyn Store>, Arc<VirtualClock>) {
        let pool = crate::store::create_migrated_test_pool().await.unwrap();
        let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::new(pool));
        let clock = Arc::new(VirtualClock::new(Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap()));
        (store, clock)
    }

    /// Test double serving canned `operational_history` results keyed by
    /// the `kind` argument, so each strategy can be exercised in isolation.
    struct FakeTelemetry {
        task_failure: Vec<OperationalEvent>,
        routing_spend: Vec<OperationalEvent>,
    }

    #[async_trait]
    impl Telemetry for FakeTelemetry {
        fn record_task_outcome(&self, _kind: &str, _succeeded: bool) {}

        async fn operational_history(&self, kind: &str, _since: DateTime<Utc>) -> crate::domain::OpsResult<Vec<OperationalEvent>> {
            Ok(match kind {
                "task_failure" => self.task_failure.clone(),
                "routing_spend" => self.routing_spend.clone(),
                _ => vec![],
            })
        }
    }

    /// Test double reporting a configurable set of existing knowledge
    /// entries, so Strategy B can be driven to both branches.
    struct FakeKnowledgeStore {
        existing: Mutex<std::collections::HashSet<(String, String)>>,
    }

    #[async_trait]
    impl KnowledgeStore for FakeKnowledgeStore {
        async fn write(&self, _key: &str, _content: &str) -> crate::domain::OpsResult<()> {
            Ok(())
        }

        async fn exists(&self, category: &str, slug: &str) -> crate::domain::OpsResult<bool> {
            Ok(self.existing.lock().await.contains(&(category.to_string(), slug.to_string())))
        }

        async fn usage_stats(&self, _path: &str, _since: DateTime<Utc>) -> crate::domain::OpsResult<UsageStats> {
            Ok(UsageStats::default())
        }
    }

    fn empty_knowledge_store() -> Arc<FakeKnowledgeStore> {
        Arc::new(FakeKnowledgeStore { existing: Mutex::new(std::collections::HashSet::new()) })
    }

    async fn detector_with(
        store: Arc<dyn Store>,
        clock: Arc<VirtualClock>,
        telemetry: Arc<dyn Telemetry>,
        knowledge_store: Arc<dyn KnowledgeStore>,
        config: OpportunityDetectorConfig,
    ) -> OpportunityDetector {
        let (audit, _handle) = AuditLog::spawn(store.clone(), clock.clone() as Arc<dyn Clock>);
        let feedback = Arc::new(crate::feedback_loop::FeedbackLoop::new(crate::feedback_loop::FeedbackLoopConfig::default(), store.clone()));
        OpportunityDetector::new(config, store, clock as Arc<dyn Clock>, Arc::new(audit), feedback, telemetry, knowledge_store)
    }

    /// Scenario S1 from `spec.md` §8: 8 `"first_layer"` failures over the
    /// 30-day lookback produce an improvement goal carrying
    /// `metadata.reason=first_layer`, `metadata.count=8`, impact ~68.
    #[tokio::test]
    async fn failure_pattern_strategy_matches_scenario_s1() {
        let (store, clock) = new_store_and_clock().await;
        let now = clock.now();

        let task_failure = (0..8)
            .map(|_| OperationalEvent { reason: "first_layer".to_string(), tier: None, cost_usd: Usd::ZERO, occurred_at: now })
            .collect();
        let telemetry = Arc::new(FakeTelemetry { task_failure, routing_spend: vec![] });

        let detector = detector_with(
            store.clone(),
            clock.clone(),
            telemetry,
            empty_knowledge_store(),
            OpportunityDetectorConfig { min_pattern_count: 3, min_impact_score: 0.0, ..Default::default() },
        )
        .await;

        let created = detector.detect().await.unwrap();
        assert_eq!(created.len(), 1);
        let goal = &created[0];
        assert_eq!(goal.kind, GoalKind::Improvement);
        assert_eq!(goal.source_tag, "failure_pattern");
        assert_eq!(goal.metadata.get("reason").map(String::as_str), Some("first_layer"));
        assert_eq!(goal.metadata.get("count").map(String::as_str), Some("8"));
        assert!((goal.impact_score - 68.0).abs() < 2.0, "impact_score {} not within tolerance of 68", goal.impact_score);

        // Re-running must not create a duplicate goal for the same reason.
        let created_again = detector.detect().await.unwrap();
        assert!(created_again.is_empty());
    }

    /// Scenario S2: the configured `materials/nylon` entry is missing from
    /// the knowledge base, producing a research goal with
    /// `metadata.material=nylon` and impact >= 60.
    #[tokio::test]
    async fn knowledge_gap_strategy_matches_scenario_s2() {
        let (store, clock) = new_store_and_clock().await;
        let telemetry = Arc::new(FakeTelemetry { task_failure: vec![], routing_spend: vec![] });

        let detector = detector_with(
            store.clone(),
            clock.clone(),
            telemetry,
            empty_knowledge_store(),
            OpportunityDetectorConfig { min_impact_score: 0.0, ..Default::default() },
        )
        .await;

        let created = detector.detect().await.unwrap();
        assert_eq!(created.len(), 1);
        let goal = &created[0];
        assert_eq!(goal.kind, GoalKind::Research);
        assert_eq!(goal.source_tag, "knowledge_gap");
        assert_eq!(goal.metadata.get("material").map(String::as_str), Some("nylon"));
        assert!(goal.impact_score >= 60.0, "impact_score {} below 60", goal.impact_score);
    }

    /// An already-documented entry produces no knowledge-gap candidate.
    #[tokio::test]
    async fn knowledge_gap_strategy_skips_existing_entries() {
        let (store, clock) = new_store_and_clock().await;
        let telemetry = Arc::new(FakeTelemetry { task_failure: vec![], routing_spend: vec![] });
        let knowledge_store = Arc::new(FakeKnowledgeStore {
            existing: Mutex::new(std::collections::HashSet::from([("materials".to_string(), "nylon".to_string())])),
        });

        let detector =
            detector_with(store.clone(), clock.clone(), telemetry, knowledge_store, OpportunityDetectorConfig { min_impact_score: 0.0, ..Default::default() })
                .await;

        let created = detector.detect().await.unwrap();
        assert!(created.is_empty());
    }

    /// Scenario S3: frontier-tier routing spend is $12.50 of a $35.50
    /// total (a ~35.2% share), producing an optimization goal with
    /// `metadata.frontier_share≈0.352`, `metadata.frontier_cost_usd=12.50`,
    /// impact ~71.
    #[tokio::test]
    async fn cost_optimization_strategy_matches_scenario_s3() {
        let (store, clock) = new_store_and_clock().await;
        let now = clock.now();

        let routing_spend = vec![
            OperationalEvent { reason: "routed".to_string(), tier: Some(RoutingTier::Frontier), cost_usd: Usd::from_dollars(12.50), occurred_at: now },
            OperationalEvent { reason: "routed".to_string(), tier: Some(RoutingTier::Local), cost_usd: Usd::from_dollars(15.0), occurred_at: now },
            OperationalEvent { reason: "routed".to_string(), tier: Some(RoutingTier::Mcp), cost_usd: Usd::from_dollars(8.0), occurred_at: now },
        ];
        let telemetry = Arc::new(FakeTelemetry { task_failure: vec![], routing_spend });

        let detector = detector_with(
            store.clone(),
            clock.clone(),
            telemetry,
            empty_knowledge_store(),
            OpportunityDetectorConfig {
                min_impact_score: 0.0,
                knowledge_gap: KnowledgeGapConfig { expected_entries: vec![], ..Default::default() },
                ..Default::default()
            },
        )
        .await;

        let created = detector.detect().await.unwrap();
        assert_eq!(created.len(), 1);
        let goal = &created[0];
        assert_eq!(goal.kind, GoalKind::Optimization);
        assert_eq!(goal.source_tag, "cost_optimization");
        let frontier_share: f64 = goal.metadata.get("frontier_share").unwrap().parse().unwrap();
        assert!((frontier_share - 0.352).abs() < 0.01, "frontier_share {frontier_share}");
        assert_eq!(goal.metadata.get("frontier_cost_usd").map(String::as_str), Some("12.50"));
        assert!((goal.impact_score - 71.0).abs() < 2.0, "impact_score {} not within tolerance of 71", goal.impact_score);
    }

    /// Frontier spend below both thresholds produces no candidate.
    #[tokio::test]
    async fn cost_optimization_strategy_ignores_minor_frontier_spend() {
        let (store, clock) = new_store_and_clock().await;
        let now = clock.now();

        let routing_spend = vec![
            OperationalEvent { reason: "routed".to_string(), tier: Some(RoutingTier::Frontier), cost_usd: Usd::from_dollars(1.0), occurred_at: now },
            OperationalEvent { reason: "routed".to_string(), tier: Some(RoutingTier::Local), cost_usd: Usd::from_dollars(20.0), occurred_at: now },
        ];
        let telemetry = Arc::new(FakeTelemetry { task_failure: vec![], routing_spend });

        let detector = detector_with(
            store.clone(),
            clock.clone(),
            telemetry,
            empty_knowledge_store(),
            OpportunityDetectorConfig {
                min_impact_score: 0.0,
                knowledge_gap: KnowledgeGapConfig { expected_entries: vec![], ..Default::default() },
                ..Default::default()
            },
        )
        .await;

        let created = detector.detect().await.unwrap();
        assert!(created.is_empty());
    }
}
