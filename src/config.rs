//! Hierarchical configuration (`spec.md` §6): defaults merged with
//! `config.yaml` merged with `OPSCORE_`-prefixed environment variables,
//! in that order of precedence, via `figment`.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::Duration;
use chrono_tz::Tz;
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection_pool::PoolDefaults;
use crate::domain::Usd;
use crate::feedback_loop::AdjustmentBounds;
use crate::opportunity_detector::StrategyWeights;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("daily_budget_usd must be positive, got {0}")]
    InvalidDailyBudget(f64),

    #[error("idle_threshold_min must be non-negative, got {0}")]
    InvalidIdleThreshold(i64),

    #[error("cpu_ceiling_pct and mem_ceiling_pct must be in (0, 100], got cpu={0} mem={1}")]
    InvalidCeiling(f32, f32),

    #[error("maintenance_window start_hour and end_hour must be in [0, 24), got start={0} end={1}")]
    InvalidMaintenanceWindow(u32, u32),

    #[error("database path cannot be empty")]
    EmptyDatabasePath,

    #[error("lookback_days must be positive, got {0}")]
    InvalidLookbackDays(i64),

    #[error("min_pattern_count must be positive, got {0}")]
    InvalidMinPatternCount(u32),

    #[error("strategy_weights must sum to 1.0 within tolerance, got {0}")]
    StrategyWeightsNotNormalized(f64),

    #[error("measurement_window_days must be positive, got {0}")]
    InvalidMeasurementWindow(i64),

    #[error("adjustment_bounds.min ({0}) must be less than adjustment_bounds.max ({1})")]
    InvalidAdjustmentBounds(f64, f64),

    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MaintenanceWindowConfig {
    pub start_hour: u32,
    pub end_hour: u32,
    pub zone: Tz,
}

impl Default for MaintenanceWindowConfig {
    fn default() -> Self {
        Self { start_hour: 4, end_hour: 6, zone: chrono_tz::UTC }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDefaultsConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_millis")]
    pub max_backoff: StdDuration,
}

impl Default for RetryDefaultsConfig {
    fn default() -> Self {
        Self { max_attempts: 5, max_backoff: StdDuration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDefaultsConfig {
    pub max_conn: usize,
    #[serde(with = "humantime_millis")]
    pub keepalive: StdDuration,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: i64,
    #[serde(with = "humantime_millis")]
    pub health_interval: StdDuration,
    pub requests_per_sec: u32,
}

impl Default for PoolDefaultsConfig {
    fn default() -> Self {
        let d = PoolDefaults::default();
        Self {
            max_conn: d.max_conn,
            keepalive: d.keepalive,
            failure_threshold: d.failure_threshold,
            recovery_timeout_secs: d.recovery_timeout.num_seconds(),
            health_interval: d.health_interval,
            requests_per_sec: d.requests_per_sec.get(),
        }
    }
}

impl PoolDefaultsConfig {
    #[must_use]
    pub fn to_pool_defaults(&self) -> PoolDefaults {
        PoolDefaults {
            max_conn: self.max_conn,
            keepalive: self.keepalive,
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::seconds(self.recovery_timeout_secs),
            health_interval: self.health_interval,
            requests_per_sec: std::num::NonZeroU32::new(self.requests_per_sec).unwrap_or(PoolDefaults::default().requests_per_sec),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty, log_dir: None }
    }
}

/// Mirrors every option enumerated in `spec.md` §6, plus the database path
/// and logging block the teacher's `Config` always carried alongside its
/// domain options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_path: String,
    pub http_bind: String,

    pub daily_budget_usd: Usd,
    pub idle_threshold_min: i64,
    pub cpu_ceiling_pct: f32,
    pub mem_ceiling_pct: f32,

    pub maintenance_window: MaintenanceWindowConfig,
    pub full_time_mode: bool,

    pub lookback_days: i64,
    pub min_pattern_count: u32,
    pub min_impact_score: f64,
    pub strategy_weights: StrategyWeights,

    pub measurement_window_days: i64,
    pub feedback_min_samples: usize,
    pub adjustment_bounds: AdjustmentBounds,

    pub task_kind_permits: HashMap<String, usize>,
    /// Overspend tolerance per goal kind (`spec.md` §3), keyed by
    /// `GoalKind::as_str()`; kinds absent here fall back to
    /// `default_overspend_tolerance`.
    pub overspend_tolerance: HashMap<String, f64>,
    pub default_overspend_tolerance: f64,
    pub retry_defaults: RetryDefaultsConfig,
    pub pool_defaults: PoolDefaultsConfig,

    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut task_kind_permits = HashMap::new();
        task_kind_permits.insert("search".to_string(), 3);
        task_kind_permits.insert("synthesize".to_string(), 3);
        task_kind_permits.insert("kb_write".to_string(), 2);
        task_kind_permits.insert("commit".to_string(), 1);

        Self {
            database_path: ".opscore/opscore.db".to_string(),
            http_bind: "0.0.0.0:8080".to_string(),
            daily_budget_usd: Usd::from_dollars(50.0),
            idle_threshold_min: 10,
            cpu_ceiling_pct: 80.0,
            mem_ceiling_pct: 85.0,
            maintenance_window: MaintenanceWindowConfig::default(),
            full_time_mode: false,
            lookback_days: 30,
            min_pattern_count: 3,
            min_impact_score: 40.0,
            strategy_weights: StrategyWeights::default(),
            measurement_window_days: 30,
            feedback_min_samples: 10,
            adjustment_bounds: AdjustmentBounds::default(),
            task_kind_permits,
            overspend_tolerance: HashMap::new(),
            default_overspend_tolerance: crate::domain::models::DEFAULT_OVERSPEND_TOLERANCE,
            retry_defaults: RetryDefaultsConfig::default(),
            pool_defaults: PoolDefaultsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// For `TaskExecutor`'s per-kind semaphore seeding; goal kinds not
    /// covered by `task_kind_permits` fall back to this.
    #[must_use]
    pub fn permit_for_kind(&self, kind: &str) -> usize {
        self.task_kind_permits.get(kind).copied().unwrap_or(3)
    }

    /// Overspend tolerance for `kind`, falling back to
    /// `default_overspend_tolerance` when `kind` has no override.
    #[must_use]
    pub fn overspend_tolerance_for(&self, kind: crate::domain::models::GoalKind) -> f64 {
        self.overspend_tolerance.get(kind.as_str()).copied().unwrap_or(self.default_overspend_tolerance)
    }
}

/// Loader for the `Config` struct, following the teacher's `ConfigLoader`:
/// programmatic defaults merged with `config.yaml` merged with
/// environment variables (`OPSCORE_`, double-underscore nested).
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> anyhow::Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file("config.yaml"))
            .merge(Env::prefixed("OPSCORE_").split("__"))
            .extract()?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.daily_budget_usd.as_micros() <= 0 {
            return Err(ConfigError::InvalidDailyBudget(config.daily_budget_usd.as_dollars()));
        }
        if config.idle_threshold_min < 0 {
            return Err(ConfigError::InvalidIdleThreshold(config.idle_threshold_min));
        }
        if !(0.0..=100.0).contains(&config.cpu_ceiling_pct) || config.cpu_ceiling_pct <= 0.0 {
            return Err(ConfigError::InvalidCeiling(config.cpu_ceiling_pct, config.mem_ceiling_pct));
        }
        if !(0.0..=100.0).contains(&config.mem_ceiling_pct) || config.mem_ceiling_pct <= 0.0 {
            return Err(ConfigError::InvalidCeiling(config.cpu_ceiling_pct, config.mem_ceiling_pct));
        }
        if config.maintenance_window.start_hour >= 24 || config.maintenance_window.end_hour >= 24 {
            return Err(ConfigError::InvalidMaintenanceWindow(
                config.maintenance_window.start_hour,
                config.maintenance_window.end_hour,
            ));
        }
        if config.database_path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.lookback_days <= 0 {
            return Err(ConfigError::InvalidLookbackDays(config.lookback_days));
        }
        if config.min_pattern_count == 0 {
            return Err(ConfigError::InvalidMinPatternCount(config.min_pattern_count));
        }
        let weight_sum = config.strategy_weights.frequency
            + config.strategy_weights.severity
            + config.strategy_weights.cost_savings
            + config.strategy_weights.knowledge_gap
            + config.strategy_weights.strategic_value;
        if (weight_sum - 1.0).abs() > 0.01 {
            return Err(ConfigError::StrategyWeightsNotNormalized(weight_sum));
        }
        if config.measurement_window_days <= 0 {
            return Err(ConfigError::InvalidMeasurementWindow(config.measurement_window_days));
        }
        if config.adjustment_bounds.min >= config.adjustment_bounds.max {
            return Err(ConfigError::InvalidAdjustmentBounds(config.adjustment_bounds.min, config.adjustment_bounds.max));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        Ok(())
    }
}

mod humantime_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
