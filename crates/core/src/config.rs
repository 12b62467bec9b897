use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Forecast strategies a worker can be configured with.
pub const KNOWN_STRATEGIES: &[&str] = &["decomposition", "zscore"];

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub aws: AwsConfig,
    pub postgres: PostgresConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `GEOANOMALY_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("GEOANOMALY_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let pipeline = PipelineConfig::from_env_profiled(p);
        Self {
            profile: p.to_string(),
            scheduler: SchedulerConfig::from_env_profiled(p, &pipeline),
            pipeline,
            worker: WorkerConfig::from_env_profiled(p),
            queue: QueueConfig::from_env_profiled(p),
            aws: AwsConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  pipeline:   strategy={}, min_points={}, confidence={}, interval={}s, spatial={}",
            self.pipeline.forecast_strategy,
            self.pipeline.min_points,
            self.pipeline.confidence_level,
            self.pipeline.reevaluation_interval_secs,
            self.pipeline.spatial_grouping
        );
        tracing::info!(
            "  scheduler:  sweep={}s, dedup_window={}s, stall_timeout={}s",
            self.scheduler.sweep_interval_secs,
            self.scheduler.dedup_window_secs,
            self.scheduler.stall_timeout_secs
        );
        tracing::info!(
            "  worker:     concurrency={}, max_attempts={}",
            self.worker.resolved_concurrency(),
            self.pipeline.max_attempts
        );
        tracing::info!(
            "  queue:      provider={}, url={}",
            self.queue.provider,
            self.queue.queue_url.as_deref().unwrap_or("(none)")
        );
        tracing::info!(
            "  postgres:   host={}, db={}, configured={}",
            self.postgres.host,
            self.postgres.database,
            self.postgres.is_configured()
        );
    }
}

// ── Pipeline ──────────────────────────────────────────────────

/// Options recognized by the partitioner, forecast engine and scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub reevaluation_interval_secs: u64,
    pub min_points: usize,
    pub confidence_level: f64,
    pub max_attempts: u32,
    pub spatial_grouping: bool,
    /// Grid cell edge length in degrees when spatial grouping is on.
    pub spatial_cell_size_deg: f64,
    pub forecast_strategy: String,
    /// Seasonal period of the decomposition strategy; 0 disables seasonality.
    pub seasonal_period_days: u32,
    /// Minimum band half-scale, as a fraction of the training mean level.
    pub band_floor_ratio: f64,
    pub zscore_window: usize,
    /// Remove stored anomalies for points that score normal on re-evaluation.
    pub clear_false_positives: bool,
    /// Treat training values before the first non-zero value as missing.
    pub ignore_leading_zeros: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reevaluation_interval_secs: 3600,
            min_points: 14,
            confidence_level: 0.8,
            max_attempts: 3,
            spatial_grouping: false,
            spatial_cell_size_deg: 0.1,
            forecast_strategy: "decomposition".to_string(),
            seasonal_period_days: 7,
            band_floor_ratio: 0.05,
            zscore_window: 30,
            clear_false_positives: false,
            ignore_leading_zeros: false,
        }
    }
}

impl PipelineConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            reevaluation_interval_secs: profiled_env_parse(
                p,
                "REEVALUATION_INTERVAL_SECS",
                d.reevaluation_interval_secs,
            ),
            min_points: profiled_env_parse(p, "MIN_POINTS", d.min_points),
            confidence_level: profiled_env_parse(p, "CONFIDENCE_LEVEL", d.confidence_level),
            max_attempts: profiled_env_parse(p, "MAX_ATTEMPTS", d.max_attempts),
            spatial_grouping: profiled_env_bool(p, "SPATIAL_GROUPING", d.spatial_grouping),
            spatial_cell_size_deg: profiled_env_parse(
                p,
                "SPATIAL_CELL_SIZE_DEG",
                d.spatial_cell_size_deg,
            ),
            forecast_strategy: profiled_env_or(p, "FORECAST_STRATEGY", &d.forecast_strategy)
                .to_lowercase(),
            seasonal_period_days: profiled_env_parse(
                p,
                "SEASONAL_PERIOD_DAYS",
                d.seasonal_period_days,
            ),
            band_floor_ratio: profiled_env_parse(p, "BAND_FLOOR_RATIO", d.band_floor_ratio),
            zscore_window: profiled_env_parse(p, "ZSCORE_WINDOW", d.zscore_window),
            clear_false_positives: profiled_env_bool(
                p,
                "CLEAR_FALSE_POSITIVES",
                d.clear_false_positives,
            ),
            ignore_leading_zeros: profiled_env_bool(
                p,
                "IGNORE_LEADING_ZEROS",
                d.ignore_leading_zeros,
            ),
        }
    }

    pub fn reevaluation_interval(&self) -> Duration {
        Duration::from_secs(self.reevaluation_interval_secs)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.min_points < 2 {
            return Err(PipelineError::Config(format!(
                "min_points must be at least 2, got {}",
                self.min_points
            )));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(PipelineError::Config(format!(
                "confidence_level must be in (0, 1), got {}",
                self.confidence_level
            )));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::Config("max_attempts must be at least 1".into()));
        }
        if self.spatial_grouping && !(self.spatial_cell_size_deg > 0.0) {
            return Err(PipelineError::Config(format!(
                "spatial_cell_size_deg must be positive, got {}",
                self.spatial_cell_size_deg
            )));
        }
        if self.band_floor_ratio < 0.0 || !self.band_floor_ratio.is_finite() {
            return Err(PipelineError::Config(format!(
                "band_floor_ratio must be a non-negative number, got {}",
                self.band_floor_ratio
            )));
        }
        if !KNOWN_STRATEGIES.contains(&self.forecast_strategy.as_str()) {
            return Err(PipelineError::Config(format!(
                "unknown forecast strategy '{}' (expected one of {:?})",
                self.forecast_strategy, KNOWN_STRATEGIES
            )));
        }
        Ok(())
    }
}

// ── Scheduler ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub sweep_interval_secs: u64,
    /// How long a submitted task ID is rejected as a duplicate.
    pub dedup_window_secs: u64,
    pub sweep_lease_secs: u64,
    pub stall_timeout_secs: u64,
    /// Retention of task statuses in the result cache.
    pub status_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            dedup_window_secs: 3600,
            sweep_lease_secs: 300,
            stall_timeout_secs: 600,
            status_ttl_secs: 86_400,
        }
    }
}

impl SchedulerConfig {
    fn from_env_profiled(p: &str, pipeline: &PipelineConfig) -> Self {
        let d = Self::default();
        Self {
            sweep_interval_secs: profiled_env_parse(p, "SWEEP_INTERVAL_SECS", d.sweep_interval_secs),
            dedup_window_secs: profiled_env_parse(
                p,
                "DEDUP_WINDOW_SECS",
                pipeline.reevaluation_interval_secs,
            ),
            sweep_lease_secs: profiled_env_parse(p, "SWEEP_LEASE_SECS", d.sweep_lease_secs),
            stall_timeout_secs: profiled_env_parse(p, "STALL_TIMEOUT_SECS", d.stall_timeout_secs),
            status_ttl_secs: profiled_env_parse(p, "STATUS_TTL_SECS", d.status_ttl_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn sweep_lease(&self) -> Duration {
        Duration::from_secs(self.sweep_lease_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }
}

// ── Worker ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent evaluations per worker process. 0 = available parallelism.
    pub concurrency: usize,
    pub batch_size: u32,
    pub poll_interval_ms: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            batch_size: 10,
            poll_interval_ms: 500,
            retry_base_ms: 1_000,
            retry_max_ms: 60_000,
        }
    }
}

impl WorkerConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            concurrency: profiled_env_parse(p, "WORKER_CONCURRENCY", d.concurrency),
            batch_size: profiled_env_parse(p, "WORKER_BATCH_SIZE", d.batch_size),
            poll_interval_ms: profiled_env_parse(p, "WORKER_POLL_INTERVAL_MS", d.poll_interval_ms),
            retry_base_ms: profiled_env_parse(p, "RETRY_BASE_MS", d.retry_base_ms),
            retry_max_ms: profiled_env_parse(p, "RETRY_MAX_MS", d.retry_max_ms),
        }
    }

    /// Resolve concurrency (0 means use available parallelism).
    pub fn resolved_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.concurrency
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ── Queue ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// "memory" or "sqs".
    pub provider: String,
    pub queue_url: Option<String>,
    pub dlq_url: Option<String>,
    pub visibility_timeout_secs: u32,
}

impl QueueConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            provider: profiled_env_or(p, "QUEUE_PROVIDER", "memory").to_lowercase(),
            queue_url: profiled_env_opt(p, "QUEUE_URL"),
            dlq_url: profiled_env_opt(p, "QUEUE_DLQ_URL"),
            visibility_timeout_secs: profiled_env_parse(p, "QUEUE_VISIBILITY_TIMEOUT_SECS", 600),
        }
    }

    pub fn is_sqs(&self) -> bool {
        self.provider == "sqs" && self.queue_url.is_some()
    }
}

// ── AWS ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "eu-west-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_parse(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "anomaly_detection"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_parse(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(u), Some(pw)) => format!("{}:{}@", u, pw),
            (Some(u), None) => format!("{}@", u),
            _ => String::new(),
        };
        format!(
            "postgres://{}{}:{}/{}?sslmode={}",
            auth, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.min_points, 14);
        assert_eq!(config.confidence_level, 0.8);
        assert_eq!(config.max_attempts, 3);
        assert!(!config.spatial_grouping);
        assert_eq!(config.forecast_strategy, "decomposition");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.min_points = 1;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        let mut config = PipelineConfig::default();
        config.confidence_level = 1.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.forecast_strategy = "prophet".into();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.spatial_grouping = true;
        config.spatial_cell_size_deg = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolved_concurrency() {
        let mut config = WorkerConfig::default();
        assert!(config.resolved_concurrency() > 0);

        config.concurrency = 8;
        assert_eq!(config.resolved_concurrency(), 8);
    }

    #[test]
    fn connection_url_includes_credentials() {
        let pg = PostgresConfig {
            host: "db".into(),
            port: 5433,
            database: "geo".into(),
            username: Some("app".into()),
            password: Some("secret".into()),
            ssl_mode: "disable".into(),
            max_connections: 4,
        };
        assert_eq!(
            pg.connection_url(),
            "postgres://app:secret@db:5433/geo?sslmode=disable"
        );
        assert!(pg.is_configured());
    }
}
