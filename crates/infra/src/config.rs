//! Configuration loading and representation.
//!
//! Defaults, then an optional YAML file named by `TUBEWATCH_CONFIG`, then
//! individual `TUBEWATCH_*` environment overrides.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use tubewatch_analytics::AggregatorConfig;
use tubewatch_cache::CacheConfig;
use tubewatch_observability::LoggingConfig;

use crate::jobs::{
    BackoffStrategy, BrokerConfig, JobKind, QueueName, RetryPolicy, ScheduleDefinition, WorkerPoolConfig,
};
use crate::source::RateLimitConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: usize,
    pub max_in_flight: usize,
    pub lease_secs: u64,
    pub poll_wait_ms: u64,
    pub queues: Vec<QueueName>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 4,
            max_in_flight: 4,
            lease_secs: 300,
            poll_wait_ms: 250,
            queues: QueueName::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub backoff: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub jitter: f64,
    pub finished_history: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_secs: 300,
            jitter: 0.1,
            finished_history: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub capacity: usize,
    pub ttl_secs: u64,
    pub compute_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_secs: 900,
            compute_timeout_secs: 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsSettings {
    pub bucket_width_secs: u64,
    pub trend_window_secs: u64,
    pub classification_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub seen_comments_per_entity: usize,
    pub entity_idle_secs: u64,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            bucket_width_secs: 3_600,
            trend_window_secs: 7 * 24 * 3_600,
            classification_ttl_secs: 24 * 3_600,
            sweep_interval_secs: 60,
            seen_comments_per_entity: 10_000,
            entity_idle_secs: 24 * 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// JSON fixture catalog served by the fixture source
    pub fixtures: Option<PathBuf>,
    pub latency_ms: u64,
    pub comments_ttl_secs: u64,
    pub rate_limited: bool,
    pub rate_limit_capacity: u32,
    pub rate_limit_per_sec: f64,
    pub rate_limit_wait_ms: u64,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            fixtures: None,
            latency_ms: 0,
            comments_ttl_secs: 900,
            rate_limited: true,
            rate_limit_capacity: 10,
            rate_limit_per_sec: 5.0,
            rate_limit_wait_ms: 2_000,
        }
    }
}

fn default_true() -> bool {
    true
}

fn empty_payload() -> Value {
    Value::Object(Default::default())
}

/// One recurring job as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    pub kind: JobKind,
    #[serde(default)]
    pub queue: Option<QueueName>,
    pub period_secs: u64,
    #[serde(default = "default_true")]
    pub no_overlap: bool,
    #[serde(default)]
    pub run_on_start: bool,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "empty_payload")]
    pub payload: Value,
}

impl ScheduleConfig {
    pub fn definition(&self) -> ScheduleDefinition {
        ScheduleDefinition {
            name: self.name.clone(),
            kind: self.kind,
            queue: self.queue,
            period: Duration::from_secs(self.period_secs),
            no_overlap: self.no_overlap,
            run_on_start: self.run_on_start,
            priority: self.priority,
            max_attempts: self.max_attempts,
            payload: self.payload.clone(),
        }
    }
}

fn default_schedules() -> Vec<ScheduleConfig> {
    vec![ScheduleConfig {
        name: "refresh_trending".to_string(),
        kind: JobKind::RefreshTrending,
        queue: None,
        period_secs: 6 * 3_600,
        no_overlap: true,
        run_on_start: false,
        priority: None,
        max_attempts: None,
        payload: serde_json::json!({ "region": "US", "limit": 50 }),
    }]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub workers: WorkersConfig,
    pub broker: BrokerSettings,
    pub cache: CacheSettings,
    pub analytics: AnalyticsSettings,
    pub source: SourceSettings,
    pub logging: LoggingConfig,
    pub schedules: Vec<ScheduleConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workers: WorkersConfig::default(),
            broker: BrokerSettings::default(),
            cache: CacheSettings::default(),
            analytics: AnalyticsSettings::default(),
            source: SourceSettings::default(),
            logging: LoggingConfig::default(),
            schedules: default_schedules(),
        }
    }
}

fn parse_env<T: FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
        })
}

impl AppConfig {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(|var| std::env::var(var).ok())
    }

    /// Load with a custom variable lookup.
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("TUBEWATCH_CONFIG") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })?;
                Self::from_yaml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("TUBEWATCH_WORKERS") {
            self.workers.count = parse_env("TUBEWATCH_WORKERS", v)?;
        }
        if let Some(v) = lookup("TUBEWATCH_MAX_IN_FLIGHT") {
            self.workers.max_in_flight = parse_env("TUBEWATCH_MAX_IN_FLIGHT", v)?;
        }
        if let Some(v) = lookup("TUBEWATCH_LEASE_SECS") {
            self.workers.lease_secs = parse_env("TUBEWATCH_LEASE_SECS", v)?;
        }
        if let Some(v) = lookup("TUBEWATCH_CACHE_CAPACITY") {
            self.cache.capacity = parse_env("TUBEWATCH_CACHE_CAPACITY", v)?;
        }
        if let Some(v) = lookup("TUBEWATCH_CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse_env("TUBEWATCH_CACHE_TTL_SECS", v)?;
        }
        if let Some(v) = lookup("TUBEWATCH_FIXTURES") {
            self.source.fixtures = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TUBEWATCH_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("TUBEWATCH_LOG_JSON") {
            self.logging.json = parse_env("TUBEWATCH_LOG_JSON", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.workers.count == 0 {
            return invalid("workers.count must be at least 1");
        }
        if self.workers.max_in_flight == 0 {
            return invalid("workers.max_in_flight must be at least 1");
        }
        if self.workers.lease_secs == 0 {
            return invalid("workers.lease_secs must be positive");
        }
        if self.workers.queues.is_empty() {
            return invalid("workers.queues must name at least one queue");
        }
        if self.cache.capacity == 0 {
            return invalid("cache.capacity must be at least 1");
        }
        if self.cache.compute_timeout_secs == 0 {
            return invalid("cache.compute_timeout_secs must be positive");
        }
        if self.analytics.bucket_width_secs == 0 {
            return invalid("analytics.bucket_width_secs must be positive");
        }
        if self.analytics.trend_window_secs < self.analytics.bucket_width_secs {
            return invalid("analytics.trend_window_secs must cover at least one bucket");
        }
        if self.analytics.seen_comments_per_entity == 0 {
            return invalid("analytics.seen_comments_per_entity must be positive");
        }
        if !(0.0..=1.0).contains(&self.broker.jitter) {
            return invalid("broker.jitter must be within [0, 1]");
        }
        if self.source.rate_limited && self.source.rate_limit_per_sec <= 0.0 {
            return invalid("source.rate_limit_per_sec must be positive");
        }

        let mut names = HashSet::new();
        for schedule in &self.schedules {
            if schedule.period_secs == 0 {
                return Err(ConfigError::Invalid(format!("schedule {} has a zero period", schedule.name)));
            }
            if !names.insert(schedule.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate schedule name {}", schedule.name)));
            }
        }
        Ok(())
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers.count,
            max_in_flight: self.workers.max_in_flight,
            lease_duration: Duration::from_secs(self.workers.lease_secs),
            poll_wait: Duration::from_millis(self.workers.poll_wait_ms.max(1)),
            queues: self.workers.queues.clone(),
            ..WorkerPoolConfig::default()
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.broker.base_delay_ms),
                max_delay: Duration::from_secs(self.broker.max_delay_secs),
                strategy: self.broker.backoff,
                jitter: self.broker.jitter,
            },
            finished_history: self.broker.finished_history,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache.capacity,
            default_ttl: Duration::from_secs(self.cache.ttl_secs),
            compute_timeout: Duration::from_secs(self.cache.compute_timeout_secs),
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            bucket_width: Duration::from_secs(self.analytics.bucket_width_secs),
            trend_window: Duration::from_secs(self.analytics.trend_window_secs),
            classification_ttl: Duration::from_secs(self.analytics.classification_ttl_secs),
            seen_comments_per_entity: self.analytics.seen_comments_per_entity,
            entity_idle_ttl: Duration::from_secs(self.analytics.entity_idle_secs),
        }
    }

    pub fn rate_limit(&self) -> Option<RateLimitConfig> {
        self.source.rate_limited.then(|| RateLimitConfig {
            capacity: self.source.rate_limit_capacity,
            refill_per_sec: self.source.rate_limit_per_sec,
            max_wait: Duration::from_millis(self.source.rate_limit_wait_ms),
        })
    }

    pub fn schedule_definitions(&self) -> Vec<ScheduleDefinition> {
        self.schedules.iter().map(ScheduleConfig::definition).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_are_valid_and_schedule_trending() {
        let config = AppConfig::load_from(env(&[])).unwrap();
        assert_eq!(config, AppConfig::default());

        let defs = config.schedule_definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].kind, JobKind::RefreshTrending);
        assert_eq!(defs[0].period, Duration::from_secs(6 * 3600));
        assert!(defs[0].no_overlap);
    }

    #[test]
    fn yaml_fills_in_partial_sections() {
        let config = AppConfig::from_yaml_str(
            r#"
workers:
  count: 8
cache:
  ttl_secs: 30
schedules:
  - name: channels
    kind: scrape_channel
    period_secs: 600
    queue: priority
    payload:
      channel_id: ch1
"#,
        )
        .unwrap();

        assert_eq!(config.workers.count, 8);
        assert_eq!(config.workers.max_in_flight, 4);
        assert_eq!(config.cache_config().default_ttl, Duration::from_secs(30));
        let def = &config.schedule_definitions()[0];
        assert_eq!(def.queue, Some(QueueName::Priority));
        assert!(def.no_overlap);
        assert_eq!(def.payload["channel_id"], "ch1");
    }

    #[test]
    fn environment_overrides_file_values() {
        let config = AppConfig::load_from(env(&[
            ("TUBEWATCH_WORKERS", "2"),
            ("TUBEWATCH_CACHE_CAPACITY", "50"),
            ("TUBEWATCH_LOG_JSON", "false"),
            ("TUBEWATCH_FIXTURES", "/tmp/catalog.json"),
        ]))
        .unwrap();

        assert_eq!(config.pool_config().workers, 2);
        assert_eq!(config.cache.capacity, 50);
        assert!(!config.logging.json);
        assert_eq!(config.source.fixtures, Some(PathBuf::from("/tmp/catalog.json")));
    }

    #[test]
    fn malformed_env_value_is_reported() {
        let err = AppConfig::load_from(env(&[("TUBEWATCH_LEASE_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref var, .. } if var == "TUBEWATCH_LEASE_SECS"));
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let mut config = AppConfig::default();
        config.workers.count = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.analytics.trend_window_secs = 60;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.analytics.seen_comments_per_entity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.schedules.push(config.schedules[0].clone());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn config_file_is_read_from_path() {
        let path = std::env::temp_dir().join(format!("tubewatch-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "workers:\n  count: 3\nschedules: []\n").unwrap();

        let config = AppConfig::load_from(env(&[("TUBEWATCH_CONFIG", path.to_str().unwrap())])).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.workers.count, 3);
        assert!(config.schedules.is_empty());
    }

    #[test]
    fn missing_config_file_is_an_io_error() {
        let err = AppConfig::load_from(env(&[("TUBEWATCH_CONFIG", "/definitely/not/here.yaml")])).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
