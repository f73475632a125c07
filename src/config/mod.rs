use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::pool::PoolConfig;
use crate::resilience::{
    CircuitBreakerConfig, CircuitOverride, ErrorMonitorConfig, OperationConfig, OperationOverride,
    RetryConfig, RetryOverride,
};

/// Connection pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Idle time in milliseconds before an entry is evicted
    #[serde(default = "default_max_idle_time_ms")]
    pub max_idle_time_ms: u64,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,

    /// Consecutive probe failures before an entry is replaced
    #[serde(default = "default_health_check_retries")]
    pub health_check_retries: u32,

    #[serde(default = "default_idle_check_interval_ms")]
    pub idle_check_interval_ms: u64,

    #[serde(default = "default_enable_warmup")]
    pub enable_warmup: bool,
}

fn default_max_connections() -> usize {
    10
}

fn default_min_connections() -> usize {
    2
}

fn default_max_idle_time_ms() -> u64 {
    300_000
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_health_check_interval_ms() -> u64 {
    60_000
}

fn default_health_check_timeout_ms() -> u64 {
    5_000
}

fn default_health_check_retries() -> u32 {
    3
}

fn default_idle_check_interval_ms() -> u64 {
    60_000
}

fn default_enable_warmup() -> bool {
    true
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            max_idle_time_ms: default_max_idle_time_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            health_check_retries: default_health_check_retries(),
            idle_check_interval_ms: default_idle_check_interval_ms(),
            enable_warmup: default_enable_warmup(),
        }
    }
}

/// Retry settings shared by every operation unless overridden
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Deadline for the whole retry sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            timeout_ms: None,
        }
    }
}

/// Circuit breaker settings shared by every operation unless overridden
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    #[serde(default = "default_failure_count_window_ms")]
    pub failure_count_window_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_failure_count_window_ms() -> u64 {
    60_000
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            failure_count_window_ms: default_failure_count_window_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMonitorSettings {
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    #[serde(default = "default_trend_window_ms")]
    pub trend_window_ms: u64,

    #[serde(default = "default_trend_threshold")]
    pub trend_threshold: usize,
}

fn default_max_history() -> usize {
    1000
}

fn default_trend_window_ms() -> u64 {
    300_000
}

fn default_trend_threshold() -> usize {
    10
}

impl Default for ErrorMonitorSettings {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            trend_window_ms: default_trend_window_ms(),
            trend_threshold: default_trend_threshold(),
        }
    }
}

/// Per-operation retry overrides; unset fields keep the shared value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverrideSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Per-operation circuit overrides; unset fields keep the shared value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitOverrideSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_count_window_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationSettings {
    #[serde(default)]
    pub retry: RetryOverrideSettings,

    #[serde(default)]
    pub circuit_breaker: CircuitOverrideSettings,
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Cluster context; also the pool name
    #[serde(default = "default_context")]
    pub context: String,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub error_monitor: ErrorMonitorSettings,

    /// Overrides keyed by operation name
    #[serde(default)]
    pub operations: BTreeMap<String, OperationSettings>,
}

fn default_context() -> String {
    "default".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            context: default_context(),
            pool: PoolSettings::default(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            error_monitor: ErrorMonitorSettings::default(),
            operations: BTreeMap::new(),
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl Config {
    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.context.trim().is_empty(), "context must not be empty");

        let pool = &self.pool;
        ensure!(pool.max_connections > 0, "pool.max_connections must be greater than 0");
        ensure!(
            pool.min_connections <= pool.max_connections,
            "pool.min_connections ({}) exceeds pool.max_connections ({})",
            pool.min_connections,
            pool.max_connections
        );
        ensure!(pool.health_check_retries > 0, "pool.health_check_retries must be greater than 0");
        ensure!(pool.health_check_interval_ms > 0, "pool.health_check_interval_ms must be greater than 0");
        ensure!(pool.idle_check_interval_ms > 0, "pool.idle_check_interval_ms must be greater than 0");

        validate_retry("retry", &self.retry)?;
        validate_circuit("circuit_breaker", &self.circuit_breaker)?;

        ensure!(self.error_monitor.max_history > 0, "error_monitor.max_history must be greater than 0");
        ensure!(
            self.error_monitor.trend_threshold > 0,
            "error_monitor.trend_threshold must be greater than 0"
        );

        for (name, op) in &self.operations {
            let merged = self.operation_config().merged(&op.to_override());
            validate_retry(&format!("operations.{}.retry", name), &RetrySettings::from(&merged.retry))?;
            validate_circuit(
                &format!("operations.{}.circuit_breaker", name),
                &CircuitBreakerSettings::from(&merged.circuit),
            )?;
        }

        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        let p = &self.pool;
        PoolConfig {
            max_connections: p.max_connections,
            min_connections: p.min_connections,
            max_idle_time: millis(p.max_idle_time_ms),
            acquire_timeout: millis(p.acquire_timeout_ms),
            health_check_interval: millis(p.health_check_interval_ms),
            health_check_timeout: millis(p.health_check_timeout_ms),
            health_check_retries: p.health_check_retries,
            idle_check_interval: millis(p.idle_check_interval_ms),
            enable_warmup: p.enable_warmup,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        let r = &self.retry;
        RetryConfig {
            max_attempts: r.max_attempts,
            initial_delay: millis(r.initial_delay_ms),
            max_delay: millis(r.max_delay_ms),
            backoff_multiplier: r.backoff_multiplier,
            jitter_factor: r.jitter_factor,
            timeout: r.timeout_ms.map(millis),
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        let c = &self.circuit_breaker;
        CircuitBreakerConfig {
            failure_threshold: c.failure_threshold,
            success_threshold: c.success_threshold,
            reset_timeout: millis(c.reset_timeout_ms),
            failure_count_window: millis(c.failure_count_window_ms),
        }
    }

    pub fn error_monitor_config(&self) -> ErrorMonitorConfig {
        let m = &self.error_monitor;
        ErrorMonitorConfig {
            max_history: m.max_history,
            trend_window: millis(m.trend_window_ms),
            trend_threshold: m.trend_threshold,
        }
    }

    /// Defaults for every operation
    pub fn operation_config(&self) -> OperationConfig {
        OperationConfig {
            retry: self.retry_config(),
            circuit: self.circuit_breaker_config(),
        }
    }

    pub fn operation_overrides(&self) -> HashMap<String, OperationOverride> {
        self.operations
            .iter()
            .map(|(name, op)| (name.clone(), op.to_override()))
            .collect()
    }
}

impl OperationSettings {
    fn to_override(&self) -> OperationOverride {
        let r = &self.retry;
        let c = &self.circuit_breaker;
        OperationOverride {
            retry: RetryOverride {
                max_attempts: r.max_attempts,
                initial_delay: r.initial_delay_ms.map(millis),
                max_delay: r.max_delay_ms.map(millis),
                backoff_multiplier: r.backoff_multiplier,
                jitter_factor: r.jitter_factor,
                timeout: r.timeout_ms.map(millis),
            },
            circuit: CircuitOverride {
                failure_threshold: c.failure_threshold,
                success_threshold: c.success_threshold,
                reset_timeout: c.reset_timeout_ms.map(millis),
                failure_count_window: c.failure_count_window_ms.map(millis),
            },
        }
    }
}

impl From<&RetryConfig> for RetrySettings {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay_ms: config.initial_delay.as_millis() as u64,
            max_delay_ms: config.max_delay.as_millis() as u64,
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            timeout_ms: config.timeout.map(|t| t.as_millis() as u64),
        }
    }
}

impl From<&CircuitBreakerConfig> for CircuitBreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            reset_timeout_ms: config.reset_timeout.as_millis() as u64,
            failure_count_window_ms: config.failure_count_window.as_millis() as u64,
        }
    }
}

fn validate_retry(section: &str, retry: &RetrySettings) -> Result<()> {
    ensure!(retry.max_attempts > 0, "{}.max_attempts must be greater than 0", section);
    ensure!(
        retry.backoff_multiplier >= 1.0,
        "{}.backoff_multiplier must be at least 1.0 (got {})",
        section,
        retry.backoff_multiplier
    );
    ensure!(
        (0.0..=1.0).contains(&retry.jitter_factor),
        "{}.jitter_factor must be between 0.0 and 1.0 (got {})",
        section,
        retry.jitter_factor
    );
    ensure!(
        retry.initial_delay_ms <= retry.max_delay_ms,
        "{}.initial_delay_ms exceeds {}.max_delay_ms",
        section,
        section
    );
    Ok(())
}

fn validate_circuit(section: &str, circuit: &CircuitBreakerSettings) -> Result<()> {
    ensure!(circuit.failure_threshold > 0, "{}.failure_threshold must be greater than 0", section);
    ensure!(circuit.success_threshold > 0, "{}.success_threshold must be greater than 0", section);
    ensure!(
        circuit.failure_count_window_ms > 0,
        "{}.failure_count_window_ms must be greater than 0",
        section
    );
    Ok(())
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid value for {}: {:?}", name, raw))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

/// Apply environment overrides on top of `config`
///
/// Recognised variables:
/// - KUBEGUARD_CONTEXT
/// - KUBEGUARD_MAX_CONNECTIONS
/// - KUBEGUARD_MIN_CONNECTIONS
/// - KUBEGUARD_ACQUIRE_TIMEOUT_MS
/// - KUBEGUARD_RETRY_MAX_ATTEMPTS
/// - KUBEGUARD_FAILURE_THRESHOLD
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Ok(context) = std::env::var("KUBEGUARD_CONTEXT") {
        config.context = context;
    }

    if let Some(val) = env_value("KUBEGUARD_MAX_CONNECTIONS")? {
        config.pool.max_connections = val;
    }

    if let Some(val) = env_value("KUBEGUARD_MIN_CONNECTIONS")? {
        config.pool.min_connections = val;
    }

    if let Some(val) = env_value("KUBEGUARD_ACQUIRE_TIMEOUT_MS")? {
        config.pool.acquire_timeout_ms = val;
    }

    if let Some(val) = env_value("KUBEGUARD_RETRY_MAX_ATTEMPTS")? {
        config.retry.max_attempts = val;
    }

    if let Some(val) = env_value("KUBEGUARD_FAILURE_THRESHOLD")? {
        config.circuit_breaker.failure_threshold = val;
    }

    Ok(())
}

/// Load configuration from environment variables over the defaults
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::default();
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Load configuration from file or environment
///
/// Reads the YAML file when one is given, otherwise starts from the
/// defaults; environment overrides apply either way and the result is
/// validated.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => {
            let _ = dotenvy::dotenv();
            let mut config = load_from_yaml(path)?;
            apply_env_overrides(&mut config)?;
            config
        }
        None => load_from_env()?,
    };

    config.validate().context("Invalid configuration")?;
    Ok(config)
}
