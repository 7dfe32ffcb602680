//! Engine configuration.
//!
//! Every section has serde defaults, so an empty file (or no file at all)
//! yields a working configuration. Durations are given in milliseconds.
//!
//! ```toml
//! [engine]
//! max_parallelism = 8
//!
//! [retry.escalated]
//! max_attempts = 3
//! initial_delay_ms = 500
//!
//! [breaker]
//! failure_threshold = 5
//!
//! [breaker.overrides.payments]
//! failure_threshold = 2
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stratus_abstraction::Clock;
use stratus_resilience::{
    BackpressureLimiter, BulkheadConfig, BulkheadRegistry, CircuitBreakerConfig,
    CircuitBreakerRegistry, LoadShedConfig, RateLimitConfig, RetryConfig, ShedMode,
};

use crate::error::ConfigError;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "STRATUS_CONFIG";

/// Bulkhead slots when bulkheads are disabled but another backpressure
/// mechanism is on.
const UNBOUNDED_SLOTS: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StratusConfig {
    /// Scheduler and executor limits.
    pub engine: EngineSettings,
    /// Retry tiers.
    pub retry: RetrySettings,
    /// Circuit breakers.
    pub breaker: BreakerSettings,
    /// Per-target bulkheads.
    pub bulkhead: BulkheadSettings,
    /// Global rate limit.
    pub rate_limit: RateLimitSettings,
    /// Priority load shedding.
    pub load_shed: LoadShedSettings,
    /// Idempotency records.
    pub idempotency: IdempotencySettings,
    /// Consensus groups.
    pub consensus: ConsensusSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// `[engine]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Steps of one run executing at once.
    pub max_parallelism: usize,
    /// Limit for a single agent invocation.
    pub step_timeout_ms: u64,
    /// In-flight executions that count as full load for shedding.
    pub load_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { max_parallelism: 4, step_timeout_ms: 300_000, load_capacity: 64 }
    }
}

impl EngineSettings {
    /// Step timeout as a duration.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// One retry tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryTierSettings {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay_ms: u64,
    /// Upper bound for any delay.
    pub max_delay_ms: u64,
    /// Backoff multiplier.
    pub base: f64,
    /// Whether to jitter delays.
    pub jitter: bool,
}

impl RetryTierSettings {
    fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay_ms: config.initial_delay.as_millis() as u64,
            max_delay_ms: config.max_delay.as_millis() as u64,
            base: config.base,
            jitter: config.jitter,
        }
    }

    /// Converts to the resilience crate's config.
    pub fn to_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            base: self.base,
            jitter: self.jitter,
        }
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(format!("{}.max_attempts must be at least 1", section)));
        }
        if !self.base.is_finite() || self.base < 1.0 {
            return Err(ConfigError::Validation(format!(
                "{}.base must be at least 1.0, got {}",
                section, self.base
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::Validation(format!(
                "{}.max_delay_ms must not be below initial_delay_ms",
                section
            )));
        }
        Ok(())
    }
}

/// `[retry]`: the base tier inside the executor and the escalated tier
/// the scheduler applies to environmental failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Quick retries around each invocation.
    pub base: RetryTierSettings,
    /// Backoff retries around whole step attempts.
    pub escalated: RetryTierSettings,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base: RetryTierSettings::from_config(&RetryConfig::base_tier()),
            escalated: RetryTierSettings::from_config(&RetryConfig::escalated_tier()),
        }
    }
}

/// Breaker thresholds for one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerThresholds {
    /// Failures inside the window that open the circuit.
    pub failure_threshold: u32,
    /// Half-open successes that close it again.
    pub success_threshold: u32,
    /// Time spent open before trial calls.
    pub open_timeout_ms: u64,
    /// Sliding failure window.
    pub failure_window_ms: u64,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            open_timeout_ms: config.open_timeout.as_millis() as u64,
            failure_window_ms: config.failure_window.as_millis() as u64,
        }
    }
}

impl BreakerThresholds {
    /// Converts to the resilience crate's config.
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            failure_window: Duration::from_millis(self.failure_window_ms),
        }
    }
}

/// `[breaker]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Thresholds for every dependency without an override.
    #[serde(flatten)]
    pub defaults: BreakerThresholds,
    /// Per-dependency thresholds.
    pub overrides: BTreeMap<String, BreakerThresholds>,
}

impl BreakerSettings {
    /// Builds a breaker registry.
    pub fn registry(&self, clock: Arc<dyn Clock>) -> CircuitBreakerRegistry {
        self.overrides.iter().fold(
            CircuitBreakerRegistry::new(self.defaults.to_config(), clock),
            |registry, (dependency, thresholds)| registry.with_override(dependency, thresholds.to_config()),
        )
    }
}

/// Bulkhead limits for one compartment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadLimits {
    /// Concurrent slots.
    pub max_concurrent: usize,
    /// Callers allowed to wait.
    pub queue_size: usize,
    /// Longest wait for a slot.
    pub timeout_ms: u64,
}

impl Default for BulkheadLimits {
    fn default() -> Self {
        let config = BulkheadConfig::default();
        Self {
            max_concurrent: config.max_concurrent,
            queue_size: config.queue_size,
            timeout_ms: config.timeout.as_millis() as u64,
        }
    }
}

impl BulkheadLimits {
    /// Converts to the resilience crate's config.
    pub fn to_config(&self) -> BulkheadConfig {
        BulkheadConfig {
            max_concurrent: self.max_concurrent,
            queue_size: self.queue_size,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// `[bulkhead]`: one compartment per agent target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadSettings {
    /// Whether bulkheads are applied.
    pub enabled: bool,
    /// Limits for every target without an override.
    #[serde(flatten)]
    pub defaults: BulkheadLimits,
    /// Per-target limits.
    pub overrides: BTreeMap<String, BulkheadLimits>,
}

/// `[rate_limit]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Whether the rate limit is applied.
    pub enabled: bool,
    /// Operations per window.
    pub max_operations: usize,
    /// Window length.
    pub window_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let config = RateLimitConfig::default();
        Self {
            enabled: false,
            max_operations: config.max_operations,
            window_ms: config.window.as_millis() as u64,
        }
    }
}

/// `[load_shed]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadShedSettings {
    /// Whether load shedding is applied.
    pub enabled: bool,
    /// Load fraction above which shedding starts.
    pub max_load: f64,
    /// Decision mode.
    pub mode: ShedMode,
}

impl Default for LoadShedSettings {
    fn default() -> Self {
        let config = LoadShedConfig::default();
        Self { enabled: false, max_load: config.max_load, mode: config.mode }
    }
}

/// `[idempotency]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    /// Record lifetime.
    pub ttl_ms: u64,
    /// Mirror records to the engine's store.
    pub persist: bool,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self { ttl_ms: 24 * 60 * 60 * 1000, persist: true }
    }
}

impl IdempotencySettings {
    /// TTL as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// `[consensus]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSettings {
    /// Voting deadline for groups that do not set one.
    pub default_timeout_ms: u64,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self { default_timeout_ms: 30_000 }
    }
}

impl ConsensusSettings {
    /// Default deadline as a duration.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Plain }
    }
}

impl StratusConfig {
    /// Loads configuration.
    ///
    /// Searches in order:
    /// 1. the file named by `$STRATUS_CONFIG`
    /// 2. `./stratus.toml` (workspace config)
    /// 3. `~/.stratus/config.toml` (home directory config)
    ///
    /// Falls back to defaults if no file is found.
    ///
    /// # Errors
    /// Returns `ConfigError` if a file exists but parsing or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            return Self::load_from_file(explicit);
        }

        let workspace_config = Path::new("./stratus.toml");
        if workspace_config.exists() {
            return Self::load_from_file(workspace_config);
        }

        if let Ok(home) = std::env::var("HOME") {
            let home_config = PathBuf::from(home).join(".stratus/config.toml");
            if home_config.exists() {
                return Self::load_from_file(&home_config);
            }
        }

        Ok(Self::default())
    }

    /// Loads configuration from a specific file.
    ///
    /// # Arguments
    /// * `path` - Path to TOML configuration file
    ///
    /// # Errors
    /// Returns `ConfigError` if file cannot be read, parsed, or validated.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_parallelism == 0 {
            return Err(ConfigError::Validation("engine.max_parallelism must be at least 1".to_string()));
        }
        if self.engine.step_timeout_ms == 0 {
            return Err(ConfigError::Validation("engine.step_timeout_ms must be positive".to_string()));
        }
        if self.engine.load_capacity == 0 {
            return Err(ConfigError::Validation("engine.load_capacity must be at least 1".to_string()));
        }

        self.retry.base.validate("retry.base")?;
        self.retry.escalated.validate("retry.escalated")?;

        let breakers = std::iter::once(("breaker".to_string(), &self.breaker.defaults)).chain(
            self.breaker.overrides.iter().map(|(name, t)| (format!("breaker.overrides.{}", name), t)),
        );
        for (section, thresholds) in breakers {
            if thresholds.failure_threshold == 0 || thresholds.success_threshold == 0 {
                return Err(ConfigError::Validation(format!(
                    "{}: thresholds must be at least 1",
                    section
                )));
            }
        }

        if self.rate_limit.enabled && (self.rate_limit.max_operations == 0 || self.rate_limit.window_ms == 0) {
            return Err(ConfigError::Validation(
                "rate_limit.max_operations and window_ms must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.load_shed.max_load) {
            return Err(ConfigError::Validation(format!(
                "load_shed.max_load must be between 0.0 and 1.0, got {}",
                self.load_shed.max_load
            )));
        }
        if self.idempotency.ttl_ms == 0 {
            return Err(ConfigError::Validation("idempotency.ttl_ms must be positive".to_string()));
        }
        if self.consensus.default_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "consensus.default_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the backpressure limiter, or `None` when every mechanism is off.
    pub fn backpressure(&self, clock: Arc<dyn Clock>) -> Option<BackpressureLimiter> {
        if !(self.bulkhead.enabled || self.rate_limit.enabled || self.load_shed.enabled) {
            return None;
        }

        let bulkheads = if self.bulkhead.enabled {
            self.bulkhead.overrides.iter().fold(
                BulkheadRegistry::new(self.bulkhead.defaults.to_config()),
                |registry, (target, limits)| registry.with_override(target, limits.to_config()),
            )
        } else {
            BulkheadRegistry::new(BulkheadConfig {
                max_concurrent: UNBOUNDED_SLOTS,
                queue_size: 0,
                timeout: Duration::ZERO,
            })
        };

        let mut limiter = BackpressureLimiter::new(BulkheadConfig::default()).with_bulkheads(bulkheads);
        if self.rate_limit.enabled {
            limiter = limiter.with_rate_limit(
                RateLimitConfig {
                    max_operations: self.rate_limit.max_operations,
                    window: Duration::from_millis(self.rate_limit.window_ms),
                },
                clock,
            );
        }
        if self.load_shed.enabled {
            limiter = limiter.with_load_shedding(LoadShedConfig {
                max_load: self.load_shed.max_load,
                mode: self.load_shed.mode,
            });
        }
        Some(limiter)
    }
}
