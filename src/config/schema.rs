//! Bootstrap configuration schema.
//!
//! Everything here is read once at process start and is immutable for the
//! life of the process. All types derive Serde traits for deserialization
//! from TOML and every section has defaults, so an empty file is valid.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the control plane.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// L1/L2 capacities and time-to-live values.
    pub cache: CacheConfig,

    /// Persistence connection parameters.
    pub store: StoreConfig,

    /// Flag-store circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Invalidation bus topics and limits.
    pub bus: BusConfig,

    /// Environment names and inheritance.
    pub environments: EnvironmentsConfig,

    /// Dynamic rate limiter settings.
    pub rate_limit: RateLimitConfig,

    /// Static flag fallbacks.
    pub flags: FlagsConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,

    /// Definitions created at start-up.
    pub seed: SeedConfig,
}

/// Cache tier configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum resolved values held in each instance's L1.
    pub l1_capacity: usize,

    /// Absolute L1 time-to-live in milliseconds. Bounds staleness when an
    /// invalidation message is lost.
    pub l1_ttl_ms: u64,

    /// Up to this much is shaved off each L1 TTL at random.
    pub l1_ttl_jitter_ms: u64,

    /// L2 time-to-live in seconds.
    pub l2_ttl_secs: u64,

    /// Maximum flag definitions held in L1.
    pub flag_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 10_000,
            l1_ttl_ms: 5_000,
            l1_ttl_jitter_ms: 500,
            l2_ttl_secs: 300,
            flag_capacity: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn l2_ttl(&self) -> Duration {
        Duration::from_secs(self.l2_ttl_secs)
    }
}

/// Store connection configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection URL. `memory://` selects the in-process store.
    pub url: String,

    /// Maximum pooled connections.
    pub pool_size: u32,

    /// Deadline for a single store call in milliseconds.
    pub call_timeout_ms: u64,

    /// Deadline for a single L2 call in milliseconds.
    pub cache_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "memory://".to_string(),
            pool_size: 10,
            call_timeout_ms: 2_000,
            cache_timeout_ms: 250,
        }
    }
}

impl StoreConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Time spent open before a single probe is allowed, in milliseconds.
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

/// Invalidation bus configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Topic carrying configuration value invalidations.
    pub config_topic: String,

    /// Topic carrying flag definition invalidations.
    pub flag_topic: String,

    /// Per-subscriber buffer before messages are dropped.
    pub channel_capacity: usize,

    /// Deadline for a publish in milliseconds.
    pub publish_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            config_topic: "config.invalidate".to_string(),
            flag_topic: "flags.invalidate".to_string(),
            channel_capacity: 1_024,
            publish_timeout_ms: 500,
        }
    }
}

impl BusConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Environment declarations.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvironmentsConfig {
    /// Name of the scope that writes the entry's own value.
    pub global: String,

    /// Known environments. Reads in undeclared environments resolve
    /// override then global, without inheritance.
    pub declared: Vec<EnvironmentConfig>,
}

impl Default for EnvironmentsConfig {
    fn default() -> Self {
        Self {
            global: "global".to_string(),
            declared: vec![
                EnvironmentConfig::new("development"),
                EnvironmentConfig::new("staging"),
                EnvironmentConfig::new("production"),
            ],
        }
    }
}

/// One declared environment.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EnvironmentConfig {
    pub name: String,

    /// Overrides of the parent apply when this environment has none.
    #[serde(default)]
    pub parent: Option<String>,
}

impl EnvironmentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Configuration keys under this prefix are rate limit rules.
    pub rule_prefix: String,

    /// Environment rules are resolved in.
    pub environment: String,

    /// Maximum waiters per scoped key for `queue` rules.
    pub queue_capacity: usize,

    /// Longest a queued request waits before it is rejected, in milliseconds.
    pub max_queue_wait_ms: u64,

    /// Admit requests when the distributed cache is unreachable.
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rule_prefix: "ratelimit.".to_string(),
            environment: "production".to_string(),
            queue_capacity: 100,
            max_queue_wait_ms: 10_000,
            fail_open: true,
        }
    }
}

impl RateLimitConfig {
    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_millis(self.max_queue_wait_ms)
    }
}

/// Feature flag configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FlagsConfig {
    /// Served when a flag cannot be loaded and nothing is cached.
    pub static_defaults: BTreeMap<String, bool>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Seed definitions.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SeedConfig {
    /// TOML file with entries, flags and templates to create at start-up.
    pub path: Option<PathBuf>,

    /// Actor recorded on seeded changes.
    pub actor: Option<String>,
}
