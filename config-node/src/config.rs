use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::coordination::RetryPolicy;
use crate::error::{ConfigNodeError, Result};
use crate::registry::FilterRegistry;

/// Main configuration for the configuration node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Coordination service connection
    pub coordination: CoordinationConfig,
    /// Watched cache settings
    pub cache: CacheConfig,
    /// Known filters seeded at bootstrap
    pub filters: FilterRegistry,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics and monitoring
    pub metrics: MetricsConfig,
}

/// Which coordination backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    /// In-process tree, single node only
    Memory,
    /// NATS JetStream key-value bucket shared by the fleet
    Nats,
}

/// Coordination service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Backend selection
    pub backend: CoordinationBackend,
    /// NATS server URLs
    pub nats_servers: Vec<String>,
    /// JetStream key-value bucket holding the tree
    pub bucket: String,
    /// Connection name (random per process when unset)
    pub connection_name: Option<String>,
    /// Connect timeout per attempt in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-call timeout in milliseconds, unbounded when unset
    pub call_timeout_ms: Option<u64>,
    /// Initial connection retry policy
    pub retry: RetryPolicy,
    /// Consecutive failed reconnects after which a session counts as lost
    pub max_reconnect_failures: u32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: CoordinationBackend::Nats,
            nats_servers: vec!["nats://127.0.0.1:4222".to_string()],
            bucket: "waf-config".to_string(),
            connection_name: None,
            connect_timeout_ms: 5000,
            call_timeout_ms: None,
            retry: RetryPolicy::default(),
            max_reconnect_failures: 60,
        }
    }
}

impl CoordinationConfig {
    /// In-process backend, used by tests and single-node setups
    pub fn memory() -> Self {
        Self {
            backend: CoordinationBackend::Memory,
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

/// Watched cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Concurrent rule reads per filter during `get_request_configs`
    pub rule_read_concurrency: usize,
    /// How long startup waits for the initial snapshot (milliseconds)
    pub initial_sync_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rule_read_concurrency: 8,
            initial_sync_timeout_ms: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn initial_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_sync_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, text)
    pub format: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("text".to_string()),
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.as_deref() == Some("json")
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,
    /// Metrics server address
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "0.0.0.0:9191".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file with `WAFCFG_` environment overrides
    ///
    /// Nested keys use a double underscore, e.g.
    /// `WAFCFG_COORDINATION__BUCKET=waf-staging`.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("WAFCFG")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: NodeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigNodeError::Config(e.to_string()))
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        self.metrics.listen_addr.parse().map_err(|e| {
            ConfigNodeError::Config(format!(
                "invalid metrics listen address {:?}: {}",
                self.metrics.listen_addr, e
            ))
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let coordination = &self.coordination;

        if coordination.backend == CoordinationBackend::Nats {
            if coordination.nats_servers.is_empty() {
                return Err(ConfigNodeError::Config(
                    "at least one NATS server is required for the nats backend".to_string(),
                ));
            }
            if coordination.bucket.is_empty() {
                return Err(ConfigNodeError::Config("bucket cannot be empty".to_string()));
            }
        }

        if coordination.retry.base_delay_ms == 0 {
            return Err(ConfigNodeError::Config(
                "retry base delay must be positive".to_string(),
            ));
        }

        if coordination.retry.max_delay_ms < coordination.retry.base_delay_ms {
            return Err(ConfigNodeError::Config(
                "retry max delay cannot be below the base delay".to_string(),
            ));
        }

        if coordination.max_reconnect_failures == 0 {
            return Err(ConfigNodeError::Config(
                "max reconnect failures must be at least 1".to_string(),
            ));
        }

        if coordination.call_timeout_ms == Some(0) {
            return Err(ConfigNodeError::Config("call timeout must be positive".to_string()));
        }

        if self.cache.rule_read_concurrency == 0 {
            return Err(ConfigNodeError::Config(
                "rule read concurrency must be at least 1".to_string(),
            ));
        }

        if self.metrics.enabled {
            self.metrics_addr()?;
        }

        self.filters.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.coordination.backend, CoordinationBackend::Nats);
        assert_eq!(config.coordination.bucket, "waf-config");
        assert_eq!(config.coordination.call_timeout(), None);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = NodeConfig::default();
        config.coordination.nats_servers.clear();
        assert!(config.validate().is_err());

        // Memory backend does not need servers
        config.coordination.backend = CoordinationBackend::Memory;
        assert!(config.validate().is_ok());

        config.cache.rule_read_concurrency = 0;
        assert!(config.validate().is_err());
        config.cache.rule_read_concurrency = 4;

        config.coordination.call_timeout_ms = Some(0);
        assert!(config.validate().is_err());
        config.coordination.call_timeout_ms = Some(250);

        config.coordination.max_reconnect_failures = 0;
        assert!(config.validate().is_err());
        config.coordination.max_reconnect_failures = 10;

        config.metrics.enabled = true;
        config.metrics.listen_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = NodeConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[coordination]"));

        let parsed: NodeConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.coordination.bucket, config.coordination.bucket);
        assert_eq!(parsed.filters, config.filters);
    }
}
