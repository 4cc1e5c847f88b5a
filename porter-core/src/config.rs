use std::env;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Resolved gateway configuration.
///
/// Defaults are layered under an optional YAML file, and `PORTER_*`
/// environment variables override the result. Unknown YAML keys are
/// rejected so a typo fails at startup instead of silently using a
/// default.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub logging: LoggingSection,
    pub metrics: MetricsSection,
    pub tls: TlsSection,
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Flight SQL bind address, `host:port`.
    pub address: String,
    /// Hard ceiling on open backend connections.
    pub max_connections: usize,
    /// Idle connections retained beyond which returns close the handle.
    pub max_idle_connections: usize,
    /// Seconds before a handle is retired regardless of health.
    pub conn_max_lifetime_seconds: u64,
    /// Seconds between idle-handle ping sweeps.
    pub health_check_period_seconds: u64,
    /// Milliseconds a caller may wait for a pool handle.
    pub acquire_timeout_ms: u64,
    /// Per-query deadline in seconds; 0 disables.
    pub query_deadline_seconds: u64,
    /// Seconds an issued ticket stays redeemable.
    pub ticket_ttl_seconds: u64,
    /// Seconds an idle prepared statement survives before the reaper
    /// releases its pinned connection.
    pub prepared_idle_timeout_seconds: u64,
    /// Rows per emitted record batch.
    pub batch_size: usize,
    /// Maximum cached schema/result entries.
    pub cache_max_entries: usize,
    /// Maximum total bytes held by the cache.
    pub cache_max_bytes: usize,
    /// Ping the backend once at startup and refuse to serve on failure.
    pub startup_health_check: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    /// Backend DSN: `embedded://...` or `remote://host:port/db?...`.
    pub dsn: String,
    /// Token for the hosted embedded engine.
    pub token: Option<String>,
    /// SQL executed once per fresh connection.
    pub init_sql: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    /// `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// `compact` or `json`.
    pub format: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsSection {
    pub enabled: bool,
    /// Prometheus/health bind address, `host:port`.
    pub address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    pub enabled: bool,
    /// Basic credentials.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Static bearer token accepted alongside basic credentials.
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSection {
                address: "0.0.0.0:32010".to_string(),
                max_connections: 16,
                max_idle_connections: 4,
                conn_max_lifetime_seconds: 1800,
                health_check_period_seconds: 30,
                acquire_timeout_ms: 5_000,
                query_deadline_seconds: 0,
                ticket_ttl_seconds: 300,
                prepared_idle_timeout_seconds: 600,
                batch_size: 1024,
                cache_max_entries: 256,
                cache_max_bytes: 64 * 1024 * 1024,
                startup_health_check: true,
            },
            database: DatabaseSection {
                dsn: "embedded://:memory:".to_string(),
                token: None,
                init_sql: None,
            },
            logging: LoggingSection {
                level: "info".to_string(),
                format: "compact".to_string(),
            },
            metrics: MetricsSection {
                enabled: false,
                address: "0.0.0.0:9090".to_string(),
            },
            tls: TlsSection {
                enabled: false,
                cert_path: None,
                key_path: None,
            },
            auth: AuthSection {
                enabled: false,
                username: None,
                password: None,
                token: None,
            },
        }
    }
}

impl ServerConfig {
    /// Load defaults, layer an optional YAML file, then apply `PORTER_*`
    /// environment overrides.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let mut builder = config::Config::builder().add_source(
            config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
        );
        if let Some(path) = config_path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            builder = builder
                .add_source(config::File::from_str(&text, config::FileFormat::Yaml).required(true));
        }
        let settings = builder
            .build()
            .with_context(|| "failed to load configuration")?;
        let mut cfg: ServerConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Flat `PORTER_*` variables documented for operators, plus the hosted
    /// engine token convention.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("PORTER_ADDRESS") {
            self.server.address = v;
        }
        if let Ok(v) = env::var("PORTER_DATABASE") {
            self.database.dsn = v;
        }
        if let Ok(v) = env::var("PORTER_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = env::var("PORTER_LOG_FORMAT") {
            self.logging.format = v;
        }
        if let Ok(v) = env::var("PORTER_METRICS_ENABLED") {
            self.metrics.enabled = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = env::var("PORTER_METRICS_ADDRESS") {
            self.metrics.address = v;
        }
        if let Ok(v) = env::var("PORTER_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                self.server.max_connections = n;
            }
        }
        if let Ok(v) = env::var("PORTER_AUTH_TOKEN") {
            self.auth.token = Some(v);
        }
        if self.database.token.is_none() {
            if let Ok(v) = env::var("MOTHERDUCK_TOKEN") {
                self.database.token = Some(v);
            }
        }
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        resolve_addr(&self.server.address)
    }

    pub fn metrics_addr(&self) -> anyhow::Result<SocketAddr> {
        resolve_addr(&self.metrics.address)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.batch_size == 0 {
            anyhow::bail!("server.batch_size must be greater than zero");
        }
        if self.server.max_connections == 0 {
            anyhow::bail!("server.max_connections must be greater than zero");
        }
        if self.database.dsn.trim().is_empty() {
            anyhow::bail!("database.dsn must not be empty");
        }
        if !matches!(self.logging.level.as_str(), "debug" | "info" | "warn" | "error") {
            anyhow::bail!("logging.level must be one of debug, info, warn, error");
        }
        if !matches!(self.logging.format.as_str(), "compact" | "json") {
            anyhow::bail!("logging.format must be compact or json");
        }
        if self.tls.enabled && (self.tls.cert_path.is_none() || self.tls.key_path.is_none()) {
            anyhow::bail!("tls.cert_path and tls.key_path are required when tls is enabled");
        }
        Ok(())
    }
}

fn resolve_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("invalid address {addr}"))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("unable to resolve bind address for {addr}"))
}
