//! Gateway configuration.
//!
//! Loads YAML or TOML files, applies environment overrides, and validates
//! the upstream and virtual-server definitions the gateway boots with.

use crate::error::{Error, Result};
use crate::vmcp::AggregationRule;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mcp_servers: Vec<UpstreamSpec>,
    #[serde(default)]
    pub vmcps: Vec<VmcpSpec>,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub vmcp: VmcpLimits,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Management listener settings. The port is reserved even though the REST
/// surface itself lives outside the core: virtual servers may not claim it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// A prepopulated upstream MCP server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamSpec {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// A prepopulated virtual-server definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VmcpSpec {
    pub name: String,
    pub port: u16,
    pub source_server_ids: Vec<String>,
    pub aggregation_rules: Vec<AggregationRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_queue_high_water")]
    pub queue_high_water: usize,
}

impl TransportSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_interval_ms")]
    pub interval_ms: u64,
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct VmcpLimits {
    #[serde(default)]
    pub max_instances: Option<usize>,
    #[serde(default)]
    pub port_range: Option<PortRange>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_timeout_ms() -> u64 {
    30000
}
fn default_queue_high_water() -> usize {
    1024
}
fn default_refresh_interval_ms() -> u64 {
    300_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_ms: default_timeout_ms(),
            queue_high_water: default_queue_high_water(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("yaml");

        let config: Config = match extension {
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML: {}", e)))?,
            "toml" => toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?,
            _ => {
                return Err(Error::Config(format!(
                    "Unsupported config format: {}",
                    extension
                )))
            },
        };

        Ok(config)
    }

    /// Load from a file when given, otherwise start from defaults; then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `NEXUS_PORT`/`PORT` and the `MCP_ENV_VARS` JSON dictionary.
    ///
    /// `NEXUS_PORT` takes precedence over the generic `PORT`. Recognized
    /// `MCP_ENV_VARS` keys override their config counterparts; unknown keys
    /// are ignored with a warning.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let port_override = std::env::var("NEXUS_PORT")
            .or_else(|_| std::env::var("PORT"))
            .ok();
        if let Some(raw) = port_override {
            let port: u16 = raw
                .parse()
                .map_err(|_| Error::Config(format!("Invalid port override: {}", raw)))?;
            self.server.port = port;
        }

        if let Ok(raw) = std::env::var("MCP_ENV_VARS") {
            let vars: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("Invalid MCP_ENV_VARS: {}", e)))?;
            for (key, value) in vars {
                self.apply_env_var(&key, &value)?;
            }
        }

        Ok(())
    }

    fn apply_env_var(&mut self, key: &str, value: &serde_json::Value) -> Result<()> {
        let as_u64 = |v: &serde_json::Value| -> Result<u64> {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| Error::Config(format!("Invalid value for {}: {}", key, v)))
        };

        match key {
            "port" => self.server.port = as_u64(value)? as u16,
            "timeout_ms" => self.transport.timeout_ms = as_u64(value)?,
            "retry_delay_ms" => self.transport.retry_delay_ms = as_u64(value)?,
            "max_retries" => self.transport.max_retries = as_u64(value)? as u32,
            "refresh_interval_ms" => self.refresh.interval_ms = as_u64(value)?,
            "log_level" => {
                self.observability.logging.level = value
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::Config(format!("Invalid value for {}", key)))?;
            },
            other => tracing::warn!("Ignoring unknown MCP_ENV_VARS key: {}", other),
        }
        Ok(())
    }

    /// Validate cross-entry invariants before the gateway boots.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut enabled_urls = HashSet::new();
        for upstream in &self.mcp_servers {
            if upstream.name.trim().is_empty() {
                return Err(Error::Config("upstream name must not be empty".into()));
            }
            if !names.insert(upstream.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate upstream name: {}",
                    upstream.name
                )));
            }
            let parsed = url::Url::parse(&upstream.url)
                .map_err(|e| Error::Config(format!("invalid url for '{}': {}", upstream.name, e)))?;
            if !upstream.disabled {
                let key = format!(
                    "{}:{}",
                    parsed.host_str().unwrap_or_default(),
                    parsed.port_or_known_default().unwrap_or_default()
                );
                if !enabled_urls.insert(key) {
                    return Err(Error::Config(format!(
                        "duplicate url among enabled upstreams: {}",
                        upstream.url
                    )));
                }
            }
        }

        let mut ports = HashSet::new();
        ports.insert(self.server.port);
        for vmcp in &self.vmcps {
            if vmcp.name.trim().is_empty() {
                return Err(Error::Config("vmcp name must not be empty".into()));
            }
            if !ports.insert(vmcp.port) {
                return Err(Error::PortUnavailable(vmcp.port));
            }
            for source in &vmcp.source_server_ids {
                if !names.contains(source.as_str()) {
                    return Err(Error::UnknownSource(source.clone()));
                }
            }
        }

        Ok(())
    }

    /// Validate a configuration file without booting anything.
    pub fn validate_file(path: &Path) -> Result<()> {
        let config = Self::from_file(path)?;
        config.validate()
    }
}
