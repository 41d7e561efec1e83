//! ---
//! apm_section: "01-core-functionality"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Shared primitives and utilities for the agent runtime."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_service_name() -> String {
    "unnamed-service".to_owned()
}

fn default_force_reconnection_period() -> u32 {
    1
}

fn default_backend_service() -> String {
    "127.0.0.1:11800".to_owned()
}

fn default_channel_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_dynamic_config_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    "0.0.0.0:9090".parse().expect("valid default metrics address")
}

/// Primary configuration object for the R-APM agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub collector: CollectorSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AgentConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAgentConfig {
    pub config: AgentConfig,
    pub source: PathBuf,
}

impl AgentConfig {
    pub const ENV_CONFIG_PATH: &'static str = "R_APM_CONFIG";

    /// Load configuration from disk, respecting the `R_APM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAgentConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAgentConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAgentConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AgentConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.agent.service_name.trim().is_empty() {
            return Err(anyhow!("agent.service_name must not be empty"));
        }
        self.collector.validate()?;
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent: AgentSettings::default(),
            collector: CollectorSettings::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl std::str::FromStr for AgentConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AgentConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Identity and behaviour settings of the instrumented process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Logical service identity reported with every configuration sync.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Instance name; synthesised at boot when absent or blank.
    #[serde(default)]
    pub instance_name: Option<String>,
    /// Opaque token attached to every outgoing call. Blank disables the header.
    #[serde(default)]
    pub authentication: String,
    /// Number of same-endpoint health ticks before a connectivity probe is forced.
    #[serde(default = "default_force_reconnection_period")]
    pub force_reconnection_period: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            instance_name: None,
            authentication: String::new(),
            force_reconnection_period: default_force_reconnection_period(),
        }
    }
}

/// Collector uplink settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSettings {
    /// Comma-separated `host:port` list of collector endpoints.
    #[serde(default = "default_backend_service")]
    pub backend_service: String,
    /// Re-expand the first endpoint's hostname through DNS on every
    /// reconnect-pending health tick.
    #[serde(default)]
    pub is_resolve_dns_periodically: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_channel_check_interval")]
    pub grpc_channel_check_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_dynamic_config_interval")]
    pub get_agent_dynamic_config_interval: Duration,
    /// Deadline applied to every upstream call.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_upstream_timeout")]
    pub grpc_upstream_timeout: Duration,
    #[serde(default)]
    pub tls: TlsSettings,
}

impl CollectorSettings {
    /// Split the configured backend list into trimmed, non-empty entries.
    /// An empty result is tolerated here; the uplink reports itself disabled.
    pub fn backend_servers(&self) -> Vec<String> {
        self.backend_service
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_owned)
            .collect()
    }

    fn validate(&self) -> Result<()> {
        for entry in self.backend_servers() {
            split_endpoint(&entry)
                .with_context(|| format!("invalid collector endpoint {entry:?}"))?;
        }
        if let Some(path) = &self.tls.trusted_ca_path {
            if self.tls.enabled && !path.as_os_str().is_empty() && !path.exists() {
                return Err(anyhow!(
                    "tls trusted_ca_path {} does not exist",
                    path.display()
                ));
            }
        }
        Ok(())
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            backend_service: default_backend_service(),
            is_resolve_dns_periodically: false,
            grpc_channel_check_interval: default_channel_check_interval(),
            get_agent_dynamic_config_interval: default_dynamic_config_interval(),
            grpc_upstream_timeout: default_upstream_timeout(),
            tls: TlsSettings::default(),
        }
    }
}

/// Transport security for the collector channel. Plaintext when disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Optional PEM bundle overriding the system roots.
    #[serde(default)]
    pub trusted_ca_path: Option<PathBuf>,
}

/// Logging output settings consumed by [`crate::logging::init_tracing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    /// Log file name prefix; falls back to the service name.
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            file_prefix: None,
            format: default_log_format(),
        }
    }
}

/// Self-telemetry exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Split a `host:port` entry. The port is the suffix after the last colon.
pub fn split_endpoint(entry: &str) -> Result<(String, u16)> {
    let (host, port) = entry
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing port in endpoint {entry:?}"))?;
    if host.is_empty() {
        return Err(anyhow!("missing host in endpoint {entry:?}"));
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in endpoint {entry:?}"))?;
    Ok((host.to_owned(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config: AgentConfig = "".parse().unwrap();
        assert_eq!(config.agent.service_name, "unnamed-service");
        assert_eq!(config.agent.force_reconnection_period, 1);
        assert_eq!(
            config.collector.grpc_channel_check_interval,
            Duration::from_secs(30)
        );
        assert_eq!(
            config.collector.get_agent_dynamic_config_interval,
            Duration::from_secs(20)
        );
        assert!(!config.collector.tls.enabled);
        assert_eq!(config.collector.backend_servers(), vec!["127.0.0.1:11800"]);
    }

    #[test]
    fn parses_full_document() {
        let config: AgentConfig = r#"
            [agent]
            service_name = "billing"
            authentication = "token-1"
            force_reconnection_period = 4

            [collector]
            backend_service = "oap-a:11800, oap-b:11800"
            is_resolve_dns_periodically = true
            grpc_channel_check_interval = 5
            get_agent_dynamic_config_interval = 3
            grpc_upstream_timeout = 10

            [logging]
            format = "pretty"
        "#
        .parse()
        .unwrap();

        assert_eq!(config.agent.service_name, "billing");
        assert!(config.collector.is_resolve_dns_periodically);
        assert_eq!(
            config.collector.backend_servers(),
            vec!["oap-a:11800", "oap-b:11800"]
        );
        assert_eq!(
            config.collector.grpc_upstream_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn blank_backend_service_is_tolerated() {
        let config: AgentConfig = r#"
            [collector]
            backend_service = ""
        "#
        .parse()
        .unwrap();
        assert!(config.collector.backend_servers().is_empty());
    }

    #[test]
    fn rejects_blank_service_name() {
        let parsed = r#"
            [agent]
            service_name = "  "
        "#
        .parse::<AgentConfig>();
        assert!(parsed.is_err());
    }

    #[test]
    fn rejects_malformed_endpoint() {
        let parsed = r#"
            [collector]
            backend_service = "oap-a"
        "#
        .parse::<AgentConfig>();
        assert!(parsed.is_err());
    }

    #[test]
    fn load_prefers_the_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("agent.toml");
        std::fs::write(&present, "[agent]\nservice_name = \"from-disk\"\n").unwrap();

        let missing = dir.path().join("missing.toml");
        let loaded = AgentConfig::load_with_source(&[missing, present.clone()]).unwrap();
        assert_eq!(loaded.source, present);
        assert_eq!(loaded.config.agent.service_name, "from-disk");
    }

    #[test]
    fn splits_endpoints() {
        assert_eq!(
            split_endpoint("collector:11800").unwrap(),
            ("collector".to_owned(), 11800)
        );
        assert!(split_endpoint("collector").is_err());
        assert!(split_endpoint(":11800").is_err());
        assert!(split_endpoint("collector:http").is_err());
    }
}
