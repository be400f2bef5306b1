//! Client configuration: a TOML file holding the tunnel settings, with
//! `NRP_*` environment variables taking priority for the connection target.

use std::env;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use nrp_protocol::ClientSettings;

use crate::connector::DEFAULT_PING_INTERVAL;

/// Environment variable prefix
const ENV_PREFIX: &str = "NRP";

/// Client configuration (parsed from TOML)
///
/// The settings fields sit at the top level of the file and are sent to the
/// server verbatim during the handshake.
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub settings: ClientSettings,

    /// Seconds between keep-alive pings
    #[serde(default)]
    pub ping_interval_secs: Option<u64>,
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ResolvedClientConfig {
    pub settings: ClientSettings,
    pub ping_interval: Duration,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: ClientConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment overrides and defaults
    pub fn resolve(self) -> anyhow::Result<ResolvedClientConfig> {
        let mut settings = self.settings;

        if let Some(host) = get_env("BIND_HOST") {
            settings.bind_host = host;
        }
        if let Some(port) = get_env("BIND_PORT") {
            settings.bind_port = port
                .parse()
                .with_context(|| format!("Invalid {}_BIND_PORT: {}", ENV_PREFIX, port))?;
        }
        if let Some(host) = get_env("SUBDOMAIN_HOST") {
            settings.subdomain_host = Some(host);
        }

        if settings.bind_host.trim().is_empty() {
            anyhow::bail!("Server host required. Set NRP_BIND_HOST or bind_host in config");
        }
        if settings.http.is_empty() {
            tracing::warn!("No services configured under [http], the tunnel will route nothing");
        }

        let ping_interval = get_env("PING_INTERVAL_SECS")
            .and_then(|v| v.parse().ok())
            .or(self.ping_interval_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PING_INTERVAL);

        Ok(ResolvedClientConfig {
            settings,
            ping_interval,
        })
    }

    /// Load and resolve configuration from a TOML file
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedClientConfig> {
        let config = Self::load(path).with_context(|| format!("Failed to read {}", path))?;
        config.resolve()
    }
}
