//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (NRP_*)
//! 2. Config file (server.toml)
//! 3. Default values

use std::env;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Environment variable prefix
const ENV_PREFIX: &str = "NRP";

/// Server configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both listeners bind to
    pub bind_addr: Option<IpAddr>,

    /// Port tunnel clients connect to
    pub port: Option<u16>,

    /// Port of the public HTTP/WebSocket edge
    pub vhost_http_port: Option<u16>,

    /// Parent domain for clients whose settings omit `subdomain_host`
    pub subdomain_host: Option<String>,

    /// Seconds without inbound tunnel bytes before a connection is dropped
    pub idle_timeout_secs: Option<u64>,

    /// Seconds the edge waits for a response head
    pub response_timeout_secs: Option<u64>,
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub vhost_http_port: u16,
    pub subdomain_host: Option<String>,
    pub idle_timeout: Duration,
    pub response_timeout: Duration,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

/// Get environment variable parsed into `T`, ignoring unparsable values
fn get_env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        let bind_addr = get_env_parsed("BIND_ADDR")
            .or(self.bind_addr)
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        let port = get_env_parsed("PORT").or(self.port).unwrap_or(7000);

        let vhost_http_port = get_env_parsed("VHOST_HTTP_PORT")
            .or(self.vhost_http_port)
            .unwrap_or(8080);

        if port == vhost_http_port {
            anyhow::bail!(
                "Tunnel port and vhost_http_port are both {}. Set NRP_PORT or NRP_VHOST_HTTP_PORT",
                port
            );
        }

        let subdomain_host = get_env("SUBDOMAIN_HOST")
            .or(self.subdomain_host)
            .map(|h| h.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty());

        let idle_timeout_secs = get_env_parsed("IDLE_TIMEOUT_SECS")
            .or(self.idle_timeout_secs)
            .unwrap_or(60);

        let response_timeout_secs = get_env_parsed("RESPONSE_TIMEOUT_SECS")
            .or(self.response_timeout_secs)
            .unwrap_or(30);

        Ok(ResolvedServerConfig {
            bind_addr,
            port,
            vhost_http_port,
            subdomain_host,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            response_timeout: Duration::from_secs(response_timeout_secs),
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedServerConfig> {
        let config = Self::load(path);
        config.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_prefix() {
        assert_eq!(ENV_PREFIX, "NRP");
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.port.is_none());
        assert!(config.vhost_http_port.is_none());
        assert!(config.subdomain_host.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 7100
            vhost_http_port = 8100
            subdomain_host = ".Tunnel.Example.com"
            idle_timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.port, Some(7100));
        assert_eq!(config.idle_timeout_secs, Some(5));

        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.subdomain_host.as_deref(), Some("tunnel.example.com"));
        assert_eq!(resolved.idle_timeout, Duration::from_secs(5));
        assert_eq!(resolved.response_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_same_ports_rejected() {
        let config = ServerConfig {
            port: Some(9000),
            vhost_http_port: Some(9000),
            ..Default::default()
        };
        assert!(config.resolve().is_err());
    }
}
