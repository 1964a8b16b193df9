use crate::error::{RelayError, Result};
use crate::models::ProxyEndpoint;
use crate::proxy::handler::RelayConfig;
use crate::proxy::target::{BROWSER_USER_AGENT, DEFAULT_IMAGE_HOSTS};
use std::env;
use std::fs;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Inbound relay server configuration
    pub relay: RelayServerConfig,
    /// Upstream pool and outbound request configuration
    pub upstream: UpstreamConfig,
    /// Admin API server configuration
    pub api: ApiServerConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Port for the relay server (default: 8000)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Upstream proxy endpoints in rotation order
    pub endpoints: Vec<ProxyEndpoint>,
    /// Per-stage upstream timeout in seconds
    pub timeout: u64,
    /// Host substrings that mark a target as an image
    pub image_hosts: Vec<String>,
    /// User-Agent sent on outbound requests
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Serve the admin API (default: true)
    pub enabled: bool,
    /// Port for the API server (default: 8001)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Allowed CORS origins (comma-separated, empty = localhost only)
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl RelayServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ApiServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let relay_port = env::var("RELAY_PORT")
            .or_else(|_| env::var("PORT"))
            .unwrap_or_else(|_| "8000".to_string());

        Ok(Config {
            relay: RelayServerConfig {
                port: relay_port.parse().map_err(|_| {
                    RelayError::InvalidConfig("RELAY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("RELAY_HOST", "0.0.0.0"),
            },
            upstream: UpstreamConfig {
                endpoints: load_upstreams()?,
                timeout: get_env_or("UPSTREAM_TIMEOUT", "10").parse().map_err(|_| {
                    RelayError::InvalidConfig("UPSTREAM_TIMEOUT must be a number of seconds".into())
                })?,
                image_hosts: split_list(&get_env_or(
                    "IMAGE_HOSTS",
                    &DEFAULT_IMAGE_HOSTS.join(","),
                )),
                user_agent: get_env_or("RELAY_USER_AGENT", BROWSER_USER_AGENT),
            },
            api: ApiServerConfig {
                enabled: get_env_or("API_ENABLED", "true").parse().unwrap_or(true),
                port: get_env_or("API_PORT", "8001").parse().map_err(|_| {
                    RelayError::InvalidConfig("API_PORT must be a valid port number".into())
                })?,
                host: get_env_or("API_HOST", "0.0.0.0"),
                cors_origins: split_list(&get_env_or("CORS_ORIGINS", "")),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Settings for the relay handler
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            upstream_timeout: Duration::from_secs(self.upstream.timeout),
            user_agent: self.upstream.user_agent.clone(),
            image_hosts: self.upstream.image_hosts.clone(),
        }
    }
}

/// Collect upstream entries from `UPSTREAM_PROXIES` and `UPSTREAM_PROXIES_FILE`
fn load_upstreams() -> Result<Vec<ProxyEndpoint>> {
    let mut raw = get_env_or("UPSTREAM_PROXIES", "");

    if let Ok(path) = env::var("UPSTREAM_PROXIES_FILE") {
        let contents = fs::read_to_string(&path).map_err(|e| {
            RelayError::InvalidConfig(format!("Failed to read UPSTREAM_PROXIES_FILE {}: {}", path, e))
        })?;
        raw.push('\n');
        raw.push_str(&contents);
    }

    let endpoints = parse_upstreams(&raw)?;
    if endpoints.is_empty() {
        return Err(RelayError::InvalidConfig(
            "No upstream proxies configured (set UPSTREAM_PROXIES or UPSTREAM_PROXIES_FILE)".into(),
        ));
    }

    Ok(endpoints)
}

/// Parse upstream entries separated by commas or newlines; `#` starts a comment
pub fn parse_upstreams(raw: &str) -> Result<Vec<ProxyEndpoint>> {
    raw.lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(id, entry)| ProxyEndpoint::parse(id, entry))
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
