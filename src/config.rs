//! Configuration management via environment variables
//!
//! Loads configuration from environment variables with .env file support.
//! Follows 12-factor app principles for cloud-native deployments.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FirewallError, Result};
use crate::server::Mode;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub firewall: FirewallConfig,
    pub rules: RulesConfig,
    pub telemetry: TelemetryConfig,
}

/// Server binding configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: Option<usize>,
}

/// Upstream origin settings
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub upstream_url: String,
    pub timeout: Option<Duration>,
    pub preserve_host: bool,
    pub forwarded_headers: bool,
}

/// Request processing settings
#[derive(Debug, Clone)]
pub struct FirewallConfig {
    pub mode: Mode,
    pub block_page: PathBuf,
    pub max_body_bytes: Option<usize>,
    pub header_timeout: Option<Duration>,
}

/// Where the rule document lives
#[derive(Debug, Clone, PartialEq)]
pub enum RuleStorageType {
    Memory,
    File,
    #[cfg(feature = "redis-storage")]
    Redis,
}

#[derive(Debug, Clone)]
pub struct RulesConfig {
    pub storage: RuleStorageType,
    pub file: PathBuf,
    pub redis_url: Option<String>,
}

/// Storage backend type for counters and the fast log store
#[derive(Debug, Clone, PartialEq)]
pub enum StorageType {
    Memory,
    #[cfg(feature = "redis-storage")]
    Redis,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub storage: StorageType,
    pub traffic_log_path: PathBuf,
    pub redis_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Reads .env file if present, then parses environment variables.
    /// Returns error if required variables are missing or invalid.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            server: ServerConfig::from_env()?,
            proxy: ProxyConfig::from_env()?,
            firewall: FirewallConfig::from_env()?,
            rules: RulesConfig::from_env()?,
            telemetry: TelemetryConfig::from_env()?,
        })
    }
}

/// Parse `name`, falling back to `default` when unset
fn var_or<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse::<T>()
        .map_err(|e| FirewallError::Config(format!("Invalid {}: {}", name, e)))
}

/// Parse `name` when set and non-empty
fn optional_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| FirewallError::Config(format!("Invalid {}: {}", name, e))),
        _ => Ok(None),
    }
}

fn redis_url() -> Result<String> {
    env::var("REDIS_URL").map_err(|_| {
        FirewallError::Config("REDIS_URL is required when using Redis storage".to_string())
    })
}

impl ServerConfig {
    fn from_env() -> Result<Self> {
        let host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = var_or::<u16>("SERVER_PORT", "8080")?;
        let max_connections = optional_var::<usize>("SERVER_MAX_CONNECTIONS")?;

        if max_connections == Some(0) {
            return Err(FirewallError::Config(
                "SERVER_MAX_CONNECTIONS must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            host,
            port,
            max_connections,
        })
    }
}

impl ProxyConfig {
    fn from_env() -> Result<Self> {
        let upstream_url = env::var("PROXY_UPSTREAM_URL")
            .map_err(|_| FirewallError::Config("PROXY_UPSTREAM_URL is required".to_string()))?;

        let timeout_secs = var_or::<u64>("PROXY_TIMEOUT_SECS", "30")?;
        let preserve_host = var_or::<bool>("PROXY_PRESERVE_HOST", "true")?;
        let forwarded_headers = var_or::<bool>("PROXY_FORWARDED_HEADERS", "false")?;

        Ok(Self {
            upstream_url,
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            preserve_host,
            forwarded_headers,
        })
    }

    /// Settings for the upstream client
    pub fn client_config(&self) -> crate::proxy::ProxyConfig {
        crate::proxy::ProxyConfig::new(self.upstream_url.clone())
            .with_timeout(self.timeout)
            .with_preserve_host(self.preserve_host)
            .with_forwarded_headers(self.forwarded_headers)
    }
}

impl FirewallConfig {
    fn from_env() -> Result<Self> {
        let mode = var_or::<Mode>("FIREWALL_MODE", "http")?;
        let block_page = PathBuf::from(
            env::var("FIREWALL_BLOCK_PAGE").unwrap_or_else(|_| "static/block.html".to_string()),
        );
        let max_body_bytes = optional_var::<usize>("FIREWALL_MAX_BODY_BYTES")?;
        let header_timeout =
            optional_var::<u64>("FIREWALL_HEADER_TIMEOUT_SECS")?.map(Duration::from_secs);

        Ok(Self {
            mode,
            block_page,
            max_body_bytes,
            header_timeout,
        })
    }
}

impl RulesConfig {
    fn from_env() -> Result<Self> {
        let storage_str = env::var("RULES_STORAGE").unwrap_or_else(|_| "file".to_string());

        let storage = match storage_str.to_lowercase().as_str() {
            "memory" => RuleStorageType::Memory,
            "file" => RuleStorageType::File,
            #[cfg(feature = "redis-storage")]
            "redis" => RuleStorageType::Redis,
            _ => {
                return Err(FirewallError::Config(format!(
                    "Invalid RULES_STORAGE: {}. Expected 'memory', 'file' or 'redis'",
                    storage_str
                )));
            }
        };

        let file = PathBuf::from(env::var("RULES_FILE").unwrap_or_else(|_| "rules.json".to_string()));

        let redis_url = match storage {
            #[cfg(feature = "redis-storage")]
            RuleStorageType::Redis => Some(redis_url()?),
            _ => None,
        };

        Ok(Self {
            storage,
            file,
            redis_url,
        })
    }
}

impl TelemetryConfig {
    fn from_env() -> Result<Self> {
        let storage_str = env::var("TELEMETRY_STORAGE").unwrap_or_else(|_| "memory".to_string());

        let storage = match storage_str.to_lowercase().as_str() {
            "memory" => StorageType::Memory,
            #[cfg(feature = "redis-storage")]
            "redis" => StorageType::Redis,
            _ => {
                return Err(FirewallError::Config(format!(
                    "Invalid TELEMETRY_STORAGE: {}. Expected 'memory' or 'redis'",
                    storage_str
                )));
            }
        };

        let traffic_log_path = PathBuf::from(
            env::var("TRAFFIC_LOG_PATH").unwrap_or_else(|_| "traffic.jsonl".to_string()),
        );

        let redis_url = if storage == StorageType::Memory {
            None
        } else {
            Some(redis_url()?)
        };

        Ok(Self {
            storage,
            traffic_log_path,
            redis_url,
        })
    }
}
