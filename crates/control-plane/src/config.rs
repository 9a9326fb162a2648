// Server configuration loaded from environment variables.
// Decision: Missing values fall back to dev defaults; malformed values fail startup
// Decision: No DATABASE_URL means in-memory dev mode with the publish route enabled

use std::net::SocketAddr;
use std::time::Duration;

use depot_core::{RelayConfig, DEFAULT_SUBSCRIBER_BUFFER};
use thiserror::Error;

pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:9000";
pub const DEFAULT_NOTIFY_CHANNEL_PREFIX: &str = "depot_";
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {name}={value:?}: {reason}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
    pub reason: String,
}

impl ConfigError {
    fn new(name: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self {
            name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (HTTP_ADDR)
    pub http_addr: SocketAddr,
    /// Route prefix, e.g. "/api" (API_PREFIX)
    pub api_prefix: String,
    /// Allowed CORS origins; empty means same-origin only (CORS_ALLOWED_ORIGINS)
    pub cors_allowed_origins: Vec<String>,
    /// Postgres connection string; `None` runs the in-memory source (DATABASE_URL)
    pub database_url: Option<String>,
    /// NOTIFY channel for a table is `<prefix><table>` (NOTIFY_CHANNEL_PREFIX)
    pub notify_channel_prefix: String,
    /// `None` disables heartbeats (HEARTBEAT_INTERVAL_SECS=0)
    pub heartbeat_interval: Option<Duration>,
    /// Per-connection buffer before changes are dropped (SUBSCRIBER_BUFFER)
    pub subscriber_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            api_prefix: String::new(),
            cors_allowed_origins: Vec::new(),
            database_url: None,
            notify_channel_prefix: DEFAULT_NOTIFY_CHANNEL_PREFIX.to_string(),
            heartbeat_interval: Some(Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS)),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl ServerConfig {
    /// Load `.env` (if present) and read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::info!("Loaded .env from {:?}", path);
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any key lookup; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let http_addr = match get("HTTP_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|e: std::net::AddrParseError| ConfigError::new("HTTP_ADDR", &raw, e.to_string()))?,
            None => defaults.http_addr,
        };

        let api_prefix = match get("API_PREFIX") {
            Some(raw) => {
                if !raw.starts_with('/') {
                    return Err(ConfigError::new("API_PREFIX", &raw, "must start with '/'"));
                }
                raw.trim_end_matches('/').to_string()
            }
            None => defaults.api_prefix,
        };

        let cors_allowed_origins = get("CORS_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let notify_channel_prefix = match get("NOTIFY_CHANNEL_PREFIX") {
            Some(raw) => {
                if !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(ConfigError::new(
                        "NOTIFY_CHANNEL_PREFIX",
                        &raw,
                        "only ASCII letters, digits and '_' are allowed",
                    ));
                }
                raw
            }
            None => defaults.notify_channel_prefix,
        };

        let heartbeat_interval = match get("HEARTBEAT_INTERVAL_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| ConfigError::new("HEARTBEAT_INTERVAL_SECS", &raw, "expected whole seconds"))?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => defaults.heartbeat_interval,
        };

        let subscriber_buffer = match get("SUBSCRIBER_BUFFER") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::new(
                        "SUBSCRIBER_BUFFER",
                        &raw,
                        "expected a positive integer",
                    ))
                }
            },
            None => defaults.subscriber_buffer,
        };

        Ok(Self {
            http_addr,
            api_prefix,
            cors_allowed_origins,
            database_url: get("DATABASE_URL"),
            notify_channel_prefix,
            heartbeat_interval,
            subscriber_buffer,
        })
    }

    /// Dev mode: in-memory source, publish route enabled
    pub fn is_dev_mode(&self) -> bool {
        self.database_url.is_none()
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig::default().with_heartbeat_interval(self.heartbeat_interval)
    }
}
