use std::net::IpAddr;
use std::time::Duration;
use std::{env, fs, path::Path};

use serde::Deserialize;

use crate::errors::ConfigError;

/// Environment variable overriding the publisher (phone) token.
pub const PUBLISHER_TOKEN_ENV: &str = "PHONE_AUTH_TOKEN";

/// Environment variable overriding the subscriber (extension) token.
pub const SUBSCRIBER_TOKEN_ENV: &str = "EXTENSION_TOKEN";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// HTTP port to listen on.
    pub port: u16,

    /// Log level for tracing (e.g. "info", "debug").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    pub server_version: String,

    /// How long `POST /otp` waits for a subscriber before publishing anyway.
    #[serde(default = "default_publisher_timeout_ms")]
    pub publisher_timeout_ms: u64,

    /// How long `GET /otp` waits for a code before answering 204.
    #[serde(default = "default_subscriber_timeout_ms")]
    pub subscriber_timeout_ms: u64,

    /// Base URL of the geolocation service. The client IP is appended
    /// as the last path segment.
    #[serde(default = "default_geo_lookup_url")]
    pub geo_lookup_url: String,

    #[serde(default = "default_geo_lookup_timeout_ms")]
    pub geo_lookup_timeout_ms: u64,

    /// Peers allowed to tell us the real client address through
    /// `X-Forwarded-For` (load balancers, reverse proxies).
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,

    /// Bearer token the phone must present on `POST /otp`.
    #[serde(default)]
    pub publisher_token: String,

    /// Bearer token the extension must present on `GET /otp`.
    #[serde(default)]
    pub subscriber_token: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_publisher_timeout_ms() -> u64 {
    25_000
}

fn default_subscriber_timeout_ms() -> u64 {
    60_000
}

fn default_geo_lookup_url() -> String {
    "https://free.freeipapi.com/api/json".to_string()
}

fn default_geo_lookup_timeout_ms() -> u64 {
    3_000
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_json(&file)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str::<AppConfig>(text)?)
    }

    /// Tokens are secrets; the environment wins over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var(PUBLISHER_TOKEN_ENV) {
            self.publisher_token = token;
        }
        if let Ok(token) = env::var(SUBSCRIBER_TOKEN_ENV) {
            self.subscriber_token = token;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publisher_token.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "publisher token is empty (set {PUBLISHER_TOKEN_ENV})"
            )));
        }
        if self.subscriber_token.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "subscriber token is empty (set {SUBSCRIBER_TOKEN_ENV})"
            )));
        }
        if self.publisher_timeout_ms == 0 || self.subscriber_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "publisher and subscriber timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn publisher_timeout(&self) -> Duration {
        Duration::from_millis(self.publisher_timeout_ms)
    }

    pub fn subscriber_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_timeout_ms)
    }

    pub fn geo_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.geo_lookup_timeout_ms)
    }
}
