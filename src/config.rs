//! Configuration for the settings client

use crate::cache::FreshnessPolicy;
use crate::error::{ClientError, Result};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Configuration for [`SettingsClient`](crate::SettingsClient)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL every request path is appended to, e.g. `http://localhost:8080/api`
    pub base_url: String,

    /// Per-request timeout, covering connect and body transfer
    pub request_timeout: Duration,

    /// Bearer token sent with every request
    pub auth_token: Option<String>,

    /// Freshness policy for setting reads
    pub freshness: FreshnessPolicy,

    /// How many times a write is retried after a `412`
    pub max_conflict_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            request_timeout: Duration::from_secs(10),
            auth_token: None,
            freshness: FreshnessPolicy::default(),
            max_conflict_retries: 1,
        }
    }
}

impl ClientConfig {
    /// Create a new builder for client configuration
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Load from the environment, reading `.env` first if present.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `SETTINGS_API_BASE_URL` | `base_url` |
    /// | `SETTINGS_API_TIMEOUT_MS` | `request_timeout` |
    /// | `SETTINGS_API_TOKEN` | `auth_token` |
    /// | `SETTINGS_FRESH_FOR_SECS` | `freshness.fresh_for` |
    /// | `SETTINGS_KEEP_FOR_SECS` | `freshness.keep_for` |
    /// | `SETTINGS_MAX_CONFLICT_RETRIES` | `max_conflict_retries` |
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenv::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(base_url) = get("SETTINGS_API_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(ms) = get("SETTINGS_API_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(parse_var("SETTINGS_API_TIMEOUT_MS", &ms)?);
        }
        config.auth_token = get("SETTINGS_API_TOKEN");
        if let Some(secs) = get("SETTINGS_FRESH_FOR_SECS") {
            config.freshness.fresh_for = Duration::from_secs(parse_var("SETTINGS_FRESH_FOR_SECS", &secs)?);
        }
        if let Some(secs) = get("SETTINGS_KEEP_FOR_SECS") {
            config.freshness.keep_for = Duration::from_secs(parse_var("SETTINGS_KEEP_FOR_SECS", &secs)?);
        }
        if let Some(retries) = get("SETTINGS_MAX_CONFLICT_RETRIES") {
            config.max_conflict_retries = parse_var("SETTINGS_MAX_CONFLICT_RETRIES", &retries)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(ClientError::Config("base_url must not be empty".to_string()));
        }

        if self.request_timeout.is_zero() {
            return Err(ClientError::Config(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        self.freshness.validate().map_err(ClientError::Config)?;

        Ok(())
    }

    /// Every read revalidates with the server before returning
    pub fn realtime(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            freshness: FreshnessPolicy::conditional(),
            ..Self::default()
        }
    }

    /// Long freshness windows for configuration that rarely changes
    pub fn static_content(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            freshness: FreshnessPolicy::static_content(),
            ..Self::default()
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ClientError::Config(format!("invalid {}={}: {}", name, raw, e)))
}

/// Builder for client configuration
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    base_url: Option<String>,
    request_timeout: Option<Duration>,
    auth_token: Option<String>,
    freshness: Option<FreshnessPolicy>,
    max_conflict_retries: Option<u32>,
}

impl ClientConfigBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn freshness(mut self, policy: FreshnessPolicy) -> Self {
        self.freshness = Some(policy);
        self
    }

    pub fn max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = Some(retries);
        self
    }

    /// Build the configuration
    pub fn build(self) -> ClientConfig {
        let default = ClientConfig::default();
        ClientConfig {
            base_url: self.base_url.unwrap_or(default.base_url),
            request_timeout: self.request_timeout.unwrap_or(default.request_timeout),
            auth_token: self.auth_token.or(default.auth_token),
            freshness: self.freshness.unwrap_or(default.freshness),
            max_conflict_retries: self
                .max_conflict_retries
                .unwrap_or(default.max_conflict_retries),
        }
    }

    /// Build and validate the configuration
    pub fn build_validated(self) -> Result<ClientConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}
