//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The access token is loaded from MARKETING_ACCESS_TOKEN or
//! access_token_file, never stored in the TOML directly.

use common::{Error, Secret};
use governor::{RateTier, RetryPolicy};
use serde::{Deserialize, Deserializer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var holding the upstream access token.
pub const ACCESS_TOKEN_ENV: &str = "MARKETING_ACCESS_TOKEN";

const DEFAULT_CONFIG_FILE: &str = "marketing-api-gateway.toml";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub paging: PagingConfig,
    #[serde(default)]
    pub headers: Vec<HeaderRule>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Remote API settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Path to a file containing the access token (alternative to the env var)
    #[serde(default)]
    pub access_token_file: Option<PathBuf>,
    #[serde(skip)]
    pub access_token: Option<Secret<String>>,
}

#[derive(Debug, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_tier", deserialize_with = "deserialize_tier")]
    pub tier: RateTier,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            tier: default_tier(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_ms: 1000,
        }
    }
}

/// Traversal and batching ceilings, shared with request handlers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    pub max_pages: usize,
    pub max_items: usize,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            max_pages: 100,
            max_items: 5000,
            batch_size: 50,
            batch_delay_ms: 1000,
        }
    }
}

impl PagingConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Static header added to every upstream call
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderRule {
    pub name: String,
    pub value: String,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    256
}

fn default_api_version() -> String {
    "v19.0".to_string()
}

fn default_tier() -> RateTier {
    RateTier::Development
}

fn deserialize_tier<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RateTier, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve the
    /// access token (env var first, then `access_token_file`).
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        config.upstream.access_token = common::load_secret(
            ACCESS_TOKEN_ENV,
            config.upstream.access_token_file.as_deref(),
        )?;

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.upstream.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::invalid(
                "upstream.base_url",
                format!("must start with http:// or https://, got: {base_url}"),
            ));
        }
        if self.upstream.api_version.trim_matches('/').is_empty() {
            return Err(Error::invalid("upstream.api_version", "must not be empty"));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(Error::invalid("upstream.timeout_secs", "must be greater than 0"));
        }
        if self.server.max_connections == 0 {
            return Err(Error::invalid("server.max_connections", "must be greater than 0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::invalid(
                "retry.max_delay_ms",
                "must not be smaller than retry.base_delay_ms",
            ));
        }
        if self.paging.max_pages == 0 {
            return Err(Error::invalid("paging.max_pages", "must be greater than 0"));
        }
        if self.paging.max_items == 0 {
            return Err(Error::invalid("paging.max_items", "must be greater than 0"));
        }
        if self.paging.batch_size == 0 {
            return Err(Error::invalid("paging.batch_size", "must be greater than 0"));
        }
        for rule in &self.headers {
            if rule.name.eq_ignore_ascii_case("authorization") {
                return Err(Error::invalid(
                    "headers",
                    "must not set authorization; use access_token_file or MARKETING_ACCESS_TOKEN",
                ));
            }
        }
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_jitter: Duration::from_millis(self.retry.jitter_ms),
        }
    }

    pub fn header_injections(&self) -> Vec<transport::HeaderInjection> {
        self.headers
            .iter()
            .map(|rule| transport::HeaderInjection {
                name: rule.name.clone(),
                value: rule.value.clone(),
            })
            .collect()
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }
}
