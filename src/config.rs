//! Configuration Module
//!
//! A JSON document with nested `cache`, `proxy`, `webserver` and `logging`
//! sections. Values are layered: defaults, then the config file, then
//! `RESERVOIR_*` environment variables, then command-line flags.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_SHARDS;
use crate::error::ConfigError;
use crate::http::CachePolicy;
use crate::proxy::ProxyOptions;
use crate::tasks::JanitorConfig;

// == Cache Type ==
/// Which backend stores cached bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    #[default]
    Memory,
    File,
}

impl FromStr for CacheType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(CacheType::Memory),
            "file" => Ok(CacheType::File),
            other => Err(ConfigError::Invalid(format!("unknown cache type {:?}", other))),
        }
    }
}

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(ConfigError::Invalid(format!("unknown log format {:?}", other))),
        }
    }
}

// == Sections ==
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    /// Directory of the file backend
    pub dir: PathBuf,
    /// Aggregate size the janitor evicts down from, in bytes
    pub max_cache_size: u64,
    /// Share of system memory the memory backend may use
    pub memory_limit_percent: u8,
    pub lock_shards: usize,
    pub janitor_interval_ms: u64,
    pub default_max_age_secs: u64,
    pub force_default_max_age: bool,
    pub ignore_cache_control: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Memory,
            dir: PathBuf::from("cache"),
            max_cache_size: 1024 * 1024 * 1024,
            memory_limit_percent: 25,
            lock_shards: DEFAULT_SHARDS,
            janitor_interval_ms: 10_000,
            default_max_age_secs: 3600,
            force_default_max_age: false,
            ignore_cache_control: false,
        }
    }
}

impl CacheConfig {
    pub fn policy(&self) -> CachePolicy {
        CachePolicy {
            default_max_age: Duration::from_secs(self.default_max_age_secs),
            force_default_max_age: self.force_default_max_age,
            ignore_cache_control: self.ignore_cache_control,
        }
    }

    pub fn janitor(&self) -> JanitorConfig {
        JanitorConfig {
            interval: Duration::from_millis(self.janitor_interval_ms),
            max_cache_size: self.max_cache_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub upstream_timeout_secs: u64,
    pub max_request_body: usize,
    pub retry_on_range_416: bool,
    pub retry_on_invalid_range: bool,
    /// Fetch and store the full body for ranged `GET`s and slice locally
    pub cache_range_requests: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let options = ProxyOptions::default();
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            upstream_timeout_secs: 30,
            max_request_body: options.max_request_body,
            retry_on_range_416: options.retry_on_range_416,
            retry_on_invalid_range: options.retry_on_invalid_range,
            cache_range_requests: options.cache_range_requests,
        }
    }
}

impl ProxyConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn options(&self) -> ProxyOptions {
        ProxyOptions {
            max_request_body: self.max_request_body,
            retry_on_range_416: self.retry_on_range_416,
            retry_on_invalid_range: self.retry_on_invalid_range,
            cache_range_requests: self.cache_range_requests,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebserverConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
}

impl Default for WebserverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from(([127, 0, 0, 1], 8081)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "reservoir=info,tower_http=info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// == Config ==
/// Server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub proxy: ProxyConfig,
    pub webserver: WebserverConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Creates a new Config by loading values from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overrides fields from `RESERVOIR_*` environment variables.
    ///
    /// # Environment Variables
    /// - `RESERVOIR_CACHE_TYPE` - `memory` or `file`
    /// - `RESERVOIR_CACHE_DIR` - file backend directory
    /// - `RESERVOIR_MAX_CACHE_SIZE` - eviction bound in bytes
    /// - `RESERVOIR_MEMORY_LIMIT_PERCENT` - memory backend cap
    /// - `RESERVOIR_LOCK_SHARDS` - shard lock count
    /// - `RESERVOIR_JANITOR_INTERVAL_MS` - janitor tick
    /// - `RESERVOIR_DEFAULT_MAX_AGE` - default freshness in seconds
    /// - `RESERVOIR_PROXY_LISTEN` - proxy listen address
    /// - `RESERVOIR_UPSTREAM_TIMEOUT` - upstream timeout in seconds
    /// - `RESERVOIR_WEBSERVER_ENABLED` - `true` or `false`
    /// - `RESERVOIR_WEBSERVER_LISTEN` - stats listen address
    /// - `RESERVOIR_LOG_LEVEL` - filter directive
    /// - `RESERVOIR_LOG_FORMAT` - `pretty` or `compact`
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| env::var(name).ok());
    }

    /// Overrides fields from any variable source. Unparsable values are ignored.
    pub fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
            var(name).and_then(|v| v.trim().parse().ok())
        }

        let cache = &mut self.cache;
        if let Some(v) = parsed(&var, "RESERVOIR_CACHE_TYPE") {
            cache.cache_type = v;
        }
        if let Some(v) = var("RESERVOIR_CACHE_DIR") {
            cache.dir = PathBuf::from(v);
        }
        if let Some(v) = parsed(&var, "RESERVOIR_MAX_CACHE_SIZE") {
            cache.max_cache_size = v;
        }
        if let Some(v) = parsed(&var, "RESERVOIR_MEMORY_LIMIT_PERCENT") {
            cache.memory_limit_percent = v;
        }
        if let Some(v) = parsed(&var, "RESERVOIR_LOCK_SHARDS") {
            cache.lock_shards = v;
        }
        if let Some(v) = parsed(&var, "RESERVOIR_JANITOR_INTERVAL_MS") {
            cache.janitor_interval_ms = v;
        }
        if let Some(v) = parsed(&var, "RESERVOIR_DEFAULT_MAX_AGE") {
            cache.default_max_age_secs = v;
        }

        if let Some(v) = parsed(&var, "RESERVOIR_PROXY_LISTEN") {
            self.proxy.listen = v;
        }
        if let Some(v) = parsed(&var, "RESERVOIR_UPSTREAM_TIMEOUT") {
            self.proxy.upstream_timeout_secs = v;
        }

        if let Some(v) = parsed(&var, "RESERVOIR_WEBSERVER_ENABLED") {
            self.webserver.enabled = v;
        }
        if let Some(v) = parsed(&var, "RESERVOIR_WEBSERVER_LISTEN") {
            self.webserver.listen = v;
        }

        if let Some(v) = var("RESERVOIR_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = parsed(&var, "RESERVOIR_LOG_FORMAT") {
            self.logging.format = v;
        }
    }

    /// Rejects settings the cache cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cache = &self.cache;
        if cache.lock_shards == 0 || !cache.lock_shards.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "cache.lock_shards must be a power of two, got {}",
                cache.lock_shards
            )));
        }
        if cache.janitor_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "cache.janitor_interval_ms must be positive".to_string(),
            ));
        }
        if !(1..=100).contains(&cache.memory_limit_percent) {
            return Err(ConfigError::Invalid(format!(
                "cache.memory_limit_percent must be within 1..=100, got {}",
                cache.memory_limit_percent
            )));
        }
        if self.proxy.upstream_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "proxy.upstream_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
