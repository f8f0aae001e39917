//! Configuration Module
//!
//! Loads cache configuration from a TOML file and environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{CacheError, Result};

/// Cache configuration parameters.
///
/// Every field has a default, so a partial `[cache]` table is enough.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base path of the persistent file pair (`<base>.idx` / `<base>.dat`)
    pub cache_file: PathBuf,
    /// Propagate writes to the persistent tier from background workers
    pub async_upstream: bool,
    /// How long a persistent-tier read stays buffered in memory, in milliseconds
    pub buffer_ttl_ms: u64,
    /// Expiry sweep interval in seconds
    pub sweep_interval_secs: u64,
    /// Number of write-behind workers in async mode
    pub write_workers: usize,
    /// Maximum number of queued write-behind jobs
    pub write_queue: usize,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cache: Config,
}

impl Config {
    /// Creates a Config from defaults overlaid by environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_FILE` - Base path of the file pair (default: `cache/cache`)
    /// - `CACHE_ASYNC_UPSTREAM` - `true`/`false` (default: true)
    /// - `CACHE_BUFFER_TTL_MS` - Buffering TTL in ms (default: 5000)
    /// - `CACHE_SWEEP_INTERVAL_SECS` - Sweep interval (default: 5)
    /// - `CACHE_WRITE_WORKERS` - Write-behind workers (default: 2)
    /// - `CACHE_WRITE_QUEUE` - Write-behind queue capacity (default: 1024)
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Parses a TOML file containing a `[cache]` table.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| CacheError::io("reading", path, e))?;
        Self::from_toml(&raw)
    }

    /// Parses TOML text containing a `[cache]` table.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(raw).map_err(|e| CacheError::Config(e.to_string()))?;
        Ok(file.cache)
    }

    /// Reads `path` if it exists, then applies environment overrides.
    ///
    /// A missing file only logs a warning, matching how the cache is usually
    /// started without any configuration at all.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let base = if path.exists() {
            Self::from_file(path)?
        } else {
            warn!("Config file {} not found, using defaults", path.display());
            Self::default()
        };
        Ok(base.with_env_overrides())
    }

    /// Applies any `CACHE_*` environment variables on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(file) = env::var("CACHE_FILE") {
            self.cache_file = PathBuf::from(file);
        }
        if let Some(flag) = env::var("CACHE_ASYNC_UPSTREAM").ok().and_then(|v| parse_flag(&v)) {
            self.async_upstream = flag;
        }
        if let Some(ms) = env_parse("CACHE_BUFFER_TTL_MS") {
            self.buffer_ttl_ms = ms;
        }
        if let Some(secs) = env_parse("CACHE_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = secs;
        }
        if let Some(workers) = env_parse("CACHE_WRITE_WORKERS") {
            self.write_workers = workers;
        }
        if let Some(queue) = env_parse("CACHE_WRITE_QUEUE") {
            self.write_queue = queue;
        }
        self
    }

    pub fn buffer_ttl(&self) -> Duration {
        Duration::from_millis(self.buffer_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_file: PathBuf::from("cache/cache"),
            async_upstream: true,
            buffer_ttl_ms: 5000,
            sweep_interval_secs: 5,
            write_workers: 2,
            write_queue: 1024,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.cache_file, PathBuf::from("cache/cache"));
        assert!(config.async_upstream);
        assert_eq!(config.buffer_ttl(), Duration::from_secs(5));
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.write_workers, 2);
        assert_eq!(config.write_queue, 1024);
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        for name in [
            "CACHE_FILE",
            "CACHE_ASYNC_UPSTREAM",
            "CACHE_BUFFER_TTL_MS",
            "CACHE_SWEEP_INTERVAL_SECS",
            "CACHE_WRITE_WORKERS",
            "CACHE_WRITE_QUEUE",
        ] {
            env::remove_var(name);
        }

        assert_eq!(Config::from_env(), Config::default());
    }

    #[test]
    fn test_config_partial_toml() {
        let config = Config::from_toml(
            r#"
            [cache]
            cache_file = "/var/lib/transcache/words"
            async_upstream = false
            "#,
        )
        .unwrap();

        assert_eq!(config.cache_file, PathBuf::from("/var/lib/transcache/words"));
        assert!(!config.async_upstream);
        assert_eq!(config.buffer_ttl_ms, 5000);
    }

    #[test]
    fn test_config_empty_toml_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_config_invalid_toml() {
        let result = Config::from_toml("[cache]\nwrite_workers = \"many\"");
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_sweep_interval_never_zero() {
        let config = Config {
            sweep_interval_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }
}
