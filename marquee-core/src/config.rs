//! Configuration types

use crate::{ConfigError, MarqueeError, MarqueeResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings for the remote key/value cache.
///
/// Must be supplied once at process start. There is no default host: a
/// missing host or port is a fatal configuration error, never something to
/// retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Logical database index.
    pub db: i64,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl CacheConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            db: 0,
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Read `MARQUEE_CACHE_HOST`, `MARQUEE_CACHE_PORT` and the optional
    /// `MARQUEE_CACHE_DB` from the process environment.
    pub fn from_env() -> MarqueeResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> MarqueeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("MARQUEE_CACHE_HOST")
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| missing("MARQUEE_CACHE_HOST"))?;
        let port = parse_required::<u16, _>(&lookup, "MARQUEE_CACHE_PORT")?;
        let mut config = Self::new(host, port);
        if let Some(raw) = lookup("MARQUEE_CACHE_DB") {
            config.db = parse_value("MARQUEE_CACHE_DB", &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Connection URL understood by the redis client.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    pub fn validate(&self) -> MarqueeResult<()> {
        if self.port == 0 {
            return Err(invalid("port", "0", "port must be non-zero"));
        }
        if self.db < 0 {
            return Err(invalid("db", &self.db.to_string(), "db index must be >= 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout", "0", "timeout must be positive"));
        }
        Ok(())
    }
}

/// Behavioral settings for the cache-aside layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when a caller does not pass one.
    pub default_ttl: Duration,
    /// COUNT hint for each SCAN page during pattern invalidation.
    pub scan_page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            scan_page_size: 100,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size;
        self
    }

    pub fn validate(&self) -> MarqueeResult<()> {
        if self.default_ttl.as_secs() == 0 {
            return Err(invalid(
                "default_ttl",
                &format!("{:?}", self.default_ttl),
                "ttl must be at least one second",
            ));
        }
        if self.scan_page_size == 0 {
            return Err(invalid("scan_page_size", "0", "page size must be positive"));
        }
        Ok(())
    }
}

/// Retry settings for origin fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Attempt `n` waits `n * backoff_unit` before attempt `n + 1`.
    pub backoff_unit: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_unit: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> MarqueeResult<()> {
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "0", "at least one attempt is required"));
        }
        Ok(())
    }
}

fn missing(field: &str) -> MarqueeError {
    MarqueeError::Config(ConfigError::MissingRequired {
        field: field.to_string(),
    })
}

fn invalid(field: &str, value: &str, reason: &str) -> MarqueeError {
    MarqueeError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

fn parse_value<T: std::str::FromStr>(field: &str, raw: &str) -> MarqueeResult<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| invalid(field, raw, "not a valid number"))
}

fn parse_required<T, F>(lookup: &F, field: &str) -> MarqueeResult<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(field).ok_or_else(|| missing(field))?;
    parse_value(field, &raw)
}
