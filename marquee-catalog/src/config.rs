//! Process configuration, read once from the environment at startup.

use std::time::Duration;

use marquee_core::{
    CacheConfig, CacheConnectionConfig, ConfigError, MarqueeError, MarqueeResult, RetryConfig,
};

use crate::db::DbConfig;

/// Which [`marquee_storage::KeyValueCache`] the process builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    /// Process-local cache; nothing to connect to.
    Memory,
    /// Remote Redis cache. Requires `MARQUEE_CACHE_HOST` and `MARQUEE_CACHE_PORT`.
    Redis,
}

impl std::str::FromStr for CacheBackend {
    type Err = MarqueeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(CacheBackend::Memory),
            "redis" => Ok(CacheBackend::Redis),
            other => Err(ConfigError::InvalidValue {
                field: "MARQUEE_CACHE_BACKEND".to_string(),
                value: other.to_string(),
                reason: "expected `memory` or `redis`".to_string(),
            }
            .into()),
        }
    }
}

/// Everything the catalog binary needs to build its clients.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub cache_backend: CacheBackend,
    /// Present exactly when `cache_backend` is [`CacheBackend::Redis`].
    pub cache_connection: Option<CacheConnectionConfig>,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub db: DbConfig,
}

impl CatalogConfig {
    pub fn from_env() -> MarqueeResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    ///
    /// Cache host and port are only required for the Redis backend; when
    /// they are needed and absent this fails before any client is built.
    pub fn from_lookup<F>(lookup: F) -> MarqueeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_backend = match lookup("MARQUEE_CACHE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => CacheBackend::Redis,
        };
        let cache_connection = match cache_backend {
            CacheBackend::Redis => Some(CacheConnectionConfig::from_lookup(&lookup)?),
            CacheBackend::Memory => None,
        };

        let mut cache = CacheConfig::default();
        if let Some(secs) = parse_optional::<u64, _>(&lookup, "MARQUEE_CACHE_TTL_SECS")? {
            cache = cache.with_ttl(Duration::from_secs(secs));
        }
        if let Some(count) = parse_optional::<usize, _>(&lookup, "MARQUEE_CACHE_SCAN_COUNT")? {
            cache = cache.with_scan_page_size(count);
        }
        cache.validate()?;

        let mut retry = RetryConfig::default();
        if let Some(attempts) = parse_optional::<u32, _>(&lookup, "MARQUEE_RETRY_MAX_ATTEMPTS")? {
            retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_optional::<u64, _>(&lookup, "MARQUEE_RETRY_BACKOFF_MS")? {
            retry.backoff_unit = Duration::from_millis(ms);
        }
        retry.validate()?;

        let db = DbConfig::from_lookup(&lookup);
        db.validate()?;

        Ok(Self {
            cache_backend,
            cache_connection,
            cache,
            retry,
            db,
        })
    }
}

fn parse_optional<T, F>(lookup: &F, field: &str) -> MarqueeResult<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(field) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ConfigError::InvalidValue {
                field: field.to_string(),
                value: raw.clone(),
                reason: "not a valid number".to_string(),
            }
            .into()
        }),
    }
}
