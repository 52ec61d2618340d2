//! Provenance of a cache-aside read.

use chrono::{DateTime, Utc};

/// Where the value of a read came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadSource {
    /// Served from the cache.
    Cache,
    /// Cache miss (or a corrupt entry); fetched from the origin and written back.
    Origin,
    /// The cache could not be consulted; fetched from the origin. Written back
    /// only when the server answered with an error, never when unreachable.
    OriginAfterCacheFailure { reason: String },
}

/// A value returned by the cache-aside reader together with its provenance.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    source: ReadSource,
    read_at: DateTime<Utc>,
}

impl<T> CacheRead<T> {
    pub fn from_cache(value: T) -> Self {
        Self::new(value, ReadSource::Cache)
    }

    pub fn from_origin(value: T) -> Self {
        Self::new(value, ReadSource::Origin)
    }

    pub fn after_cache_failure(value: T, reason: impl Into<String>) -> Self {
        Self::new(
            value,
            ReadSource::OriginAfterCacheFailure {
                reason: reason.into(),
            },
        )
    }

    fn new(value: T, source: ReadSource) -> Self {
        Self {
            value,
            source,
            read_at: Utc::now(),
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn source(&self) -> &ReadSource {
        &self.source
    }

    pub fn read_at(&self) -> DateTime<Utc> {
        self.read_at
    }

    pub fn was_cache_hit(&self) -> bool {
        matches!(self.source, ReadSource::Cache)
    }

    /// True when the cache was bypassed because it was unavailable.
    pub fn was_degraded(&self) -> bool {
        matches!(self.source, ReadSource::OriginAfterCacheFailure { .. })
    }

    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            source: self.source,
            read_at: self.read_at,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
