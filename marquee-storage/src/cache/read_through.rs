//! Cache-aside reads.
//!
//! [`CacheAside::cache_or_fetch`] checks the cache, falls back to a
//! retry-wrapped origin fetch on a miss, a corrupt entry or an unavailable
//! cache, and writes the fetched value back on a best-effort basis unless the
//! cache could not be reached. Only origin failures reach the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use marquee_core::{CacheConfig, CacheKey, CacheSetName, MarqueeResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::read::CacheRead;
use super::traits::{CacheCounters, CacheStats, CacheUnavailable, KeyValueCache};
use crate::retry::RetryExecutor;

/// What the cache lookup produced, before any origin fetch.
enum Lookup<T> {
    Hit(T),
    Miss,
    Unavailable(CacheUnavailable),
}

/// Cache-aside reader over a [`KeyValueCache`].
///
/// One instance is built at startup and shared; it holds no per-request state.
pub struct CacheAside<C: KeyValueCache + ?Sized> {
    cache: Arc<C>,
    retry: RetryExecutor,
    config: CacheConfig,
    counters: Arc<CacheCounters>,
}

impl<C: KeyValueCache + ?Sized> Clone for CacheAside<C> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            retry: self.retry.clone(),
            config: self.config.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<C: KeyValueCache + ?Sized> CacheAside<C> {
    pub fn new(cache: Arc<C>, retry: RetryExecutor, config: CacheConfig) -> Self {
        Self {
            cache,
            retry,
            config,
            counters: Arc::new(CacheCounters::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<C> {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Return the value at `key`, fetching it from the origin on a miss.
    ///
    /// `ttl` defaults to [`CacheConfig::default_ttl`]. When `set` is given the
    /// key is also registered in that set so it can be purged as a group.
    pub async fn cache_or_fetch<T, F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
        ttl: Option<Duration>,
        set: Option<&CacheSetName>,
    ) -> MarqueeResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = MarqueeResult<T>>,
    {
        self.cache_or_fetch_read(key, fetch, ttl, set)
            .await
            .map(CacheRead::into_value)
    }

    /// Like [`cache_or_fetch`](Self::cache_or_fetch), also reporting where the value came from.
    pub async fn cache_or_fetch_read<T, F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
        ttl: Option<Duration>,
        set: Option<&CacheSetName>,
    ) -> MarqueeResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = MarqueeResult<T>>,
    {
        match self.lookup::<T>(key).await {
            Lookup::Hit(value) => Ok(CacheRead::from_cache(value)),
            Lookup::Miss => {
                let value = self.retry.execute(fetch).await?;
                self.populate(key, &value, ttl, set).await;
                Ok(CacheRead::from_origin(value))
            }
            Lookup::Unavailable(reason) => {
                let value = self.retry.execute(fetch).await?;
                // An unreachable cache would only fail again. A server that
                // rejected the read (wrong type) takes the overwrite that heals it.
                if !reason.is_transport() {
                    self.populate(key, &value, ttl, set).await;
                }
                Ok(CacheRead::after_cache_failure(value, reason.to_string()))
            }
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &CacheKey) -> Lookup<T> {
        match self.cache.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    self.counters.hit();
                    tracing::debug!(key = %key, "Cache hit");
                    Lookup::Hit(value)
                }
                Err(e) => {
                    self.counters.corrupted();
                    tracing::warn!(key = %key, error = %e, "Corrupt cache entry, treating as miss");
                    Lookup::Miss
                }
            },
            Ok(None) => {
                self.counters.miss();
                tracing::debug!(key = %key, "Cache miss");
                Lookup::Miss
            }
            Err(reason) => {
                self.counters.degraded();
                tracing::warn!(key = %key, error = %reason, "Cache unavailable, reading from origin");
                Lookup::Unavailable(reason)
            }
        }
    }

    /// Best-effort write-back. Failures are counted and logged, never returned.
    async fn populate<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
        set: Option<&CacheSetName>,
    ) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.counters.write_failed();
                tracing::warn!(key = %key, error = %e, "Could not serialize value for cache");
                return;
            }
        };

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if let Err(e) = self.cache.set(key, &bytes, ttl).await {
            self.counters.write_failed();
            tracing::warn!(key = %key, error = %e, "Cache write failed");
            return;
        }

        if let Some(set) = set {
            // The set must outlive its members or they drop out of group purges.
            let set_ttl = ttl.max(self.config.default_ttl);
            if let Err(e) = self.cache.add_to_set(set, key, set_ttl).await {
                self.counters.write_failed();
                tracing::warn!(key = %key, set = %set, error = %e, "Cache set registration failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory_backend::InMemoryKeyValueCache;
    use crate::cache::read::ReadSource;
    use crate::retry::{Backoff, RetryPolicy};
    use marquee_core::{EntityType, MarqueeError, StorageError, ValidationError};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: u32,
        title: String,
    }

    fn doc() -> Doc {
        Doc {
            id: 7,
            title: "Pilot".to_string(),
        }
    }

    fn reader(cache: Arc<InMemoryKeyValueCache>) -> CacheAside<InMemoryKeyValueCache> {
        let policy = RetryPolicy::default().with_backoff(Backoff::None);
        CacheAside::new(cache, RetryExecutor::new(policy), CacheConfig::default())
    }

    #[tokio::test]
    async fn test_miss_fetches_once_then_hits() {
        let cache = Arc::new(InMemoryKeyValueCache::new());
        let reader = reader(Arc::clone(&cache));
        let key = CacheKey::from_raw("episode:7");
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let value: Doc = reader
                .cache_or_fetch(
                    &key,
                    || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok(doc()) }
                    },
                    None,
                    None,
                )
                .await
                .unwrap();
            assert_eq!(value, doc());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = reader.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_overwritten() {
        let cache = Arc::new(InMemoryKeyValueCache::new());
        let reader = reader(Arc::clone(&cache));
        let key = CacheKey::from_raw("episode:7");
        cache.insert_raw(&key, b"{not json");

        let read = reader
            .cache_or_fetch_read(&key, || async { Ok(doc()) }, None, None)
            .await
            .unwrap();

        assert_eq!(read.source(), &ReadSource::Origin);
        let stored: Doc = serde_json::from_slice(&cache.peek(&key).unwrap()).unwrap();
        assert_eq!(stored, doc());
        assert_eq!(reader.stats().corrupted, 1);
    }

    #[tokio::test]
    async fn test_outage_serves_origin_without_populating() {
        let cache = Arc::new(InMemoryKeyValueCache::new());
        let reader = reader(Arc::clone(&cache));
        let key = CacheKey::from_raw("season:1");
        cache.set_unreachable(true);

        let read = reader
            .cache_or_fetch_read(&key, || async { Ok(doc()) }, None, None)
            .await
            .unwrap();

        assert!(read.was_degraded());
        assert_eq!(read.into_value(), doc());
        cache.set_unreachable(false);
        assert!(!cache.contains(&key));
    }

    #[tokio::test]
    async fn test_cache_throwing_on_read_falls_back() {
        let cache = Arc::new(InMemoryKeyValueCache::new());
        let reader = reader(Arc::clone(&cache));
        let key = CacheKey::from_raw("season:1");
        cache.set_fail_reads(true);

        let value: Doc = reader
            .cache_or_fetch(&key, || async { Ok(doc()) }, None, None)
            .await
            .unwrap();
        assert_eq!(value, doc());
        assert_eq!(reader.stats().degraded, 1);
        // The server answered, so the value was still written back.
        cache.set_fail_reads(false);
        assert!(cache.contains(&key));
    }

    #[tokio::test]
    async fn test_wrong_type_entry_is_overwritten() {
        let cache = Arc::new(InMemoryKeyValueCache::new());
        let reader = reader(Arc::clone(&cache));
        let set = CacheSetName::for_lists(EntityType::Season);
        // GET against a key holding a set fails with WRONGTYPE.
        let key = CacheKey::from_raw(set.as_str());
        cache
            .add_to_set(&set, &CacheKey::from_raw("seasons:all:{}"), Duration::from_secs(60))
            .await
            .unwrap();

        let first = reader
            .cache_or_fetch_read(&key, || async { Ok(doc()) }, None, None)
            .await
            .unwrap();
        assert!(first.was_degraded());

        let second = reader
            .cache_or_fetch_read(&key, || async { Ok(doc()) }, None, None)
            .await
            .unwrap();
        assert_eq!(second.source(), &ReadSource::Cache);
        assert_eq!(second.into_value(), doc());
    }

    #[tokio::test]
    async fn test_write_failure_still_returns_value() {
        let cache = Arc::new(InMemoryKeyValueCache::new());
        let reader = reader(Arc::clone(&cache));
        let key = CacheKey::from_raw("episode:9");
        cache.set_fail_writes(true);

        let value: Doc = reader
            .cache_or_fetch(&key, || async { Ok(doc()) }, None, None)
            .await
            .unwrap();
        assert_eq!(value, doc());
        assert_eq!(reader.stats().write_failures, 1);
    }

    #[tokio::test]
    async fn test_set_registration() {
        let cache = Arc::new(InMemoryKeyValueCache::new());
        let reader = reader(Arc::clone(&cache));
        let set = CacheSetName::for_lists(EntityType::Episode);
        let key = CacheKey::from_raw("episodes:all:{}");

        let _: Doc = reader
            .cache_or_fetch(&key, || async { Ok(doc()) }, None, Some(&set))
            .await
            .unwrap();

        assert_eq!(cache.set_members(&set).await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn test_transient_origin_failure_is_retried() {
        let cache = Arc::new(InMemoryKeyValueCache::new());
        let reader = reader(Arc::clone(&cache));
        let key = CacheKey::from_raw("episode:3");
        let calls = AtomicU32::new(0);

        let value: Doc = reader
            .cache_or_fetch(
                &key,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(MarqueeError::Storage(StorageError::ConnectionReset {
                                reason: "reset by peer".to_string(),
                            }))
                        } else {
                            Ok(doc())
                        }
                    }
                },
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(value, doc());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.contains(&key));
    }

    #[tokio::test]
    async fn test_permanent_origin_failure_propagates_and_caches_nothing() {
        let cache = Arc::new(InMemoryKeyValueCache::new());
        let reader = reader(Arc::clone(&cache));
        let key = CacheKey::from_raw("episode:4");

        let result: MarqueeResult<Doc> = reader
            .cache_or_fetch(
                &key,
                || async {
                    Err(MarqueeError::Validation(ValidationError::RequiredFieldMissing {
                        field: "id".to_string(),
                    }))
                },
                None,
                None,
            )
            .await;

        assert!(matches!(result, Err(MarqueeError::Validation(_))));
        assert!(!cache.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = Arc::new(InMemoryKeyValueCache::new());
        let reader = reader(Arc::clone(&cache));
        let key = CacheKey::from_raw("episode:5");
        let calls = AtomicU32::new(0);
        let fetch = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(doc()) }
        };

        let _: Doc = reader
            .cache_or_fetch(&key, fetch, Some(Duration::from_secs(10)), None)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        let _: Doc = reader
            .cache_or_fetch(&key, fetch, Some(Duration::from_secs(10)), None)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
