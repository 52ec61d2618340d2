//! Explicit-key, pattern and set invalidation.
//!
//! Invalidation is best-effort: failures are logged and recorded in the
//! returned [`InvalidationReport`], never raised. A failed invalidation
//! leaves a staleness window bounded by the entry TTL.

use std::sync::Arc;

use marquee_core::{CacheConfig, CacheKey, CacheKeyPattern, CacheSetName};

use super::traits::KeyValueCache;

/// Outcome of one or more invalidation calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Keys the cache reported as removed.
    pub deleted: u64,
    /// SCAN pages consumed.
    pub pages: u64,
    /// Cursor of the last SCAN; `0` once a sweep has finished.
    pub final_cursor: u64,
    /// Failure messages, in the order they occurred.
    pub failures: Vec<String>,
    /// False if any sweep stopped early or any delete failed.
    pub complete: bool,
}

impl Default for InvalidationReport {
    fn default() -> Self {
        Self {
            deleted: 0,
            pages: 0,
            final_cursor: 0,
            failures: Vec::new(),
            complete: true,
        }
    }
}

impl InvalidationReport {
    /// Fold another report into this one.
    pub fn merge(&mut self, other: InvalidationReport) {
        self.deleted += other.deleted;
        self.pages += other.pages;
        if other.pages > 0 {
            self.final_cursor = other.final_cursor;
        }
        self.failures.extend(other.failures);
        self.complete &= other.complete;
    }

    fn fail(&mut self, message: String) {
        self.failures.push(message);
        self.complete = false;
    }
}

/// Removes cache entries after writes commit.
pub struct Invalidator<C: KeyValueCache + ?Sized> {
    cache: Arc<C>,
    scan_page_size: usize,
}

impl<C: KeyValueCache + ?Sized> Clone for Invalidator<C> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            scan_page_size: self.scan_page_size,
        }
    }
}

impl<C: KeyValueCache + ?Sized> Invalidator<C> {
    pub fn new(cache: Arc<C>, config: &CacheConfig) -> Self {
        Self {
            cache,
            scan_page_size: config.scan_page_size.max(1),
        }
    }

    pub fn backend(&self) -> &Arc<C> {
        &self.cache
    }

    /// Delete `keys` in one round-trip. No-op on an empty slice.
    pub async fn invalidate_cache(&self, keys: &[CacheKey]) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        if keys.is_empty() {
            return report;
        }
        match self.cache.delete(keys).await {
            Ok(n) => {
                report.deleted = n;
                tracing::debug!(keys = keys.len(), deleted = n, "Invalidated cache keys");
            }
            Err(e) => {
                tracing::warn!(keys = keys.len(), error = %e, "Cache key invalidation failed");
                report.fail(format!("delete {} keys: {e}", keys.len()));
            }
        }
        report
    }

    /// Delete every key matching the glob `pattern`.
    ///
    /// Walks a SCAN cursor until it returns to 0, deleting each page as it
    /// goes. Keys written concurrently may or may not be swept.
    pub async fn invalidate_cache_by_pattern(&self, pattern: &str) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        let mut cursor = 0u64;
        loop {
            let page = match self.cache.scan(cursor, pattern, self.scan_page_size).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(pattern, cursor, error = %e, "Cache scan failed, sweep incomplete");
                    report.final_cursor = cursor;
                    report.fail(format!("scan {pattern} at cursor {cursor}: {e}"));
                    return report;
                }
            };
            report.pages += 1;

            if !page.keys.is_empty() {
                match self.cache.delete(&page.keys).await {
                    Ok(n) => report.deleted += n,
                    Err(e) => {
                        // Keep sweeping; later pages may still succeed.
                        tracing::warn!(pattern, keys = page.keys.len(), error = %e, "Cache delete failed during sweep");
                        report.fail(format!("delete page of {pattern}: {e}"));
                    }
                }
            }

            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        report.final_cursor = cursor;
        tracing::debug!(pattern, deleted = report.deleted, pages = report.pages, "Pattern sweep finished");
        report
    }

    /// Invalidate one typed pattern. Exact-key patterns skip the scan.
    ///
    /// Sweeping a family's lists also drops that family's list set, whose
    /// members the sweep has just removed.
    pub async fn invalidate_pattern(&self, pattern: &CacheKeyPattern) -> InvalidationReport {
        if let Some(key) = pattern.exact_key() {
            return self.invalidate_cache(std::slice::from_ref(&key)).await;
        }
        let mut report = self.invalidate_cache_by_pattern(&pattern.to_glob()).await;
        if let CacheKeyPattern::AllLists(entity_type) = pattern {
            let set = CacheSetName::for_lists(*entity_type);
            report.merge(self.invalidate_cache(&[CacheKey::from_raw(set.as_str())]).await);
        }
        report
    }

    /// Invalidate `patterns` in the given order, continuing past failures.
    pub async fn invalidate_all(&self, patterns: &[CacheKeyPattern]) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        for pattern in patterns {
            report.merge(self.invalidate_pattern(pattern).await);
        }
        report
    }

    /// Delete every member of `set`, then the set itself.
    pub async fn invalidate_set(&self, set: &CacheSetName) -> InvalidationReport {
        let members = match self.cache.set_members(set).await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(set = %set, error = %e, "Could not read cache set");
                let mut report = InvalidationReport::default();
                report.fail(format!("read set {set}: {e}"));
                return report;
            }
        };
        let mut keys = members;
        keys.push(CacheKey::from_raw(set.as_str()));
        self.invalidate_cache(&keys).await
    }
}
