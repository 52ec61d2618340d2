//! Key/value cache backend trait and cache outcome types.
//!
//! Cache failures never become [`marquee_core::MarqueeError`]s. Every backend
//! call returns a [`CacheOutcome`], and callers branch on
//! [`CacheUnavailable`] explicitly to degrade to the origin.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use marquee_core::{CacheKey, CacheSetName};

/// Why a cache operation could not be served.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheUnavailable {
    /// The client never established a connection (initial connect failed).
    #[error("cache not connected: {reason}")]
    NotConnected { reason: String },

    /// The connection dropped or the server did not answer in time.
    #[error("cache unreachable: {reason}")]
    Unreachable { reason: String },

    /// The client was shut down.
    #[error("cache client closed")]
    Closed,

    /// The server rejected the command (wrong type, bad argument, ...).
    #[error("cache command failed: {reason}")]
    Command { reason: String },
}

impl CacheUnavailable {
    /// Whether the cache could not be reached at all, as opposed to a server
    /// that answered with an error.
    pub fn is_transport(&self) -> bool {
        !matches!(self, CacheUnavailable::Command { .. })
    }
}

/// Result of a cache operation.
pub type CacheOutcome<T> = Result<T, CacheUnavailable>;

/// One page of a cursor-driven key scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanPage {
    /// Cursor for the next call; `0` means the scan is complete.
    pub cursor: u64,
    pub keys: Vec<CacheKey>,
}

/// Remote key/value cache contract.
///
/// Values are opaque bytes. Implementations must be safe to share across
/// tasks; a single instance is constructed at process start and injected
/// wherever the cache is used.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    /// Get the raw value stored at `key`.
    async fn get(&self, key: &CacheKey) -> CacheOutcome<Option<Vec<u8>>>;

    /// Store `value` at `key`, expiring after `ttl` (rounded up to whole seconds).
    async fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> CacheOutcome<()>;

    /// Delete all `keys` in one round-trip. Returns how many existed.
    async fn delete(&self, keys: &[CacheKey]) -> CacheOutcome<u64>;

    /// One SCAN step: examine roughly `count` keys starting at `cursor` and
    /// return those matching the glob `pattern`.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> CacheOutcome<ScanPage>;

    /// Add `key` to the set `set` and re-arm the set's expiry to `ttl`.
    async fn add_to_set(&self, set: &CacheSetName, key: &CacheKey, ttl: Duration) -> CacheOutcome<()>;

    /// Members of the set `set` (empty if it does not exist).
    async fn set_members(&self, set: &CacheSetName) -> CacheOutcome<Vec<CacheKey>>;

    /// Release the connection. Idempotent; returns `true` only for the call
    /// that actually closed it.
    async fn close(&self) -> bool;

    /// All keys matching `pattern`, looping SCAN until the cursor returns to 0.
    async fn scan_keys_matching(
        &self,
        pattern: &str,
        page_size: usize,
    ) -> CacheOutcome<Vec<CacheKey>> {
        let mut keys = Vec::new();
        let mut cursor = 0u64;
        loop {
            let page = self.scan(cursor, pattern, page_size).await?;
            keys.extend(page.keys);
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

/// Seconds to pass to SETEX: never zero.
pub(crate) fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

/// Snapshot of cache-aside statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from the cache.
    pub hits: u64,
    /// Reads where the key was absent.
    pub misses: u64,
    /// Reads where the stored bytes failed to deserialize.
    pub corrupted: u64,
    /// Reads that skipped the cache because it was unavailable.
    pub degraded: u64,
    /// Best-effort writes that failed.
    pub write_failures: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.corrupted + self.degraded;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Lock-free counters behind [`CacheStats`].
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    corrupted: AtomicU64,
    degraded: AtomicU64,
    write_failures: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn corrupted(&self) {
        self.corrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write_failed(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}
