//! Cache-aside layer over a remote key/value store.
//!
//! Cache trouble never fails a request. Every backend call returns a
//! [`CacheOutcome`], and the reader turns [`CacheUnavailable`] into an origin
//! fetch as an explicit branch. Writes purge their dependents through the
//! [`Invalidator`] once the store transaction has committed.
//!
//! # Example
//!
//! ```ignore
//! let cache = Arc::new(RedisKeyValueCache::new(CacheConnectionConfig::from_env()?));
//! let reader = CacheAside::new(cache.clone(), RetryExecutor::default(), CacheConfig::default());
//!
//! let key = CacheKey::entity(EntityType::Episode, id);
//! let episode: Episode = reader
//!     .cache_or_fetch(&key, || store.load_episode(id), None, None)
//!     .await?;
//! ```

pub mod invalidation;
pub mod memory_backend;
pub mod read;
pub mod read_through;
pub mod redis_backend;
pub mod traits;

pub use invalidation::{InvalidationReport, Invalidator};
pub use memory_backend::{glob_match, InMemoryKeyValueCache};
pub use read::{CacheRead, ReadSource};
pub use read_through::CacheAside;
pub use redis_backend::{ConnectionStatus, RedisKeyValueCache};
pub use traits::{CacheOutcome, CacheStats, CacheUnavailable, KeyValueCache, ScanPage};
