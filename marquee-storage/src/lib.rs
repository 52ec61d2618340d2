//! Marquee Storage - Cache-Aside Layer and Aggregate Writes
//!
//! The read side is [`CacheAside`]: cache first, retry-wrapped origin fetch
//! on a miss, best-effort write-back. The write side is
//! [`AggregateWriteCoordinator`]: multi-collection transactions over a
//! [`DocumentStore`], followed by graph-derived cache invalidation.

pub mod cache;
pub mod coordinator;
pub mod retry;
pub mod store;

pub use cache::{
    glob_match, CacheAside, CacheOutcome, CacheRead, CacheStats, CacheUnavailable,
    ConnectionStatus, InMemoryKeyValueCache, InvalidationReport, Invalidator, KeyValueCache,
    ReadSource, RedisKeyValueCache, ScanPage,
};
pub use coordinator::{
    AggregateWriteCoordinator, AggregateWriteGroup, CommittedGroup, DeletedAggregate, Mutation,
    WriteKind, WriteReceipt, WriteState, WriteStep,
};
pub use retry::{Backoff, RetryExecutor, RetryPolicy};
pub use store::{
    filter, matches_filter, Collection, Document, DocumentStore, FieldFilter,
    InMemoryDocumentStore, InMemorySession, StoreSession, StoreSessionExt, UniqueIndex,
};
