//! In-memory transactional document store.
//!
//! Transactions overlap. Each one reads from a snapshot taken when it
//! started, overlaid with its own writes, and records every mutation in a
//! write log. Commit replays the log against whatever is committed at that
//! moment, under the store lock, and publishes the result only if every
//! operation applied. Store-side operations such as `increment` therefore
//! compose across concurrent transactions, while a value computed from a
//! stale snapshot and written back with `set_fields` overwrites the other
//! writers. Unique indexes are checked on insert and again on commit. Fault
//! switches let tests fail a specific delete or insert midway through an
//! aggregate write.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use marquee_core::{EntityId, MarqueeError, MarqueeResult, StorageError};
use serde_json::Value;
use tokio::sync::{Barrier, Mutex as AsyncMutex};

use super::{
    matches_filter, no_transaction, Collection, Document, DocumentStore, FieldFilter, StoreSession,
};

#[derive(Debug, Clone, Default)]
struct StoreState {
    collections: HashMap<Collection, BTreeMap<EntityId, Value>>,
}

impl StoreState {
    fn collection(&self, collection: Collection) -> Option<&BTreeMap<EntityId, Value>> {
        self.collections.get(&collection)
    }

    fn collection_mut(&mut self, collection: Collection) -> &mut BTreeMap<EntityId, Value> {
        self.collections.entry(collection).or_default()
    }

    fn find(&self, collection: Collection, id: EntityId) -> Option<Value> {
        self.collection(collection).and_then(|docs| docs.get(&id).cloned())
    }

    fn find_matching(&self, collection: Collection, filter: &FieldFilter) -> Vec<Value> {
        self.collection(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| matches_filter(doc, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply one logged write. Returns whether the target document existed.
    fn apply(&mut self, op: &WriteOp) -> MarqueeResult<bool> {
        match op {
            WriteOp::Insert {
                collection,
                id,
                doc,
            } => {
                self.insert(*collection, *id, doc.clone())?;
                Ok(true)
            }
            WriteOp::Delete { collection, id } => {
                Ok(self.collection_mut(*collection).remove(id).is_some())
            }
            WriteOp::SetFields {
                collection,
                id,
                fields,
            } => self.update(*collection, *id, |doc| {
                doc.extend(fields.clone());
                Ok(())
            }),
            WriteOp::PushId {
                collection,
                id,
                field,
                value,
            } => self.update(*collection, *id, |doc| {
                id_array(doc, field)?.push(Value::String(value.to_string()));
                Ok(())
            }),
            WriteOp::PullId {
                collection,
                id,
                field,
                value,
            } => {
                let needle = Value::String(value.to_string());
                self.update(*collection, *id, |doc| {
                    id_array(doc, field)?.retain(|v| *v != needle);
                    Ok(())
                })
            }
            WriteOp::Increment {
                collection,
                id,
                field,
                by,
            } => self.update(*collection, *id, |doc| {
                let current = match doc.get(field.as_str()) {
                    None | Some(Value::Null) => 0,
                    Some(v) => v.as_i64().ok_or_else(|| {
                        MarqueeError::Storage(StorageError::Backend {
                            reason: format!("field {field} is not an integer"),
                        })
                    })?,
                };
                doc.insert(field.clone(), Value::from(current + by));
                Ok(())
            }),
        }
    }

    fn insert(&mut self, collection: Collection, id: EntityId, doc: Value) -> MarqueeResult<()> {
        let docs = self.collection_mut(collection);
        if docs.contains_key(&id) {
            return Err(duplicate(collection, "_id", id.to_string()));
        }
        for index in collection.unique_indexes() {
            let tuple: Vec<Option<&Value>> = index.fields.iter().map(|f| doc.get(*f)).collect();
            let clash = docs
                .values()
                .any(|other| index.fields.iter().map(|f| other.get(*f)).eq(tuple.iter().copied()));
            if clash {
                let value = tuple
                    .iter()
                    .map(|v| v.map(Value::to_string).unwrap_or_else(|| "null".to_string()))
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(duplicate(collection, index.name, format!("({value})")));
            }
        }
        docs.insert(id, doc);
        Ok(())
    }

    fn update<F>(&mut self, collection: Collection, id: EntityId, f: F) -> MarqueeResult<bool>
    where
        F: FnOnce(&mut serde_json::Map<String, Value>) -> MarqueeResult<()>,
    {
        match self.collection_mut(collection).get_mut(&id) {
            Some(Value::Object(fields)) => {
                f(fields)?;
                Ok(true)
            }
            Some(_) => Err(MarqueeError::Storage(StorageError::Backend {
                reason: format!("{collection}/{id} is not an object"),
            })),
            None => Ok(false),
        }
    }
}

/// A mutation recorded by a transaction and replayed on commit.
#[derive(Debug, Clone)]
enum WriteOp {
    Insert {
        collection: Collection,
        id: EntityId,
        doc: Value,
    },
    Delete {
        collection: Collection,
        id: EntityId,
    },
    SetFields {
        collection: Collection,
        id: EntityId,
        fields: FieldFilter,
    },
    PushId {
        collection: Collection,
        id: EntityId,
        field: String,
        value: EntityId,
    },
    PullId {
        collection: Collection,
        id: EntityId,
        field: String,
        value: EntityId,
    },
    Increment {
        collection: Collection,
        id: EntityId,
        field: String,
        by: i64,
    },
}

fn duplicate(collection: Collection, index: &str, value: String) -> MarqueeError {
    MarqueeError::Storage(StorageError::DuplicateKey {
        collection: collection.name().to_string(),
        index: index.to_string(),
        value,
    })
}

fn id_array<'a>(
    fields: &'a mut serde_json::Map<String, Value>,
    field: &str,
) -> MarqueeResult<&'a mut Vec<Value>> {
    match fields
        .entry(field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(items) => Ok(items),
        _ => Err(MarqueeError::Storage(StorageError::Backend {
            reason: format!("field {field} is not an array"),
        })),
    }
}

#[derive(Debug)]
struct CommitGate {
    barrier: Arc<Barrier>,
    remaining: usize,
}

/// Injected failures and commit scheduling, consumed as they fire.
#[derive(Debug, Default)]
struct FaultPlan {
    fail_delete: HashSet<EntityId>,
    fail_insert: HashSet<EntityId>,
    connection_resets: u32,
    commit_gate: Option<CommitGate>,
}

impl FaultPlan {
    fn next_commit_gate(&mut self) -> Option<Arc<Barrier>> {
        let gate = self.commit_gate.as_mut()?;
        gate.remaining = gate.remaining.saturating_sub(1);
        let barrier = Arc::clone(&gate.barrier);
        if gate.remaining == 0 {
            self.commit_gate = None;
        }
        Some(barrier)
    }
}

#[derive(Debug, Default)]
struct StoreCounters {
    sessions: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
}

/// In-memory [`DocumentStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    state: Arc<AsyncMutex<StoreState>>,
    faults: Arc<Mutex<FaultPlan>>,
    counters: Arc<StoreCounters>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next delete of `id` inside a transaction.
    pub fn fail_delete_of(&self, id: EntityId) {
        if let Ok(mut plan) = self.faults.lock() {
            plan.fail_delete.insert(id);
        }
    }

    /// Fail the next insert of `id` inside a transaction.
    pub fn fail_insert_of(&self, id: EntityId) {
        if let Ok(mut plan) = self.faults.lock() {
            plan.fail_insert.insert(id);
        }
    }

    /// Fail the next `n` transaction starts with a connection reset.
    pub fn reset_connections(&self, n: u32) {
        if let Ok(mut plan) = self.faults.lock() {
            plan.connection_resets = n;
        }
    }

    /// Hold the next `n` commits until all `n` have been requested, so every
    /// one of those transactions has read its snapshot before any publishes.
    pub fn hold_commits(&self, n: usize) {
        if n == 0 {
            return;
        }
        if let Ok(mut plan) = self.faults.lock() {
            plan.commit_gate = Some(CommitGate {
                barrier: Arc::new(Barrier::new(n)),
                remaining: n,
            });
        }
    }

    pub fn commits(&self) -> u64 {
        self.counters.commits.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> u64 {
        self.counters.aborts.load(Ordering::SeqCst)
    }

    pub fn sessions_started(&self) -> u64 {
        self.counters.sessions.load(Ordering::SeqCst)
    }

    /// Committed document count in `collection`.
    pub async fn count(&self, collection: Collection) -> usize {
        self.state
            .lock()
            .await
            .collection(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Committed typed document, if present.
    pub async fn get<D: Document>(&self, id: EntityId) -> MarqueeResult<Option<D>> {
        let raw = self.state.lock().await.find(D::COLLECTION, id);
        raw.map(|v| serde_json::from_value(v).map_err(MarqueeError::from))
            .transpose()
    }

    /// Write a document directly, bypassing transactions and index checks.
    pub async fn seed<D: Document>(&self, doc: &D) -> MarqueeResult<()> {
        let raw = serde_json::to_value(doc)?;
        self.state
            .lock()
            .await
            .collection_mut(D::COLLECTION)
            .insert(doc.id(), raw);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    type Session = InMemorySession;

    async fn start_session(&self) -> MarqueeResult<InMemorySession> {
        self.counters.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(InMemorySession {
            state: Arc::clone(&self.state),
            faults: Arc::clone(&self.faults),
            counters: Arc::clone(&self.counters),
            txn: None,
            ended: false,
        })
    }
}

struct Transaction {
    // Snapshot at start plus this transaction's own writes.
    view: StoreState,
    log: Vec<WriteOp>,
}

/// Session over an [`InMemoryDocumentStore`].
pub struct InMemorySession {
    state: Arc<AsyncMutex<StoreState>>,
    faults: Arc<Mutex<FaultPlan>>,
    counters: Arc<StoreCounters>,
    txn: Option<Transaction>,
    ended: bool,
}

impl std::fmt::Debug for InMemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySession")
            .field("in_transaction", &self.txn.is_some())
            .field("ended", &self.ended)
            .finish()
    }
}

impl InMemorySession {
    fn check_open(&self) -> MarqueeResult<()> {
        if self.ended {
            return Err(MarqueeError::Storage(StorageError::TransactionFailed {
                reason: "session already ended".to_string(),
            }));
        }
        Ok(())
    }

    /// Apply `op` to the transaction's view and log it for commit.
    fn write(&mut self, operation: &str, op: WriteOp) -> MarqueeResult<bool> {
        self.check_open()?;
        let txn = self.txn.as_mut().ok_or_else(|| no_transaction(operation))?;
        let existed = txn.view.apply(&op)?;
        txn.log.push(op);
        Ok(existed)
    }

    fn faults(&self) -> MarqueeResult<std::sync::MutexGuard<'_, FaultPlan>> {
        self.faults
            .lock()
            .map_err(|_| MarqueeError::Storage(StorageError::LockPoisoned))
    }

    /// Run a read against the transaction's view, or the committed state.
    async fn read<T>(&mut self, f: impl FnOnce(&StoreState) -> T) -> MarqueeResult<T> {
        self.check_open()?;
        match &self.txn {
            Some(txn) => Ok(f(&txn.view)),
            None => Ok(f(&*self.state.lock().await)),
        }
    }
}

#[async_trait]
impl StoreSession for InMemorySession {
    async fn start_transaction(&mut self) -> MarqueeResult<()> {
        self.check_open()?;
        if self.txn.is_some() {
            return Err(MarqueeError::Storage(StorageError::TransactionFailed {
                reason: "transaction already in progress".to_string(),
            }));
        }
        {
            let mut plan = self.faults()?;
            if plan.connection_resets > 0 {
                plan.connection_resets -= 1;
                return Err(MarqueeError::Storage(StorageError::ConnectionReset {
                    reason: "connection reset by peer".to_string(),
                }));
            }
        }
        let view = self.state.lock().await.clone();
        self.txn = Some(Transaction {
            view,
            log: Vec::new(),
        });
        Ok(())
    }

    async fn commit_transaction(&mut self) -> MarqueeResult<()> {
        self.check_open()?;
        let txn = self.txn.take().ok_or_else(|| no_transaction("commit"))?;

        let gate = self.faults()?.next_commit_gate();
        if let Some(barrier) = gate {
            barrier.wait().await;
        }

        let mut committed = self.state.lock().await;
        let mut next = committed.clone();
        for op in &txn.log {
            if let Err(e) = next.apply(op) {
                self.counters.aborts.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(error = %e, "Commit replay failed, transaction discarded");
                return Err(e);
            }
        }
        *committed = next;
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort_transaction(&mut self) -> MarqueeResult<()> {
        self.check_open()?;
        if self.txn.take().is_some() {
            self.counters.aborts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn end_session(&mut self) -> MarqueeResult<()> {
        if self.ended {
            return Ok(());
        }
        if self.txn.take().is_some() {
            self.counters.aborts.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("Session ended with an open transaction, aborted");
        }
        self.ended = true;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    async fn find_raw(&mut self, collection: Collection, id: EntityId) -> MarqueeResult<Option<Value>> {
        self.read(|s| s.find(collection, id)).await
    }

    async fn find_raw_by_fields(
        &mut self,
        collection: Collection,
        filter: &FieldFilter,
    ) -> MarqueeResult<Vec<Value>> {
        self.read(|s| s.find_matching(collection, filter)).await
    }

    async fn insert_raw(&mut self, collection: Collection, id: EntityId, doc: Value) -> MarqueeResult<()> {
        if self.faults()?.fail_insert.remove(&id) {
            return Err(MarqueeError::Storage(StorageError::InjectedFailure {
                operation: format!("insert {collection}/{id}"),
            }));
        }
        self.write(
            "insert",
            WriteOp::Insert {
                collection,
                id,
                doc,
            },
        )
        .map(|_| ())
    }

    async fn delete_raw(&mut self, collection: Collection, id: EntityId) -> MarqueeResult<bool> {
        if self.faults()?.fail_delete.remove(&id) {
            return Err(MarqueeError::Storage(StorageError::InjectedFailure {
                operation: format!("delete {collection}/{id}"),
            }));
        }
        self.write("delete", WriteOp::Delete { collection, id })
    }

    async fn set_fields(
        &mut self,
        collection: Collection,
        id: EntityId,
        fields: FieldFilter,
    ) -> MarqueeResult<bool> {
        self.write(
            "set_fields",
            WriteOp::SetFields {
                collection,
                id,
                fields,
            },
        )
    }

    async fn push_id(
        &mut self,
        collection: Collection,
        id: EntityId,
        field: &str,
        value: EntityId,
    ) -> MarqueeResult<bool> {
        self.write(
            "push_id",
            WriteOp::PushId {
                collection,
                id,
                field: field.to_string(),
                value,
            },
        )
    }

    async fn pull_id(
        &mut self,
        collection: Collection,
        id: EntityId,
        field: &str,
        value: EntityId,
    ) -> MarqueeResult<bool> {
        self.write(
            "pull_id",
            WriteOp::PullId {
                collection,
                id,
                field: field.to_string(),
                value,
            },
        )
    }

    async fn increment(
        &mut self,
        collection: Collection,
        id: EntityId,
        field: &str,
        by: i64,
    ) -> MarqueeResult<bool> {
        self.write(
            "increment",
            WriteOp::Increment {
                collection,
                id,
                field: field.to_string(),
                by,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{filter, StoreSessionExt};
    use marquee_core::{new_entity_id, Episode};
    use serde_json::json;

    fn episode(season_id: EntityId, number: i32) -> Episode {
        let now = chrono::Utc::now();
        Episode {
            episode_id: new_entity_id(),
            season_id,
            tv_show_id: new_entity_id(),
            episode_number: number,
            title: format!("Episode {number}"),
            runtime_minutes: Some(42),
            rating_sum: 0,
            rating_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let store = InMemoryDocumentStore::new();
        let ep = episode(new_entity_id(), 1);

        let mut session = store.start_session().await.unwrap();
        session.start_transaction().await.unwrap();
        session.insert(&ep).await.unwrap();
        session.commit_transaction().await.unwrap();
        session.end_session().await.unwrap();

        let stored: Option<Episode> = store.get(ep.episode_id).await.unwrap();
        assert_eq!(stored, Some(ep));
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn test_abort_discards_writes() {
        let store = InMemoryDocumentStore::new();
        let ep = episode(new_entity_id(), 1);

        let mut session = store.start_session().await.unwrap();
        session.start_transaction().await.unwrap();
        session.insert(&ep).await.unwrap();
        assert!(session.find::<Episode>(ep.episode_id).await.unwrap().is_some());
        session.abort_transaction().await.unwrap();

        assert!(session.find::<Episode>(ep.episode_id).await.unwrap().is_none());
        assert_eq!(store.count(Collection::Episodes).await, 0);
        assert_eq!(store.aborts(), 1);
    }

    #[tokio::test]
    async fn test_mutation_requires_transaction() {
        let store = InMemoryDocumentStore::new();
        let mut session = store.start_session().await.unwrap();
        let result = session.insert(&episode(new_entity_id(), 1)).await;
        assert!(matches!(
            result,
            Err(MarqueeError::Storage(StorageError::TransactionFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_unique_index_enforced() {
        let store = InMemoryDocumentStore::new();
        let season = new_entity_id();
        let mut session = store.start_session().await.unwrap();
        session.start_transaction().await.unwrap();
        session.insert(&episode(season, 1)).await.unwrap();
        session.insert(&episode(season, 2)).await.unwrap();

        let clash = session.insert(&episode(season, 1)).await;
        match clash {
            Err(MarqueeError::Storage(StorageError::DuplicateKey { index, .. })) => {
                assert_eq!(index, "episodes_season_number_key");
            }
            other => panic!("expected duplicate key, got {other:?}"),
        }
        // Same number under another season is fine.
        session.insert(&episode(new_entity_id(), 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_side_updates() {
        let store = InMemoryDocumentStore::new();
        let ep = episode(new_entity_id(), 1);
        store.seed(&ep).await.unwrap();
        let child = new_entity_id();

        let mut session = store.start_session().await.unwrap();
        session.start_transaction().await.unwrap();
        assert!(session
            .increment(Collection::Episodes, ep.episode_id, "rating_sum", 7)
            .await
            .unwrap());
        session
            .increment(Collection::Episodes, ep.episode_id, "rating_sum", 3)
            .await
            .unwrap();
        session
            .push_id(Collection::Episodes, ep.episode_id, "reviews", child)
            .await
            .unwrap();
        session
            .set_fields(
                Collection::Episodes,
                ep.episode_id,
                filter([("title", json!("Renamed"))]),
            )
            .await
            .unwrap();
        assert!(!session
            .increment(Collection::Episodes, new_entity_id(), "rating_sum", 1)
            .await
            .unwrap());
        session.commit_transaction().await.unwrap();

        let raw = store.state.lock().await.find(Collection::Episodes, ep.episode_id).unwrap();
        assert_eq!(raw["rating_sum"], json!(10));
        assert_eq!(raw["title"], json!("Renamed"));
        assert_eq!(raw["reviews"], json!([child.to_string()]));

        let mut session = store.start_session().await.unwrap();
        session.start_transaction().await.unwrap();
        session
            .pull_id(Collection::Episodes, ep.episode_id, "reviews", child)
            .await
            .unwrap();
        session.commit_transaction().await.unwrap();
        let raw = store.state.lock().await.find(Collection::Episodes, ep.episode_id).unwrap();
        assert_eq!(raw["reviews"], json!([]));
    }

    #[tokio::test]
    async fn test_find_by_fields() {
        let store = InMemoryDocumentStore::new();
        let season = new_entity_id();
        for n in 1..=3 {
            store.seed(&episode(season, n)).await.unwrap();
        }
        store.seed(&episode(new_entity_id(), 1)).await.unwrap();

        let mut session = store.start_session().await.unwrap();
        let found: Vec<Episode> = session
            .find_by_fields(&filter([("season_id", json!(season))]))
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn test_injected_faults_fire_once() {
        let store = InMemoryDocumentStore::new();
        let ep = episode(new_entity_id(), 1);
        store.seed(&ep).await.unwrap();
        store.fail_delete_of(ep.episode_id);
        store.reset_connections(1);

        let mut session = store.start_session().await.unwrap();
        assert!(matches!(
            session.start_transaction().await,
            Err(MarqueeError::Storage(StorageError::ConnectionReset { .. }))
        ));
        session.start_transaction().await.unwrap();
        assert!(matches!(
            session.delete_raw(Collection::Episodes, ep.episode_id).await,
            Err(MarqueeError::Storage(StorageError::InjectedFailure { .. }))
        ));
        assert!(session.delete_raw(Collection::Episodes, ep.episode_id).await.unwrap());
    }

    async fn rating_count(store: &InMemoryDocumentStore, id: EntityId) -> i64 {
        store.get::<Episode>(id).await.unwrap().unwrap().rating_count
    }

    #[tokio::test]
    async fn test_overlapping_increments_both_apply() {
        let store = InMemoryDocumentStore::new();
        let ep = episode(new_entity_id(), 1);
        store.seed(&ep).await.unwrap();

        let mut a = store.start_session().await.unwrap();
        let mut b = store.start_session().await.unwrap();
        a.start_transaction().await.unwrap();
        b.start_transaction().await.unwrap();

        // Both read before either writes.
        let seen_a = a.find::<Episode>(ep.episode_id).await.unwrap().unwrap();
        let seen_b = b.find::<Episode>(ep.episode_id).await.unwrap().unwrap();
        assert_eq!((seen_a.rating_count, seen_b.rating_count), (0, 0));

        a.increment(Collection::Episodes, ep.episode_id, "rating_count", 1)
            .await
            .unwrap();
        b.increment(Collection::Episodes, ep.episode_id, "rating_count", 1)
            .await
            .unwrap();
        a.commit_transaction().await.unwrap();
        b.commit_transaction().await.unwrap();

        assert_eq!(rating_count(&store, ep.episode_id).await, 2);
    }

    #[tokio::test]
    async fn test_overlapping_read_modify_write_loses_an_update() {
        let store = InMemoryDocumentStore::new();
        let ep = episode(new_entity_id(), 1);
        store.seed(&ep).await.unwrap();

        let mut a = store.start_session().await.unwrap();
        let mut b = store.start_session().await.unwrap();
        a.start_transaction().await.unwrap();
        b.start_transaction().await.unwrap();

        for session in [&mut a, &mut b] {
            let seen = session.find::<Episode>(ep.episode_id).await.unwrap().unwrap();
            session
                .set_fields(
                    Collection::Episodes,
                    ep.episode_id,
                    filter([("rating_count", json!(seen.rating_count + 1))]),
                )
                .await
                .unwrap();
        }
        a.commit_transaction().await.unwrap();
        b.commit_transaction().await.unwrap();

        assert_eq!(rating_count(&store, ep.episode_id).await, 1);
    }

    #[tokio::test]
    async fn test_transaction_reads_its_snapshot() {
        let store = InMemoryDocumentStore::new();
        let season = new_entity_id();
        let mut reader = store.start_session().await.unwrap();
        reader.start_transaction().await.unwrap();

        let mut writer = store.start_session().await.unwrap();
        writer.start_transaction().await.unwrap();
        let ep = episode(season, 1);
        writer.insert(&ep).await.unwrap();
        writer.commit_transaction().await.unwrap();

        assert!(reader.find::<Episode>(ep.episode_id).await.unwrap().is_none());
        reader.abort_transaction().await.unwrap();
        assert!(reader.find::<Episode>(ep.episode_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unique_index_rechecked_on_commit() {
        let store = InMemoryDocumentStore::new();
        let season = new_entity_id();
        let mut a = store.start_session().await.unwrap();
        let mut b = store.start_session().await.unwrap();
        a.start_transaction().await.unwrap();
        b.start_transaction().await.unwrap();

        a.insert(&episode(season, 1)).await.unwrap();
        b.insert(&episode(season, 1)).await.unwrap();
        a.commit_transaction().await.unwrap();

        assert!(matches!(
            b.commit_transaction().await,
            Err(MarqueeError::Storage(StorageError::DuplicateKey { .. }))
        ));
        assert_eq!(store.count(Collection::Episodes).await, 1);
        assert_eq!(store.aborts(), 1);
    }

    #[tokio::test]
    async fn test_held_commits_wait_for_each_other() {
        let store = InMemoryDocumentStore::new();
        let ep = episode(new_entity_id(), 1);
        store.seed(&ep).await.unwrap();
        store.hold_commits(2);

        let mut a = store.start_session().await.unwrap();
        a.start_transaction().await.unwrap();
        a.increment(Collection::Episodes, ep.episode_id, "rating_count", 1)
            .await
            .unwrap();
        let first = tokio::spawn(async move { a.commit_transaction().await });
        tokio::task::yield_now().await;
        assert_eq!(store.commits(), 0);

        let mut b = store.start_session().await.unwrap();
        b.start_transaction().await.unwrap();
        b.increment(Collection::Episodes, ep.episode_id, "rating_count", 1)
            .await
            .unwrap();
        b.commit_transaction().await.unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(store.commits(), 2);
        assert_eq!(rating_count(&store, ep.episode_id).await, 2);
        // The gate is spent; later commits go straight through.
        let mut c = store.start_session().await.unwrap();
        c.start_transaction().await.unwrap();
        c.commit_transaction().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_session_aborts_open_transaction() {
        let store = InMemoryDocumentStore::new();
        let mut session = store.start_session().await.unwrap();
        session.start_transaction().await.unwrap();
        session.insert(&episode(new_entity_id(), 1)).await.unwrap();
        session.end_session().await.unwrap();
        session.end_session().await.unwrap();

        assert_eq!(store.count(Collection::Episodes).await, 0);
        assert_eq!(store.aborts(), 1);
        let mut next = store.start_session().await.unwrap();
        next.start_transaction().await.unwrap();
    }
}
