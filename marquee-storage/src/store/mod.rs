//! Document store abstraction with multi-collection transactions.
//!
//! A [`DocumentStore`] hands out [`StoreSession`]s. Reads work with or
//! without a transaction; every mutation requires one, so an aggregate write
//! is always all-or-nothing. Counter and id-list updates are store-side
//! operations ([`StoreSession::increment`], [`StoreSession::push_id`]) rather
//! than read-modify-write in application code.

pub mod memory;

use async_trait::async_trait;
use marquee_core::{
    EntityId, EntityType, Episode, MarqueeError, MarqueeResult, Season, StorageError, TvShow,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

pub use memory::{InMemoryDocumentStore, InMemorySession};

/// Field-equality filter: every listed field must equal the given value.
pub type FieldFilter = Map<String, Value>;

/// The collections that make up the TV aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    TvShows,
    Seasons,
    Episodes,
}

/// A uniqueness constraint enforced by the store itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueIndex {
    pub name: &'static str,
    pub fields: &'static [&'static str],
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::TvShows, Collection::Seasons, Collection::Episodes];

    pub fn name(self) -> &'static str {
        match self {
            Collection::TvShows => "tv_shows",
            Collection::Seasons => "seasons",
            Collection::Episodes => "episodes",
        }
    }

    pub fn entity_type(self) -> EntityType {
        match self {
            Collection::TvShows => EntityType::TvShow,
            Collection::Seasons => EntityType::Season,
            Collection::Episodes => EntityType::Episode,
        }
    }

    /// The collection that stores documents of `entity_type`, if any.
    pub fn for_entity(entity_type: EntityType) -> Option<Self> {
        Collection::ALL
            .into_iter()
            .find(|c| c.entity_type() == entity_type)
    }

    pub fn unique_indexes(self) -> &'static [UniqueIndex] {
        match self {
            Collection::TvShows => &[],
            Collection::Seasons => &[UniqueIndex {
                name: "seasons_show_number_key",
                fields: &["tv_show_id", "season_number"],
            }],
            Collection::Episodes => &[UniqueIndex {
                name: "episodes_season_number_key",
                fields: &["season_id", "episode_number"],
            }],
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed document stored in one [`Collection`].
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> EntityId;
}

impl Document for TvShow {
    const COLLECTION: Collection = Collection::TvShows;

    fn id(&self) -> EntityId {
        self.tv_show_id
    }
}

impl Document for Season {
    const COLLECTION: Collection = Collection::Seasons;

    fn id(&self) -> EntityId {
        self.season_id
    }
}

impl Document for Episode {
    const COLLECTION: Collection = Collection::Episodes;

    fn id(&self) -> EntityId {
        self.episode_id
    }
}

/// Factory for sessions. One instance is shared process-wide.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    type Session: StoreSession;

    async fn start_session(&self) -> MarqueeResult<Self::Session>;
}

/// One logical connection to the store.
#[async_trait]
pub trait StoreSession: Send {
    async fn start_transaction(&mut self) -> MarqueeResult<()>;

    async fn commit_transaction(&mut self) -> MarqueeResult<()>;

    /// Discard every mutation since `start_transaction`.
    async fn abort_transaction(&mut self) -> MarqueeResult<()>;

    /// Release the session. Aborts an open transaction.
    async fn end_session(&mut self) -> MarqueeResult<()>;

    fn in_transaction(&self) -> bool;

    async fn find_raw(&mut self, collection: Collection, id: EntityId) -> MarqueeResult<Option<Value>>;

    async fn find_raw_by_fields(
        &mut self,
        collection: Collection,
        filter: &FieldFilter,
    ) -> MarqueeResult<Vec<Value>>;

    /// Insert a new document. Fails with [`StorageError::DuplicateKey`] on an
    /// id or unique index collision.
    async fn insert_raw(&mut self, collection: Collection, id: EntityId, doc: Value) -> MarqueeResult<()>;

    /// Returns whether the document existed.
    async fn delete_raw(&mut self, collection: Collection, id: EntityId) -> MarqueeResult<bool>;

    /// Overwrite the given top-level fields. Returns whether the document existed.
    async fn set_fields(
        &mut self,
        collection: Collection,
        id: EntityId,
        fields: FieldFilter,
    ) -> MarqueeResult<bool>;

    /// Append `value` to the id array `field`.
    async fn push_id(
        &mut self,
        collection: Collection,
        id: EntityId,
        field: &str,
        value: EntityId,
    ) -> MarqueeResult<bool>;

    /// Remove every occurrence of `value` from the id array `field`.
    async fn pull_id(
        &mut self,
        collection: Collection,
        id: EntityId,
        field: &str,
        value: EntityId,
    ) -> MarqueeResult<bool>;

    /// Atomically add `by` to the integer `field`.
    async fn increment(
        &mut self,
        collection: Collection,
        id: EntityId,
        field: &str,
        by: i64,
    ) -> MarqueeResult<bool>;
}

/// Typed helpers over [`StoreSession`].
#[async_trait]
pub trait StoreSessionExt: StoreSession {
    async fn find<D: Document>(&mut self, id: EntityId) -> MarqueeResult<Option<D>> {
        match self.find_raw(D::COLLECTION, id).await? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    async fn find_by_fields<D: Document>(&mut self, filter: &FieldFilter) -> MarqueeResult<Vec<D>> {
        self.find_raw_by_fields(D::COLLECTION, filter)
            .await?
            .into_iter()
            .map(|raw| serde_json::from_value(raw).map_err(MarqueeError::from))
            .collect()
    }

    async fn insert<D: Document>(&mut self, doc: &D) -> MarqueeResult<()> {
        let raw = serde_json::to_value(doc)?;
        self.insert_raw(D::COLLECTION, doc.id(), raw).await
    }
}

impl<S: StoreSession> StoreSessionExt for S {}

/// Build a [`FieldFilter`] from `(field, value)` pairs.
pub fn filter<I, K>(pairs: I) -> FieldFilter
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Whether `doc` satisfies every condition in `filter`.
pub fn matches_filter(doc: &Value, filter: &FieldFilter) -> bool {
    filter
        .iter()
        .all(|(field, expected)| doc.get(field) == Some(expected))
}

pub(crate) fn no_transaction(operation: &str) -> MarqueeError {
    MarqueeError::Storage(StorageError::TransactionFailed {
        reason: format!("{operation} requires an active transaction"),
    })
}
