//! Catalog read services and write entry points.
//!
//! Reads go through [`CacheAside`] with an origin-fetch callback that opens a
//! store session, loads the documents and ends the session. Writes are
//! delegated to the [`AggregateWriteCoordinator`], which owns every
//! multi-collection mutation and the cache invalidation that follows it.

use std::sync::Arc;

use marquee_core::{
    CacheConfig, CacheKey, CacheSetName, EntityGraph, EntityId, EntityType, Episode, EpisodeId,
    EpisodeUpdate, ListKind, MarqueeError, MarqueeResult, NewEpisode, NewSeason, NewTvShow,
    Season, SeasonId, SeasonWithEpisodes, TvShow, TvShowId,
};
use marquee_storage::{
    filter, AggregateWriteCoordinator, CacheAside, CacheRead, CacheStats, DeletedAggregate,
    Document, DocumentStore, FieldFilter, InvalidationReport, Invalidator, KeyValueCache,
    RetryExecutor, StoreSession, StoreSessionExt, WriteReceipt,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Page size used when a list query does not set one.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

/// Filter and page for [`CatalogService::list_episodes`].
///
/// The query is part of the cache key, so two equal queries always share an
/// entry no matter how they were built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tv_show_id: Option<TvShowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season_id: Option<SeasonId>,
    #[serde(default)]
    pub page: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl EpisodeQuery {
    pub fn for_show(tv_show_id: TvShowId) -> Self {
        Self {
            tv_show_id: Some(tv_show_id),
            ..Self::default()
        }
    }

    pub fn with_page(mut self, page: u32, limit: u32) -> Self {
        self.page = page;
        self.limit = Some(limit);
        self
    }

    fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE) as usize
    }

    fn field_filter(&self) -> FieldFilter {
        let mut fields = FieldFilter::new();
        if let Some(id) = self.tv_show_id {
            fields.insert("tv_show_id".to_string(), json!(id));
        }
        if let Some(id) = self.season_id {
            fields.insert("season_id".to_string(), json!(id));
        }
        fields
    }
}

/// The catalog as seen by callers: cached reads plus coordinated writes.
pub struct CatalogService<S: DocumentStore, C: KeyValueCache + ?Sized> {
    store: Arc<S>,
    reader: CacheAside<C>,
    invalidator: Invalidator<C>,
    writes: AggregateWriteCoordinator<S, C>,
}

impl<S: DocumentStore, C: KeyValueCache + ?Sized> Clone for CatalogService<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            reader: self.reader.clone(),
            invalidator: self.invalidator.clone(),
            writes: self.writes.clone(),
        }
    }
}

impl<S: DocumentStore, C: KeyValueCache + ?Sized> CatalogService<S, C> {
    /// Wire the reader, invalidator and write coordinator around one cache
    /// client and one store, both constructed by the caller.
    pub fn new(store: Arc<S>, cache: Arc<C>, config: CacheConfig, retry: RetryExecutor) -> Self {
        let invalidator = Invalidator::new(Arc::clone(&cache), &config);
        let writes = AggregateWriteCoordinator::new(
            Arc::clone(&store),
            invalidator.clone(),
            EntityGraph::catalog(),
            retry.clone(),
        );
        Self {
            store,
            reader: CacheAside::new(cache, retry, config),
            invalidator,
            writes,
        }
    }

    pub fn writes(&self) -> &AggregateWriteCoordinator<S, C> {
        &self.writes
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.reader.stats()
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub async fn episode(&self, episode_id: EpisodeId) -> MarqueeResult<Episode> {
        self.episode_read(episode_id).await.map(CacheRead::into_value)
    }

    /// Like [`episode`](Self::episode), also reporting whether the cache served it.
    pub async fn episode_read(&self, episode_id: EpisodeId) -> MarqueeResult<CacheRead<Episode>> {
        let store = &*self.store;
        self.reader
            .cache_or_fetch_read(
                &CacheKey::entity(EntityType::Episode, episode_id),
                || load_one::<S, Episode>(store, episode_id),
                None,
                None,
            )
            .await
    }

    /// A season with its episodes in episode-number order.
    pub async fn season(&self, season_id: SeasonId) -> MarqueeResult<SeasonWithEpisodes> {
        let store = &*self.store;
        self.reader
            .cache_or_fetch(
                &CacheKey::entity(EntityType::Season, season_id),
                || load_season(store, season_id),
                None,
                None,
            )
            .await
    }

    pub async fn tv_show(&self, tv_show_id: TvShowId) -> MarqueeResult<TvShow> {
        let store = &*self.store;
        self.reader
            .cache_or_fetch(
                &CacheKey::entity(EntityType::TvShow, tv_show_id),
                || load_one::<S, TvShow>(store, tv_show_id),
                None,
                None,
            )
            .await
    }

    /// Episodes of one season, cached as `episodes:by-parent:{"season_id":...}`.
    pub async fn episodes_by_season(&self, season_id: SeasonId) -> MarqueeResult<Vec<Episode>> {
        let key = CacheKey::list(EntityType::Episode, ListKind::ByParent, &json!({ "season_id": season_id }))?;
        let set = CacheSetName::for_lists(EntityType::Episode);
        let store = &*self.store;
        self.reader
            .cache_or_fetch(
                &key,
                || async move {
                    let mut episodes: Vec<Episode> =
                        load_where(store, &filter([("season_id", json!(season_id))])).await?;
                    episodes.sort_by_key(|e| e.episode_number);
                    Ok::<_, MarqueeError>(episodes)
                },
                None,
                Some(&set),
            )
            .await
    }

    /// Filtered, paged episode listing, ordered by season then episode number.
    pub async fn list_episodes(&self, query: &EpisodeQuery) -> MarqueeResult<Vec<Episode>> {
        let key = CacheKey::list(EntityType::Episode, ListKind::All, query)?;
        let set = CacheSetName::for_lists(EntityType::Episode);
        let store = &*self.store;
        let fields = query.field_filter();
        let (skip, take) = (query.page as usize * query.page_size(), query.page_size());
        self.reader
            .cache_or_fetch(
                &key,
                || {
                    let fields = fields.clone();
                    async move {
                        let mut episodes: Vec<Episode> = load_where(store, &fields).await?;
                        episodes.sort_by_key(|e| (e.tv_show_id, e.season_id, e.episode_number));
                        Ok::<_, MarqueeError>(episodes.into_iter().skip(skip).take(take).collect::<Vec<_>>())
                    }
                },
                None,
                Some(&set),
            )
            .await
    }

    /// Drop every list/query entry registered for `entity_type`.
    pub async fn purge_lists(&self, entity_type: EntityType) -> InvalidationReport {
        self.invalidator
            .invalidate_set(&CacheSetName::for_lists(entity_type))
            .await
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    pub async fn create_tv_show(&self, input: NewTvShow) -> MarqueeResult<WriteReceipt<TvShow>> {
        self.writes.create_tv_show(input).await
    }

    pub async fn create_season(&self, input: NewSeason) -> MarqueeResult<WriteReceipt<Season>> {
        self.writes.create_season(input).await
    }

    pub async fn create_episode(&self, input: NewEpisode) -> MarqueeResult<WriteReceipt<Episode>> {
        self.writes.create_episode(input).await
    }

    pub async fn update_episode(
        &self,
        episode_id: EpisodeId,
        update: EpisodeUpdate,
    ) -> MarqueeResult<WriteReceipt<Episode>> {
        self.writes.update_episode(episode_id, update).await
    }

    pub async fn rate_episode(
        &self,
        episode_id: EpisodeId,
        score: i64,
    ) -> MarqueeResult<WriteReceipt<Episode>> {
        self.writes.rate_episode(episode_id, score).await
    }

    pub async fn delete_episode(
        &self,
        episode_id: EpisodeId,
    ) -> MarqueeResult<WriteReceipt<DeletedAggregate>> {
        self.writes.delete_episode(episode_id).await
    }

    pub async fn delete_season(
        &self,
        season_id: SeasonId,
    ) -> MarqueeResult<WriteReceipt<DeletedAggregate>> {
        self.writes.delete_season(season_id).await
    }

    pub async fn delete_tv_show(
        &self,
        tv_show_id: TvShowId,
    ) -> MarqueeResult<WriteReceipt<DeletedAggregate>> {
        self.writes.delete_tv_show(tv_show_id).await
    }
}

// ============================================================================
// ORIGIN FETCHES
// ============================================================================

async fn end<Sess: StoreSession>(session: &mut Sess) {
    if let Err(e) = session.end_session().await {
        tracing::warn!(error = %e, "Failed to end read session");
    }
}

async fn load_one<S: DocumentStore, D: Document>(store: &S, id: EntityId) -> MarqueeResult<D> {
    let mut session = store.start_session().await?;
    let found = session.find::<D>(id).await;
    end(&mut session).await;
    found?.ok_or_else(|| MarqueeError::not_found(D::COLLECTION.entity_type(), id))
}

async fn load_where<S: DocumentStore, D: Document>(
    store: &S,
    fields: &FieldFilter,
) -> MarqueeResult<Vec<D>> {
    let mut session = store.start_session().await?;
    let found = session.find_by_fields::<D>(fields).await;
    end(&mut session).await;
    found
}

async fn load_season<S: DocumentStore>(
    store: &S,
    season_id: SeasonId,
) -> MarqueeResult<SeasonWithEpisodes> {
    let mut session = store.start_session().await?;
    let loaded = async {
        let season = session
            .find::<Season>(season_id)
            .await?
            .ok_or_else(|| MarqueeError::not_found(EntityType::Season, season_id))?;
        let mut episodes = session
            .find_by_fields::<Episode>(&filter([("season_id", json!(season_id))]))
            .await?;
        episodes.sort_by_key(|e| e.episode_number);
        Ok::<_, MarqueeError>(SeasonWithEpisodes { season, episodes })
    }
    .await;
    end(&mut session).await;
    loaded
}
