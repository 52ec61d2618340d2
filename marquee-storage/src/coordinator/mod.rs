//! Transactional aggregate writes with post-commit cache invalidation.
//!
//! Each public operation runs as one [`AggregateWriteGroup`]: validate the
//! input, open a transaction, run every step of the aggregate inside it,
//! commit or abort as a unit, then purge the cache patterns that the
//! [`EntityGraph`] derives from the touched entities. Invalidation happens
//! only after a commit and its failures never unwind the write.

mod write_group;

pub use write_group::{
    AggregateWriteGroup, CommittedGroup, Mutation, WriteKind, WriteReceipt, WriteState, WriteStep,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use marquee_core::{
    new_entity_id, validate_rating, Change, EntityGraph, EntityId, EntityType, Episode,
    EpisodeId, EpisodeUpdate, MarqueeError, MarqueeResult, NewEpisode, NewSeason, NewTvShow,
    Season, SeasonId, StorageError, TvShow, TvShowId, ValidationError,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::cache::{Invalidator, KeyValueCache};
use crate::retry::RetryExecutor;
use crate::store::{filter, Collection, DocumentStore, FieldFilter, StoreSession};

/// What a cascading delete removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedAggregate {
    pub root_type: EntityType,
    pub root_id: EntityId,
    /// Removed documents in deletion order (leaf-to-root).
    pub removed: Vec<(EntityType, EntityId)>,
}

impl DeletedAggregate {
    /// How many documents of `entity_type` were removed.
    pub fn count(&self, entity_type: EntityType) -> usize {
        self.removed.iter().filter(|(t, _)| *t == entity_type).count()
    }
}

/// Owns every multi-collection write to the TV aggregate.
pub struct AggregateWriteCoordinator<S: DocumentStore, C: KeyValueCache + ?Sized> {
    store: Arc<S>,
    invalidator: Invalidator<C>,
    graph: EntityGraph,
    retry: RetryExecutor,
}

impl<S: DocumentStore, C: KeyValueCache + ?Sized> Clone for AggregateWriteCoordinator<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            invalidator: self.invalidator.clone(),
            graph: self.graph.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<S: DocumentStore, C: KeyValueCache + ?Sized> AggregateWriteCoordinator<S, C> {
    /// `retry` covers opening the session and transaction only; steps that
    /// already ran are never replayed.
    pub fn new(
        store: Arc<S>,
        invalidator: Invalidator<C>,
        graph: EntityGraph,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            store,
            invalidator,
            graph,
            retry,
        }
    }

    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ========================================================================
    // CREATES
    // ========================================================================

    pub async fn create_tv_show(&self, input: NewTvShow) -> MarqueeResult<WriteReceipt<TvShow>> {
        input.validate()?;
        let mut group = self.begin(WriteKind::CreateTvShow).await?;
        let result = create_tv_show_steps(&mut group, input).await;
        self.complete(group, result).await
    }

    pub async fn create_season(&self, input: NewSeason) -> MarqueeResult<WriteReceipt<Season>> {
        input.validate()?;
        let mut group = self.begin(WriteKind::CreateSeason).await?;
        let result = create_season_steps(&mut group, input).await;
        self.complete(group, result).await
    }

    /// Insert the episode, append it to its season and bump the show's
    /// popularity, all in one transaction.
    pub async fn create_episode(&self, input: NewEpisode) -> MarqueeResult<WriteReceipt<Episode>> {
        input.validate()?;
        let mut group = self.begin(WriteKind::CreateEpisode).await?;
        let result = create_episode_steps(&mut group, input).await;
        self.complete(group, result).await
    }

    // ========================================================================
    // UPDATES
    // ========================================================================

    pub async fn update_episode(
        &self,
        episode_id: EpisodeId,
        update: EpisodeUpdate,
    ) -> MarqueeResult<WriteReceipt<Episode>> {
        update.validate()?;
        if update.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "update".to_string(),
                reason: "no fields to update".to_string(),
            }
            .into());
        }
        let mut group = self.begin(WriteKind::UpdateEpisode).await?;
        let result = update_episode_steps(&mut group, episode_id, update).await;
        self.complete(group, result).await
    }

    /// Record one rating. Sum and count are incremented store-side; the
    /// average is derived on read.
    pub async fn rate_episode(
        &self,
        episode_id: EpisodeId,
        score: i64,
    ) -> MarqueeResult<WriteReceipt<Episode>> {
        validate_rating(score)?;
        let mut group = self.begin(WriteKind::RateEpisode).await?;
        let result = rate_episode_steps(&mut group, episode_id, score).await;
        self.complete(group, result).await
    }

    // ========================================================================
    // DELETES
    // ========================================================================

    pub async fn delete_episode(
        &self,
        episode_id: EpisodeId,
    ) -> MarqueeResult<WriteReceipt<DeletedAggregate>> {
        let mut group = self.begin(WriteKind::DeleteEpisode).await?;
        let result = delete_episode_steps(&mut group, episode_id).await;
        self.complete(group, result).await
    }

    /// Delete a season and all of its episodes in one transaction.
    pub async fn delete_season(
        &self,
        season_id: SeasonId,
    ) -> MarqueeResult<WriteReceipt<DeletedAggregate>> {
        let mut group = self.begin(WriteKind::DeleteSeason).await?;
        let result = delete_season_steps(&mut group, &self.graph, season_id).await;
        self.complete(group, result).await
    }

    /// Delete a show with every season and episode under it in one transaction.
    pub async fn delete_tv_show(
        &self,
        tv_show_id: TvShowId,
    ) -> MarqueeResult<WriteReceipt<DeletedAggregate>> {
        let mut group = self.begin(WriteKind::DeleteTvShow).await?;
        let result = delete_tv_show_steps(&mut group, &self.graph, tv_show_id).await;
        self.complete(group, result).await
    }

    // ========================================================================
    // GROUP LIFECYCLE
    // ========================================================================

    async fn begin(&self, kind: WriteKind) -> MarqueeResult<AggregateWriteGroup<S::Session>> {
        let store = &self.store;
        self.retry
            .execute(|| async move {
                let session = store.start_session().await?;
                let mut group = AggregateWriteGroup::new(kind, session);
                group.begin().await?;
                Ok(group)
            })
            .await
    }

    async fn complete<T>(
        &self,
        group: AggregateWriteGroup<S::Session>,
        result: MarqueeResult<T>,
    ) -> MarqueeResult<WriteReceipt<T>> {
        let (value, committed) = group.conclude(result).await?;
        Ok(self.invalidate(value, committed).await)
    }

    async fn invalidate<T>(&self, value: T, committed: CommittedGroup) -> WriteReceipt<T> {
        let targets = self.graph.invalidation_targets(&committed.touched);
        let invalidation = self.invalidator.invalidate_all(&targets).await;

        if invalidation.complete {
            tracing::debug!(
                kind = %committed.kind,
                targets = targets.len(),
                deleted = invalidation.deleted,
                "Write committed and invalidated"
            );
        } else {
            tracing::warn!(
                kind = %committed.kind,
                failures = invalidation.failures.len(),
                "Write committed but invalidation was incomplete; stale entries expire by TTL"
            );
        }

        WriteReceipt {
            value,
            kind: committed.kind,
            state: WriteState::Invalidated,
            steps: committed.steps,
            touched: committed.touched,
            targets,
            invalidation,
        }
    }
}

// ============================================================================
// STEP SEQUENCES
// ============================================================================

fn id_filter(field: &str, id: EntityId) -> FieldFilter {
    filter([(field, json!(id))])
}

fn timestamp() -> MarqueeResult<Value> {
    Ok(serde_json::to_value(Utc::now())?)
}

/// A unique-index violation raised by the store is the same business error
/// as the explicit pre-check.
fn as_conflict(err: MarqueeError, entity_type: EntityType, field: &str, value: i32) -> MarqueeError {
    match err {
        MarqueeError::Storage(StorageError::DuplicateKey { .. }) => already_exists(entity_type, field, value),
        other => other,
    }
}

fn already_exists(entity_type: EntityType, field: &str, value: i32) -> MarqueeError {
    ValidationError::AlreadyExists {
        entity_type,
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

async fn create_tv_show_steps<S: StoreSession>(
    group: &mut AggregateWriteGroup<S>,
    input: NewTvShow,
) -> MarqueeResult<TvShow> {
    let now = Utc::now();
    let show = TvShow {
        tv_show_id: new_entity_id(),
        title: input.title,
        overview: input.overview,
        popularity: 0,
        seasons: Vec::new(),
        created_at: now,
        updated_at: now,
    };
    group.insert(&show).await?;
    group.touch(EntityType::TvShow, show.tv_show_id, Change::Created);
    Ok(show)
}

async fn create_season_steps<S: StoreSession>(
    group: &mut AggregateWriteGroup<S>,
    input: NewSeason,
) -> MarqueeResult<Season> {
    let show_id = input.tv_show_id;
    if group.find::<TvShow>(show_id).await?.is_none() {
        return Err(ValidationError::ParentNotFound {
            entity_type: EntityType::TvShow,
            id: show_id,
        }
        .into());
    }

    let mut clash = id_filter("tv_show_id", show_id);
    clash.insert("season_number".to_string(), json!(input.season_number));
    if !group.find_by_fields::<Season>(&clash).await?.is_empty() {
        return Err(already_exists(EntityType::Season, "season_number", input.season_number));
    }

    let now = Utc::now();
    let season = Season {
        season_id: new_entity_id(),
        tv_show_id: show_id,
        season_number: input.season_number,
        title: input.title,
        episodes: Vec::new(),
        created_at: now,
        updated_at: now,
    };
    group
        .insert(&season)
        .await
        .map_err(|e| as_conflict(e, EntityType::Season, "season_number", season.season_number))?;
    group
        .push_id(Collection::TvShows, show_id, "seasons", season.season_id)
        .await?;

    group.touch(EntityType::Season, season.season_id, Change::Created);
    group.touch(EntityType::TvShow, show_id, Change::MembershipChanged);
    Ok(season)
}

async fn create_episode_steps<S: StoreSession>(
    group: &mut AggregateWriteGroup<S>,
    input: NewEpisode,
) -> MarqueeResult<Episode> {
    let season = group
        .find::<Season>(input.season_id)
        .await?
        .ok_or(ValidationError::ParentNotFound {
            entity_type: EntityType::Season,
            id: input.season_id,
        })?;

    let mut clash = id_filter("season_id", season.season_id);
    clash.insert("episode_number".to_string(), json!(input.episode_number));
    if !group.find_by_fields::<Episode>(&clash).await?.is_empty() {
        return Err(already_exists(EntityType::Episode, "episode_number", input.episode_number));
    }

    let now = Utc::now();
    let episode = Episode {
        episode_id: new_entity_id(),
        season_id: season.season_id,
        tv_show_id: season.tv_show_id,
        episode_number: input.episode_number,
        title: input.title,
        runtime_minutes: input.runtime_minutes,
        rating_sum: 0,
        rating_count: 0,
        created_at: now,
        updated_at: now,
    };
    group
        .insert(&episode)
        .await
        .map_err(|e| as_conflict(e, EntityType::Episode, "episode_number", episode.episode_number))?;
    group
        .push_id(Collection::Seasons, season.season_id, "episodes", episode.episode_id)
        .await?;
    group
        .increment(Collection::TvShows, season.tv_show_id, "popularity", 1)
        .await?;

    group.touch(EntityType::Episode, episode.episode_id, Change::Created);
    group.touch(EntityType::Season, season.season_id, Change::MembershipChanged);
    group.touch(EntityType::TvShow, season.tv_show_id, Change::CounterChanged);
    Ok(episode)
}

async fn update_episode_steps<S: StoreSession>(
    group: &mut AggregateWriteGroup<S>,
    episode_id: EpisodeId,
    update: EpisodeUpdate,
) -> MarqueeResult<Episode> {
    let current = group.require::<Episode>(episode_id).await?;

    let mut fields = FieldFilter::new();
    if let Some(title) = update.title {
        fields.insert("title".to_string(), Value::String(title));
    }
    if let Some(runtime) = update.runtime_minutes {
        fields.insert("runtime_minutes".to_string(), json!(runtime));
    }
    fields.insert("updated_at".to_string(), timestamp()?);
    group
        .set_fields(Collection::Episodes, episode_id, fields)
        .await?;

    group.touch(EntityType::Episode, episode_id, Change::Updated);
    group.touch(EntityType::Season, current.season_id, Change::ChildChanged);
    group.require::<Episode>(episode_id).await
}

async fn rate_episode_steps<S: StoreSession>(
    group: &mut AggregateWriteGroup<S>,
    episode_id: EpisodeId,
    score: i64,
) -> MarqueeResult<Episode> {
    let current = group.require::<Episode>(episode_id).await?;
    group
        .increment(Collection::Episodes, episode_id, "rating_sum", score)
        .await?;
    group
        .increment(Collection::Episodes, episode_id, "rating_count", 1)
        .await?;

    group.touch(EntityType::Episode, episode_id, Change::CounterChanged);
    group.touch(EntityType::Season, current.season_id, Change::ChildChanged);
    group.require::<Episode>(episode_id).await
}

async fn delete_episode_steps<S: StoreSession>(
    group: &mut AggregateWriteGroup<S>,
    episode_id: EpisodeId,
) -> MarqueeResult<DeletedAggregate> {
    let episode = group.require::<Episode>(episode_id).await?;
    group.delete(Collection::Episodes, episode_id).await?;
    group
        .pull_id(Collection::Seasons, episode.season_id, "episodes", episode_id)
        .await?;

    group.touch(EntityType::Episode, episode_id, Change::Deleted);
    group.touch(EntityType::Season, episode.season_id, Change::MembershipChanged);
    Ok(DeletedAggregate {
        root_type: EntityType::Episode,
        root_id: episode_id,
        removed: vec![(EntityType::Episode, episode_id)],
    })
}

async fn delete_season_steps<S: StoreSession>(
    group: &mut AggregateWriteGroup<S>,
    graph: &EntityGraph,
    season_id: SeasonId,
) -> MarqueeResult<DeletedAggregate> {
    let season = group.require::<Season>(season_id).await?;
    let mut episodes = group
        .find_by_fields::<Episode>(&id_filter("season_id", season_id))
        .await?;
    episodes.sort_by_key(|e| e.episode_number);

    let mut members = BTreeMap::new();
    members.insert(
        EntityType::Episode,
        episodes.iter().map(|e| e.episode_id).collect(),
    );
    members.insert(EntityType::Season, vec![season_id]);

    let deleted = cascade_delete(group, graph, EntityType::Season, season_id, members).await?;

    group
        .pull_id(Collection::TvShows, season.tv_show_id, "seasons", season_id)
        .await?;
    group.touch(EntityType::TvShow, season.tv_show_id, Change::MembershipChanged);
    Ok(deleted)
}

async fn delete_tv_show_steps<S: StoreSession>(
    group: &mut AggregateWriteGroup<S>,
    graph: &EntityGraph,
    tv_show_id: TvShowId,
) -> MarqueeResult<DeletedAggregate> {
    group.require::<TvShow>(tv_show_id).await?;
    let mut seasons = group
        .find_by_fields::<Season>(&id_filter("tv_show_id", tv_show_id))
        .await?;
    seasons.sort_by_key(|s| s.season_number);
    let mut episodes = group
        .find_by_fields::<Episode>(&id_filter("tv_show_id", tv_show_id))
        .await?;
    episodes.sort_by_key(|e| (e.season_id, e.episode_number));

    let mut members = BTreeMap::new();
    members.insert(
        EntityType::Episode,
        episodes.iter().map(|e| e.episode_id).collect(),
    );
    members.insert(
        EntityType::Season,
        seasons.iter().map(|s| s.season_id).collect(),
    );
    members.insert(EntityType::TvShow, vec![tv_show_id]);

    cascade_delete(group, graph, EntityType::TvShow, tv_show_id, members).await
}

/// Delete `members` type by type in the graph's leaf-to-root order.
async fn cascade_delete<S: StoreSession>(
    group: &mut AggregateWriteGroup<S>,
    graph: &EntityGraph,
    root_type: EntityType,
    root_id: EntityId,
    mut members: BTreeMap<EntityType, Vec<EntityId>>,
) -> MarqueeResult<DeletedAggregate> {
    let mut removed = Vec::new();
    for entity_type in graph.delete_cascade_order(root_type) {
        let ids = members.remove(&entity_type).unwrap_or_default();
        if ids.is_empty() {
            continue;
        }
        let collection = Collection::for_entity(entity_type).ok_or_else(|| {
            MarqueeError::Storage(StorageError::Backend {
                reason: format!("no collection stores {entity_type}"),
            })
        })?;
        for id in ids {
            group.delete(collection, id).await?;
            group.touch(entity_type, id, Change::Deleted);
            removed.push((entity_type, id));
        }
    }
    Ok(DeletedAggregate {
        root_type,
        root_id,
        removed,
    })
}
