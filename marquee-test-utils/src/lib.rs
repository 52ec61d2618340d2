//! Marquee Test Utilities
//!
//! Shared test infrastructure for the Marquee workspace:
//! - Proptest generators for catalog payloads, ids and cache keys
//! - Fixtures that wire the in-memory cache and store into a full stack
//! - Assertions over cache contents

// Re-export the in-memory backends from their source crate
pub use marquee_storage::{
    AggregateWriteCoordinator, Backoff, CacheAside, InMemoryDocumentStore,
    InMemoryKeyValueCache, Invalidator, KeyValueCache, RetryExecutor, RetryPolicy,
};

// Re-export core types for convenience
pub use marquee_core::{
    CacheConfig, CacheKey, CacheKeyPattern, EntityGraph, EntityId, EntityType, Episode,
    EpisodeUpdate, ListKind, MarqueeError, MarqueeResult, NewEpisode, NewSeason, NewTvShow,
    RetryConfig, Season, SeasonId, Timestamp, TvShow, TvShowId, MAX_RATING, MIN_RATING,
};

use chrono::Utc;
use std::sync::Arc;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating Marquee values.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use uuid::Uuid;

    // === Identity Generators ===

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate an entity id.
    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        arb_uuid()
    }

    /// Generate a Timestamp between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    // === Enum Generators ===

    /// Generate any EntityType variant.
    pub fn arb_entity_type() -> impl Strategy<Value = EntityType> {
        prop::sample::select(EntityType::ALL.to_vec())
    }

    /// Generate one of the TV aggregate types.
    pub fn arb_tv_entity_type() -> impl Strategy<Value = EntityType> {
        prop_oneof![
            Just(EntityType::TvShow),
            Just(EntityType::Season),
            Just(EntityType::Episode),
        ]
    }

    pub fn arb_list_kind() -> impl Strategy<Value = ListKind> {
        prop_oneof![Just(ListKind::All), Just(ListKind::ByParent), Just(ListKind::Search)]
    }

    // === Payload Generators ===

    /// Generate a non-blank title.
    pub fn arb_title() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{2,12}( [A-Z][a-z]{2,10}){0,3}"
    }

    pub fn arb_new_tv_show() -> impl Strategy<Value = NewTvShow> {
        (arb_title(), prop::option::of("[a-z ]{10,80}"))
            .prop_map(|(title, overview)| NewTvShow { title, overview })
    }

    pub fn arb_new_season(tv_show_id: TvShowId) -> impl Strategy<Value = NewSeason> {
        (1i32..30, arb_title()).prop_map(move |(season_number, title)| NewSeason {
            tv_show_id,
            season_number,
            title,
        })
    }

    pub fn arb_new_episode(season_id: SeasonId) -> impl Strategy<Value = NewEpisode> {
        (1i32..40, arb_title(), prop::option::of(1i32..180)).prop_map(
            move |(episode_number, title, runtime_minutes)| NewEpisode {
                season_id,
                episode_number,
                title,
                runtime_minutes,
            },
        )
    }

    /// Generate a non-empty, valid episode update.
    pub fn arb_episode_update() -> impl Strategy<Value = EpisodeUpdate> {
        (prop::option::of(arb_title()), prop::option::of(1i32..180))
            .prop_filter("update must change something", |(title, runtime)| {
                title.is_some() || runtime.is_some()
            })
            .prop_map(|(title, runtime_minutes)| EpisodeUpdate {
                title,
                runtime_minutes,
            })
    }

    /// Generate an in-range rating score.
    pub fn arb_rating() -> impl Strategy<Value = i64> {
        MIN_RATING..=MAX_RATING
    }

    /// Generate an out-of-range rating score.
    pub fn arb_invalid_rating() -> impl Strategy<Value = i64> {
        prop_oneof![i64::MIN..MIN_RATING, (MAX_RATING + 1)..i64::MAX]
    }

    // === Cache Key Generators ===

    /// Generate a list query object with optional paging and sorting.
    pub fn arb_list_query() -> impl Strategy<Value = Value> {
        (
            0u32..50,
            prop::option::of(1u32..100),
            prop::option::of(prop_oneof![Just("title"), Just("episode_number")]),
        )
            .prop_map(|(page, limit, sort)| {
                let mut query = json!({ "page": page });
                if let Some(limit) = limit {
                    query["limit"] = json!(limit);
                }
                if let Some(sort) = sort {
                    query["sort"] = json!(sort);
                }
                query
            })
    }

    /// Generate a single-entity cache key.
    pub fn arb_entity_key() -> impl Strategy<Value = CacheKey> {
        (arb_entity_type(), arb_entity_id()).prop_map(|(t, id)| CacheKey::entity(t, id))
    }

    /// Generate a typed invalidation pattern.
    pub fn arb_key_pattern() -> impl Strategy<Value = CacheKeyPattern> {
        (arb_entity_type(), arb_entity_id(), 0u8..4).prop_map(|(t, id, which)| match which {
            0 => CacheKeyPattern::Entity(t, id),
            1 => CacheKeyPattern::AllEntities(t),
            2 => CacheKeyPattern::AllLists(t),
            _ => CacheKeyPattern::Subresources(t, id),
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built payloads and a fully wired in-memory stack.

    use super::*;

    pub type TestCoordinator = AggregateWriteCoordinator<InMemoryDocumentStore, InMemoryKeyValueCache>;

    /// Retry policy with the default attempt count and no backoff delay.
    pub fn fast_retry() -> RetryExecutor {
        RetryExecutor::new(RetryPolicy::default().with_backoff(Backoff::None))
    }

    pub fn new_show(title: &str) -> NewTvShow {
        NewTvShow {
            title: title.to_string(),
            overview: Some(format!("{title} overview")),
        }
    }

    pub fn new_season(tv_show_id: TvShowId, season_number: i32) -> NewSeason {
        NewSeason {
            tv_show_id,
            season_number,
            title: format!("Season {season_number}"),
        }
    }

    pub fn new_episode(season_id: SeasonId, episode_number: i32) -> NewEpisode {
        NewEpisode {
            season_id,
            episode_number,
            title: format!("Episode {episode_number}"),
            runtime_minutes: Some(42),
        }
    }

    /// A standalone episode document, not persisted anywhere.
    pub fn episode_document(season_id: SeasonId, tv_show_id: TvShowId, episode_number: i32) -> Episode {
        let now = Utc::now();
        Episode {
            episode_id: marquee_core::new_entity_id(),
            season_id,
            tv_show_id,
            episode_number,
            title: format!("Episode {episode_number}"),
            runtime_minutes: Some(42),
            rating_sum: 0,
            rating_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// In-memory cache, store, reader and coordinator sharing one cache.
    pub struct TestStack {
        pub cache: Arc<InMemoryKeyValueCache>,
        pub store: Arc<InMemoryDocumentStore>,
        pub reader: CacheAside<InMemoryKeyValueCache>,
        pub invalidator: Invalidator<InMemoryKeyValueCache>,
        pub coordinator: TestCoordinator,
    }

    impl TestStack {
        pub fn new() -> Self {
            Self::with_config(CacheConfig::default())
        }

        pub fn with_config(config: CacheConfig) -> Self {
            let cache = Arc::new(InMemoryKeyValueCache::new());
            let store = Arc::new(InMemoryDocumentStore::new());
            let reader = CacheAside::new(Arc::clone(&cache), fast_retry(), config.clone());
            let invalidator = Invalidator::new(Arc::clone(&cache), &config);
            let coordinator = AggregateWriteCoordinator::new(
                Arc::clone(&store),
                invalidator.clone(),
                EntityGraph::catalog(),
                fast_retry(),
            );
            Self {
                cache,
                store,
                reader,
                invalidator,
                coordinator,
            }
        }

        /// Create a show, one season and `episodes` episodes numbered from 1.
        pub async fn seed_season(&self, episodes: i32) -> MarqueeResult<SeededSeason> {
            let show = self
                .coordinator
                .create_tv_show(new_show("Seeded Show"))
                .await?
                .into_value();
            let season = self
                .coordinator
                .create_season(new_season(show.tv_show_id, 1))
                .await?
                .into_value();
            let mut created = Vec::new();
            for n in 1..=episodes {
                created.push(
                    self.coordinator
                        .create_episode(new_episode(season.season_id, n))
                        .await?
                        .into_value(),
                );
            }
            Ok(SeededSeason {
                show,
                season,
                episodes: created,
            })
        }
    }

    impl Default for TestStack {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Documents created by [`TestStack::seed_season`], as returned by the writes.
    #[derive(Debug, Clone)]
    pub struct SeededSeason {
        pub show: TvShow,
        pub season: Season,
        pub episodes: Vec<Episode>,
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over cache contents.

    use super::*;
    use serde::de::DeserializeOwned;

    #[track_caller]
    pub fn assert_cached(cache: &InMemoryKeyValueCache, key: &CacheKey) {
        assert!(cache.contains(key), "expected {key} to be cached");
    }

    #[track_caller]
    pub fn assert_not_cached(cache: &InMemoryKeyValueCache, key: &CacheKey) {
        assert!(!cache.contains(key), "expected {key} to be absent from the cache");
    }

    /// Decode the cached value at `key`, panicking if absent or corrupt.
    #[track_caller]
    pub fn cached_value<T: DeserializeOwned>(cache: &InMemoryKeyValueCache, key: &CacheKey) -> T {
        let bytes = match cache.peek(key) {
            Some(bytes) => bytes,
            None => panic!("expected {key} to be cached"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => panic!("cached value at {key} is not valid JSON: {e}"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
