//! End-to-end cache consistency checks over the in-memory cache and store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use marquee_catalog::{CatalogService, EpisodeQuery};
use marquee_core::{
    CacheConfig, CacheConnectionConfig, CacheKey, CacheKeyPattern, CacheSetName, EntityType, Episode,
    EpisodeUpdate, MarqueeError, Season, StorageError, ValidationError,
};
use marquee_storage::{
    Collection, InMemoryDocumentStore, InMemoryKeyValueCache, KeyValueCache, ReadSource,
    RedisKeyValueCache, WriteState,
};
use marquee_test_utils::assertions::{assert_cached, assert_not_cached, cached_value};
use marquee_test_utils::fixtures::{self, TestStack};
use marquee_test_utils::generators;
use proptest::prelude::*;

type Catalog = CatalogService<InMemoryDocumentStore, InMemoryKeyValueCache>;

fn catalog() -> (Catalog, Arc<InMemoryKeyValueCache>, Arc<InMemoryDocumentStore>) {
    let cache = Arc::new(InMemoryKeyValueCache::new());
    let store = Arc::new(InMemoryDocumentStore::new());
    let service = CatalogService::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        CacheConfig::default(),
        fixtures::fast_retry(),
    );
    (service, cache, store)
}

struct Seeded {
    season: Season,
    episodes: Vec<Episode>,
}

async fn seed(service: &Catalog, episodes: i32) -> Seeded {
    let show = service
        .create_tv_show(fixtures::new_show("Integration"))
        .await
        .unwrap()
        .into_value();
    let season = service
        .create_season(fixtures::new_season(show.tv_show_id, 1))
        .await
        .unwrap()
        .into_value();
    let mut created = Vec::new();
    for n in 1..=episodes {
        created.push(
            service
                .create_episode(fixtures::new_episode(season.season_id, n))
                .await
                .unwrap()
                .into_value(),
        );
    }
    Seeded {
        season,
        episodes: created,
    }
}

// ============================================================================
// READ PATH
// ============================================================================

#[tokio::test]
async fn miss_fetches_once_then_serves_from_cache() {
    let stack = TestStack::new();
    let calls = AtomicU32::new(0);
    let calls = &calls;
    let key = CacheKey::from_raw("episode:p2");

    for _ in 0..3 {
        let value: u32 = stack
            .reader
            .cache_or_fetch(
                &key,
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, MarqueeError>(7)
                },
                Some(Duration::from_secs(60)),
                None,
            )
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = stack.reader.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2);
}

#[tokio::test]
async fn corrupt_entry_is_refetched_and_overwritten() {
    let stack = TestStack::new();
    let key = CacheKey::from_raw("episode:p3");
    stack.cache.insert_raw(&key, b"\xff\x00not json");

    let value: String = stack
        .reader
        .cache_or_fetch(&key, || async { Ok::<_, MarqueeError>("fresh".to_string()) }, None, None)
        .await
        .unwrap();

    assert_eq!(value, "fresh");
    let healed: String = cached_value(&stack.cache, &key);
    assert_eq!(healed, "fresh");
    assert_eq!(stack.reader.stats().corrupted, 1);
}

#[tokio::test]
async fn cache_outage_never_reaches_the_caller() {
    let (service, cache, _) = catalog();
    let seeded = seed(&service, 1).await;
    let id = seeded.episodes[0].episode_id;

    cache.set_unreachable(true);
    let read = service.episode_read(id).await.unwrap();
    assert!(matches!(read.source(), ReadSource::OriginAfterCacheFailure { .. }));
    assert_eq!(read.value().episode_id, id);

    cache.set_unreachable(false);
    assert_not_cached(&cache, &CacheKey::entity(EntityType::Episode, id));
    let read = service.episode_read(id).await.unwrap();
    assert_eq!(read.source(), &ReadSource::Origin);
}

#[tokio::test]
async fn unreachable_redis_degrades_to_the_store() {
    let redis = Arc::new(RedisKeyValueCache::new(
        CacheConnectionConfig::new("127.0.0.1", 1)
            .with_connect_timeout(Duration::from_millis(200))
            .with_response_timeout(Duration::from_millis(200)),
    ));
    let store = Arc::new(InMemoryDocumentStore::new());
    let service = CatalogService::new(
        Arc::clone(&store),
        Arc::clone(&redis),
        CacheConfig::default(),
        fixtures::fast_retry(),
    );

    let show = service
        .create_tv_show(fixtures::new_show("Offline"))
        .await
        .unwrap();
    // The write committed even though its invalidation could not reach the cache.
    assert!(!show.invalidation.complete);

    let loaded = service.tv_show(show.value.tv_show_id).await.unwrap();
    assert_eq!(loaded.title, "Offline");
    assert_eq!(service.cache_stats().degraded, 1);

    assert!(redis.close().await);
    assert!(!redis.close().await);
}

// ============================================================================
// WRITE PATH
// ============================================================================

#[tokio::test]
async fn new_episode_is_visible_in_previously_cached_season() {
    let (service, cache, _) = catalog();
    let seeded = seed(&service, 2).await;
    let season_key = CacheKey::entity(EntityType::Season, seeded.season.season_id);

    let before = service.season(seeded.season.season_id).await.unwrap();
    assert_eq!(before.episodes.len(), 2);
    assert_cached(&cache, &season_key);
    let listed = service.episodes_by_season(seeded.season.season_id).await.unwrap();
    assert_eq!(listed.len(), 2);

    let receipt = service
        .create_episode(fixtures::new_episode(seeded.season.season_id, 3))
        .await
        .unwrap();
    assert_eq!(receipt.state, WriteState::Invalidated);
    assert!(receipt
        .targets
        .contains(&CacheKeyPattern::Entity(EntityType::Season, seeded.season.season_id)));
    assert_not_cached(&cache, &season_key);

    let after = service.season(seeded.season.season_id).await.unwrap();
    assert_eq!(after.episodes.len(), 3);
    assert_eq!(
        service.episodes_by_season(seeded.season.season_id).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn duplicate_episode_number_rolls_back_everything() {
    let (service, _, store) = catalog();
    let seeded = seed(&service, 1).await;
    let show_before = service.tv_show(seeded.season.tv_show_id).await.unwrap();

    let err = service
        .create_episode(fixtures::new_episode(seeded.season.season_id, 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MarqueeError::Validation(ValidationError::AlreadyExists { .. })
    ));

    assert_eq!(store.count(Collection::Episodes).await, 1);
    let season: Season = store.get(seeded.season.season_id).await.unwrap().unwrap();
    assert_eq!(season.episodes.len(), 1);
    let show_after = store
        .get::<marquee_core::TvShow>(seeded.season.tv_show_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(show_after.popularity, show_before.popularity);
}

#[tokio::test]
async fn season_delete_is_all_or_nothing() {
    let (service, cache, store) = catalog();
    let seeded = seed(&service, 3).await;
    let season_id = seeded.season.season_id;

    // Prime every cache entry the delete must purge.
    service.season(season_id).await.unwrap();
    for episode in &seeded.episodes {
        service.episode(episode.episode_id).await.unwrap();
    }
    service.episodes_by_season(season_id).await.unwrap();
    let season_key = CacheKey::entity(EntityType::Season, season_id);
    let episode_keys: Vec<CacheKey> = seeded
        .episodes
        .iter()
        .map(|e| CacheKey::entity(EntityType::Episode, e.episode_id))
        .collect();

    store.fail_delete_of(seeded.episodes[1].episode_id);
    let err = service.delete_season(season_id).await.unwrap_err();
    assert!(matches!(
        err,
        MarqueeError::Storage(StorageError::InjectedFailure { .. })
    ));

    assert_eq!(store.count(Collection::Episodes).await, 3);
    assert_eq!(store.count(Collection::Seasons).await, 1);
    assert_cached(&cache, &season_key);
    for key in &episode_keys {
        assert_cached(&cache, key);
    }

    let receipt = service.delete_season(season_id).await.unwrap();
    assert_eq!(receipt.state, WriteState::Invalidated);
    assert_eq!(receipt.value.count(EntityType::Episode), 3);
    assert_eq!(receipt.value.count(EntityType::Season), 1);
    assert_eq!(store.count(Collection::Episodes).await, 0);
    assert_eq!(store.count(Collection::Seasons).await, 0);

    assert_not_cached(&cache, &season_key);
    for key in &episode_keys {
        assert_not_cached(&cache, key);
    }
    let remaining = cache.scan_keys_matching("episodes:*", 100).await.unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn concurrent_ratings_are_never_lost() {
    let (service, _, store) = catalog();
    let seeded = seed(&service, 1).await;
    let id = seeded.episodes[0].episode_id;
    // No rating commits until all ten have read the episode.
    store.hold_commits(10);

    let raters = (1..=10).map(|score| {
        let service = service.clone();
        tokio::spawn(async move { service.rate_episode(id, score).await })
    });
    for result in futures_util::future::join_all(raters).await {
        result.unwrap().unwrap();
    }

    let episode = service.episode(id).await.unwrap();
    assert_eq!(episode.rating_count, 10);
    assert_eq!(episode.rating_sum, 55);
    assert_eq!(episode.average_rating(), Some(5.5));
}

#[tokio::test]
async fn update_refreshes_cached_episode_and_lists() {
    let (service, cache, _) = catalog();
    let seeded = seed(&service, 2).await;
    let id = seeded.episodes[0].episode_id;
    let query = EpisodeQuery::for_show(seeded.season.tv_show_id);

    assert_eq!(service.episode(id).await.unwrap().title, "Episode 1");
    service.list_episodes(&query).await.unwrap();

    service
        .update_episode(
            id,
            EpisodeUpdate {
                title: Some("Pilot".to_string()),
                runtime_minutes: None,
            },
        )
        .await
        .unwrap();

    assert_not_cached(&cache, &CacheKey::entity(EntityType::Episode, id));
    assert_eq!(service.episode(id).await.unwrap().title, "Pilot");
    let listed = service.list_episodes(&query).await.unwrap();
    assert_eq!(listed[0].title, "Pilot");
}

#[tokio::test]
async fn writes_leave_no_dead_list_registrations() {
    let (service, cache, _) = catalog();
    let seeded = seed(&service, 2).await;
    let show_id = seeded.season.tv_show_id;
    let set = CacheSetName::for_lists(EntityType::Episode);

    for round in 0..20 {
        service
            .list_episodes(&EpisodeQuery::for_show(show_id).with_page(round, 1))
            .await
            .unwrap();
        service.episodes_by_season(seeded.season.season_id).await.unwrap();
        assert!(!cache.set_members(&set).await.unwrap().is_empty());

        service
            .rate_episode(seeded.episodes[0].episode_id, 7)
            .await
            .unwrap();
        assert!(cache.set_members(&set).await.unwrap().is_empty());
    }
    assert!(cache.scan_keys_matching("episodes:*", 100).await.unwrap().is_empty());
}

#[tokio::test]
async fn show_delete_sweeps_every_level() {
    let (service, cache, store) = catalog();
    let seeded = seed(&service, 2).await;
    let show_id = seeded.season.tv_show_id;

    service.tv_show(show_id).await.unwrap();
    service.season(seeded.season.season_id).await.unwrap();
    service.episode(seeded.episodes[0].episode_id).await.unwrap();

    let receipt = service.delete_tv_show(show_id).await.unwrap();
    let removed: Vec<EntityType> = receipt.value.removed.iter().map(|(t, _)| *t).collect();
    assert_eq!(
        removed,
        vec![EntityType::Episode, EntityType::Episode, EntityType::Season, EntityType::TvShow]
    );
    assert!(cache.is_empty());
    for collection in Collection::ALL {
        assert_eq!(store.count(collection).await, 0);
    }

    let err = service.tv_show(show_id).await.unwrap_err();
    assert!(matches!(err, MarqueeError::Storage(StorageError::NotFound { .. })));
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Equal list queries always map to the same key, under the plural prefix.
    #[test]
    fn prop_list_keys_are_stable(query in generators::arb_list_query()) {
        let a = CacheKey::list(EntityType::Episode, marquee_core::ListKind::All, &query).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&query.to_string()).unwrap();
        let b = CacheKey::list(EntityType::Episode, marquee_core::ListKind::All, &reparsed).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert!(CacheKeyPattern::AllLists(EntityType::Episode).covers(&a));
    }
}
