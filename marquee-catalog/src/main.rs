//! Marquee catalog entry point.
//!
//! Reads configuration, builds the cache client and the document store once,
//! ensures the schema, then serves until interrupted. The cache client is
//! closed exactly once on the way out.

use std::sync::Arc;

use marquee_catalog::{
    init_tracing, CacheBackend, CatalogConfig, CatalogError, CatalogResult, CatalogService,
    PgDocumentStore, TelemetryConfig,
};
use marquee_core::ConfigError;
use marquee_storage::{
    ConnectionStatus, InMemoryKeyValueCache, KeyValueCache, RedisKeyValueCache, RetryExecutor,
    RetryPolicy,
};

#[tokio::main]
async fn main() -> CatalogResult<()> {
    init_tracing(&TelemetryConfig::from_env())?;

    let config = CatalogConfig::from_env()?;
    let cache = build_cache(&config).await?;

    let store = Arc::new(PgDocumentStore::from_config(&config.db)?);
    store.ensure_schema().await?;

    let retry = RetryExecutor::new(RetryPolicy::from_config(&config.retry));
    let service = CatalogService::new(store, Arc::clone(&cache), config.cache.clone(), retry);

    tracing::info!(
        cache_backend = ?config.cache_backend,
        db_host = %config.db.host,
        db_name = %config.db.dbname,
        "Marquee catalog ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    let stats = service.cache_stats();
    tracing::info!(
        hits = stats.hits,
        misses = stats.misses,
        degraded = stats.degraded,
        hit_rate = stats.hit_rate(),
        "Cache statistics"
    );

    if cache.close().await {
        tracing::info!("Cache client closed");
    }
    Ok(())
}

async fn build_cache(config: &CatalogConfig) -> CatalogResult<Arc<dyn KeyValueCache>> {
    match config.cache_backend {
        CacheBackend::Memory => {
            tracing::info!("Using in-process cache");
            Ok(Arc::new(InMemoryKeyValueCache::new()))
        }
        CacheBackend::Redis => {
            let connection = config.cache_connection.clone().ok_or_else(|| {
                CatalogError::Marquee(
                    ConfigError::MissingRequired {
                        field: "MARQUEE_CACHE_HOST".to_string(),
                    }
                    .into(),
                )
            })?;
            let url = connection.url();
            let redis = RedisKeyValueCache::new(connection);
            match redis.connect().await {
                ConnectionStatus::Connected => tracing::info!(%url, "Cache connected"),
                // Reads fall back to the store for the life of the process.
                status => tracing::warn!(%url, ?status, "Cache unavailable, serving from the store"),
            }
            Ok(Arc::new(redis))
        }
    }
}
