//! Marquee Core - Entity Types
//!
//! Pure data structures shared by the cache layer and the catalog services:
//! catalog documents, typed cache keys, the entity dependency graph,
//! configuration and the error taxonomy. No I/O lives here.

pub mod config;
pub mod entities;
pub mod enums;
pub mod error;
pub mod graph;
pub mod identity;
pub mod keys;

pub use config::{CacheConfig, CacheConnectionConfig, RetryConfig};
pub use entities::{
    validate_rating, Episode, EpisodeUpdate, NewEpisode, NewSeason, NewTvShow, Season,
    SeasonWithEpisodes, TvShow, MAX_RATING, MIN_RATING,
};
pub use enums::{EntityType, ListKind};
pub use error::{ConfigError, MarqueeError, MarqueeResult, StorageError, ValidationError};
pub use graph::{Change, EntityGraph, GraphEdge, Touched};
pub use identity::{
    new_entity_id, EntityId, EpisodeId, SeasonId, Timestamp, TvShowId,
};
pub use keys::{CacheKey, CacheKeyPattern, CacheSetName};
