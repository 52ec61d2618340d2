//! Enum types shared across the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Entity type discriminator for cache keys and the entity graph.
///
/// Every cache key in the catalog starts with either [`EntityType::singular`]
/// (single-entity keys) or [`EntityType::plural`] (list and query keys).
/// Services that build keys by hand instead of through these prefixes will
/// be missed by pattern invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Movie,
    TvShow,
    Season,
    Episode,
    Person,
    Review,
    Watchlist,
}

impl EntityType {
    /// All entity types, in declaration order.
    pub const ALL: [EntityType; 7] = [
        EntityType::Movie,
        EntityType::TvShow,
        EntityType::Season,
        EntityType::Episode,
        EntityType::Person,
        EntityType::Review,
        EntityType::Watchlist,
    ];

    /// Prefix used for single-entity keys (`episode:<id>`).
    pub fn singular(self) -> &'static str {
        match self {
            EntityType::Movie => "movie",
            EntityType::TvShow => "tvshow",
            EntityType::Season => "season",
            EntityType::Episode => "episode",
            EntityType::Person => "person",
            EntityType::Review => "review",
            EntityType::Watchlist => "watchlist",
        }
    }

    /// Prefix used for list and query keys (`episodes:all:<query>`).
    pub fn plural(self) -> &'static str {
        match self {
            EntityType::Movie => "movies",
            EntityType::TvShow => "tvshows",
            EntityType::Season => "seasons",
            EntityType::Episode => "episodes",
            EntityType::Person => "people",
            EntityType::Review => "reviews",
            EntityType::Watchlist => "watchlists",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.singular())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.singular() == value || t.plural() == value)
            .ok_or_else(|| format!("Unknown entity type: {value}"))
    }
}

/// Kind of list/query result cached under a plural prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListKind {
    /// Filtered or paged listing over the whole collection.
    All,
    /// Children of a single parent (`episodes:by-season:<query>`).
    ByParent,
    /// Search results.
    Search,
}

impl ListKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ListKind::All => "all",
            ListKind::ByParent => "by-parent",
            ListKind::Search => "search",
        }
    }
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for t in EntityType::ALL {
            assert!(seen.insert(t.singular()), "duplicate prefix {}", t.singular());
            assert!(seen.insert(t.plural()), "duplicate prefix {}", t.plural());
        }
    }

    #[test]
    fn test_entity_type_from_str_accepts_both_forms() {
        assert_eq!("episode".parse::<EntityType>().unwrap(), EntityType::Episode);
        assert_eq!("episodes".parse::<EntityType>().unwrap(), EntityType::Episode);
        assert_eq!("people".parse::<EntityType>().unwrap(), EntityType::Person);
        assert!("podcast".parse::<EntityType>().is_err());
    }
}
