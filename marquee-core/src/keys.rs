//! Deterministic cache keys and typed invalidation patterns.
//!
//! Key naming convention shared by every catalog service:
//!
//! - `<entityType>:<id>` for single entities (`episode:<id>`)
//! - `<entityTypePlural>:<listKind>:<serializedQuery>` for list/query results
//!   (`episodes:all:{"page":1}`)
//! - `<entityType>:<id>:<subresource>` for nested views (`movie:<id>:cast`)
//!
//! Keys are only constructed through [`CacheKey`], and invalidation patterns
//! only through [`CacheKeyPattern`], so a pattern such as `episodes:*` always
//! covers every key a list read could have produced.

use crate::{EntityId, EntityType, ListKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fully-rendered cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a single entity: `episode:<id>`.
    pub fn entity(entity_type: EntityType, id: EntityId) -> Self {
        Self(format!("{}:{}", entity_type.singular(), id))
    }

    /// Key for a list/query result: `episodes:all:<canonical json>`.
    ///
    /// The query is rendered as canonical JSON (object keys sorted), so two
    /// logically identical queries always produce the same key regardless of
    /// field order in the caller's struct or map.
    pub fn list<Q: Serialize + ?Sized>(
        entity_type: EntityType,
        kind: ListKind,
        query: &Q,
    ) -> Result<Self, serde_json::Error> {
        let canonical = canonical_json(query)?;
        Ok(Self(format!(
            "{}:{}:{}",
            entity_type.plural(),
            kind.as_str(),
            canonical
        )))
    }

    /// Key for a nested view of an entity: `movie:<id>:cast`.
    pub fn subresource(entity_type: EntityType, id: EntityId, subresource: &str) -> Self {
        Self(format!("{}:{}:{}", entity_type.singular(), id, subresource))
    }

    /// Wrap an already-rendered key, e.g. one returned by a SCAN.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Render a value as JSON with object keys in sorted order.
fn canonical_json<Q: Serialize + ?Sized>(query: &Q) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(query)?;
    let mut out = String::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

// Sorts explicitly instead of relying on the map type, which flips to
// insertion order if any crate in the graph enables `preserve_order`.
fn write_canonical(value: &serde_json::Value, out: &mut String) -> Result<(), serde_json::Error> {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k)?);
                out.push(':');
                write_canonical(v, out)?;
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out)?;
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other)?),
    }
    Ok(())
}

/// Name of a secondary set grouping keys that are purged together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheSetName(String);

impl CacheSetName {
    /// The query-result set for an entity family: `set:episodes`.
    pub fn for_lists(entity_type: EntityType) -> Self {
        Self(format!("set:{}", entity_type.plural()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheSetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed invalidation target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheKeyPattern {
    /// Exactly one entity key: `season:<id>`.
    Entity(EntityType, EntityId),
    /// Every single-entity key of a type: `episode:*`.
    AllEntities(EntityType),
    /// Every list/query key of a type: `episodes:*`.
    AllLists(EntityType),
    /// Every nested view of one entity: `movie:<id>:*`.
    Subresources(EntityType, EntityId),
}

impl CacheKeyPattern {
    /// The exact key, when this pattern names a single key.
    pub fn exact_key(&self) -> Option<CacheKey> {
        match self {
            CacheKeyPattern::Entity(t, id) => Some(CacheKey::entity(*t, *id)),
            _ => None,
        }
    }

    /// Redis-style glob for SCAN MATCH.
    pub fn to_glob(&self) -> String {
        match self {
            CacheKeyPattern::Entity(t, id) => CacheKey::entity(*t, *id).into_string(),
            CacheKeyPattern::AllEntities(t) => format!("{}:*", t.singular()),
            CacheKeyPattern::AllLists(t) => format!("{}:*", t.plural()),
            CacheKeyPattern::Subresources(t, id) => format!("{}:{}:*", t.singular(), id),
        }
    }

    /// The entity type this pattern belongs to.
    pub fn entity_type(&self) -> EntityType {
        match self {
            CacheKeyPattern::Entity(t, _)
            | CacheKeyPattern::AllEntities(t)
            | CacheKeyPattern::AllLists(t)
            | CacheKeyPattern::Subresources(t, _) => *t,
        }
    }

    /// Whether `key` would be removed by invalidating this pattern.
    pub fn covers(&self, key: &CacheKey) -> bool {
        let key = key.as_str();
        match self {
            CacheKeyPattern::Entity(t, id) => key == CacheKey::entity(*t, *id).as_str(),
            CacheKeyPattern::AllEntities(t) => has_segment_prefix(key, t.singular()),
            CacheKeyPattern::AllLists(t) => has_segment_prefix(key, t.plural()),
            CacheKeyPattern::Subresources(t, id) => {
                has_segment_prefix(key, &format!("{}:{}", t.singular(), id))
            }
        }
    }
}

fn has_segment_prefix(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with(':'))
}

impl fmt::Display for CacheKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_glob())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn test_entity_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            CacheKey::entity(EntityType::Episode, id).as_str(),
            "episode:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            CacheKey::subresource(EntityType::Movie, id, "cast").as_str(),
            "movie:00000000-0000-0000-0000-000000000000:cast"
        );
    }

    #[test]
    fn test_list_key_is_order_independent() {
        let a = CacheKey::list(
            EntityType::Episode,
            ListKind::All,
            &json!({"page": 1, "season": "s1", "sort": {"by": "number", "dir": "asc"}}),
        )
        .unwrap();

        let mut map = HashMap::new();
        map.insert("sort", json!({"dir": "asc", "by": "number"}));
        map.insert("season", json!("s1"));
        map.insert("page", json!(1));
        let b = CacheKey::list(EntityType::Episode, ListKind::All, &map).unwrap();

        assert_eq!(a, b);
        assert!(a.as_str().starts_with("episodes:all:"));
    }

    #[test]
    fn test_pattern_globs() {
        let id = Uuid::nil();
        assert_eq!(CacheKeyPattern::AllEntities(EntityType::Episode).to_glob(), "episode:*");
        assert_eq!(CacheKeyPattern::AllLists(EntityType::Episode).to_glob(), "episodes:*");
        assert_eq!(
            CacheKeyPattern::Subresources(EntityType::Movie, id).to_glob(),
            format!("movie:{}:*", id)
        );
        assert_eq!(
            CacheKeyPattern::Entity(EntityType::Season, id).exact_key(),
            Some(CacheKey::entity(EntityType::Season, id))
        );
        assert_eq!(CacheKeyPattern::AllLists(EntityType::Season).exact_key(), None);
    }

    #[test]
    fn test_singular_pattern_does_not_cover_plural_keys() {
        let list = CacheKey::list(EntityType::Episode, ListKind::All, &json!({})).unwrap();
        let single = CacheKey::entity(EntityType::Episode, Uuid::now_v7());

        assert!(!CacheKeyPattern::AllEntities(EntityType::Episode).covers(&list));
        assert!(CacheKeyPattern::AllEntities(EntityType::Episode).covers(&single));
        assert!(CacheKeyPattern::AllLists(EntityType::Episode).covers(&list));
        assert!(!CacheKeyPattern::AllLists(EntityType::Episode).covers(&single));
    }

    #[test]
    fn test_set_name() {
        assert_eq!(CacheSetName::for_lists(EntityType::Episode).as_str(), "set:episodes");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn arb_entity_type() -> impl Strategy<Value = EntityType> {
            prop::sample::select(EntityType::ALL.to_vec())
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            /// The same query fields in any insertion order render one key.
            #[test]
            fn prop_list_key_ignores_field_order(
                fields in prop::collection::btree_map("[a-z_]{1,8}", any::<i64>(), 0..8),
                entity_type in arb_entity_type(),
            ) {
                let forward: serde_json::Map<String, serde_json::Value> = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect();
                let reversed: Vec<(String, serde_json::Value)> = fields
                    .iter()
                    .rev()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect();

                let a = CacheKey::list(entity_type, ListKind::All, &forward).unwrap();
                let b = CacheKey::list(entity_type, ListKind::All, &reversed.into_iter().collect::<HashMap<_, _>>()).unwrap();
                prop_assert_eq!(&a, &b);
                prop_assert!(CacheKeyPattern::AllLists(entity_type).covers(&a));
                prop_assert!(!CacheKeyPattern::AllEntities(entity_type).covers(&a));
            }

            /// Entity patterns never reach another type's keys.
            #[test]
            fn prop_entity_patterns_stay_in_their_type(
                own in arb_entity_type(),
                other in arb_entity_type(),
                bytes in any::<[u8; 16]>(),
            ) {
                let id = Uuid::from_bytes(bytes);
                let key = CacheKey::entity(own, id);
                prop_assert!(CacheKeyPattern::Entity(own, id).covers(&key));
                prop_assert!(CacheKeyPattern::AllEntities(own).covers(&key));
                prop_assert_eq!(CacheKeyPattern::AllEntities(other).covers(&key), own == other);
                prop_assert!(!CacheKeyPattern::AllLists(other).covers(&key));
            }
        }
    }
}
