//! Entity dependency graph used to derive cascade order and cache invalidation.
//!
//! The graph is static data. Writes describe what they touched as a list of
//! [`Touched`] entries; [`EntityGraph::invalidation_targets`] turns that into
//! the ordered set of [`CacheKeyPattern`]s to purge after commit.

use crate::{CacheKeyPattern, EntityId, EntityType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A parent → child relationship between entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub parent: EntityType,
    pub child: EntityType,
    /// Deleting the parent deletes every child in the same transaction.
    pub cascade_on_delete: bool,
    /// Cached single-child views embed the parent document, so any change to
    /// the parent makes every cached child view stale.
    pub child_embeds_parent: bool,
}

/// How a write changed an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Change {
    Created,
    Updated,
    Deleted,
    /// A child id was appended to or removed from one of its id lists.
    MembershipChanged,
    /// A store-side counter was incremented.
    CounterChanged,
    /// A child embedded in this entity's cached view changed.
    ChildChanged,
}

/// One entity touched by a write group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Touched {
    pub entity_type: EntityType,
    pub id: EntityId,
    pub change: Change,
}

impl Touched {
    pub fn new(entity_type: EntityType, id: EntityId, change: Change) -> Self {
        Self {
            entity_type,
            id,
            change,
        }
    }
}

/// The read-only dependency map between entity types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityGraph {
    edges: Vec<GraphEdge>,
}

impl Default for EntityGraph {
    fn default() -> Self {
        Self::catalog()
    }
}

impl EntityGraph {
    /// Build a graph from explicit edges.
    pub fn new(edges: Vec<GraphEdge>) -> Self {
        Self { edges }
    }

    /// The catalog graph: TvShow owns Season owns Episode. Reviews reference
    /// movies and episodes but are not owned by them.
    pub fn catalog() -> Self {
        Self::new(vec![
            GraphEdge {
                parent: EntityType::TvShow,
                child: EntityType::Season,
                cascade_on_delete: true,
                child_embeds_parent: false,
            },
            GraphEdge {
                parent: EntityType::Season,
                child: EntityType::Episode,
                cascade_on_delete: true,
                child_embeds_parent: true,
            },
            GraphEdge {
                parent: EntityType::Movie,
                child: EntityType::Review,
                cascade_on_delete: false,
                child_embeds_parent: false,
            },
            GraphEdge {
                parent: EntityType::Episode,
                child: EntityType::Review,
                cascade_on_delete: false,
                child_embeds_parent: false,
            },
        ])
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Edges where `parent` is the parent.
    pub fn children(&self, parent: EntityType) -> impl Iterator<Item = &GraphEdge> {
        self.edges.iter().filter(move |e| e.parent == parent)
    }

    /// Edges where `child` is the child.
    pub fn parents(&self, child: EntityType) -> impl Iterator<Item = &GraphEdge> {
        self.edges.iter().filter(move |e| e.child == child)
    }

    /// Longest ownership path from a root to `entity_type` (roots are 0).
    pub fn depth(&self, entity_type: EntityType) -> usize {
        self.depth_guarded(entity_type, 0)
    }

    fn depth_guarded(&self, entity_type: EntityType, guard: usize) -> usize {
        if guard > self.edges.len() {
            return guard;
        }
        self.parents(entity_type)
            .filter(|e| e.cascade_on_delete)
            .map(|e| self.depth_guarded(e.parent, guard + 1) + 1)
            .max()
            .unwrap_or(0)
    }

    /// Types removed when `root` is deleted, leaf-to-root.
    ///
    /// For the catalog, deleting a TvShow yields `[Episode, Season, TvShow]`.
    pub fn delete_cascade_order(&self, root: EntityType) -> Vec<EntityType> {
        let mut order = Vec::new();
        self.collect_cascade(root, &mut order);
        order
    }

    fn collect_cascade(&self, entity_type: EntityType, order: &mut Vec<EntityType>) {
        if order.contains(&entity_type) {
            return;
        }
        for edge in self.children(entity_type).filter(|e| e.cascade_on_delete) {
            self.collect_cascade(edge.child, order);
        }
        order.push(entity_type);
    }

    /// Cache patterns to purge after a write that touched `touched` commits.
    ///
    /// Targets are deduplicated and ordered leaf-to-root (deepest entity
    /// type first) so child caches go before their parents'. Exact keys are
    /// kept even when a type-wide pattern also covers them: the pattern sweep
    /// is a SCAN and can fail midway, the exact DEL cannot partially apply.
    pub fn invalidation_targets(&self, touched: &[Touched]) -> Vec<CacheKeyPattern> {
        let mut targets = BTreeSet::new();

        for t in touched {
            targets.insert(CacheKeyPattern::Entity(t.entity_type, t.id));
            targets.insert(CacheKeyPattern::AllLists(t.entity_type));

            if matches!(t.change, Change::Updated | Change::Deleted) {
                targets.insert(CacheKeyPattern::Subresources(t.entity_type, t.id));
            }

            if matches!(
                t.change,
                Change::Updated | Change::Deleted | Change::MembershipChanged
            ) {
                for edge in self.children(t.entity_type).filter(|e| e.child_embeds_parent) {
                    targets.insert(CacheKeyPattern::AllEntities(edge.child));
                }
            }
        }

        let mut ordered: Vec<CacheKeyPattern> = targets.into_iter().collect();

        // Stable sort keeps BTreeSet order within a depth.
        ordered.sort_by_key(|p| std::cmp::Reverse(self.depth(p.entity_type())));
        ordered
    }
}
