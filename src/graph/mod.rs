//! In-memory traversal index over the latest entity versions.
//!
//! The index is a cache: the store stays the source of truth. It is rebuilt
//! on startup and updated inside the same critical section as each store
//! commit (see `services::GraphService`), so traversal answers never
//! diverge from persisted state.
//!
//! Reads take a shared lock; updates take an exclusive lock. Critical
//! sections hold no I/O.

use crate::models::{
    Entity, EntityId, EntityRelationship, RelationshipId, RelationshipType,
};
use crate::storage::{EntityFilter, GraphStore};
use crate::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Which edges `neighbors` follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Edges whose source is the queried entity.
    Outgoing,
    /// Edges whose target is the queried entity.
    Incoming,
    /// Both.
    Both,
}

/// The entities within a radius of a center, plus the edges among them.
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    /// Entities reachable within the radius (center included).
    pub entities: Vec<Entity>,
    /// Edges whose endpoints are both in `entities`.
    pub relationships: Vec<EntityRelationship>,
}

#[derive(Debug, Default)]
struct IndexInner {
    /// Latest live (non-tombstoned) version per id.
    entities: HashMap<EntityId, Entity>,
    edges: HashMap<RelationshipId, EntityRelationship>,
    /// Adjacency in insertion order; the order is the BFS tiebreak.
    outgoing: HashMap<EntityId, Vec<RelationshipId>>,
    incoming: HashMap<EntityId, Vec<RelationshipId>>,
}

impl IndexInner {
    fn insert_edge(&mut self, rel: EntityRelationship) {
        let id = rel.id.clone();
        if self.edges.contains_key(&id) {
            // Re-insertion keeps the original adjacency position.
            self.edges.insert(id, rel);
            return;
        }
        self.outgoing
            .entry(rel.from_entity_id.clone())
            .or_default()
            .push(id.clone());
        self.incoming
            .entry(rel.to_entity_id.clone())
            .or_default()
            .push(id.clone());
        self.edges.insert(id, rel);
    }

    fn remove_edge(&mut self, id: &RelationshipId) {
        if let Some(rel) = self.edges.remove(id) {
            if let Some(out) = self.outgoing.get_mut(&rel.from_entity_id) {
                out.retain(|e| e != id);
            }
            if let Some(inc) = self.incoming.get_mut(&rel.to_entity_id) {
                inc.retain(|e| e != id);
            }
        }
    }

    /// Outgoing neighbor ids of `id` in insertion order, skipping edges
    /// whose target is not a live entity.
    fn successors<'a>(
        &'a self,
        id: &EntityId,
        rel_type: Option<RelationshipType>,
    ) -> impl Iterator<Item = &'a EntityId> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|rid| self.edges.get(rid))
            .filter(move |rel| rel_type.is_none_or(|t| rel.relationship_type == t))
            .map(|rel| &rel.to_entity_id)
            .filter(|to| self.entities.contains_key(*to))
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("graph index lock was poisoned, recovering");
            poisoned.into_inner()
        },
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("graph index lock was poisoned, recovering");
            poisoned.into_inner()
        },
    }
}

/// Shared in-memory adjacency index.
#[derive(Debug, Default)]
pub struct GraphIndex {
    inner: RwLock<IndexInner>,
}

impl GraphIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the index from the store: latest live entities plus every
    /// relationship between them.
    pub fn rebuild(&self, store: &dyn GraphStore) -> Result<()> {
        let entities = store.list_entities(&EntityFilter::new())?;
        let relationships = store.list_relationships()?;

        let mut inner = write_lock(&self.inner);
        *inner = IndexInner::default();
        for entity in entities {
            inner.entities.insert(entity.id.clone(), entity);
        }
        for rel in relationships {
            inner.insert_edge(rel);
        }
        tracing::debug!(
            entities = inner.entities.len(),
            edges = inner.edges.len(),
            "graph index rebuilt"
        );
        Ok(())
    }

    /// Applies a committed entity version: replaces the cached latest, or
    /// evicts the id when the version is a tombstone.
    pub fn apply_entity(&self, entity: &Entity) {
        let mut inner = write_lock(&self.inner);
        if entity.is_tombstone() {
            inner.entities.remove(&entity.id);
            return;
        }
        let newer = inner
            .entities
            .get(&entity.id)
            .is_none_or(|cached| entity.version >= cached.version);
        if newer {
            inner.entities.insert(entity.id.clone(), entity.clone());
        }
    }

    /// Applies a committed relationship.
    pub fn apply_relationship(&self, relationship: &EntityRelationship) {
        let mut inner = write_lock(&self.inner);
        inner.insert_edge(relationship.clone());
    }

    /// Removes a deleted relationship.
    pub fn remove_relationship(&self, id: &RelationshipId) {
        let mut inner = write_lock(&self.inner);
        inner.remove_edge(id);
    }

    /// Returns the cached latest version of `id`, if live.
    #[must_use]
    pub fn entity(&self, id: &EntityId) -> Option<Entity> {
        read_lock(&self.inner).entities.get(id).cloned()
    }

    /// Returns true if `id` is a live entity.
    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        read_lock(&self.inner).entities.contains_key(id)
    }

    /// Number of live entities in the index.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        read_lock(&self.inner).entities.len()
    }

    /// Unweighted shortest path from `from` to `to` along outgoing edges,
    /// as an ordered id list. `from == to` yields `[from]`. No path (or an
    /// unknown endpoint) yields `[]`. Ties break by edge insertion order.
    #[must_use]
    pub fn path(&self, from: &EntityId, to: &EntityId, max_depth: usize) -> Vec<EntityId> {
        let inner = read_lock(&self.inner);
        if !inner.entities.contains_key(from) || !inner.entities.contains_key(to) {
            return Vec::new();
        }
        if from == to {
            return vec![from.clone()];
        }

        let mut predecessor: HashMap<EntityId, EntityId> = HashMap::new();
        let mut visited: HashSet<EntityId> = HashSet::from([from.clone()]);
        let mut queue: VecDeque<(EntityId, usize)> = VecDeque::from([(from.clone(), 0)]);

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for next in inner.successors(&current, None) {
                if !visited.insert(next.clone()) {
                    continue;
                }
                predecessor.insert(next.clone(), current.clone());
                if next == to {
                    let mut path = vec![to.clone()];
                    let mut cursor = to;
                    while let Some(prev) = predecessor.get(cursor) {
                        path.push(prev.clone());
                        cursor = prev;
                    }
                    path.reverse();
                    return path;
                }
                queue.push_back((next.clone(), depth + 1));
            }
        }
        Vec::new()
    }

    /// Entities adjacent to `id`, optionally restricted by direction and
    /// edge type.
    #[must_use]
    pub fn neighbors(
        &self,
        id: &EntityId,
        direction: Direction,
        rel_type: Option<RelationshipType>,
    ) -> Vec<Entity> {
        let inner = read_lock(&self.inner);
        let mut seen: HashSet<&EntityId> = HashSet::new();
        let mut out: Vec<Entity> = Vec::new();

        let push = |eid: &EntityId, inner: &IndexInner, out: &mut Vec<Entity>| {
            if let Some(entity) = inner.entities.get(eid) {
                out.push(entity.clone());
            }
        };

        if matches!(direction, Direction::Outgoing | Direction::Both) {
            for rid in inner.outgoing.get(id).into_iter().flatten() {
                if let Some(rel) = inner.edges.get(rid) {
                    if rel_type.is_none_or(|t| rel.relationship_type == t)
                        && seen.insert(&rel.to_entity_id)
                    {
                        push(&rel.to_entity_id, &inner, &mut out);
                    }
                }
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            for rid in inner.incoming.get(id).into_iter().flatten() {
                if let Some(rel) = inner.edges.get(rid) {
                    if rel_type.is_none_or(|t| rel.relationship_type == t)
                        && seen.insert(&rel.from_entity_id)
                    {
                        push(&rel.from_entity_id, &inner, &mut out);
                    }
                }
            }
        }
        out
    }

    /// Entities reachable within `radius` hops of `id` (following edges in
    /// both directions), plus the edges among them.
    #[must_use]
    pub fn subgraph(&self, id: &EntityId, radius: usize) -> Subgraph {
        let inner = read_lock(&self.inner);
        if !inner.entities.contains_key(id) {
            return Subgraph::default();
        }

        let mut included: HashSet<EntityId> = HashSet::from([id.clone()]);
        let mut order: Vec<EntityId> = vec![id.clone()];
        let mut queue: VecDeque<(EntityId, usize)> = VecDeque::from([(id.clone(), 0)]);

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= radius {
                continue;
            }
            let out_edges = inner.outgoing.get(&current).into_iter().flatten();
            let in_edges = inner.incoming.get(&current).into_iter().flatten();
            for rid in out_edges.chain(in_edges) {
                let Some(rel) = inner.edges.get(rid) else {
                    continue;
                };
                let other = if rel.from_entity_id == current {
                    &rel.to_entity_id
                } else {
                    &rel.from_entity_id
                };
                if inner.entities.contains_key(other) && included.insert(other.clone()) {
                    order.push(other.clone());
                    queue.push_back((other.clone(), depth + 1));
                }
            }
        }

        let entities: Vec<Entity> = order
            .iter()
            .filter_map(|eid| inner.entities.get(eid).cloned())
            .collect();
        let mut relationships: Vec<EntityRelationship> = inner
            .edges
            .values()
            .filter(|rel| {
                included.contains(&rel.from_entity_id) && included.contains(&rel.to_entity_id)
            })
            .cloned()
            .collect();
        relationships.sort_by(|a, b| a.id.cmp(&b.id));

        Subgraph {
            entities,
            relationships,
        }
    }

    /// Entities of the same type as `id` ranked by content similarity:
    /// Jaccard overlap of content keys plus a bonus per shared key with an
    /// equal value. Ties break on id.
    #[must_use]
    pub fn find_similar(&self, id: &EntityId, top_k: usize) -> Vec<(Entity, f32)> {
        const VALUE_EQUALITY_BONUS: f32 = 0.25;

        let inner = read_lock(&self.inner);
        let Some(subject) = inner.entities.get(id) else {
            return Vec::new();
        };
        let subject_keys: HashSet<&String> = subject.content.keys().collect();

        let mut scored: Vec<(Entity, f32)> = inner
            .entities
            .values()
            .filter(|other| other.id != *id && other.entity_type == subject.entity_type)
            .filter_map(|other| {
                let other_keys: HashSet<&String> = other.content.keys().collect();
                let union = subject_keys.union(&other_keys).count();
                if union == 0 {
                    return None;
                }
                let shared: Vec<&String> = subject_keys
                    .intersection(&other_keys)
                    .copied()
                    .collect();
                #[allow(clippy::cast_precision_loss)]
                let jaccard = shared.len() as f32 / union as f32;
                let equal = shared
                    .iter()
                    .filter(|key| subject.content.get(**key) == other.content.get(**key))
                    .count();
                #[allow(clippy::cast_precision_loss)]
                let score = VALUE_EQUALITY_BONUS.mul_add(equal as f32, jaccard);
                (score > 0.0).then(|| (other.clone(), score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(top_k);
        scored
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{EntityType, Value, ValueMap};

    fn room(name: &str) -> Entity {
        Entity::new(EntityType::Room, name, ValueMap::new(), "u1")
    }

    fn connect(index: &GraphIndex, from: &Entity, to: &Entity) -> EntityRelationship {
        let rel = EntityRelationship::new(
            (&from.id, &from.version),
            (&to.id, &to.version),
            RelationshipType::ConnectsTo,
            "u1",
        );
        index.apply_relationship(&rel);
        rel
    }

    fn chain() -> (GraphIndex, Entity, Entity, Entity, EntityRelationship) {
        let index = GraphIndex::new();
        let r1 = room("R1");
        let r2 = room("R2");
        let r3 = room("R3");
        for r in [&r1, &r2, &r3] {
            index.apply_entity(r);
        }
        connect(&index, &r1, &r2);
        let last = connect(&index, &r2, &r3);
        (index, r1, r2, r3, last)
    }

    #[test]
    fn test_path_linear_chain() {
        let (index, r1, r2, r3, _) = chain();
        let path = index.path(&r1.id, &r3.id, 10);
        assert_eq!(path, vec![r1.id.clone(), r2.id, r3.id]);
    }

    #[test]
    fn test_path_from_equals_to() {
        let (index, r1, _, _, _) = chain();
        assert_eq!(index.path(&r1.id, &r1.id, 10), vec![r1.id.clone()]);
    }

    #[test]
    fn test_path_gone_after_edge_removal() {
        let (index, r1, _, r3, last) = chain();
        index.remove_relationship(&last.id);
        assert!(index.path(&r1.id, &r3.id, 10).is_empty());
    }

    #[test]
    fn test_path_respects_max_depth() {
        let (index, r1, _, r3, _) = chain();
        assert!(index.path(&r1.id, &r3.id, 1).is_empty());
        assert_eq!(index.path(&r1.id, &r3.id, 2).len(), 3);
    }

    #[test]
    fn test_path_unknown_endpoint() {
        let (index, r1, _, _, _) = chain();
        let ghost = room("Ghost");
        assert!(index.path(&r1.id, &ghost.id, 10).is_empty());
    }

    #[test]
    fn test_neighbors_directions() {
        let (index, r1, r2, r3, _) = chain();
        let out = index.neighbors(&r2.id, Direction::Outgoing, None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, r3.id);

        let inc = index.neighbors(&r2.id, Direction::Incoming, None);
        assert_eq!(inc.len(), 1);
        assert_eq!(inc[0].id, r1.id);

        let both = index.neighbors(&r2.id, Direction::Both, None);
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn test_neighbors_filters_relationship_type() {
        let (index, _, r2, _, _) = chain();
        let none = index.neighbors(&r2.id, Direction::Both, Some(RelationshipType::Controls));
        assert!(none.is_empty());
    }

    #[test]
    fn test_tombstone_evicts_from_index() {
        let (index, r1, r2, r3, _) = chain();
        index.apply_entity(&r2.tombstone("u1"));
        assert!(!index.contains(&r2.id));
        // Paths through the tombstoned room disappear.
        assert!(index.path(&r1.id, &r3.id, 10).is_empty());
    }

    #[test]
    fn test_subgraph_radius() {
        let (index, r1, r2, r3, _) = chain();
        let sub = index.subgraph(&r1.id, 1);
        assert_eq!(sub.entities.len(), 2);
        assert_eq!(sub.relationships.len(), 1);

        let sub = index.subgraph(&r1.id, 2);
        assert_eq!(sub.entities.len(), 3);
        assert_eq!(sub.relationships.len(), 2);
        let _ = (r2, r3);
    }

    #[test]
    fn test_find_similar_prefers_equal_values() {
        let index = GraphIndex::new();
        let mut base = ValueMap::new();
        base.insert("manufacturer".to_string(), Value::from("Lumen Co"));
        base.insert("wattage".to_string(), Value::Int(9));

        let subject =
            Entity::new(EntityType::Device, "Lamp A", base.clone(), "u1");

        let twin = Entity::new(EntityType::Device, "Lamp B", base.clone(), "u1");

        let mut different = base.clone();
        different.insert("wattage".to_string(), Value::Int(60));
        let cousin = Entity::new(EntityType::Device, "Lamp C", different, "u1");

        // Same keys, different type: never similar.
        let room = Entity::new(EntityType::Room, "Lamp Room", base, "u1");

        for e in [&subject, &twin, &cousin, &room] {
            index.apply_entity(e);
        }

        let similar = index.find_similar(&subject.id, 10);
        assert_eq!(similar.len(), 2);
        assert_eq!(similar[0].0.id, twin.id);
        assert!(similar[0].1 > similar[1].1);
    }

    #[test]
    fn test_rebuild_from_store() {
        use crate::storage::{GraphStore, InMemoryGraphStore};

        let store = InMemoryGraphStore::new();
        let r1 = room("R1");
        let r2 = room("R2");
        store.put_entity(&r1).unwrap();
        store.put_entity(&r2).unwrap();
        store
            .put_relationship(&EntityRelationship::new(
                (&r1.id, &r1.version),
                (&r2.id, &r2.version),
                RelationshipType::ConnectsTo,
                "u1",
            ))
            .unwrap();

        let index = GraphIndex::new();
        index.rebuild(&store).unwrap();
        assert_eq!(index.entity_count(), 2);
        assert_eq!(index.path(&r1.id, &r2.id, 5), vec![r1.id.clone(), r2.id]);
    }
}
