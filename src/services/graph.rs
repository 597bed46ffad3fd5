//! Graph service: the validated write path and the read surface.
//!
//! All writes go through here. The service serializes writes per entity id
//! (lexicographic acquisition order when one operation touches several ids)
//! so the parent-exists invariant and the latest-per-id projection never
//! race, and refreshes the in-memory index inside the same critical
//! section as the store commit.

use crate::graph::{Direction, GraphIndex, Subgraph};
use crate::models::{
    Entity, EntityId, EntityRelationship, EntityType, RelationshipId, RelationshipType,
    SourceType, Value, ValueMap,
};
use crate::storage::{EntityFilter, GraphStore, SearchHit, StoreStats};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::instrument;

/// An entity together with its incident edges.
#[derive(Debug, Clone)]
pub struct EntityDetails {
    /// The latest version.
    pub entity: Entity,
    /// Edges pointing at this entity.
    pub incoming: Vec<EntityRelationship>,
    /// Edges leaving this entity.
    pub outgoing: Vec<EntityRelationship>,
}

/// Acquires a plain mutex with poison recovery.
fn acquire<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("graph service lock was poisoned, recovering");
            poisoned.into_inner()
        },
    }
}

/// Runs `f` while holding every lock in `arcs`, acquired front to back.
fn run_locked<T>(arcs: &[Arc<Mutex<()>>], f: impl FnOnce() -> T) -> T {
    match arcs.split_first() {
        None => f(),
        Some((head, rest)) => {
            let _guard = acquire(head);
            run_locked(rest, f)
        },
    }
}

/// Service over a [`GraphStore`] and its [`GraphIndex`].
pub struct GraphService {
    store: Arc<dyn GraphStore>,
    index: Arc<GraphIndex>,
    /// One mutex per entity id; writes acquire them in lexicographic order.
    id_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GraphService {
    /// Creates a service and builds the index from the store.
    pub fn new(store: Arc<dyn GraphStore>) -> Result<Self> {
        let index = Arc::new(GraphIndex::new());
        index.rebuild(store.as_ref())?;
        Ok(Self {
            store,
            index,
            id_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Returns the traversal index.
    #[must_use]
    pub fn index(&self) -> &Arc<GraphIndex> {
        &self.index
    }

    /// Runs `f` with the per-id mutexes for `ids` held, acquired in
    /// lexicographic order so concurrent multi-id writes cannot deadlock.
    fn with_id_locks<T>(&self, ids: &[&EntityId], f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut keys: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        keys.sort_unstable();
        keys.dedup();

        let arcs: Vec<Arc<Mutex<()>>> = {
            let mut table = acquire(&self.id_locks);
            keys.into_iter()
                .map(|key| table.entry(key.to_string()).or_default().clone())
                .collect()
        };
        run_locked(&arcs, f)
    }

    // ========================================================================
    // Entity writes
    // ========================================================================

    /// Creates a new entity (initial version).
    #[instrument(skip(self, content), fields(entity_type = %entity_type, name = %name))]
    pub fn create_entity(
        &self,
        entity_type: EntityType,
        name: &str,
        content: ValueMap,
        user_id: &str,
        source_type: SourceType,
    ) -> Result<Entity> {
        let entity = Entity::new(entity_type, name, content, user_id).with_source(source_type);
        self.with_id_locks(&[&entity.id], || {
            self.store.put_entity(&entity)?;
            self.index.apply_entity(&entity);
            Ok(())
        })?;
        metrics::counter!("homegraph_entities_created_total").increment(1);
        Ok(entity)
    }

    /// Appends a new version of `id` with `changes` merged into the content.
    ///
    /// A `Null` value removes the key; anything else upserts it. `name`
    /// renames the entity. The new version's parent is the current latest.
    #[instrument(skip(self, changes), fields(entity_id = %id))]
    pub fn update_entity(
        &self,
        id: &EntityId,
        changes: ValueMap,
        name: Option<&str>,
        user_id: &str,
    ) -> Result<Entity> {
        let updated = self.with_id_locks(&[id], || {
            let latest = self
                .store
                .get_entity(id, None)?
                .ok_or_else(|| Error::NotFound(format!("entity {id}")))?;
            if latest.is_tombstone() {
                return Err(Error::NotFound(format!("entity {id} is deleted")));
            }

            let mut next = latest.next_version(user_id);
            for (key, value) in changes {
                if matches!(value, Value::Null) {
                    next.content.remove(&key);
                } else {
                    next.content.insert(key, value);
                }
            }
            if let Some(name) = name {
                next.name = name.to_string();
            }

            self.store.put_entity(&next)?;
            self.index.apply_entity(&next);
            Ok(next)
        })?;
        metrics::counter!("homegraph_entities_updated_total").increment(1);
        Ok(updated)
    }

    /// Appends a tombstone version for `id`. Deleting an already-deleted
    /// entity is a silent no-op that returns the existing tombstone.
    #[instrument(skip(self), fields(entity_id = %id))]
    pub fn delete_entity(&self, id: &EntityId, user_id: &str) -> Result<Entity> {
        self.with_id_locks(&[id], || {
            let latest = self
                .store
                .get_entity(id, None)?
                .ok_or_else(|| Error::NotFound(format!("entity {id}")))?;
            if latest.is_tombstone() {
                return Ok(latest);
            }
            let tombstone = latest.tombstone(user_id);
            self.store.put_entity(&tombstone)?;
            self.index.apply_entity(&tombstone);
            Ok(tombstone)
        })
    }

    /// Applies an entity version received from a sync peer, verbatim.
    /// The store's own invariant checks still apply.
    pub fn apply_remote_entity(&self, entity: &Entity) -> Result<()> {
        self.with_id_locks(&[&entity.id], || {
            self.store.put_entity(entity)?;
            self.index.apply_entity(entity);
            Ok(())
        })
    }

    // ========================================================================
    // Relationship writes
    // ========================================================================

    /// Creates a relationship between the latest versions of two entities.
    ///
    /// Rejects cycles for the hierarchical types (`located_in`, `part_of`)
    /// and self-loops for every type.
    #[instrument(skip(self, properties), fields(from = %from_id, to = %to_id, rel = %relationship_type))]
    pub fn create_relationship(
        &self,
        from_id: &EntityId,
        to_id: &EntityId,
        relationship_type: RelationshipType,
        properties: ValueMap,
        user_id: &str,
    ) -> Result<EntityRelationship> {
        if from_id == to_id {
            return Err(Error::InvalidArgument(
                "relationship endpoints must differ".to_string(),
            ));
        }

        let created = self.with_id_locks(&[from_id, to_id], || {
            let from = self
                .live_latest(from_id)?
                .ok_or_else(|| Error::NotFound(format!("entity {from_id}")))?;
            let to = self
                .live_latest(to_id)?
                .ok_or_else(|| Error::NotFound(format!("entity {to_id}")))?;

            if relationship_type.is_hierarchical()
                && self.reaches(to_id, from_id, relationship_type)
            {
                return Err(Error::InvalidArgument(format!(
                    "{relationship_type} edge {from_id} -> {to_id} would form a cycle"
                )));
            }

            let relationship = EntityRelationship::new(
                (&from.id, &from.version),
                (&to.id, &to.version),
                relationship_type,
                user_id,
            )
            .with_properties(properties);

            self.store.put_relationship(&relationship)?;
            self.index.apply_relationship(&relationship);
            Ok(relationship)
        })?;
        metrics::counter!("homegraph_relationships_created_total").increment(1);
        Ok(created)
    }

    /// Hard-deletes a relationship. Returns `false` if it did not exist.
    #[instrument(skip(self), fields(relationship_id = %id))]
    pub fn delete_relationship(&self, id: &RelationshipId) -> Result<bool> {
        let Some(rel) = self.store.get_relationship(id)? else {
            return Ok(false);
        };
        self.with_id_locks(&[&rel.from_entity_id, &rel.to_entity_id], || {
            let deleted = self.store.delete_relationship(id)?;
            if deleted {
                self.index.remove_relationship(id);
            }
            Ok(deleted)
        })
    }

    /// Applies a relationship received from a sync peer.
    pub fn apply_remote_relationship(&self, relationship: &EntityRelationship) -> Result<()> {
        self.with_id_locks(
            &[&relationship.from_entity_id, &relationship.to_entity_id],
            || {
                self.store.put_relationship(relationship)?;
                self.index.apply_relationship(relationship);
                Ok(())
            },
        )
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Returns a specific version, or the latest when `version` is `None`.
    pub fn get_entity(
        &self,
        id: &EntityId,
        version: Option<&crate::models::VersionId>,
    ) -> Result<Option<Entity>> {
        self.store.get_entity(id, version)
    }

    /// Returns the latest version per id matching `filter`.
    pub fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<Entity>> {
        self.store.list_entities(filter)
    }

    /// Returns every version of `id` in version order.
    pub fn get_history(&self, id: &EntityId) -> Result<Vec<Entity>> {
        self.store.get_history(id)
    }

    /// Ranked substring search over names and content.
    pub fn search(&self, query: &str, types: &[EntityType]) -> Result<Vec<SearchHit>> {
        self.store.search(query, types)
    }

    /// Returns the entity plus its incident edges.
    pub fn entity_details(&self, id: &EntityId) -> Result<EntityDetails> {
        let entity = self
            .store
            .get_entity(id, None)?
            .ok_or_else(|| Error::NotFound(format!("entity {id}")))?;
        Ok(EntityDetails {
            incoming: self.store.relationships_to(id)?,
            outgoing: self.store.relationships_from(id)?,
            entity,
        })
    }

    /// Shortest path along outgoing edges; see [`GraphIndex::path`].
    #[must_use]
    pub fn find_path(&self, from: &EntityId, to: &EntityId, max_depth: usize) -> Vec<EntityId> {
        self.index.path(from, to, max_depth)
    }

    /// Adjacent entities; see [`GraphIndex::neighbors`].
    #[must_use]
    pub fn neighbors(
        &self,
        id: &EntityId,
        direction: Direction,
        rel_type: Option<RelationshipType>,
    ) -> Vec<Entity> {
        self.index.neighbors(id, direction, rel_type)
    }

    /// Entities within `radius` hops; see [`GraphIndex::subgraph`].
    #[must_use]
    pub fn subgraph(&self, id: &EntityId, radius: usize) -> Subgraph {
        self.index.subgraph(id, radius)
    }

    /// Same-type entities ranked by content overlap; see
    /// [`GraphIndex::find_similar`].
    #[must_use]
    pub fn find_similar(&self, id: &EntityId, top_k: usize) -> Vec<(Entity, f32)> {
        self.index.find_similar(id, top_k)
    }

    /// Store-level aggregate counts.
    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Latest version of `id` if it exists and is not tombstoned.
    fn live_latest(&self, id: &EntityId) -> Result<Option<Entity>> {
        Ok(self
            .store
            .get_entity(id, None)?
            .filter(|e| !e.is_tombstone()))
    }

    /// True when `target` is reachable from `start` along edges of
    /// `rel_type`, per the index.
    fn reaches(&self, start: &EntityId, target: &EntityId, rel_type: RelationshipType) -> bool {
        let mut visited: HashSet<EntityId> = HashSet::from([start.clone()]);
        let mut queue: VecDeque<EntityId> = VecDeque::from([start.clone()]);
        while let Some(current) = queue.pop_front() {
            if &current == target {
                return true;
            }
            for next in self
                .index
                .neighbors(&current, Direction::Outgoing, Some(rel_type))
            {
                if visited.insert(next.id.clone()) {
                    queue.push_back(next.id);
                }
            }
        }
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::InMemoryGraphStore;

    fn service() -> GraphService {
        GraphService::new(Arc::new(InMemoryGraphStore::new())).unwrap()
    }

    fn content(pairs: &[(&str, Value)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_create_update_history() {
        let svc = service();
        let room = svc
            .create_entity(
                EntityType::Room,
                "Living Room",
                content(&[("floor", Value::Int(1))]),
                "u1",
                SourceType::Manual,
            )
            .unwrap();

        let updated = svc
            .update_entity(&room.id, ValueMap::new(), Some("Family Room"), "u1")
            .unwrap();
        assert_eq!(updated.name, "Family Room");
        assert_eq!(updated.parent_versions, vec![room.version.clone()]);

        let history = svc.get_history(&room.id).unwrap();
        assert_eq!(history.len(), 2);
        let latest = svc.get_entity(&room.id, None).unwrap().unwrap();
        assert_eq!(latest.name, "Family Room");
        // Content carried over.
        assert_eq!(latest.content.get("floor"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_update_null_removes_key() {
        let svc = service();
        let room = svc
            .create_entity(
                EntityType::Room,
                "Office",
                content(&[("floor", Value::Int(2)), ("color", Value::from("white"))]),
                "u1",
                SourceType::Manual,
            )
            .unwrap();

        let updated = svc
            .update_entity(&room.id, content(&[("color", Value::Null)]), None, "u1")
            .unwrap();
        assert!(!updated.content.contains_key("color"));
        assert!(updated.content.contains_key("floor"));
    }

    #[test]
    fn test_update_missing_entity() {
        let svc = service();
        let ghost = EntityId::generate();
        assert!(matches!(
            svc.update_entity(&ghost, ValueMap::new(), None, "u1"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let svc = service();
        let note = svc
            .create_entity(EntityType::Note, "scratch", ValueMap::new(), "u1", SourceType::Manual)
            .unwrap();
        let dead = svc.delete_entity(&note.id, "u1").unwrap();
        assert!(dead.is_tombstone());
        let again = svc.delete_entity(&note.id, "u1").unwrap();
        assert_eq!(again.version, dead.version);
        assert_eq!(svc.get_history(&note.id).unwrap().len(), 2);
    }

    #[test]
    fn test_relationship_cycle_rejected_for_hierarchy() {
        let svc = service();
        let home = svc
            .create_entity(EntityType::Home, "Home", ValueMap::new(), "u1", SourceType::Manual)
            .unwrap();
        let room = svc
            .create_entity(EntityType::Room, "Kitchen", ValueMap::new(), "u1", SourceType::Manual)
            .unwrap();

        svc.create_relationship(
            &room.id,
            &home.id,
            RelationshipType::LocatedIn,
            ValueMap::new(),
            "u1",
        )
        .unwrap();

        // Home located_in Kitchen closes a located_in cycle.
        let err = svc
            .create_relationship(
                &home.id,
                &room.id,
                RelationshipType::LocatedIn,
                ValueMap::new(),
                "u1",
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        // The same edge is fine for a non-hierarchical type.
        svc.create_relationship(
            &home.id,
            &room.id,
            RelationshipType::ConnectsTo,
            ValueMap::new(),
            "u1",
        )
        .unwrap();
    }

    #[test]
    fn test_self_loop_rejected() {
        let svc = service();
        let room = svc
            .create_entity(EntityType::Room, "Kitchen", ValueMap::new(), "u1", SourceType::Manual)
            .unwrap();
        assert!(matches!(
            svc.create_relationship(
                &room.id,
                &room.id,
                RelationshipType::ConnectsTo,
                ValueMap::new(),
                "u1",
            ),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_entity_details_lists_edges() {
        let svc = service();
        let room = svc
            .create_entity(EntityType::Room, "Kitchen", ValueMap::new(), "u1", SourceType::Manual)
            .unwrap();
        let lamp = svc
            .create_entity(EntityType::Device, "Lamp", ValueMap::new(), "u1", SourceType::Manual)
            .unwrap();
        svc.create_relationship(
            &lamp.id,
            &room.id,
            RelationshipType::LocatedIn,
            ValueMap::new(),
            "u1",
        )
        .unwrap();

        let details = svc.entity_details(&room.id).unwrap();
        assert_eq!(details.incoming.len(), 1);
        assert!(details.outgoing.is_empty());

        let details = svc.entity_details(&lamp.id).unwrap();
        assert_eq!(details.outgoing.len(), 1);
    }

    #[test]
    fn test_relationship_to_tombstoned_entity_refused() {
        let svc = service();
        let room = svc
            .create_entity(EntityType::Room, "Kitchen", ValueMap::new(), "u1", SourceType::Manual)
            .unwrap();
        let lamp = svc
            .create_entity(EntityType::Device, "Lamp", ValueMap::new(), "u1", SourceType::Manual)
            .unwrap();
        svc.delete_entity(&room.id, "u1").unwrap();

        assert!(matches!(
            svc.create_relationship(
                &lamp.id,
                &room.id,
                RelationshipType::LocatedIn,
                ValueMap::new(),
                "u1",
            ),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_relationship_updates_index() {
        let svc = service();
        let a = svc
            .create_entity(EntityType::Room, "A", ValueMap::new(), "u1", SourceType::Manual)
            .unwrap();
        let b = svc
            .create_entity(EntityType::Room, "B", ValueMap::new(), "u1", SourceType::Manual)
            .unwrap();
        let rel = svc
            .create_relationship(&a.id, &b.id, RelationshipType::ConnectsTo, ValueMap::new(), "u1")
            .unwrap();

        assert_eq!(svc.find_path(&a.id, &b.id, 5).len(), 2);
        assert!(svc.delete_relationship(&rel.id).unwrap());
        assert!(svc.find_path(&a.id, &b.id, 5).is_empty());
        assert!(!svc.delete_relationship(&rel.id).unwrap());
    }
}
