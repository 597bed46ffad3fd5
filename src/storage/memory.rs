//! In-memory graph store for tests and client replicas.

use crate::models::{
    Entity, EntityId, EntityRelationship, EntityType, RelationshipId, RelationshipType,
    VectorClock, VersionId,
};
use crate::storage::traits::{ChangeSet, EntityFilter, GraphStore, SearchHit, StoreStats};
use crate::storage::{
    relationship_change_kind, relationship_frontier, score_entity, validate_put, PutDisposition,
};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquires a read lock with poison recovery.
fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("in-memory store lock was poisoned, recovering");
            poisoned.into_inner()
        },
    }
}

/// Acquires a write lock with poison recovery.
fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("in-memory store lock was poisoned, recovering");
            poisoned.into_inner()
        },
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Every version of every entity, keyed by id then version.
    versions: HashMap<EntityId, BTreeMap<VersionId, Entity>>,
    /// Latest-per-id projection.
    latest: HashMap<EntityId, VersionId>,
    relationships: BTreeMap<RelationshipId, EntityRelationship>,
    sync_metadata: HashMap<String, String>,
}

impl Inner {
    fn latest_entity(&self, id: &EntityId) -> Option<&Entity> {
        let version = self.latest.get(id)?;
        self.versions.get(id)?.get(version)
    }
}

/// Non-persistent [`GraphStore`] backed by `RwLock` maps.
///
/// Used by unit and integration tests, and as the local replica store for
/// the client-side sync engine.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    inner: RwLock<Inner>,
}

impl InMemoryGraphStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of distinct entity ids (including tombstoned).
    #[must_use]
    pub fn id_count(&self) -> usize {
        read_lock(&self.inner).versions.len()
    }
}

impl GraphStore for InMemoryGraphStore {
    fn put_entity(&self, entity: &Entity) -> Result<()> {
        let mut inner = write_lock(&self.inner);
        let history: Vec<Entity> = inner
            .versions
            .get(&entity.id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();

        if validate_put(&history, entity)? == PutDisposition::Replay {
            return Ok(());
        }

        inner
            .versions
            .entry(entity.id.clone())
            .or_default()
            .insert(entity.version.clone(), entity.clone());

        let replace = inner
            .latest
            .get(&entity.id)
            .is_none_or(|current| entity.version > *current);
        if replace {
            inner.latest.insert(entity.id.clone(), entity.version.clone());
        }
        Ok(())
    }

    fn get_entity(&self, id: &EntityId, version: Option<&VersionId>) -> Result<Option<Entity>> {
        let inner = read_lock(&self.inner);
        let found = match version {
            Some(v) => inner.versions.get(id).and_then(|m| m.get(v)),
            None => inner.latest_entity(id),
        };
        Ok(found.cloned())
    }

    fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<Entity>> {
        let inner = read_lock(&self.inner);
        let mut out: Vec<Entity> = inner
            .latest
            .keys()
            .filter_map(|id| inner.latest_entity(id))
            .filter(|e| filter.include_deleted || !e.is_tombstone())
            .filter(|e| filter.entity_type.is_none_or(|t| e.entity_type == t))
            .filter(|e| {
                filter.name_substring.as_ref().is_none_or(|needle| {
                    e.name.to_lowercase().contains(&needle.to_lowercase())
                })
            })
            .filter(|e| filter.modified_since.is_none_or(|t| e.updated_at > t))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));

        let offset = filter.offset.unwrap_or(0);
        let mut page: Vec<Entity> = out.into_iter().skip(offset).collect();
        if let Some(limit) = filter.limit {
            page.truncate(limit);
        }
        Ok(page)
    }

    fn get_history(&self, id: &EntityId) -> Result<Vec<Entity>> {
        let inner = read_lock(&self.inner);
        Ok(inner
            .versions
            .get(id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn put_relationship(&self, relationship: &EntityRelationship) -> Result<()> {
        let mut inner = write_lock(&self.inner);

        for (id, version) in [
            (
                &relationship.from_entity_id,
                &relationship.from_entity_version,
            ),
            (&relationship.to_entity_id, &relationship.to_entity_version),
        ] {
            let exists = inner
                .versions
                .get(id)
                .is_some_and(|m| m.contains_key(version));
            if !exists {
                return Err(Error::NotFound(format!(
                    "relationship endpoint {id}@{version} does not exist"
                )));
            }
        }

        inner
            .relationships
            .insert(relationship.id.clone(), relationship.clone());
        Ok(())
    }

    fn delete_relationship(&self, id: &RelationshipId) -> Result<bool> {
        let mut inner = write_lock(&self.inner);
        Ok(inner.relationships.remove(id).is_some())
    }

    fn get_relationship(&self, id: &RelationshipId) -> Result<Option<EntityRelationship>> {
        let inner = read_lock(&self.inner);
        Ok(inner.relationships.get(id).cloned())
    }

    fn relationships_from(&self, id: &EntityId) -> Result<Vec<EntityRelationship>> {
        let inner = read_lock(&self.inner);
        Ok(inner
            .relationships
            .values()
            .filter(|r| &r.from_entity_id == id)
            .cloned()
            .collect())
    }

    fn relationships_to(&self, id: &EntityId) -> Result<Vec<EntityRelationship>> {
        let inner = read_lock(&self.inner);
        Ok(inner
            .relationships
            .values()
            .filter(|r| &r.to_entity_id == id)
            .cloned()
            .collect())
    }

    fn relationships_by_type(&self, rt: RelationshipType) -> Result<Vec<EntityRelationship>> {
        let inner = read_lock(&self.inner);
        Ok(inner
            .relationships
            .values()
            .filter(|r| r.relationship_type == rt)
            .cloned()
            .collect())
    }

    fn list_relationships(&self) -> Result<Vec<EntityRelationship>> {
        let inner = read_lock(&self.inner);
        Ok(inner.relationships.values().cloned().collect())
    }

    fn changes_since(&self, clock: &VectorClock) -> Result<ChangeSet> {
        let inner = read_lock(&self.inner);

        let mut entities: Vec<Entity> = inner
            .versions
            .values()
            .flat_map(|m| m.values())
            .filter(|e| !clock.has_seen(&e.version))
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.version.cmp(&b.version));

        let mut relationships: Vec<_> = inner
            .relationships
            .values()
            .filter(|r| !clock.has_seen(&relationship_frontier(r)))
            .map(|r| (relationship_change_kind(r), r.clone()))
            .collect();
        relationships.sort_by(|a, b| a.1.id.cmp(&b.1.id));

        Ok(ChangeSet {
            entities,
            relationships,
        })
    }

    fn search(&self, query: &str, types: &[EntityType]) -> Result<Vec<SearchHit>> {
        let inner = read_lock(&self.inner);
        let query_lower = query.to_lowercase();

        let mut hits: Vec<SearchHit> = inner
            .latest
            .keys()
            .filter_map(|id| inner.latest_entity(id))
            .filter(|e| !e.is_tombstone())
            .filter(|e| types.is_empty() || types.contains(&e.entity_type))
            .filter_map(|e| {
                score_entity(e, &query_lower).map(|(score, field_scores)| SearchHit {
                    entity: e.clone(),
                    score,
                    field_scores,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        Ok(hits)
    }

    fn get_sync_metadata(&self, key: &str) -> Result<Option<String>> {
        let inner = read_lock(&self.inner);
        Ok(inner.sync_metadata.get(key).cloned())
    }

    fn put_sync_metadata(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = write_lock(&self.inner);
        inner
            .sync_metadata
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats> {
        let inner = read_lock(&self.inner);
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut live = 0;
        for id in inner.latest.keys() {
            if let Some(e) = inner.latest_entity(id) {
                if !e.is_tombstone() {
                    live += 1;
                    *by_type.entry(e.entity_type.to_string()).or_default() += 1;
                }
            }
        }
        Ok(StoreStats {
            entity_count: live,
            version_count: inner.versions.values().map(BTreeMap::len).sum(),
            relationship_count: inner.relationships.len(),
            entities_by_type: by_type.into_iter().collect(),
        })
    }
}
