//! Graph store trait: the persistence contract both backends implement.
//!
//! # Implementor Notes
//!
//! - Methods take `&self` so stores can be shared via `Arc<dyn GraphStore>`;
//!   use interior mutability (`Mutex<Connection>`, `RwLock` maps).
//! - `put_entity` must enforce the versioning invariants itself: unknown
//!   parents fail with `ParentUnknown`, a type change fails with
//!   `TypeImmutable`, and a replay of an identical `(id, version)` succeeds
//!   silently so sync retries are no-ops.
//! - Storage faults surface as `StoreUnavailable` (retryable); invariant
//!   violations are not retried.

use crate::models::{
    ChangeKind, Entity, EntityId, EntityRelationship, EntityType, RelationshipId,
    RelationshipType, VectorClock, VersionId,
};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Filter for `list_entities`. All criteria are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    /// Only entities of this type.
    pub entity_type: Option<EntityType>,
    /// Case-insensitive substring of the name.
    pub name_substring: Option<String>,
    /// Only entities whose latest version was written after this instant.
    pub modified_since: Option<DateTime<Utc>>,
    /// Include tombstoned entities (default: elided).
    pub include_deleted: bool,
    /// Maximum results.
    pub limit: Option<usize>,
    /// Offset for pagination.
    pub offset: Option<usize>,
}

impl EntityFilter {
    /// Creates an empty filter matching every live entity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters by entity type.
    #[must_use]
    pub const fn with_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    /// Filters by name substring.
    #[must_use]
    pub fn with_name_substring(mut self, needle: impl Into<String>) -> Self {
        self.name_substring = Some(needle.into());
        self
    }

    /// Filters by modification time.
    #[must_use]
    pub const fn modified_since(mut self, since: DateTime<Utc>) -> Self {
        self.modified_since = Some(since);
        self
    }

    /// Includes tombstoned entities.
    #[must_use]
    pub const fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Sets the page size.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the page offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// One search result with its score breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// The matching entity (latest version).
    pub entity: Entity,
    /// Total score.
    pub score: f32,
    /// Per-field contributions (`name`, `name_exact`, content keys).
    pub field_scores: Vec<(String, f32)>,
}

/// Changes a peer has not yet observed, in version order.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Unobserved entity versions.
    pub entities: Vec<Entity>,
    /// Unobserved relationship records, paired with whether they are new
    /// to the peer (`Create`) or a later edit (`Update`).
    pub relationships: Vec<(ChangeKind, EntityRelationship)>,
}

impl ChangeSet {
    /// Total number of change records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len() + self.relationships.len()
    }

    /// Returns true if nothing remains to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// Aggregate counts for the status surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    /// Distinct entity ids (live, latest not a tombstone).
    pub entity_count: usize,
    /// Total stored versions across all ids.
    pub version_count: usize,
    /// Relationship edges.
    pub relationship_count: usize,
    /// Live entity count per type.
    pub entities_by_type: Vec<(String, usize)>,
}

/// Persistence contract for the versioned home graph.
pub trait GraphStore: Send + Sync {
    /// Stores an entity version.
    ///
    /// Replaying an identical `(id, version)` succeeds silently. A different
    /// payload under an existing `(id, version)` is `InvalidArgument`.
    ///
    /// # Errors
    ///
    /// `ParentUnknown` if a listed parent does not exist for this id;
    /// `TypeImmutable` if the type differs from an existing version.
    fn put_entity(&self, entity: &Entity) -> Result<()>;

    /// Returns a specific version, or the latest when `version` is `None`.
    /// Unknown ids return `Ok(None)`.
    fn get_entity(&self, id: &EntityId, version: Option<&VersionId>) -> Result<Option<Entity>>;

    /// Returns the latest version per id matching `filter`.
    fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<Entity>>;

    /// Returns every stored version of `id`, ordered by version.
    fn get_history(&self, id: &EntityId) -> Result<Vec<Entity>>;

    /// Stores a relationship. Both endpoint versions must exist.
    /// Replaying an identical record succeeds silently.
    fn put_relationship(&self, relationship: &EntityRelationship) -> Result<()>;

    /// Hard-deletes a relationship. Returns `false` if unknown.
    fn delete_relationship(&self, id: &RelationshipId) -> Result<bool>;

    /// Returns a relationship by id.
    fn get_relationship(&self, id: &RelationshipId) -> Result<Option<EntityRelationship>>;

    /// Returns edges whose source is `id`.
    fn relationships_from(&self, id: &EntityId) -> Result<Vec<EntityRelationship>>;

    /// Returns edges whose target is `id`.
    fn relationships_to(&self, id: &EntityId) -> Result<Vec<EntityRelationship>>;

    /// Returns all edges of one type.
    fn relationships_by_type(&self, rt: RelationshipType) -> Result<Vec<EntityRelationship>>;

    /// Returns every edge. Used for index rebuilds.
    fn list_relationships(&self) -> Result<Vec<EntityRelationship>>;

    /// Returns the entity versions and relationships a peer with `clock`
    /// has not observed. A version is unobserved when its writer is absent
    /// from the clock or the clock entry is lexicographically below it.
    fn changes_since(&self, clock: &VectorClock) -> Result<ChangeSet>;

    /// Substring search over entity names and stringified content values.
    /// Scores are the sum of field matches with a bonus for an exact name
    /// match; `types` narrows to the given entity types when non-empty.
    fn search(&self, query: &str, types: &[EntityType]) -> Result<Vec<SearchHit>>;

    /// Reads a sync-metadata value by key.
    fn get_sync_metadata(&self, key: &str) -> Result<Option<String>>;

    /// Writes a sync-metadata value.
    fn put_sync_metadata(&self, key: &str, value: &str) -> Result<()>;

    /// Returns aggregate counts.
    fn stats(&self) -> Result<StoreStats>;
}
