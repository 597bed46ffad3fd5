//! Persistent storage for the versioned home graph.
//!
//! Two backends implement [`GraphStore`]:
//!
//! | Backend | Use Case |
//! |---------|----------|
//! | [`SqliteGraphStore`] | Default; embedded, WAL mode |
//! | [`InMemoryGraphStore`] | Tests and client replicas |
//!
//! Both enforce the versioning invariants at the write boundary, so a
//! client replica and the server reject the same bad writes.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryGraphStore;
pub use sqlite::SqliteGraphStore;
pub use traits::{ChangeSet, EntityFilter, GraphStore, SearchHit, StoreStats};

use crate::models::{ChangeKind, Entity, EntityRelationship, VersionId};

/// Outcome of the `(id, version)` uniqueness check on `put_entity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutDisposition {
    /// New version; insert it.
    Insert,
    /// Identical replay; succeed without writing.
    Replay,
}

/// Validates an incoming entity version against the stored history of its id.
///
/// `history` is every stored version for `entity.id` (any order). Enforces,
/// in this order: idempotent replay, `(id, version)` uniqueness, type
/// immutability, and parent existence.
pub(crate) fn validate_put(history: &[Entity], entity: &Entity) -> crate::Result<PutDisposition> {
    if let Some(existing) = history.iter().find(|e| e.version == entity.version) {
        if existing.entity_type == entity.entity_type
            && existing.name == entity.name
            && existing.content == entity.content
            && existing.parent_versions == entity.parent_versions
        {
            return Ok(PutDisposition::Replay);
        }
        return Err(crate::Error::InvalidArgument(format!(
            "version {} already exists for entity {} with different content",
            entity.version, entity.id
        )));
    }

    if let Some(existing) = history.first() {
        if existing.entity_type != entity.entity_type {
            return Err(crate::Error::TypeImmutable {
                id: entity.id.to_string(),
                existing: existing.entity_type.to_string(),
                attempted: entity.entity_type.to_string(),
            });
        }
    }

    for parent in &entity.parent_versions {
        if !history.iter().any(|e| &e.version == parent) {
            return Err(crate::Error::ParentUnknown {
                id: entity.id.to_string(),
                version: parent.to_string(),
            });
        }
    }

    Ok(PutDisposition::Insert)
}

/// Bonus added when the query equals the entity name exactly
/// (case-insensitive).
const EXACT_NAME_BONUS: f32 = 2.0;

/// Scores an entity against a lowercased query. Returns `None` when nothing
/// matches. The score is the sum of matching fields: 1.0 for a name
/// substring hit (plus the exact-match bonus), 1.0 per content field whose
/// stringified value contains the query.
pub(crate) fn score_entity(
    entity: &Entity,
    query_lower: &str,
) -> Option<(f32, Vec<(String, f32)>)> {
    let mut fields = Vec::new();

    let name_lower = entity.name.to_lowercase();
    if !query_lower.is_empty() && name_lower.contains(query_lower) {
        fields.push(("name".to_string(), 1.0));
        if name_lower == query_lower {
            fields.push(("name_exact".to_string(), EXACT_NAME_BONUS));
        }
    }

    for (key, value) in &entity.content {
        let mut texts = Vec::new();
        value.collect_search_text(&mut texts);
        if texts
            .iter()
            .any(|t| t.to_lowercase().contains(query_lower))
        {
            fields.push((format!("content.{key}"), 1.0));
        }
    }

    if fields.is_empty() {
        return None;
    }
    let total = fields.iter().map(|(_, s)| s).sum();
    Some((total, fields))
}

/// Derives the frontier identity of a relationship record.
///
/// Relationships carry no version of their own; for delta computation their
/// `(updated_at, user_id)` pair is treated as a pseudo-version under the
/// same observation rule as entity versions.
pub(crate) fn relationship_frontier(rel: &EntityRelationship) -> VersionId {
    VersionId::from_parts(rel.updated_at, &rel.user_id)
}

/// Classifies a relationship for the wire: newly created records are
/// `Create`, later edits are `Update`.
pub(crate) fn relationship_change_kind(rel: &EntityRelationship) -> ChangeKind {
    if rel.created_at == rel.updated_at {
        ChangeKind::Create
    } else {
        ChangeKind::Update
    }
}
