//! Core data model: entities, relationships, values, and sync wire types.

pub mod entity;
pub mod relationship;
pub mod sync;
pub mod value;

pub use entity::{Entity, EntityId, EntityType, SourceType, VersionId, TOMBSTONE_KEY};
pub use relationship::{EntityRelationship, RelationshipId, RelationshipType};
pub use sync::{
    ChangeKind, Conflict, FailedChange, ResolutionMode, SyncChange, SyncRequest, SyncResponse,
    VectorClock, PROTOCOL_VERSION,
};
pub use value::{Value, ValueMap};
