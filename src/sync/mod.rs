//! Inbetweenies synchronization: client engine, server service, conflict
//! rules, and transports.
//!
//! The protocol is delta-based and vector-clock-tracked. Each side keeps a
//! clock mapping writer id to the greatest version seen from that writer;
//! a delta is every version above the peer's frontier. Resolution defaults
//! to last-write-wins by version order; the request states the mode so
//! both sides resolve identically.

pub mod conflict;
mod engine;
mod service;
mod transport;

pub use engine::{SyncEngine, SyncReport, SyncState};
pub use service::{replica_clock, SyncService};
pub use transport::{HttpSyncTransport, LoopbackTransport, SyncPhase, SyncTransport};

use crate::models::{ChangeKind, SyncChange};
use crate::storage::ChangeSet;

/// Flattens a [`ChangeSet`] into wire change records: entity versions first
/// (version order is a topological order over parent links), then
/// relationships (their endpoints are guaranteed to precede them).
#[must_use]
pub fn wire_changes(set: ChangeSet) -> Vec<SyncChange> {
    let mut out = Vec::with_capacity(set.len());
    for entity in set.entities {
        let kind = if entity.is_tombstone() {
            ChangeKind::Delete
        } else if entity.parent_versions.is_empty() {
            ChangeKind::Create
        } else {
            ChangeKind::Update
        };
        out.push(SyncChange::entity(kind, entity));
    }
    for (kind, relationship) in set.relationships {
        out.push(SyncChange::relationship(kind, relationship));
    }
    out
}
