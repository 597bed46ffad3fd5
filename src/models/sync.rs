//! Inbetweenies wire types and vector clocks.
//!
//! A sync exchange is one request/response per phase (`request`, `push`,
//! `ack`). Every message carries the protocol version literal; an unknown
//! version is refused before anything else is looked at.

use crate::models::entity::{Entity, VersionId};
use crate::models::relationship::EntityRelationship;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The protocol version this build speaks.
pub const PROTOCOL_VERSION: &str = "inbetweenies-v2";

/// Map from writer id to the greatest version string seen from that writer.
///
/// The clock doubles as a frontier: a version is "observed" by a replica iff
/// its writer has an entry at or above it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, String>);

impl VectorClock {
    /// Creates an empty clock.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Returns the greatest version seen from `writer`, if any.
    #[must_use]
    pub fn get(&self, writer: &str) -> Option<&str> {
        self.0.get(writer).map(String::as_str)
    }

    /// Records that `version` has been observed, bumping the entry for its
    /// writer if the version is greater.
    pub fn observe(&mut self, version: &VersionId) {
        let writer = version.writer().to_string();
        let entry = self.0.entry(writer).or_default();
        if version.as_str() > entry.as_str() {
            *entry = version.as_str().to_string();
        }
    }

    /// Returns true if this replica has already observed `version`: the
    /// writer is present and its entry is at or above the version.
    #[must_use]
    pub fn has_seen(&self, version: &VersionId) -> bool {
        self.0
            .get(version.writer())
            .is_some_and(|seen| seen.as_str() >= version.as_str())
    }

    /// Merges another clock into this one by per-key maximum.
    pub fn merge(&mut self, other: &Self) {
        for (writer, version) in &other.0 {
            let entry = self.0.entry(writer.clone()).or_default();
            if version > entry {
                *entry = version.clone();
            }
        }
    }

    /// Iterates over (writer, version) entries.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(w, v)| (w.as_str(), v.as_str()))
    }

    /// Returns the number of writers tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no writers are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        write!(f, "{{")?;
        for (writer, version) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{writer}: {version}")?;
            first = false;
        }
        write!(f, "}}")
    }
}

/// What a single change record does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Initial version of a new entity, or a new relationship.
    Create,
    /// A successor entity version.
    Update,
    /// An entity tombstone, or a hard relationship delete.
    Delete,
}

/// One change record on the wire. Exactly one of `entity`/`relationship`
/// is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncChange {
    /// What the change does.
    pub kind: ChangeKind,
    /// Entity payload, for entity changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Entity>,
    /// Relationship payload, for edge changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<EntityRelationship>,
}

impl SyncChange {
    /// Wraps an entity version as a change record.
    #[must_use]
    pub fn entity(kind: ChangeKind, entity: Entity) -> Self {
        Self {
            kind,
            entity: Some(entity),
            relationship: None,
        }
    }

    /// Wraps a relationship as a change record.
    #[must_use]
    pub fn relationship(kind: ChangeKind, relationship: EntityRelationship) -> Self {
        Self {
            kind,
            entity: None,
            relationship: Some(relationship),
        }
    }
}

/// How divergent versions are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// Last-write-wins by version order; the winner records one parent.
    #[default]
    Lww,
    /// Field-aware three-way merge; the result records both parents.
    Merge,
}

impl ResolutionMode {
    /// Returns the mode as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Lww => "lww",
            Self::Merge => "merge",
        }
    }
}

/// A detected divergence, reported (never an error) in the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// The entity both sides edited.
    pub entity_id: String,
    /// The version the receiving replica held.
    pub local_version: String,
    /// The version the sender offered.
    pub remote_version: String,
    /// The version that won (or the merged version's id).
    pub winning_version: String,
    /// The mode that produced the outcome.
    pub resolution: ResolutionMode,
}

/// A sync request: one phase of an exchange, client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Must equal [`PROTOCOL_VERSION`].
    pub protocol_version: String,
    /// The requesting replica's device id.
    pub device_id: String,
    /// The user on whose behalf the replica syncs.
    pub user_id: String,
    /// The requesting replica's current clock.
    pub vector_clock: VectorClock,
    /// Conflict resolution mode for this exchange. Stated explicitly so
    /// both sides resolve the same pair identically without coordination.
    #[serde(default)]
    pub resolution_mode: ResolutionMode,
    /// Changes the client wants applied, in order.
    #[serde(default)]
    pub changes: Vec<SyncChange>,
    /// Continuation cursor from a previous response, if paging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl SyncRequest {
    /// Creates a request with the current protocol version and no changes.
    #[must_use]
    pub fn new(device_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            device_id: device_id.into(),
            user_id: user_id.into(),
            vector_clock: VectorClock::new(),
            resolution_mode: ResolutionMode::default(),
            changes: Vec::new(),
            cursor: None,
        }
    }
}

/// Marks the first change record in a batch that failed to apply.
///
/// The server applies a batch as a prefix: everything before `index`
/// succeeded, everything at and after it was not attempted. The client
/// retries from `index` after backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedChange {
    /// Index into the request's `changes` of the first failure.
    pub index: usize,
    /// Stable error kind.
    pub kind: String,
    /// Human-readable cause.
    pub message: String,
}

/// A sync response: server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    /// The server's clock after applying the request.
    pub vector_clock: VectorClock,
    /// Changes the client has not yet observed, in version order.
    #[serde(default)]
    pub changes: Vec<SyncChange>,
    /// Divergences detected while applying the request.
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    /// The mode the server resolved with (echo of the request).
    #[serde(default)]
    pub resolution_mode: ResolutionMode,
    /// Present when more changes remain than the batch cap allows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Present when a change in the request failed to apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<FailedChange>,
}

/// Keys under which replicas persist their sync bookkeeping.
pub mod metadata_keys {
    /// JSON-encoded [`super::VectorClock`].
    pub const VECTOR_CLOCK: &str = "vector_clock";
    /// RFC3339 timestamp of the last successful exchange.
    pub const LAST_SYNC_TIME: &str = "last_sync_time";
    /// This replica's device id.
    pub const DEVICE_ID: &str = "device_id";
    /// Storage schema version.
    pub const SCHEMA_VERSION: &str = "schema_version";
}

/// Parses the stored `last_sync_time` value.
#[must_use]
pub fn parse_sync_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn version(secs: u32, writer: &str) -> VersionId {
        VersionId::from_parts(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs).unwrap(),
            writer,
        )
    }

    #[test]
    fn test_observe_keeps_maximum() {
        let mut clock = VectorClock::new();
        clock.observe(&version(5, "a"));
        clock.observe(&version(3, "a"));
        assert_eq!(clock.get("a"), Some(version(5, "a").as_str()));
        clock.observe(&version(9, "a"));
        assert_eq!(clock.get("a"), Some(version(9, "a").as_str()));
    }

    #[test]
    fn test_has_seen_unknown_writer() {
        let clock = VectorClock::new();
        assert!(!clock.has_seen(&version(1, "ghost")));
    }

    #[test]
    fn test_has_seen_at_and_below_frontier() {
        let mut clock = VectorClock::new();
        clock.observe(&version(5, "a"));
        assert!(clock.has_seen(&version(5, "a")));
        assert!(clock.has_seen(&version(4, "a")));
        assert!(!clock.has_seen(&version(6, "a")));
    }

    #[test]
    fn test_merge_per_key_maximum() {
        let mut left = VectorClock::new();
        left.observe(&version(5, "a"));
        left.observe(&version(2, "b"));

        let mut right = VectorClock::new();
        right.observe(&version(3, "a"));
        right.observe(&version(7, "b"));
        right.observe(&version(1, "c"));

        left.merge(&right);
        assert_eq!(left.get("a"), Some(version(5, "a").as_str()));
        assert_eq!(left.get("b"), Some(version(7, "b").as_str()));
        assert_eq!(left.get("c"), Some(version(1, "c").as_str()));
        assert_eq!(left.len(), 3);
    }

    #[test]
    fn test_clock_serializes_transparent() {
        let mut clock = VectorClock::new();
        clock.observe(&version(1, "a"));
        let json = serde_json::to_string(&clock).unwrap();
        assert!(json.starts_with('{'));
        assert!(json.contains("\"a\":"));
        let back: VectorClock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, clock);
    }

    #[test]
    fn test_request_defaults() {
        let req = SyncRequest::new("dev-1", "u1");
        assert_eq!(req.protocol_version, PROTOCOL_VERSION);
        assert_eq!(req.resolution_mode, ResolutionMode::Lww);
        assert!(req.changes.is_empty());
    }

    #[test]
    fn test_request_json_omits_empty_cursor() {
        let req = SyncRequest::new("dev-1", "u1");
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("cursor"));
        assert!(json.contains("inbetweenies-v2"));
    }
}
