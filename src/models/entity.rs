//! Entity records and the version identifier scheme.
//!
//! Entities are immutable: an edit appends a new version rather than
//! mutating in place. A version id embeds a fixed-width UTC timestamp and
//! the writer id, so plain lexicographic comparison is both a wall-clock
//! order and a deterministic last-write-wins tiebreak.

use crate::models::value::{Value, ValueMap};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content key that marks a version as a tombstone.
pub const TOMBSTONE_KEY: &str = "deleted";

/// Fixed width of the timestamp prefix in a version id
/// (`YYYY-MM-DDTHH:MM:SS.ffffffZ`).
const VERSION_TS_LEN: usize = 27;

/// Unique identifier for a graph entity, stable across versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an entity id from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh unique entity id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Per-version identifier: fixed-width UTC timestamp plus writer id.
///
/// Example: `2026-03-01T09:15:42.000317Z-hub-1`.
///
/// The derived `Ord` is the version order used everywhere: timestamp
/// dominates, writer id breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionId(String);

impl VersionId {
    /// Builds a version id from raw parts. The timestamp is truncated to
    /// microsecond precision to keep the width fixed.
    #[must_use]
    pub fn from_parts(timestamp: DateTime<Utc>, writer: &str) -> Self {
        let micros = timestamp.timestamp_micros();
        let ts = Utc
            .timestamp_micros(micros)
            .single()
            .unwrap_or_else(Utc::now);
        Self(format!(
            "{}-{writer}",
            ts.to_rfc3339_opts(SecondsFormat::Micros, true)
        ))
    }

    /// Generates a version id for `writer` at the current wall clock.
    #[must_use]
    pub fn generate(writer: &str) -> Self {
        Self::from_parts(Utc::now(), writer)
    }

    /// Generates a version id for `writer` guaranteed to sort after `prev`.
    ///
    /// If the host clock is behind the previous local version (clock skew,
    /// NTP step), the timestamp is bumped to one microsecond past it so
    /// per-writer monotonicity holds.
    #[must_use]
    pub fn after(prev: &Self, writer: &str) -> Self {
        let now = Utc::now();
        let floor = prev
            .timestamp()
            .and_then(|t| t.timestamp_micros().checked_add(1))
            .and_then(|m| Utc.timestamp_micros(m).single());
        match floor {
            Some(floor) if floor > now => Self::from_parts(floor, writer),
            _ => Self::from_parts(now, writer),
        }
    }

    /// Wraps a version string read back from storage without re-validating.
    /// Rows only ever hold strings that passed [`VersionId::parse`] or were
    /// generated here.
    pub(crate) fn from_raw(s: String) -> Self {
        Self(s)
    }

    /// Parses an existing version string. Fails if the timestamp prefix is
    /// not well-formed.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let candidate = Self(s.to_string());
        if candidate.timestamp().is_none() || candidate.writer().is_empty() {
            return Err(crate::Error::InvalidArgument(format!(
                "malformed version id: {s}"
            )));
        }
        Ok(candidate)
    }

    /// Returns the embedded timestamp, if the prefix parses.
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let prefix = self.0.get(..VERSION_TS_LEN)?;
        DateTime::parse_from_rfc3339(prefix)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Returns the writer id embedded in this version.
    #[must_use]
    pub fn writer(&self) -> &str {
        self.0.get(VERSION_TS_LEN + 1..).unwrap_or("")
    }

    /// Returns the version as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for VersionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Kind of node in the home graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// The home itself; root of the `located_in` tree.
    Home,
    /// A room within the home.
    Room,
    /// A controllable or observable device.
    Device,
    /// A logical grouping of rooms (floor, wing, outdoors).
    Zone,
    /// A door between rooms.
    Door,
    /// A window.
    Window,
    /// A step-by-step procedure (maintenance, troubleshooting).
    Procedure,
    /// A device manual or reference document.
    Manual,
    /// A free-form note.
    Note,
    /// A time-based schedule.
    Schedule,
    /// An automation rule.
    Automation,
}

impl EntityType {
    /// Returns all entity type variants.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Home,
            Self::Room,
            Self::Device,
            Self::Zone,
            Self::Door,
            Self::Window,
            Self::Procedure,
            Self::Manual,
            Self::Note,
            Self::Schedule,
            Self::Automation,
        ]
    }

    /// Returns the entity type as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Room => "room",
            Self::Device => "device",
            Self::Zone => "zone",
            Self::Door => "door",
            Self::Window => "window",
            Self::Procedure => "procedure",
            Self::Manual => "manual",
            Self::Note => "note",
            Self::Schedule => "schedule",
            Self::Automation => "automation",
        }
    }

    /// Parses an entity type from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "home" => Some(Self::Home),
            "room" => Some(Self::Room),
            "device" => Some(Self::Device),
            "zone" => Some(Self::Zone),
            "door" => Some(Self::Door),
            "window" => Some(Self::Window),
            "procedure" => Some(Self::Procedure),
            "manual" => Some(Self::Manual),
            "note" => Some(Self::Note),
            "schedule" => Some(Self::Schedule),
            "automation" => Some(Self::Automation),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown entity type: {s}"))
    }
}

/// Provenance of an entity version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Created by a user through the API or a tool.
    #[default]
    Manual,
    /// Imported from an external inventory.
    Imported,
    /// Mirrored from a HomeKit-style platform.
    Homekit,
    /// Mirrored from a Matter fabric.
    Matter,
    /// Produced by the system (merge results, migrations).
    Generated,
}

impl SourceType {
    /// Returns the source type as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Imported => "imported",
            Self::Homekit => "homekit",
            Self::Matter => "matter",
            Self::Generated => "generated",
        }
    }

    /// Parses a source type from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "manual" => Some(Self::Manual),
            "imported" => Some(Self::Imported),
            "homekit" => Some(Self::Homekit),
            "matter" => Some(Self::Matter),
            "generated" => Some(Self::Generated),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable version of a node in the home graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier across versions.
    pub id: EntityId,
    /// This version's identifier.
    pub version: VersionId,
    /// Kind of node. Immutable across versions of the same id.
    pub entity_type: EntityType,
    /// Human label; may be empty.
    pub name: String,
    /// Free-form content map.
    pub content: ValueMap,
    /// Provenance of this version.
    pub source_type: SourceType,
    /// Author of this version.
    pub user_id: String,
    /// Versions this one supersedes. Empty for initial creation, one for a
    /// linear edit, two or more for a merge.
    pub parent_versions: Vec<VersionId>,
    /// Creation time of this version.
    pub created_at: DateTime<Utc>,
    /// Last update time (equal to `created_at` for immutable versions).
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Creates the initial version of a new entity.
    #[must_use]
    pub fn new(
        entity_type: EntityType,
        name: impl Into<String>,
        content: ValueMap,
        user_id: impl Into<String>,
    ) -> Self {
        let user_id = user_id.into();
        let now = Utc::now();
        Self {
            id: EntityId::generate(),
            version: VersionId::generate(&user_id),
            entity_type,
            name: name.into(),
            content,
            source_type: SourceType::Manual,
            user_id,
            parent_versions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replaces the generated id with a caller-supplied one.
    #[must_use]
    pub fn with_id(mut self, id: EntityId) -> Self {
        self.id = id;
        self
    }

    /// Sets the provenance tag.
    #[must_use]
    pub const fn with_source(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    /// Produces the successor version authored by `user_id`, with this
    /// version as sole parent. Content and name start as copies; callers
    /// mutate them before storing.
    #[must_use]
    pub fn next_version(&self, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let now = Utc::now();
        Self {
            id: self.id.clone(),
            version: VersionId::after(&self.version, &user_id),
            entity_type: self.entity_type,
            name: self.name.clone(),
            content: self.content.clone(),
            source_type: self.source_type,
            user_id,
            parent_versions: vec![self.version.clone()],
            created_at: now,
            updated_at: now,
        }
    }

    /// Produces a tombstone version superseding this one.
    #[must_use]
    pub fn tombstone(&self, user_id: impl Into<String>) -> Self {
        let mut next = self.next_version(user_id);
        next.content.insert(TOMBSTONE_KEY.to_string(), Value::Bool(true));
        next
    }

    /// Returns true if this version marks the entity as deleted.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.content
            .get(TOMBSTONE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_version_id_shape() {
        let v = VersionId::from_parts(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 15, 42).unwrap(),
            "hub-1",
        );
        assert_eq!(v.as_str(), "2026-03-01T09:15:42.000000Z-hub-1");
        assert_eq!(v.writer(), "hub-1");
        assert_eq!(
            v.timestamp().unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 15, 42).unwrap()
        );
    }

    #[test]
    fn test_version_order_timestamp_dominates() {
        let earlier = VersionId::from_parts(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            "zz-writer",
        );
        let later = VersionId::from_parts(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 1).unwrap(),
            "aa-writer",
        );
        assert!(later > earlier);
    }

    #[test]
    fn test_version_order_writer_breaks_ties() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let a = VersionId::from_parts(ts, "alpha");
        let b = VersionId::from_parts(ts, "beta");
        assert!(b > a);
    }

    #[test]
    fn test_after_bumps_past_skewed_clock() {
        // A previous version written "in the future" relative to now.
        let future = Utc::now() + Duration::hours(1);
        let prev = VersionId::from_parts(future, "w1");
        let next = VersionId::after(&prev, "w1");
        assert!(next > prev, "successor must sort after {prev}");
        let delta = next.timestamp().unwrap() - prev.timestamp().unwrap();
        assert_eq!(delta.num_microseconds(), Some(1));
    }

    #[test]
    fn test_after_uses_wall_clock_when_ahead() {
        let past = Utc::now() - Duration::hours(1);
        let prev = VersionId::from_parts(past, "w1");
        let next = VersionId::after(&prev, "w1");
        assert!(next.timestamp().unwrap() > past + Duration::minutes(59));
    }

    #[test]
    fn test_version_parse_rejects_garbage() {
        assert!(VersionId::parse("not-a-version").is_err());
        assert!(VersionId::parse("2026-03-01T09:15:42.000000Z-hub").is_ok());
    }

    #[test]
    fn test_writer_with_hyphens_survives() {
        let v = VersionId::generate("device-42-bridge");
        assert_eq!(v.writer(), "device-42-bridge");
    }

    #[test]
    fn test_entity_type_parse() {
        assert_eq!(EntityType::parse("room"), Some(EntityType::Room));
        assert_eq!(EntityType::parse("ROOM"), Some(EntityType::Room));
        assert_eq!(EntityType::parse("automation"), Some(EntityType::Automation));
        assert_eq!(EntityType::parse("spaceship"), None);
        assert_eq!(EntityType::all().len(), 11);
    }

    #[test]
    fn test_next_version_links_parent() {
        let e = Entity::new(EntityType::Room, "Living Room", ValueMap::new(), "u1");
        let e2 = e.next_version("u2");
        assert_eq!(e2.id, e.id);
        assert_eq!(e2.parent_versions, vec![e.version.clone()]);
        assert!(e2.version > e.version);
        assert_eq!(e2.user_id, "u2");
        assert_eq!(e2.entity_type, EntityType::Room);
    }

    #[test]
    fn test_tombstone_marker() {
        let e = Entity::new(EntityType::Note, "scratch", ValueMap::new(), "u1");
        assert!(!e.is_tombstone());
        let dead = e.tombstone("u1");
        assert!(dead.is_tombstone());
        assert_eq!(dead.parent_versions, vec![e.version]);
    }
}
