//! Typed directed edges between entity versions.

use crate::models::entity::{EntityId, VersionId};
use crate::models::value::ValueMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a relationship edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipId(String);

impl RelationshipId {
    /// Creates a relationship id from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh unique relationship id.
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

impl fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of edge between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// Entity is physically located in another (room in home, device in room).
    LocatedIn,
    /// Entity controls another (switch controls light).
    Controls,
    /// Inverse of `Controls`.
    ControlledBy,
    /// Rooms or zones are connected (doorway, hallway).
    ConnectsTo,
    /// Entity is a component of another.
    PartOf,
    /// Entity manages another (hub manages devices).
    Manages,
    /// Entity is documented by a manual or note.
    DocumentedBy,
    /// A procedure applies to an entity.
    ProcedureFor,
    /// An automation is triggered by an entity.
    TriggeredBy,
    /// Entity depends on another to function.
    DependsOn,
    /// Entity monitors another (sensor watches door).
    Monitors,
    /// Inverse of `Monitors`.
    MonitoredBy,
}

impl RelationshipType {
    /// Returns all relationship type variants.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::LocatedIn,
            Self::Controls,
            Self::ControlledBy,
            Self::ConnectsTo,
            Self::PartOf,
            Self::Manages,
            Self::DocumentedBy,
            Self::ProcedureFor,
            Self::TriggeredBy,
            Self::DependsOn,
            Self::Monitors,
            Self::MonitoredBy,
        ]
    }

    /// Returns the relationship type as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LocatedIn => "located_in",
            Self::Controls => "controls",
            Self::ControlledBy => "controlled_by",
            Self::ConnectsTo => "connects_to",
            Self::PartOf => "part_of",
            Self::Manages => "manages",
            Self::DocumentedBy => "documented_by",
            Self::ProcedureFor => "procedure_for",
            Self::TriggeredBy => "triggered_by",
            Self::DependsOn => "depends_on",
            Self::Monitors => "monitors",
            Self::MonitoredBy => "monitored_by",
        }
    }

    /// Returns the inverse relationship type, if defined.
    ///
    /// `ConnectsTo` is symmetric; the control/monitor pairs invert into each
    /// other; the hierarchy types have no materialized inverse.
    #[must_use]
    pub const fn inverse(&self) -> Option<Self> {
        match self {
            Self::ConnectsTo => Some(Self::ConnectsTo),
            Self::Controls => Some(Self::ControlledBy),
            Self::ControlledBy => Some(Self::Controls),
            Self::Monitors => Some(Self::MonitoredBy),
            Self::MonitoredBy => Some(Self::Monitors),
            Self::LocatedIn
            | Self::PartOf
            | Self::Manages
            | Self::DocumentedBy
            | Self::ProcedureFor
            | Self::TriggeredBy
            | Self::DependsOn => None,
        }
    }

    /// Returns true for the hierarchy types where cycles are rejected.
    #[must_use]
    pub const fn is_hierarchical(&self) -> bool {
        matches!(self, Self::LocatedIn | Self::PartOf)
    }

    /// Parses a relationship type from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "located_in" => Some(Self::LocatedIn),
            "controls" => Some(Self::Controls),
            "controlled_by" => Some(Self::ControlledBy),
            "connects_to" => Some(Self::ConnectsTo),
            "part_of" => Some(Self::PartOf),
            "manages" => Some(Self::Manages),
            "documented_by" => Some(Self::DocumentedBy),
            "procedure_for" => Some(Self::ProcedureFor),
            "triggered_by" => Some(Self::TriggeredBy),
            "depends_on" => Some(Self::DependsOn),
            "monitors" => Some(Self::Monitors),
            "monitored_by" => Some(Self::MonitoredBy),
            _ => None,
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RelationshipType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown relationship type: {s}"))
    }
}

/// A typed directed edge between two specific entity versions.
///
/// Endpoints pin a version, not just an id, so an edge created against one
/// snapshot of a device stays meaningful as the device evolves. Deletion is
/// hard: relationships carry no tombstones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRelationship {
    /// Stable edge identifier.
    pub id: RelationshipId,
    /// Source entity id.
    pub from_entity_id: EntityId,
    /// Source entity version.
    pub from_entity_version: VersionId,
    /// Target entity id.
    pub to_entity_id: EntityId,
    /// Target entity version.
    pub to_entity_version: VersionId,
    /// Edge type.
    pub relationship_type: RelationshipType,
    /// Free-form edge properties.
    pub properties: ValueMap,
    /// Author of the edge.
    pub user_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl EntityRelationship {
    /// Creates a new edge between two entity versions.
    #[must_use]
    pub fn new(
        from: (&EntityId, &VersionId),
        to: (&EntityId, &VersionId),
        relationship_type: RelationshipType,
        user_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RelationshipId::generate(),
            from_entity_id: from.0.clone(),
            from_entity_version: from.1.clone(),
            to_entity_id: to.0.clone(),
            to_entity_version: to.1.clone(),
            relationship_type,
            properties: ValueMap::new(),
            user_id: user_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the edge properties.
    #[must_use]
    pub fn with_properties(mut self, properties: ValueMap) -> Self {
        self.properties = properties;
        self
    }
}
