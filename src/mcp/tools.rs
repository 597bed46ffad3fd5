//! Tool dispatch and handlers.
//!
//! Dispatch goes through a typed [`ToolName`] rather than string matching
//! in handlers; unknown names are captured for error reporting. Handlers
//! validate arguments, call the graph service, and serialize results into
//! the envelope.

use super::{ToolDefinition, ToolResponse};
use crate::graph::Direction;
use crate::models::{EntityId, EntityType, RelationshipType, SourceType, Value, ValueMap};
use crate::security::{Action, Claims, Role};
use crate::services::GraphService;
use crate::{Error, Result};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::instrument;

/// Default hop limit for `find_path`.
const DEFAULT_MAX_DEPTH: usize = 10;

/// Default result count for `find_similar_entities`.
const DEFAULT_TOP_K: usize = 5;

/// Tool identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ToolName {
    /// Devices located in a room.
    GetDevicesInRoom,
    /// Capability descriptors of a device.
    FindDeviceControls,
    /// Rooms reachable from a room.
    GetRoomConnections,
    /// Ranked entity search.
    SearchEntities,
    /// Create an entity.
    CreateEntity,
    /// Create a relationship.
    CreateRelationship,
    /// Shortest path between entities.
    FindPath,
    /// Entity plus incident edges.
    GetEntityDetails,
    /// Similar same-type entities.
    FindSimilarEntities,
    /// Procedures for a device.
    GetProceduresForDevice,
    /// Automations in a room.
    GetAutomationsInRoom,
    /// Append an entity version.
    UpdateEntity,
    /// Unknown tool (for error reporting).
    Unknown(String),
}

impl ToolName {
    /// Returns the dispatch name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::GetDevicesInRoom => "get_devices_in_room",
            Self::FindDeviceControls => "find_device_controls",
            Self::GetRoomConnections => "get_room_connections",
            Self::SearchEntities => "search_entities",
            Self::CreateEntity => "create_entity",
            Self::CreateRelationship => "create_relationship",
            Self::FindPath => "find_path",
            Self::GetEntityDetails => "get_entity_details",
            Self::FindSimilarEntities => "find_similar_entities",
            Self::GetProceduresForDevice => "get_procedures_for_device",
            Self::GetAutomationsInRoom => "get_automations_in_room",
            Self::UpdateEntity => "update_entity",
            Self::Unknown(s) => s.as_str(),
        }
    }

    /// Returns all known tools.
    #[must_use]
    pub const fn known() -> &'static [Self] {
        &[
            Self::GetDevicesInRoom,
            Self::FindDeviceControls,
            Self::GetRoomConnections,
            Self::SearchEntities,
            Self::CreateEntity,
            Self::CreateRelationship,
            Self::FindPath,
            Self::GetEntityDetails,
            Self::FindSimilarEntities,
            Self::GetProceduresForDevice,
            Self::GetAutomationsInRoom,
            Self::UpdateEntity,
        ]
    }

    /// The action the access policy requires for this tool. Unknown tools
    /// map to `ManageUsers` so they are denied for everyone but admins
    /// and still fail dispatch afterwards.
    #[must_use]
    pub const fn required_action(&self) -> Action {
        match self {
            Self::GetDevicesInRoom
            | Self::FindDeviceControls
            | Self::GetRoomConnections
            | Self::SearchEntities
            | Self::FindPath
            | Self::GetEntityDetails
            | Self::FindSimilarEntities
            | Self::GetProceduresForDevice
            | Self::GetAutomationsInRoom => Action::Read,
            Self::CreateEntity | Self::CreateRelationship | Self::UpdateEntity => Action::Write,
            Self::Unknown(_) => Action::ManageUsers,
        }
    }
}

impl From<&str> for ToolName {
    fn from(s: &str) -> Self {
        match s {
            "get_devices_in_room" => Self::GetDevicesInRoom,
            "find_device_controls" => Self::FindDeviceControls,
            "get_room_connections" => Self::GetRoomConnections,
            "search_entities" => Self::SearchEntities,
            "create_entity" => Self::CreateEntity,
            "create_relationship" => Self::CreateRelationship,
            "find_path" => Self::FindPath,
            "get_entity_details" => Self::GetEntityDetails,
            "find_similar_entities" => Self::FindSimilarEntities,
            "get_procedures_for_device" => Self::GetProceduresForDevice,
            "get_automations_in_room" => Self::GetAutomationsInRoom,
            "update_entity" => Self::UpdateEntity,
            unknown => Self::Unknown(unknown.to_string()),
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the caller is allowed to see.
#[derive(Debug, Clone)]
pub enum Scope {
    /// Everything.
    Full,
    /// Read-only over the given entity types (guest tokens).
    ReadOnly(HashSet<EntityType>),
}

impl Scope {
    /// Builds the scope for a verified subject.
    #[must_use]
    pub fn for_claims(claims: &Claims, policy: &crate::security::AccessControl) -> Self {
        match claims.role {
            Role::Admin => Self::Full,
            Role::Guest => Self::ReadOnly(
                EntityType::all()
                    .iter()
                    .copied()
                    .filter(|t| policy.guest_can_read_type(*t))
                    .collect(),
            ),
        }
    }

    /// Returns true when entities of `entity_type` are visible.
    #[must_use]
    pub fn allows(&self, entity_type: EntityType) -> bool {
        match self {
            Self::Full => true,
            Self::ReadOnly(types) => types.contains(&entity_type),
        }
    }
}

/// Dispatches tool calls against the graph service.
pub struct ToolRegistry {
    graph: Arc<GraphService>,
}

impl ToolRegistry {
    /// Creates a registry over a graph service.
    #[must_use]
    pub fn new(graph: Arc<GraphService>) -> Self {
        Self { graph }
    }

    /// The definitions of every exposed tool.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        super::definitions::all_tools()
    }

    /// Calls a tool by name. Arguments must be a JSON object matching the
    /// tool's schema; results and errors travel in the uniform envelope.
    #[instrument(skip(self, args, scope), fields(tool = name))]
    pub fn call(&self, name: &str, args: &serde_json::Value, scope: &Scope) -> ToolResponse {
        let tool = ToolName::from(name);
        let result = self.dispatch(&tool, args, scope);
        match result {
            Ok(value) => ToolResponse::ok(value),
            Err(e) => {
                tracing::debug!(tool = %tool, error = %e, "tool call failed");
                metrics::counter!("homegraph_tool_errors_total").increment(1);
                ToolResponse::err(&e)
            },
        }
    }

    fn dispatch(
        &self,
        tool: &ToolName,
        args: &serde_json::Value,
        scope: &Scope,
    ) -> Result<serde_json::Value> {
        if !args.is_object() && !args.is_null() {
            return Err(Error::InvalidArgument(
                "tool arguments must be an object".to_string(),
            ));
        }

        match tool {
            ToolName::GetDevicesInRoom => self.get_devices_in_room(args, scope),
            ToolName::FindDeviceControls => self.find_device_controls(args, scope),
            ToolName::GetRoomConnections => self.get_room_connections(args, scope),
            ToolName::SearchEntities => self.search_entities(args, scope),
            ToolName::CreateEntity => self.create_entity(args),
            ToolName::CreateRelationship => self.create_relationship(args),
            ToolName::FindPath => self.find_path(args),
            ToolName::GetEntityDetails => self.get_entity_details(args, scope),
            ToolName::FindSimilarEntities => self.find_similar_entities(args, scope),
            ToolName::GetProceduresForDevice => self.get_procedures_for_device(args, scope),
            ToolName::GetAutomationsInRoom => self.get_automations_in_room(args, scope),
            ToolName::UpdateEntity => self.update_entity(args),
            ToolName::Unknown(name) => {
                Err(Error::NotFound(format!("tool {name} is not exposed")))
            },
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn get_devices_in_room(
        &self,
        args: &serde_json::Value,
        scope: &Scope,
    ) -> Result<serde_json::Value> {
        let room_id = required_entity_id(args, "room_id")?;
        self.require_visible(&room_id, scope)?;
        let devices: Vec<_> = self
            .graph
            .neighbors(&room_id, Direction::Incoming, Some(RelationshipType::LocatedIn))
            .into_iter()
            .filter(|e| e.entity_type == EntityType::Device)
            .filter(|e| scope.allows(e.entity_type))
            .collect();
        to_json(&devices)
    }

    fn find_device_controls(
        &self,
        args: &serde_json::Value,
        scope: &Scope,
    ) -> Result<serde_json::Value> {
        let device_id = required_entity_id(args, "device_id")?;
        let device = self
            .graph
            .get_entity(&device_id, None)?
            .filter(|e| !e.is_tombstone())
            .ok_or_else(|| Error::NotFound(format!("entity {device_id}")))?;
        if !scope.allows(device.entity_type) {
            return Err(Error::NotFound(format!("entity {device_id}")));
        }

        // Capability descriptors live in content under these keys.
        let mut controls: Vec<Value> = Vec::new();
        for key in ["capabilities", "controls", "services"] {
            if let Some(Value::List(items)) = device.content.get(key) {
                controls.extend(items.iter().cloned());
            }
        }
        to_json(&controls)
    }

    fn get_room_connections(
        &self,
        args: &serde_json::Value,
        scope: &Scope,
    ) -> Result<serde_json::Value> {
        let room_id = required_entity_id(args, "room_id")?;
        self.require_visible(&room_id, scope)?;

        let mut seen: HashSet<EntityId> = HashSet::from([room_id.clone()]);
        let mut rooms = Vec::new();

        for neighbor in self.graph.neighbors(
            &room_id,
            Direction::Both,
            Some(RelationshipType::ConnectsTo),
        ) {
            match neighbor.entity_type {
                EntityType::Room if seen.insert(neighbor.id.clone()) => rooms.push(neighbor),
                // A door connects onward to its other room.
                EntityType::Door => {
                    for beyond in self.graph.neighbors(
                        &neighbor.id,
                        Direction::Both,
                        Some(RelationshipType::ConnectsTo),
                    ) {
                        if beyond.entity_type == EntityType::Room
                            && seen.insert(beyond.id.clone())
                        {
                            rooms.push(beyond);
                        }
                    }
                },
                _ => {},
            }
        }

        let rooms: Vec<_> = rooms
            .into_iter()
            .filter(|e| scope.allows(e.entity_type))
            .collect();
        to_json(&rooms)
    }

    fn search_entities(
        &self,
        args: &serde_json::Value,
        scope: &Scope,
    ) -> Result<serde_json::Value> {
        let query = required_str(args, "query")?;
        let types = optional_entity_types(args, "entity_types")?;
        let hits: Vec<_> = self
            .graph
            .search(&query, &types)?
            .into_iter()
            .filter(|hit| scope.allows(hit.entity.entity_type))
            .collect();
        to_json(&hits)
    }

    fn create_entity(&self, args: &serde_json::Value) -> Result<serde_json::Value> {
        let entity_type = required_entity_type(args, "entity_type")?;
        let name = required_str(args, "name")?;
        let user_id = required_str(args, "user_id")?;
        let content = optional_map(args, "content")?;
        let entity = self.graph.create_entity(
            entity_type,
            &name,
            content,
            &user_id,
            SourceType::Manual,
        )?;
        to_json(&entity)
    }

    fn create_relationship(&self, args: &serde_json::Value) -> Result<serde_json::Value> {
        let from = required_entity_id(args, "from")?;
        let to = required_entity_id(args, "to")?;
        let rel_type = required_str(args, "type")?;
        let rel_type = RelationshipType::parse(&rel_type)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown relationship type {rel_type}")))?;
        let user_id = required_str(args, "user_id")?;
        let properties = optional_map(args, "properties")?;
        let relationship =
            self.graph
                .create_relationship(&from, &to, rel_type, properties, &user_id)?;
        to_json(&relationship)
    }

    fn find_path(&self, args: &serde_json::Value) -> Result<serde_json::Value> {
        let from = required_entity_id(args, "from_id")?;
        let to = required_entity_id(args, "to_id")?;
        let max_depth = optional_usize(args, "max_depth")?.unwrap_or(DEFAULT_MAX_DEPTH);
        let path = self.graph.find_path(&from, &to, max_depth);
        to_json(&path)
    }

    fn get_entity_details(
        &self,
        args: &serde_json::Value,
        scope: &Scope,
    ) -> Result<serde_json::Value> {
        let id = required_entity_id(args, "id")?;
        let details = self.graph.entity_details(&id)?;
        if !scope.allows(details.entity.entity_type) {
            return Err(Error::NotFound(format!("entity {id}")));
        }
        Ok(serde_json::json!({
            "entity": serde_json::to_value(&details.entity).map_err(json_err)?,
            "incoming": serde_json::to_value(&details.incoming).map_err(json_err)?,
            "outgoing": serde_json::to_value(&details.outgoing).map_err(json_err)?,
        }))
    }

    fn find_similar_entities(
        &self,
        args: &serde_json::Value,
        scope: &Scope,
    ) -> Result<serde_json::Value> {
        let id = required_entity_id(args, "id")?;
        self.require_visible(&id, scope)?;
        let top_k = optional_usize(args, "top_k")?.unwrap_or(DEFAULT_TOP_K);
        let similar: Vec<serde_json::Value> = self
            .graph
            .find_similar(&id, top_k)
            .into_iter()
            .filter(|(e, _)| scope.allows(e.entity_type))
            .map(|(entity, score)| {
                Ok(serde_json::json!({
                    "entity": serde_json::to_value(&entity).map_err(json_err)?,
                    "score": score,
                }))
            })
            .collect::<Result<_>>()?;
        Ok(serde_json::Value::Array(similar))
    }

    fn get_procedures_for_device(
        &self,
        args: &serde_json::Value,
        scope: &Scope,
    ) -> Result<serde_json::Value> {
        let device_id = required_entity_id(args, "device_id")?;
        self.require_visible(&device_id, scope)?;
        let procedures: Vec<_> = self
            .graph
            .neighbors(
                &device_id,
                Direction::Incoming,
                Some(RelationshipType::ProcedureFor),
            )
            .into_iter()
            .filter(|e| e.entity_type == EntityType::Procedure)
            .filter(|e| scope.allows(e.entity_type))
            .collect();
        to_json(&procedures)
    }

    fn get_automations_in_room(
        &self,
        args: &serde_json::Value,
        scope: &Scope,
    ) -> Result<serde_json::Value> {
        let room_id = required_entity_id(args, "room_id")?;
        self.require_visible(&room_id, scope)?;

        let mut seen: HashSet<EntityId> = HashSet::new();
        let mut automations = Vec::new();

        // Automations tied to the room directly, or to a device in it.
        let mut subjects = vec![room_id.clone()];
        subjects.extend(
            self.graph
                .neighbors(&room_id, Direction::Incoming, Some(RelationshipType::LocatedIn))
                .into_iter()
                .filter(|e| e.entity_type == EntityType::Device)
                .map(|e| e.id),
        );

        for subject in subjects {
            for neighbor in self.graph.neighbors(&subject, Direction::Both, None) {
                if neighbor.entity_type == EntityType::Automation
                    && scope.allows(neighbor.entity_type)
                    && seen.insert(neighbor.id.clone())
                {
                    automations.push(neighbor);
                }
            }
        }
        to_json(&automations)
    }

    fn update_entity(&self, args: &serde_json::Value) -> Result<serde_json::Value> {
        let id = required_entity_id(args, "id")?;
        let user_id = required_str(args, "user_id")?;
        let changes = required_map(args, "changes")?;
        let name = optional_str(args, "name")?;
        let entity = self
            .graph
            .update_entity(&id, changes, name.as_deref(), &user_id)?;
        to_json(&entity)
    }

    fn require_visible(&self, id: &EntityId, scope: &Scope) -> Result<()> {
        let entity = self
            .graph
            .get_entity(id, None)?
            .filter(|e| !e.is_tombstone())
            .ok_or_else(|| Error::NotFound(format!("entity {id}")))?;
        if scope.allows(entity.entity_type) {
            Ok(())
        } else {
            // A guest cannot learn whether out-of-scope entities exist.
            Err(Error::NotFound(format!("entity {id}")))
        }
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

fn json_err(e: serde_json::Error) -> Error {
    Error::OperationFailed {
        operation: "serialize_tool_result".to_string(),
        cause: e.to_string(),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(json_err)
}

fn required_str(args: &serde_json::Value, key: &str) -> Result<String> {
    args.get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidArgument(format!("missing required string argument {key}")))
}

fn optional_str(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(Error::InvalidArgument(format!(
            "argument {key} must be a string"
        ))),
    }
}

fn required_entity_id(args: &serde_json::Value, key: &str) -> Result<EntityId> {
    Ok(EntityId::new(required_str(args, key)?))
}

fn required_entity_type(args: &serde_json::Value, key: &str) -> Result<EntityType> {
    let raw = required_str(args, key)?;
    EntityType::parse(&raw)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown entity type {raw}")))
}

fn optional_entity_types(args: &serde_json::Value, key: &str) -> Result<Vec<EntityType>> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .and_then(EntityType::parse)
                    .ok_or_else(|| {
                        Error::InvalidArgument(format!("bad entity type in {key}: {item}"))
                    })
            })
            .collect(),
        Some(_) => Err(Error::InvalidArgument(format!(
            "argument {key} must be an array of entity types"
        ))),
    }
}

fn optional_usize(args: &serde_json::Value, key: &str) -> Result<Option<usize>> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
            .map(Some)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("argument {key} must be a non-negative integer"))
            }),
    }
}

fn map_from_value(value: &serde_json::Value, key: &str) -> Result<ValueMap> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::InvalidArgument(format!("argument {key} must be an object: {e}")))
}

fn required_map(args: &serde_json::Value, key: &str) -> Result<ValueMap> {
    let value = args
        .get(key)
        .ok_or_else(|| Error::InvalidArgument(format!("missing required object argument {key}")))?;
    if !value.is_object() {
        return Err(Error::InvalidArgument(format!(
            "argument {key} must be an object"
        )));
    }
    map_from_value(value, key)
}

fn optional_map(args: &serde_json::Value, key: &str) -> Result<ValueMap> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(ValueMap::new()),
        Some(value) if value.is_object() => map_from_value(value, key),
        Some(_) => Err(Error::InvalidArgument(format!(
            "argument {key} must be an object"
        ))),
    }
}
