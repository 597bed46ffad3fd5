//! Tool definitions: JSON Schema for each of the twelve graph tools.

use super::ToolDefinition;

const ENTITY_TYPES: &[&str] = &[
    "home", "room", "device", "zone", "door", "window", "procedure", "manual", "note",
    "schedule", "automation",
];

const RELATIONSHIP_TYPES: &[&str] = &[
    "located_in",
    "controls",
    "controlled_by",
    "connects_to",
    "part_of",
    "manages",
    "documented_by",
    "procedure_for",
    "triggered_by",
    "depends_on",
    "monitors",
    "monitored_by",
];

/// Defines the `get_devices_in_room` tool.
pub fn get_devices_in_room_tool() -> ToolDefinition {
    ToolDefinition {
        name: "get_devices_in_room".to_string(),
        description: "List the devices located in a room".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "room_id": {
                    "type": "string",
                    "description": "Entity id of the room"
                }
            },
            "required": ["room_id"]
        }),
    }
}

/// Defines the `find_device_controls` tool.
pub fn find_device_controls_tool() -> ToolDefinition {
    ToolDefinition {
        name: "find_device_controls".to_string(),
        description: "List the capability descriptors a device exposes (from its content)"
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "device_id": {
                    "type": "string",
                    "description": "Entity id of the device"
                }
            },
            "required": ["device_id"]
        }),
    }
}

/// Defines the `get_room_connections` tool.
pub fn get_room_connections_tool() -> ToolDefinition {
    ToolDefinition {
        name: "get_room_connections".to_string(),
        description: "Rooms reachable from a room via connects_to edges or shared doors"
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "room_id": {
                    "type": "string",
                    "description": "Entity id of the room"
                }
            },
            "required": ["room_id"]
        }),
    }
}

/// Defines the `search_entities` tool.
pub fn search_entities_tool() -> ToolDefinition {
    ToolDefinition {
        name: "search_entities".to_string(),
        description: "Ranked substring search over entity names and content values".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search text"
                },
                "entity_types": {
                    "type": "array",
                    "items": { "type": "string", "enum": ENTITY_TYPES },
                    "description": "Optional: restrict to these entity types"
                }
            },
            "required": ["query"]
        }),
    }
}

/// Defines the `create_entity` tool.
pub fn create_entity_tool() -> ToolDefinition {
    ToolDefinition {
        name: "create_entity".to_string(),
        description: "Create a new entity (initial version)".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "entity_type": {
                    "type": "string",
                    "enum": ENTITY_TYPES,
                    "description": "Kind of entity"
                },
                "name": {
                    "type": "string",
                    "description": "Human label (may be empty)"
                },
                "content": {
                    "type": "object",
                    "description": "Free-form content map"
                },
                "user_id": {
                    "type": "string",
                    "description": "Author of the version"
                }
            },
            "required": ["entity_type", "name", "user_id"]
        }),
    }
}

/// Defines the `create_relationship` tool.
pub fn create_relationship_tool() -> ToolDefinition {
    ToolDefinition {
        name: "create_relationship".to_string(),
        description: "Create a typed edge between the latest versions of two entities"
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "from": {
                    "type": "string",
                    "description": "Source entity id"
                },
                "to": {
                    "type": "string",
                    "description": "Target entity id"
                },
                "type": {
                    "type": "string",
                    "enum": RELATIONSHIP_TYPES,
                    "description": "Edge type"
                },
                "properties": {
                    "type": "object",
                    "description": "Optional edge properties"
                },
                "user_id": {
                    "type": "string",
                    "description": "Author of the edge"
                }
            },
            "required": ["from", "to", "type", "user_id"]
        }),
    }
}

/// Defines the `find_path` tool.
pub fn find_path_tool() -> ToolDefinition {
    ToolDefinition {
        name: "find_path".to_string(),
        description: "Shortest path between two entities as an ordered id list ([] when none)"
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "from_id": {
                    "type": "string",
                    "description": "Start entity id"
                },
                "to_id": {
                    "type": "string",
                    "description": "Goal entity id"
                },
                "max_depth": {
                    "type": "integer",
                    "description": "Hop limit (default: 10)",
                    "minimum": 1,
                    "maximum": 64
                }
            },
            "required": ["from_id", "to_id"]
        }),
    }
}

/// Defines the `get_entity_details` tool.
pub fn get_entity_details_tool() -> ToolDefinition {
    ToolDefinition {
        name: "get_entity_details".to_string(),
        description: "An entity's latest version plus its incoming and outgoing relationships"
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "string",
                    "description": "Entity id"
                }
            },
            "required": ["id"]
        }),
    }
}

/// Defines the `find_similar_entities` tool.
pub fn find_similar_entities_tool() -> ToolDefinition {
    ToolDefinition {
        name: "find_similar_entities".to_string(),
        description: "Same-type entities ranked by content-key overlap, with scores".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "string",
                    "description": "Entity id to compare against"
                },
                "top_k": {
                    "type": "integer",
                    "description": "Maximum results (default: 5)",
                    "minimum": 1,
                    "maximum": 50
                }
            },
            "required": ["id"]
        }),
    }
}

/// Defines the `get_procedures_for_device` tool.
pub fn get_procedures_for_device_tool() -> ToolDefinition {
    ToolDefinition {
        name: "get_procedures_for_device".to_string(),
        description: "Procedures linked to a device via procedure_for".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "device_id": {
                    "type": "string",
                    "description": "Entity id of the device"
                }
            },
            "required": ["device_id"]
        }),
    }
}

/// Defines the `get_automations_in_room` tool.
pub fn get_automations_in_room_tool() -> ToolDefinition {
    ToolDefinition {
        name: "get_automations_in_room".to_string(),
        description: "Automations linked to a room or to the devices in it".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "room_id": {
                    "type": "string",
                    "description": "Entity id of the room"
                }
            },
            "required": ["room_id"]
        }),
    }
}

/// Defines the `update_entity` tool.
pub fn update_entity_tool() -> ToolDefinition {
    ToolDefinition {
        name: "update_entity".to_string(),
        description: "Append a new version of an entity; its parent is the current latest. \
                      A null value removes the key."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "string",
                    "description": "Entity id"
                },
                "changes": {
                    "type": "object",
                    "description": "Content keys to upsert (null removes)"
                },
                "name": {
                    "type": "string",
                    "description": "Optional new name"
                },
                "user_id": {
                    "type": "string",
                    "description": "Author of the version"
                }
            },
            "required": ["id", "changes", "user_id"]
        }),
    }
}

/// Returns every tool definition in dispatch order.
#[must_use]
pub fn all_tools() -> Vec<ToolDefinition> {
    vec![
        get_devices_in_room_tool(),
        find_device_controls_tool(),
        get_room_connections_tool(),
        search_entities_tool(),
        create_entity_tool(),
        create_relationship_tool(),
        find_path_tool(),
        get_entity_details_tool(),
        find_similar_entities_tool(),
        get_procedures_for_device_tool(),
        get_automations_in_room_tool(),
        update_entity_tool(),
    ]
}
