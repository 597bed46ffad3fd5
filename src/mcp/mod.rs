//! MCP tool layer: named, schema-validated operations over the graph.
//!
//! Twelve tools are exposed. Each validates its arguments against a fixed
//! JSON schema, calls into the graph service, and returns a uniform
//! `{ok, value|error}` envelope whose error kinds are the crate's stable
//! error taxonomy.

mod definitions;
mod tools;

pub use definitions::all_tools;
pub use tools::{Scope, ToolName, ToolRegistry};

use serde::Serialize;

/// A tool's name, human description, and JSON input schema.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// Tool name as dispatched.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the arguments object.
    pub input_schema: serde_json::Value,
}

/// Stable error payload inside the envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    /// Stable machine-readable kind (see [`crate::Error::kind`]).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// The uniform tool response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    /// True when the call succeeded.
    pub ok: bool,
    /// Result value on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Error payload on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResponse {
    /// Wraps a successful value.
    #[must_use]
    pub const fn ok(value: serde_json::Value) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    /// Wraps an error, preserving its stable kind.
    #[must_use]
    pub fn err(error: &crate::Error) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(ToolError {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }),
        }
    }
}
