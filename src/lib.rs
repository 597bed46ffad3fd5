//! # Homegraph
//!
//! A local-first smart-home knowledge graph with bidirectional synchronization.
//!
//! A central server holds an authoritative copy of a versioned
//! entity-relationship graph describing a home (rooms, devices, zones,
//! procedures, automations). Clients keep local replicas that can be read and
//! mutated while disconnected and later reconciled through the Inbetweenies
//! sync protocol: delta-based, vector-clock-tracked, last-write-wins with an
//! opt-in field-aware merge.
//!
//! ## Subsystems
//!
//! - Versioned graph store: immutable entity versions with a typed
//!   relationship edge set, persisted in `SQLite` ([`storage`]).
//! - In-memory traversal index: BFS path finding, neighborhoods, similarity
//!   ([`graph`]).
//! - Inbetweenies sync: client engine and server service ([`sync`]).
//! - Security core: Argon2 admin login, QR guest enrollment, signed session
//!   tokens, per-IP rate limiting, structured audit log ([`security`]).
//! - MCP tool layer: twelve named, schema-validated graph operations
//!   ([`mcp`]).
//!
//! ## Example
//!
//! ```rust,ignore
//! use homegraph::services::GraphService;
//! use homegraph::storage::SqliteGraphStore;
//!
//! let store = SqliteGraphStore::new("home.db")?;
//! let service = GraphService::new(Arc::new(store));
//! let room = service.create_entity(EntityType::Room, "Living Room", content, "user-1")?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

use thiserror::Error as ThisError;

// Module declarations
pub mod cli;
pub mod config;
pub mod graph;
pub mod mcp;
pub mod models;
pub mod observability;
pub mod security;
pub mod services;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use config::HomeGraphConfig;
pub use models::{
    Entity, EntityId, EntityRelationship, EntityType, RelationshipId, RelationshipType,
    SourceType, Value, VectorClock, VersionId,
};
pub use services::GraphService;
pub use storage::{GraphStore, InMemoryGraphStore, SqliteGraphStore};

/// Error type for homegraph operations.
///
/// The kinds are stable across interfaces: the MCP envelope, the sync wire
/// protocol, and the CLI all surface [`Error::kind`] unchanged.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidArgument` | Malformed input, schema violation, rejected cycle |
/// | `NotFound` | Entity, relationship, or enrollment code unknown |
/// | `PermissionDenied` | Role lacks the required action |
/// | `ParentUnknown` | Version references a parent that does not exist |
/// | `TypeImmutable` | Version changes the entity type of an existing id |
/// | `TooManyRequests` | Rate limit exceeded; carries a retry hint |
/// | `Unauthorized` | Missing, invalid, or expired token |
/// | `StoreUnavailable` | Transient storage fault (retryable) |
/// | `ProtocolMismatch` | Unknown sync protocol version |
/// | `OperationFailed` | Non-retryable internal failure |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - Required tool arguments are missing or of the wrong type
    /// - A `(id, version)` pair is re-inserted with different content
    /// - A `located_in`/`part_of` relationship would form a cycle
    /// - A password fails the complexity rules on set
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An entity, relationship, or token subject was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's role lacks the capability for this operation.
    #[error("permission denied: {action} requires more than the {role} role")]
    PermissionDenied {
        /// The action that was refused.
        action: String,
        /// The role that attempted it.
        role: String,
    },

    /// A new entity version references an unknown parent version.
    #[error("unknown parent version {version} for entity {id}")]
    ParentUnknown {
        /// Entity id the version belongs to.
        id: String,
        /// The missing parent version.
        version: String,
    },

    /// A write attempted to change the entity type of an existing id.
    #[error("entity {id} is {existing}; type cannot change to {attempted}")]
    TypeImmutable {
        /// Entity id.
        id: String,
        /// The established entity type.
        existing: String,
        /// The rejected type.
        attempted: String,
    },

    /// Rate limit exceeded for this client.
    #[error("too many requests; retry after {retry_after_secs}s")]
    TooManyRequests {
        /// Seconds until the lockout expires.
        retry_after_secs: u64,
    },

    /// Authentication failed.
    ///
    /// Raised when:
    /// - The bearer token is missing or malformed
    /// - The signature does not validate under the current signing key
    /// - The token is expired or uses a refused algorithm
    /// - An enrollment code is replayed or expired
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Transient storage fault. Callers may retry with backoff.
    #[error("store unavailable during '{operation}': {cause}")]
    StoreUnavailable {
        /// The operation that hit the fault.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The peer spoke an unknown sync protocol version.
    #[error("protocol mismatch: expected {expected}, got {got}")]
    ProtocolMismatch {
        /// The protocol version this build speaks.
        expected: String,
        /// The version the peer sent.
        got: String,
    },

    /// A non-retryable internal failure.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Returns the stable machine-readable kind for this error.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::ParentUnknown { .. } => "parent_unknown",
            Self::TypeImmutable { .. } => "type_immutable",
            Self::TooManyRequests { .. } => "too_many_requests",
            Self::Unauthorized(_) => "unauthorized",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::ProtocolMismatch { .. } => "protocol_mismatch",
            Self::OperationFailed { .. } => "operation_failed",
        }
    }

    /// Returns true when a client may retry the operation with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::TooManyRequests { .. })
    }
}

/// Result type alias for homegraph operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in seconds.
///
/// Centralized so token issuance, audit records, and rate-limit bookkeeping
/// agree on one clock. Falls back to 0 if the system clock is before the
/// Unix epoch.
#[must_use]
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
