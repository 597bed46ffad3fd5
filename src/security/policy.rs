//! Role-based access policy.
//!
//! Two roles exist: `admin` (full read/write, user management, guest
//! issuance) and `guest` (read-only over a configurable entity-type set).
//! Every operation declares a required [`Action`]; the enforcement point
//! refuses anything the role's permission set does not contain.

use crate::models::EntityType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Subject roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full access, user management, guest issuance.
    Admin,
    /// Read-only over the configured entity types.
    Guest,
}

impl Role {
    /// Returns all roles.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Admin, Self::Guest]
    }

    /// Returns the role as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Guest => "guest",
        }
    }

    /// Parses a role from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "guest" => Some(Self::Guest),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Actions an operation can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Read entities, relationships, traversals, search.
    Read,
    /// Create or update entities and relationships.
    Write,
    /// Tombstone entities, hard-delete relationships.
    Delete,
    /// Run a sync exchange.
    Sync,
    /// Generate guest enrollment artifacts.
    IssueGuestAccess,
    /// Manage user accounts.
    ManageUsers,
    /// Read the audit stream.
    ViewAudit,
}

impl Action {
    /// Returns all actions.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Read,
            Self::Write,
            Self::Delete,
            Self::Sync,
            Self::IssueGuestAccess,
            Self::ManageUsers,
            Self::ViewAudit,
        ]
    }

    /// Returns the action as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Sync => "sync",
            Self::IssueGuestAccess => "issue_guest_access",
            Self::ManageUsers => "manage_users",
            Self::ViewAudit => "view_audit",
        }
    }

    /// The permission string a guest token must carry for this action.
    /// Coarser than the action set: every read-shaped action maps to
    /// `read`, every mutation to `write`.
    #[must_use]
    pub const fn required_permission(&self) -> &'static str {
        match self {
            Self::Read | Self::ViewAudit => "read",
            Self::Write | Self::Delete => "write",
            Self::Sync => "sync",
            Self::IssueGuestAccess | Self::ManageUsers => "admin",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role and permission enforcement.
#[derive(Debug, Clone)]
pub struct AccessControl {
    role_actions: HashMap<Role, HashSet<Action>>,
    /// Entity types a guest may read.
    guest_readable_types: HashSet<EntityType>,
}

impl AccessControl {
    /// Creates the default policy: admin gets everything, guests get
    /// read-only over every entity type.
    #[must_use]
    pub fn new() -> Self {
        let mut role_actions = HashMap::new();
        role_actions.insert(Role::Admin, Action::all().iter().copied().collect());
        role_actions.insert(Role::Guest, HashSet::from([Action::Read]));
        Self {
            role_actions,
            guest_readable_types: EntityType::all().iter().copied().collect(),
        }
    }

    /// Restricts the entity types guests may read.
    #[must_use]
    pub fn with_guest_readable_types(
        mut self,
        types: impl IntoIterator<Item = EntityType>,
    ) -> Self {
        self.guest_readable_types = types.into_iter().collect();
        self
    }

    /// Returns true if `role` may perform `action`.
    #[must_use]
    pub fn allows(&self, role: Role, action: Action) -> bool {
        self.role_actions
            .get(&role)
            .is_some_and(|actions| actions.contains(&action))
    }

    /// Refuses with `PermissionDenied` unless `role` may perform `action`.
    pub fn check(&self, role: Role, action: Action) -> Result<()> {
        if self.allows(role, action) {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                action: action.to_string(),
                role: role.to_string(),
            })
        }
    }

    /// Returns true if guests may read entities of `entity_type`.
    #[must_use]
    pub fn guest_can_read_type(&self, entity_type: EntityType) -> bool {
        self.guest_readable_types.contains(&entity_type)
    }

    /// The actions granted to `role`.
    #[must_use]
    pub fn actions_for(&self, role: Role) -> Vec<Action> {
        let mut actions: Vec<Action> = self
            .role_actions
            .get(&role)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        actions.sort_by_key(Action::as_str);
        actions
    }
}

impl Default for AccessControl {
    fn default() -> Self {
        Self::new()
    }
}
