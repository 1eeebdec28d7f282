//! Role resolution and the per-operation access gate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Identifier;

/// Effective role of a user on one document.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Creator of the document, or the reserved admin identity.
    Owner,
    /// Granted read and write access.
    Editor,
    /// Granted read-only access.
    Viewer,
    /// No entry in the permission table.
    Guest,
}

impl Role {
    /// Whether this role may read document content.
    pub fn can_view(self) -> bool {
        !matches!(self, Role::Guest)
    }

    /// Whether this role may submit edits.
    pub fn can_edit(self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }

    /// Whether this role may grant or revoke roles.
    pub fn can_share(self) -> bool {
        self == Role::Owner
    }

    /// Whether this role may destroy the document.
    pub fn can_delete(self) -> bool {
        self == Role::Owner
    }
}

/// Outcome of the gate for one user on one document.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct AccessCheck {
    /// Whether any capability at all was granted.
    pub has_access: bool,
    /// The resolved role.
    pub role: Role,
    /// Read capability.
    pub can_view: bool,
    /// Write capability.
    pub can_edit: bool,
}

impl AccessCheck {
    fn granted(role: Role) -> Self {
        Self {
            has_access: true,
            role,
            can_view: role.can_view(),
            can_edit: role.can_edit(),
        }
    }

    fn denied() -> Self {
        Self {
            has_access: false,
            role: Role::Guest,
            can_view: false,
            can_edit: false,
        }
    }
}

/// Rejections from the gate and from role mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    /// No such document.
    #[error("document not found")]
    NotFound,
    /// The acting user lacks the required capability.
    #[error("insufficient role")]
    Denied,
    /// The target of a role mutation is not a usable identity.
    #[error("unknown target user")]
    InvalidTarget,
    /// Attempt to mutate the admin identity or reassign ownership.
    #[error("target role is protected")]
    Protected,
    /// The durable store rejected the write; the mutation was not applied.
    #[error("transient store error")]
    Store,
}

/// Resolves the effective role of `user` on a document.
///
/// The admin identity and the document owner short-circuit to owner; other
/// users resolve through the permission table, defaulting to guest.
pub fn evaluate(
    owner: &Identifier,
    permissions: &HashMap<Identifier, Role>,
    user: &Identifier,
    admin: &Identifier,
) -> AccessCheck {
    if user == admin || user == owner {
        return AccessCheck::granted(Role::Owner);
    }
    match permissions.get(user).copied() {
        None | Some(Role::Guest) => AccessCheck::denied(),
        Some(role) => AccessCheck::granted(role),
    }
}

/// Mutates the permission table, enforcing the sharing rules.
///
/// Only a principal resolving to owner may alter roles. Granting guest
/// removes the entry. The admin identity and the current owner cannot be
/// re-ranked, and ownership cannot be handed out through this path.
pub fn set_role(
    owner: &Identifier,
    permissions: &mut HashMap<Identifier, Role>,
    actor: &Identifier,
    target: &Identifier,
    role: Role,
    admin: &Identifier,
) -> Result<(), GateError> {
    let actor_check = evaluate(owner, permissions, actor, admin);
    if !actor_check.role.can_share() {
        return Err(GateError::Denied);
    }
    if target.as_ref().is_empty() {
        return Err(GateError::InvalidTarget);
    }
    if target == owner || role == Role::Owner {
        return Err(GateError::Protected);
    }
    if target == admin && actor != admin {
        return Err(GateError::Protected);
    }
    if role == Role::Guest {
        permissions.remove(target);
    } else {
        permissions.insert(target.clone(), role);
    }
    Ok(())
}
