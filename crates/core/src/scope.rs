//! Visibility scopes stamped on every record a job creates.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{OrganizationId, UserId};

/// A resolved visibility scope.
///
/// A scope is bound to the identity that owns it, so it can be used directly
/// as part of a uniqueness key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "visibility", rename_all = "snake_case")]
pub enum Scope {
    Personal { owner: UserId },
    Organization { organization_id: OrganizationId },
    System,
}

impl Scope {
    pub fn organization_id(&self) -> Option<OrganizationId> {
        match self {
            Scope::Organization { organization_id } => Some(*organization_id),
            _ => None,
        }
    }

    /// Stable textual key used in storage uniqueness constraints.
    ///
    /// Format: `system`, `org:<uuid>` or `user:<uuid>`.
    pub fn key(&self) -> String {
        match self {
            Scope::Personal { owner } => format!("user:{owner}"),
            Scope::Organization { organization_id } => format!("org:{organization_id}"),
            Scope::System => "system".to_string(),
        }
    }

    /// Inverse of [`Scope::key`].
    pub fn from_key(key: &str) -> Result<Self, DomainError> {
        if key == "system" {
            return Ok(Scope::System);
        }
        if let Some(rest) = key.strip_prefix("org:") {
            return Ok(Scope::Organization {
                organization_id: rest.parse()?,
            });
        }
        if let Some(rest) = key.strip_prefix("user:") {
            return Ok(Scope::Personal { owner: rest.parse()? });
        }
        Err(DomainError::invalid_id(format!("unknown scope key '{key}'")))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
