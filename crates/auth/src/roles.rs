use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Role identifier supplied by the authorization oracle.
///
/// Roles are opaque strings at this layer; only platform-wide administration
/// changes how scopes resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    /// Platform-wide administrator. May create SYSTEM records and reads
    /// everything.
    pub const SUPER_ADMIN: Role = Role(Cow::Borrowed("super_admin"));
    pub const TENANT_ADMIN: Role = Role(Cow::Borrowed("tenant_admin"));
    pub const ORG_ADMIN: Role = Role(Cow::Borrowed("org_admin"));
    pub const ORG_MEMBER: Role = Role(Cow::Borrowed("org_member"));
    pub const USER: Role = Role(Cow::Borrowed("user"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_platform_admin(&self) -> bool {
        self.as_str() == Self::SUPER_ADMIN.as_str()
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
