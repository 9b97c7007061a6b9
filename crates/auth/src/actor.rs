use serde::{Deserialize, Serialize};

use riskbatch_core::{OrganizationId, UserId};

use crate::Role;

/// An authenticated caller, as resolved by the authorization oracle.
///
/// This engine never authenticates requests itself; it trusts the roles and
/// organization membership carried here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub roles: Vec<Role>,
    pub organization_id: Option<OrganizationId>,
}

impl Actor {
    pub fn new(user_id: UserId, roles: Vec<Role>, organization_id: Option<OrganizationId>) -> Self {
        Self {
            user_id,
            roles,
            organization_id,
        }
    }

    /// A plain user with no organization.
    pub fn individual(user_id: UserId) -> Self {
        Self::new(user_id, vec![Role::USER], None)
    }

    /// A member of `organization_id`.
    pub fn member_of(user_id: UserId, organization_id: OrganizationId) -> Self {
        Self::new(user_id, vec![Role::ORG_MEMBER], Some(organization_id))
    }

    /// A platform administrator acting outside any organization.
    pub fn platform_admin(user_id: UserId) -> Self {
        Self::new(user_id, vec![Role::SUPER_ADMIN], None)
    }

    pub fn is_platform_admin(&self) -> bool {
        self.roles.iter().any(Role::is_platform_admin)
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Whether the actor may manage resources owned by `organization_id`
    /// (for example, cancel a colleague's job).
    pub fn administers(&self, organization_id: OrganizationId) -> bool {
        if self.is_platform_admin() {
            return true;
        }
        self.organization_id == Some(organization_id)
            && (self.has_role(&Role::ORG_ADMIN) || self.has_role(&Role::TENANT_ADMIN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn org_admin_administers_only_its_own_organization() {
        let org = OrganizationId::new();
        let admin = Actor::new(UserId::new(), vec![Role::ORG_ADMIN], Some(org));
        assert!(admin.administers(org));
        assert!(!admin.administers(OrganizationId::new()));

        let member = Actor::member_of(UserId::new(), org);
        assert!(!member.administers(org));
        assert!(Actor::platform_admin(UserId::new()).administers(org));
    }
}
