use serde::Serialize;

use riskbatch_core::{OrganizationId, Scope, UserId};

use crate::Actor;

/// Compute the scope stamped on every record a job submitted by `actor`
/// creates.
///
/// - No IO
/// - No panics
/// - Platform administrators outside an organization → SYSTEM
/// - Organization members (including admins acting in one) → ORGANIZATION
/// - Everyone else → PERSONAL, owned by the actor
pub fn resolve(actor: &Actor) -> Scope {
    match actor.organization_id {
        Some(organization_id) => Scope::Organization { organization_id },
        None if actor.is_platform_admin() => Scope::System,
        None => Scope::Personal {
            owner: actor.user_id,
        },
    }
}

/// Read predicate for `actor`, consistent with [`resolve`]: anything a job
/// creates is readable by its creator.
pub fn read_filter(actor: &Actor) -> ReadFilter {
    if actor.is_platform_admin() {
        return ReadFilter::Unrestricted;
    }
    ReadFilter::Restricted {
        user_id: actor.user_id,
        organization_id: actor.organization_id,
    }
}

/// Visibility predicate applied by query paths.
///
/// Storage backends either evaluate [`ReadFilter::allows`] directly or render
/// the same rules into their query language.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadFilter {
    /// Platform administrators see everything.
    Unrestricted,
    /// PERSONAL records owned by `user_id`, ORGANIZATION records of
    /// `organization_id`, and all SYSTEM records.
    Restricted {
        user_id: UserId,
        organization_id: Option<OrganizationId>,
    },
}

impl ReadFilter {
    pub fn allows(&self, scope: &Scope) -> bool {
        match self {
            ReadFilter::Unrestricted => true,
            ReadFilter::Restricted {
                user_id,
                organization_id,
            } => match scope {
                Scope::System => true,
                Scope::Personal { owner } => owner == user_id,
                Scope::Organization {
                    organization_id: record_org,
                } => organization_id.as_ref() == Some(record_org),
            },
        }
    }

    /// Scope keys this filter admits besides `system`, for key-based storage
    /// lookups. `None` means no restriction.
    pub fn allowed_scope_keys(&self) -> Option<Vec<String>> {
        match self {
            ReadFilter::Unrestricted => None,
            ReadFilter::Restricted {
                user_id,
                organization_id,
            } => {
                let mut keys = vec![
                    Scope::System.key(),
                    Scope::Personal { owner: *user_id }.key(),
                ];
                if let Some(organization_id) = organization_id {
                    keys.push(
                        Scope::Organization {
                            organization_id: *organization_id,
                        }
                        .key(),
                    );
                }
                Some(keys)
            }
        }
    }
}
