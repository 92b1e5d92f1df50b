//! Authorization: the fixed role→permission map and access decisions.
//!
//! Authorization is a pure function of (identity, permission, target). The
//! `shadow.*` / `filesystem.*` split is load-bearing: experts inspect and
//! annotate the shadow filesystem but can never touch the real one, so any
//! filesystem-scoped operation by an expert fails with `scope_violation`
//! before permissions are even consulted.

use serde::{Deserialize, Serialize};

use crate::error::AuthzError;
use crate::identity::{AgentIdentity, Role};

/// Enumerated capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ShadowRead,
    ShadowWrite,
    FilesystemRead,
    FilesystemWrite,
    EventAppend,
    EventQuery,
    ExpertRegister,
    ExpertDelegate,
    PairStart,
    SystemAdmin,
}

impl Permission {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ShadowRead => "shadow.read",
            Self::ShadowWrite => "shadow.write",
            Self::FilesystemRead => "filesystem.read",
            Self::FilesystemWrite => "filesystem.write",
            Self::EventAppend => "event.append",
            Self::EventQuery => "event.query",
            Self::ExpertRegister => "expert.register",
            Self::ExpertDelegate => "expert.delegate",
            Self::PairStart => "pair.start",
            Self::SystemAdmin => "system.admin",
        }
    }

    /// Whether this permission targets the real filesystem.
    #[must_use]
    pub const fn is_filesystem(self) -> bool {
        matches!(self, Self::FilesystemRead | Self::FilesystemWrite)
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed role→permission map.
///
/// Builders additionally hold `pair.start` and `expert.delegate` (they open
/// pair sessions and trigger escalations); experts hold `pair.start` to
/// accept. Experts never hold `filesystem.*`.
#[must_use]
pub const fn role_permissions(role: Role) -> &'static [Permission] {
    match role {
        Role::Guest => &[Permission::ShadowRead],
        Role::Agent => &[
            Permission::ShadowRead,
            Permission::FilesystemRead,
            Permission::FilesystemWrite,
            Permission::EventAppend,
            Permission::EventQuery,
            Permission::PairStart,
            Permission::ExpertDelegate,
        ],
        Role::Expert => &[
            Permission::ShadowRead,
            Permission::ShadowWrite,
            Permission::EventAppend,
            Permission::EventQuery,
            Permission::ExpertRegister,
            Permission::PairStart,
        ],
        Role::SystemAdmin => &[
            Permission::ShadowRead,
            Permission::ShadowWrite,
            Permission::FilesystemRead,
            Permission::FilesystemWrite,
            Permission::EventAppend,
            Permission::EventQuery,
            Permission::ExpertRegister,
            Permission::ExpertDelegate,
            Permission::PairStart,
            Permission::SystemAdmin,
        ],
    }
}

/// Whether a role holds a permission.
#[must_use]
pub fn role_has(role: Role, permission: Permission) -> bool {
    role_permissions(role).contains(&permission)
}

/// Authorize `identity` for `permission`.
///
/// Experts fail filesystem-scoped checks with [`AuthzError::ScopeViolation`]
/// regardless of the target path; every other denial is a plain
/// `permission_denied`.
pub fn authorize(identity: &AgentIdentity, permission: Permission) -> Result<(), AuthzError> {
    if identity.role == Role::Expert && permission.is_filesystem() {
        return Err(AuthzError::ScopeViolation);
    }
    if role_has(identity.role, permission) {
        Ok(())
    } else {
        Err(AuthzError::PermissionDenied {
            role: identity.role.as_str(),
            permission: permission.as_str(),
        })
    }
}

/// Whether `identity` may read `event` in query results.
///
/// Session lifecycle events are visible only to their own agent and to
/// system admins; everything else is readable by any caller holding
/// `event.query`.
#[must_use]
pub fn can_read_event(identity: &AgentIdentity, event: &crate::event::Event) -> bool {
    if identity.role == Role::SystemAdmin {
        return true;
    }
    if event.aggregate_id.starts_with("session:") {
        return event.agent_id == identity.agent_id;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventPayload, EventType};

    fn identity(role: Role) -> AgentIdentity {
        AgentIdentity::new("someone", role)
    }

    #[test]
    fn guest_reads_shadow_only() {
        let guest = identity(Role::Guest);
        assert!(authorize(&guest, Permission::ShadowRead).is_ok());
        for denied in [
            Permission::ShadowWrite,
            Permission::FilesystemRead,
            Permission::EventAppend,
            Permission::EventQuery,
        ] {
            assert!(authorize(&guest, denied).is_err());
        }
    }

    #[test]
    fn agent_holds_filesystem_and_log_permissions() {
        let agent = identity(Role::Agent);
        for allowed in [
            Permission::ShadowRead,
            Permission::FilesystemRead,
            Permission::FilesystemWrite,
            Permission::EventAppend,
            Permission::EventQuery,
        ] {
            assert!(authorize(&agent, allowed).is_ok());
        }
        assert!(authorize(&agent, Permission::ShadowWrite).is_err());
        assert!(authorize(&agent, Permission::SystemAdmin).is_err());
    }

    #[test]
    fn expert_filesystem_access_is_scope_violation() {
        let expert = identity(Role::Expert);
        // Regardless of which filesystem permission: scope violation, not
        // a plain permission denial.
        assert!(matches!(
            authorize(&expert, Permission::FilesystemWrite),
            Err(AuthzError::ScopeViolation)
        ));
        assert!(matches!(
            authorize(&expert, Permission::FilesystemRead),
            Err(AuthzError::ScopeViolation)
        ));
        assert!(authorize(&expert, Permission::ShadowWrite).is_ok());
    }

    #[test]
    fn system_admin_holds_everything() {
        let admin = identity(Role::SystemAdmin);
        for permission in [
            Permission::ShadowRead,
            Permission::ShadowWrite,
            Permission::FilesystemRead,
            Permission::FilesystemWrite,
            Permission::EventAppend,
            Permission::EventQuery,
            Permission::ExpertRegister,
            Permission::ExpertDelegate,
            Permission::PairStart,
            Permission::SystemAdmin,
        ] {
            assert!(authorize(&admin, permission).is_ok());
        }
    }

    #[test]
    fn permission_names_are_dotted() {
        assert_eq!(Permission::ShadowRead.as_str(), "shadow.read");
        assert_eq!(Permission::FilesystemWrite.as_str(), "filesystem.write");
        assert_eq!(Permission::SystemAdmin.as_str(), "system.admin");
    }

    fn session_event(owner: &str) -> Event {
        Event {
            sequence: 1,
            event_id: "ev".into(),
            event_type: EventType::SessionCreated,
            aggregate_id: "session:s1".into(),
            agent_id: owner.into(),
            timestamp_ms: 0,
            causation_id: None,
            payload: EventPayload::SessionCreated {
                session_id: "s1".into(),
                agent_id: owner.into(),
            },
            integrity_tag: String::new(),
        }
    }

    #[test]
    fn session_events_visible_to_owner_and_admin_only() {
        let event = session_event("alice");

        let mut alice = identity(Role::Agent);
        alice.agent_id = "alice".to_string();
        assert!(can_read_event(&alice, &event));

        let mut bob = identity(Role::Agent);
        bob.agent_id = "bob".to_string();
        assert!(!can_read_event(&bob, &event));

        let admin = identity(Role::SystemAdmin);
        assert!(can_read_event(&admin, &event));
    }
}
