//! Agent identities and the process-wide identity registry.
//!
//! The registry is derived state: it folds `identity.*` events from the log
//! and holds no authoritative data of its own. There is exactly one registry
//! per process: it is constructed once and the same `Arc` is passed into
//! every component that authenticates callers. Auto-creating identities for
//! unknown agent ids is forbidden; the only way in is an explicit
//! `identity.bootstrapped` or `identity.promoted` event.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::{Event, EventPayload};

/// Reserved id for the process's own identity. Present from construction:
/// trusted appends (bootstrap, recovery, coordinator decisions) are written
/// under it.
pub const SYSTEM_AGENT_ID: &str = "system";

/// Agent roles, in increasing privilege order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    Agent,
    Expert,
    SystemAdmin,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::Agent => "agent",
            Self::Expert => "expert",
            Self::SystemAdmin => "system_admin",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "guest" => Self::Guest,
            "agent" => Self::Agent,
            "expert" => Self::Expert,
            "system_admin" => Self::SystemAdmin,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated identity as seen by every component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub role: Role,
    /// Expert capability tags (e.g. `security`, `performance`).
    pub expert_capabilities: BTreeSet<String>,
}

impl AgentIdentity {
    #[must_use]
    pub fn new(agent_id: impl Into<String>, role: Role) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            expert_capabilities: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    identity: AgentIdentity,
    /// Hex SHA-256 of the agent's credential.
    credential_hash: Option<String>,
}

/// Process-wide registry of known identities.
///
/// Construct exactly one per process and share the `Arc`.
#[derive(Debug)]
pub struct IdentityRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl IdentityRegistry {
    /// Create a registry holding only the built-in system identity.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let mut entries = HashMap::new();
        entries.insert(
            SYSTEM_AGENT_ID.to_string(),
            RegistryEntry {
                identity: AgentIdentity::new(SYSTEM_AGENT_ID, Role::SystemAdmin),
                credential_hash: None,
            },
        );
        Arc::new(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Resolve an agent id to its identity. `None` for unknown agents;
    /// callers surface this as `unauthenticated`, never by creating one.
    #[must_use]
    pub fn authenticate(&self, agent_id: &str) -> Option<AgentIdentity> {
        let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.get(agent_id).map(|e| e.identity.clone())
    }

    /// Verify a credential against the agent's registered credential hash.
    #[must_use]
    pub fn verify_credential(&self, agent_id: &str, credential: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(entry) = entries.get(agent_id) else {
            return false;
        };
        let Some(expected) = &entry.credential_hash else {
            return false;
        };
        let presented = credential_hash(credential);
        constant_time_eq(expected.as_bytes(), presented.as_bytes())
    }

    /// Number of known identities (including the system identity).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fold an identity event into the registry. Non-identity events are
    /// ignored, which keeps the fold idempotent and order-driven.
    pub fn apply_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::IdentityBootstrapped {
                agent_id,
                role,
                capabilities,
                credential_hash,
            } => {
                let Some(role) = Role::parse(role) else {
                    tracing::warn!(agent_id, role, "ignoring bootstrap with unknown role");
                    return;
                };
                let mut identity = AgentIdentity::new(agent_id.clone(), role);
                identity.expert_capabilities = capabilities.iter().cloned().collect();
                let mut entries = self
                    .entries
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                entries.insert(
                    agent_id.clone(),
                    RegistryEntry {
                        identity,
                        credential_hash: Some(credential_hash.clone()),
                    },
                );
            }
            EventPayload::IdentityPromoted { agent_id, role } => {
                let Some(role) = Role::parse(role) else {
                    tracing::warn!(agent_id, role, "ignoring promotion to unknown role");
                    return;
                };
                let mut entries = self
                    .entries
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(entry) = entries.get_mut(agent_id) {
                    entry.identity.role = role;
                } else {
                    tracing::warn!(agent_id, "ignoring promotion of unknown agent");
                }
            }
            EventPayload::IdentityRevoked { agent_id, .. } => {
                if agent_id == SYSTEM_AGENT_ID {
                    tracing::warn!("refusing to revoke the system identity");
                    return;
                }
                let mut entries = self
                    .entries
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                entries.remove(agent_id);
            }
            _ => {}
        }
    }
}

/// Hex SHA-256 of a credential string.
#[must_use]
pub fn credential_hash(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time byte comparison for credential and token material.
#[must_use]
pub fn constant_time_eq(expected: &[u8], presented: &[u8]) -> bool {
    let max_len = expected.len().max(presented.len());
    let mut diff = expected.len() ^ presented.len();
    for idx in 0..max_len {
        let left = expected.get(idx).copied().unwrap_or(0);
        let right = presented.get(idx).copied().unwrap_or(0);
        diff |= usize::from(left ^ right);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventDraft, EventType};

    fn bootstrap_event(agent_id: &str, role: &str) -> Event {
        let payload = EventPayload::IdentityBootstrapped {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            capabilities: vec!["security".to_string()],
            credential_hash: credential_hash("hunter2"),
        };
        let draft = EventDraft::new(format!("agent:{agent_id}"), payload);
        Event {
            sequence: 1,
            event_id: "ev_boot".to_string(),
            event_type: EventType::IdentityBootstrapped,
            aggregate_id: draft.aggregate_id,
            agent_id: SYSTEM_AGENT_ID.to_string(),
            timestamp_ms: 0,
            causation_id: None,
            payload: draft.payload,
            integrity_tag: String::new(),
        }
    }

    #[test]
    fn registry_starts_with_system_only() {
        let registry = IdentityRegistry::new();
        assert_eq!(registry.len(), 1);
        let system = registry.authenticate(SYSTEM_AGENT_ID).unwrap();
        assert_eq!(system.role, Role::SystemAdmin);
    }

    #[test]
    fn unknown_agent_is_not_created() {
        let registry = IdentityRegistry::new();
        assert!(registry.authenticate("alice").is_none());
        // Still absent after the failed lookup.
        assert!(registry.authenticate("alice").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn bootstrap_event_creates_identity() {
        let registry = IdentityRegistry::new();
        registry.apply_event(&bootstrap_event("alice", "agent"));
        let alice = registry.authenticate("alice").unwrap();
        assert_eq!(alice.role, Role::Agent);
        assert!(alice.expert_capabilities.contains("security"));
    }

    #[test]
    fn promotion_changes_role() {
        let registry = IdentityRegistry::new();
        registry.apply_event(&bootstrap_event("alice", "agent"));

        let mut promote = bootstrap_event("alice", "agent");
        promote.event_type = EventType::IdentityPromoted;
        promote.payload = EventPayload::IdentityPromoted {
            agent_id: "alice".to_string(),
            role: "expert".to_string(),
        };
        registry.apply_event(&promote);

        assert_eq!(registry.authenticate("alice").unwrap().role, Role::Expert);
    }

    #[test]
    fn revocation_removes_identity() {
        let registry = IdentityRegistry::new();
        registry.apply_event(&bootstrap_event("alice", "agent"));

        let mut revoke = bootstrap_event("alice", "agent");
        revoke.event_type = EventType::IdentityRevoked;
        revoke.payload = EventPayload::IdentityRevoked {
            agent_id: "alice".to_string(),
            reason: "left".to_string(),
        };
        registry.apply_event(&revoke);

        assert!(registry.authenticate("alice").is_none());
    }

    #[test]
    fn system_identity_cannot_be_revoked() {
        let registry = IdentityRegistry::new();
        let mut revoke = bootstrap_event("alice", "agent");
        revoke.payload = EventPayload::IdentityRevoked {
            agent_id: SYSTEM_AGENT_ID.to_string(),
            reason: "nope".to_string(),
        };
        registry.apply_event(&revoke);
        assert!(registry.authenticate(SYSTEM_AGENT_ID).is_some());
    }

    #[test]
    fn credential_verification() {
        let registry = IdentityRegistry::new();
        registry.apply_event(&bootstrap_event("alice", "agent"));
        assert!(registry.verify_credential("alice", "hunter2"));
        assert!(!registry.verify_credential("alice", "wrong"));
        assert!(!registry.verify_credential("bob", "hunter2"));
        // The system identity has no credential; it never logs in.
        assert!(!registry.verify_credential(SYSTEM_AGENT_ID, ""));
    }

    #[test]
    fn replaying_bootstrap_is_idempotent() {
        let registry = IdentityRegistry::new();
        let event = bootstrap_event("alice", "agent");
        registry.apply_event(&event);
        registry.apply_event(&event);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn role_parse_roundtrip() {
        for role in [Role::Guest, Role::Agent, Role::Expert, Role::SystemAdmin] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("root"), None);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
