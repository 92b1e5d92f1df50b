//! Domain events: the data model of the append-only log.
//!
//! Every mutation in the system is one of these records. The store assigns
//! `sequence` and the integrity tag at append; everything else is supplied by
//! a validated [`EventDraft`].
//!
//! # Aggregate id conventions
//!
//! | Event family | Aggregate id |
//! |---|---|
//! | `identity.*` | `agent:<id>` |
//! | `session.*` | `session:<id>` |
//! | `file.written`, `annotation.added` | `file:<path>` |
//! | `snapshot.created` | `snapshot:<name>` |
//! | `pair.*` | `pair:<id>` |
//! | `expert.registered`, `expert.quarantined` | `expert:<id>` |
//! | `expert.decision` | `delegation:<id>` |
//! | `log.recovered` | `store:log` |
//!
//! The file/pair conventions are load-bearing: the project aggregate keys
//! annotations by `file:<path>` and pair chains by `pair:<id>`.

use serde::{Deserialize, Serialize};

/// Vote returned by a single expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertVerdict {
    Approve,
    Deny,
    Abstain,
    NeedsRevision,
}

/// Terminal verdict of a delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationVerdict {
    Approve,
    Deny,
    NeedsRevision,
    Timeout,
}

/// One expert's recorded response inside an `expert.decision` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertResponseRecord {
    pub expert_id: String,
    pub verdict: ExpertVerdict,
    pub confidence: f64,
}

/// Enumerated domain event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    IdentityBootstrapped,
    IdentityPromoted,
    IdentityRevoked,
    SessionCreated,
    SessionRevoked,
    FileWritten,
    AnnotationAdded,
    SnapshotCreated,
    PairRequested,
    PairAccepted,
    PairSuggestion,
    PairComment,
    PairClosed,
    ExpertRegistered,
    ExpertQuarantined,
    ExpertDecision,
    LogRecovered,
}

impl EventType {
    /// Canonical dotted name used in filters and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IdentityBootstrapped => "identity.bootstrapped",
            Self::IdentityPromoted => "identity.promoted",
            Self::IdentityRevoked => "identity.revoked",
            Self::SessionCreated => "session.created",
            Self::SessionRevoked => "session.revoked",
            Self::FileWritten => "file.written",
            Self::AnnotationAdded => "annotation.added",
            Self::SnapshotCreated => "snapshot.created",
            Self::PairRequested => "pair.requested",
            Self::PairAccepted => "pair.accepted",
            Self::PairSuggestion => "pair.suggestion",
            Self::PairComment => "pair.comment",
            Self::PairClosed => "pair.closed",
            Self::ExpertRegistered => "expert.registered",
            Self::ExpertQuarantined => "expert.quarantined",
            Self::ExpertDecision => "expert.decision",
            Self::LogRecovered => "log.recovered",
        }
    }

    /// Parse a canonical dotted name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "identity.bootstrapped" => Self::IdentityBootstrapped,
            "identity.promoted" => Self::IdentityPromoted,
            "identity.revoked" => Self::IdentityRevoked,
            "session.created" => Self::SessionCreated,
            "session.revoked" => Self::SessionRevoked,
            "file.written" => Self::FileWritten,
            "annotation.added" => Self::AnnotationAdded,
            "snapshot.created" => Self::SnapshotCreated,
            "pair.requested" => Self::PairRequested,
            "pair.accepted" => Self::PairAccepted,
            "pair.suggestion" => Self::PairSuggestion,
            "pair.comment" => Self::PairComment,
            "pair.closed" => Self::PairClosed,
            "expert.registered" => Self::ExpertRegistered,
            "expert.quarantined" => Self::ExpertQuarantined,
            "expert.decision" => Self::ExpertDecision,
            "log.recovered" => Self::LogRecovered,
            _ => return None,
        })
    }

    /// Required aggregate id prefix for this type.
    #[must_use]
    pub const fn aggregate_prefix(self) -> &'static str {
        match self {
            Self::IdentityBootstrapped | Self::IdentityPromoted | Self::IdentityRevoked => "agent:",
            Self::SessionCreated | Self::SessionRevoked => "session:",
            Self::FileWritten | Self::AnnotationAdded => "file:",
            Self::SnapshotCreated => "snapshot:",
            Self::PairRequested
            | Self::PairAccepted
            | Self::PairSuggestion
            | Self::PairComment
            | Self::PairClosed => "pair:",
            Self::ExpertRegistered | Self::ExpertQuarantined => "expert:",
            Self::ExpertDecision => "delegation:",
            Self::LogRecovered => "store:",
        }
    }

    /// All event types, for exhaustive round-trip tests.
    #[must_use]
    pub const fn all() -> [Self; 17] {
        [
            Self::IdentityBootstrapped,
            Self::IdentityPromoted,
            Self::IdentityRevoked,
            Self::SessionCreated,
            Self::SessionRevoked,
            Self::FileWritten,
            Self::AnnotationAdded,
            Self::SnapshotCreated,
            Self::PairRequested,
            Self::PairAccepted,
            Self::PairSuggestion,
            Self::PairComment,
            Self::PairClosed,
            Self::ExpertRegistered,
            Self::ExpertQuarantined,
            Self::ExpertDecision,
            Self::LogRecovered,
        ]
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload, one variant per event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    IdentityBootstrapped {
        agent_id: String,
        role: String,
        capabilities: Vec<String>,
        /// Hex SHA-256 of the agent's credential; never the credential itself.
        credential_hash: String,
    },
    IdentityPromoted {
        agent_id: String,
        role: String,
    },
    IdentityRevoked {
        agent_id: String,
        reason: String,
    },
    SessionCreated {
        session_id: String,
        agent_id: String,
    },
    SessionRevoked {
        session_id: String,
        reason: String,
    },
    FileWritten {
        path: String,
        content_hash: String,
        size_bytes: u64,
    },
    AnnotationAdded {
        path: String,
        line: u32,
        category: String,
        message: String,
        author: String,
    },
    SnapshotCreated {
        name: String,
        at_sequence: u64,
    },
    PairRequested {
        pair_id: String,
        builder_id: String,
        task: String,
    },
    PairAccepted {
        pair_id: String,
        expert_id: String,
    },
    PairSuggestion {
        pair_id: String,
        line: u32,
        text: String,
        author: String,
    },
    PairComment {
        pair_id: String,
        text: String,
        author: String,
    },
    PairClosed {
        pair_id: String,
        reason: String,
    },
    ExpertRegistered {
        expert_id: String,
        capabilities: Vec<String>,
        public_id: String,
    },
    ExpertQuarantined {
        expert_id: String,
        reason: String,
    },
    ExpertDecision {
        delegation_id: String,
        fingerprint: String,
        verdict: DelegationVerdict,
        responses: Vec<ExpertResponseRecord>,
    },
    LogRecovered {
        truncated_from_sequence: u64,
        verified_tag: String,
    },
}

impl EventPayload {
    /// The event type this payload belongs to.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::IdentityBootstrapped { .. } => EventType::IdentityBootstrapped,
            Self::IdentityPromoted { .. } => EventType::IdentityPromoted,
            Self::IdentityRevoked { .. } => EventType::IdentityRevoked,
            Self::SessionCreated { .. } => EventType::SessionCreated,
            Self::SessionRevoked { .. } => EventType::SessionRevoked,
            Self::FileWritten { .. } => EventType::FileWritten,
            Self::AnnotationAdded { .. } => EventType::AnnotationAdded,
            Self::SnapshotCreated { .. } => EventType::SnapshotCreated,
            Self::PairRequested { .. } => EventType::PairRequested,
            Self::PairAccepted { .. } => EventType::PairAccepted,
            Self::PairSuggestion { .. } => EventType::PairSuggestion,
            Self::PairComment { .. } => EventType::PairComment,
            Self::PairClosed { .. } => EventType::PairClosed,
            Self::ExpertRegistered { .. } => EventType::ExpertRegistered,
            Self::ExpertQuarantined { .. } => EventType::ExpertQuarantined,
            Self::ExpertDecision { .. } => EventType::ExpertDecision,
            Self::LogRecovered { .. } => EventType::LogRecovered,
        }
    }
}

/// Immutable, sequenced log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic position in the log, assigned at append. 1-based.
    pub sequence: u64,
    /// Opaque unique id. Caller-supplied or generated at append.
    pub event_id: String,
    pub event_type: EventType,
    pub aggregate_id: String,
    /// Authenticated writer. References a known identity at append time.
    pub agent_id: String,
    /// Wall clock in epoch milliseconds. Display only; ordering is `sequence`.
    pub timestamp_ms: i64,
    /// The event that logically caused this one, if any.
    pub causation_id: Option<String>,
    pub payload: EventPayload,
    /// Hex HMAC chaining this event to the prior log state.
    pub integrity_tag: String,
}

/// An unsequenced event submitted for append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub event_type: EventType,
    pub aggregate_id: String,
    pub payload: EventPayload,
    #[serde(default)]
    pub causation_id: Option<String>,
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub event_id: Option<String>,
    /// When set, the append fails unless the log head tag equals this value.
    #[serde(default)]
    pub pinned_head_tag: Option<String>,
}

impl EventDraft {
    /// Build a draft with the conventional aggregate id for its payload.
    #[must_use]
    pub fn new(aggregate_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_type: payload.event_type(),
            aggregate_id: aggregate_id.into(),
            payload,
            causation_id: None,
            event_id: None,
            pinned_head_tag: None,
        }
    }

    /// Link this draft to the event that caused it.
    #[must_use]
    pub fn caused_by(mut self, event_id: impl Into<String>) -> Self {
        self.causation_id = Some(event_id.into());
        self
    }

    /// Validate type/payload agreement and the aggregate id convention.
    pub fn validate(&self) -> Result<(), String> {
        if self.payload.event_type() != self.event_type {
            return Err(format!(
                "payload is for `{}` but draft declares `{}`",
                self.payload.event_type(),
                self.event_type
            ));
        }
        let prefix = self.event_type.aggregate_prefix();
        if !self.aggregate_id.starts_with(prefix) {
            return Err(format!(
                "`{}` events require aggregate id prefix `{prefix}`",
                self.event_type
            ));
        }
        if self.aggregate_id.len() <= prefix.len() {
            return Err("aggregate id has an empty key".to_string());
        }
        // The fixed schemes: annotations anchor to the file they annotate,
        // pair events to their pair id.
        match &self.payload {
            EventPayload::FileWritten { path, .. } | EventPayload::AnnotationAdded { path, .. } => {
                if self.aggregate_id != format!("file:{path}") {
                    return Err(format!(
                        "aggregate id must be `file:{path}` for this payload"
                    ));
                }
            }
            EventPayload::PairRequested { pair_id, .. }
            | EventPayload::PairAccepted { pair_id, .. }
            | EventPayload::PairSuggestion { pair_id, .. }
            | EventPayload::PairComment { pair_id, .. }
            | EventPayload::PairClosed { pair_id, .. } => {
                if self.aggregate_id != format!("pair:{pair_id}") {
                    return Err(format!(
                        "aggregate id must be `pair:{pair_id}` for this payload"
                    ));
                }
            }
            _ => {}
        }
        if let Some(id) = &self.event_id {
            if id.is_empty() {
                return Err("event id must not be empty".to_string());
            }
        }
        if let Some(causation) = &self.causation_id {
            if causation.is_empty() {
                return Err("causation id must not be empty".to_string());
            }
        }
        Ok(())
    }
}

/// Generate an opaque event id.
#[must_use]
pub fn generate_event_id() -> String {
    use rand::RngCore;
    let mut buf = [0u8; 16];
    rand::rng().fill_bytes(&mut buf);
    format!("ev_{}", hex::encode(buf))
}
