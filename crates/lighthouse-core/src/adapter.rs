//! Adapter contracts: the wire shapes crossing the core boundary.
//!
//! Adapters (HTTP, MCP, CLI launchers) validate only their transport framing
//! and map these types onto [`crate::service::CoreService`] calls. No
//! business logic lives here, and an adapter never synthesizes an identity:
//! a request without a valid session token fails `unauthenticated`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};
use crate::event::{DelegationVerdict, Event, EventDraft};
use crate::speed::fingerprint::CommandRequest;
use crate::speed::{Decision, DecisionSource};

/// Wire error: a stable kind code plus a human-readable message.
///
/// Messages never include secrets, tokens, or payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ApiError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// `session.create` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub agent_id: String,
    pub credential: String,
}

/// `session.create` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    /// Opaque bearer token.
    pub token: String,
}

/// `session.validate` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateSessionResponse {
    pub agent_id: String,
    pub role: String,
}

/// `command.validate` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateCommandRequest {
    pub command: CommandRequest,
}

/// `command.validate` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateCommandResponse {
    pub fingerprint: String,
    pub verdict: DelegationVerdict,
    pub source: DecisionSource,
    pub reason: String,
}

impl From<Decision> for ValidateCommandResponse {
    fn from(decision: Decision) -> Self {
        Self {
            fingerprint: decision.fingerprint.as_str().to_string(),
            verdict: decision.verdict,
            source: decision.source,
            reason: decision.reason,
        }
    }
}

/// `event.append` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEventRequest {
    pub draft: EventDraft,
}

/// `event.append` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEventResponse {
    pub sequence: u64,
    pub integrity_tag: String,
}

/// `event.query` request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryEventsRequest {
    #[serde(default)]
    pub aggregate_id: Option<String>,
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
    #[serde(default)]
    pub sequence_range: Option<(u64, u64)>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<u64>,
}

/// `event.query` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventsResponse {
    pub events: Vec<Event>,
    pub next_cursor: Option<u64>,
}

/// `expert.register` step-one response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge_id: String,
    pub nonce: String,
    pub expires_in_secs: u64,
}

/// Cross-origin policy evaluated by HTTP adapters.
///
/// A credentialed wildcard is rejected at config validation, so this check
/// is a plain allow-list membership test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsPolicy {
    pub allow_origins: Vec<String>,
    pub allow_credentials: bool,
}

impl CorsPolicy {
    #[must_use]
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allow_origins
            .iter()
            .any(|allowed| allowed == origin || (allowed == "*" && !self.allow_credentials))
    }
}
