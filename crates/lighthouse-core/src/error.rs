//! Error types for lighthouse-core.
//!
//! Each subsystem has its own error enum; all roll up into [`Error`]. Every
//! variant maps to a stable snake_case [`ErrorKind`] code used on the adapter
//! boundary, and to a process exit code for the CLI.
//!
//! Error messages must never carry secrets, session tokens, or event payload
//! bytes.

use thiserror::Error;

/// Result type alias using the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error classification surfaced to adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    PermissionDenied,
    ScopeViolation,
    InvalidToken,
    BoundMismatch,
    RateLimited,
    SchemaInvalid,
    IntegrityViolation,
    IoError,
    Timeout,
    CircuitOpen,
    Lagging,
    Conflict,
    NotFound,
}

impl ErrorKind {
    /// Stable wire code for this kind.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission_denied",
            Self::ScopeViolation => "scope_violation",
            Self::InvalidToken => "invalid_token",
            Self::BoundMismatch => "bound_mismatch",
            Self::RateLimited => "rate_limited",
            Self::SchemaInvalid => "schema_invalid",
            Self::IntegrityViolation => "integrity_violation",
            Self::IoError => "io_error",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::Lagging => "lagging",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
        }
    }

    /// Whether an adapter may retry a non-mutating call after this error.
    ///
    /// Authentication and authorization failures are never retried; the
    /// caller must re-authenticate. Mutating paths are never auto-retried
    /// because log appends are not idempotent across fresh drafts.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::IoError | Self::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Main error type for lighthouse-core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("authorization error: {0}")]
    Authz(#[from] AuthzError),

    #[error("speed layer error: {0}")]
    Speed(#[from] SpeedError),

    #[error("expert coordination error: {0}")]
    Expert(#[from] ExpertError),

    #[error("aggregate error: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("pair session error: {0}")]
    Pair(#[from] PairError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable classification for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Session(e) => e.kind(),
            Self::Authz(e) => e.kind(),
            Self::Speed(e) => e.kind(),
            Self::Expert(e) => e.kind(),
            Self::Aggregate(e) => e.kind(),
            Self::Pair(e) => e.kind(),
            Self::Config(_) => ErrorKind::SchemaInvalid,
            Self::Encoding(_) => ErrorKind::SchemaInvalid,
            Self::Io(_) => ErrorKind::IoError,
        }
    }

    /// Process exit code for fatal startup errors.
    ///
    /// 0 clean shutdown, 10 config error, 20 storage recovery failure,
    /// 30 integrity violation detected at startup, 40 authentication secret
    /// unavailable.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(ConfigError::SecretUnavailable) => 40,
            Self::Config(_) => 10,
            Self::Store(StoreError::Integrity { .. } | StoreError::HeadMismatch { .. }) => 30,
            Self::Store(_) | Self::Io(_) => 20,
            _ => 1,
        }
    }
}

/// Event store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Caller identity is not currently authenticated.
    #[error("caller is not an authenticated identity")]
    Unauthenticated,

    /// Caller lacks the permission required for the operation.
    #[error("caller lacks permission `{permission}`")]
    PermissionDenied { permission: &'static str },

    /// Draft payload does not validate for its declared event type.
    #[error("event draft is invalid: {reason}")]
    SchemaInvalid { reason: String },

    /// Chained-tag verification failed at the given sequence.
    #[error("integrity chain broken at sequence {sequence}")]
    Integrity { sequence: u64 },

    /// A caller-pinned prior tag disagrees with the log head.
    #[error("pinned prior tag does not match the log head at sequence {head_sequence}")]
    HeadMismatch { head_sequence: u64 },

    /// Appending this event would close a causation cycle.
    #[error("causation link from `{causation_id}` forms a cycle")]
    CausationCycle { causation_id: String },

    /// The store is refusing appends until a health check passes.
    #[error("store is halted pending a successful health check")]
    Halted,

    /// Per-agent append rate exceeded.
    #[error("append rate limit exceeded for agent")]
    RateLimited,

    /// A subscriber fell behind its configured queue bound.
    #[error("subscriber lagging: pending queue exceeded {bound} events")]
    Lagging { bound: usize },

    /// Requested record does not exist.
    #[error("no event at sequence {sequence}")]
    NotFound { sequence: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

impl StoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated => ErrorKind::Unauthenticated,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::SchemaInvalid { .. } | Self::Encoding(_) => ErrorKind::SchemaInvalid,
            Self::Integrity { .. } | Self::HeadMismatch { .. } => ErrorKind::IntegrityViolation,
            Self::CausationCycle { .. } => ErrorKind::Conflict,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::Halted | Self::Io(_) => ErrorKind::IoError,
            Self::Lagging { .. } => ErrorKind::Lagging,
            Self::NotFound { .. } => ErrorKind::NotFound,
        }
    }
}

/// Session security errors.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Token failed to parse or its MAC did not verify.
    #[error("session token is invalid")]
    InvalidToken,

    /// Session exceeded its idle or absolute timeout.
    #[error("session expired")]
    Expired,

    /// Session was revoked.
    #[error("session revoked")]
    Revoked,

    /// Token presented from a different IP or user agent than it was bound to.
    #[error("session binding mismatch")]
    BoundMismatch,

    /// Per-agent validate rate exceeded.
    #[error("rate limit exceeded for agent")]
    RateLimited,

    /// Creating this session would exceed the per-agent concurrency cap.
    #[error("agent already has {limit} active sessions")]
    TooManySessions { limit: u32 },

    /// Credential did not verify against the agent's registered credential.
    #[error("credential rejected")]
    InvalidCredential,

    /// Agent id is unknown to the identity registry.
    #[error("unknown agent identity")]
    UnknownAgent,

    /// Session id not present in the session table.
    #[error("no such session")]
    NotFound,
}

impl SessionError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidToken | Self::Expired | Self::Revoked => ErrorKind::InvalidToken,
            Self::BoundMismatch => ErrorKind::BoundMismatch,
            Self::RateLimited | Self::TooManySessions { .. } => ErrorKind::RateLimited,
            Self::InvalidCredential | Self::UnknownAgent => ErrorKind::Unauthenticated,
            Self::NotFound => ErrorKind::NotFound,
        }
    }
}

impl SessionError {
    /// Expired sessions surface as their own wire code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::BoundMismatch => "bound_mismatch",
            Self::RateLimited | Self::TooManySessions { .. } => "rate_limited",
            Self::InvalidCredential | Self::UnknownAgent => "unauthenticated",
            Self::NotFound => "not_found",
        }
    }
}

/// Authorization errors.
#[derive(Error, Debug)]
pub enum AuthzError {
    /// Identity's role does not grant the permission.
    #[error("role `{role}` lacks permission `{permission}`")]
    PermissionDenied {
        role: &'static str,
        permission: &'static str,
    },

    /// Expert identity attempted to touch a non-shadow target.
    #[error("expert identities may not touch filesystem targets")]
    ScopeViolation,
}

impl AuthzError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::ScopeViolation => ErrorKind::ScopeViolation,
        }
    }
}

/// Speed layer errors.
#[derive(Error, Debug)]
pub enum SpeedError {
    /// Escalation circuit is open; request failed closed.
    #[error("escalation circuit open; retry in {retry_after_ms} ms")]
    CircuitOpen { retry_after_ms: u64 },

    /// Classification exceeded the request deadline.
    #[error("classification deadline exceeded")]
    DeadlineExceeded,

    /// A policy rule failed to compile at load time.
    #[error("invalid policy rule `{rule_id}`: {reason}")]
    InvalidRule { rule_id: String, reason: String },
}

impl SpeedError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::DeadlineExceeded => ErrorKind::Timeout,
            Self::InvalidRule { .. } => ErrorKind::SchemaInvalid,
        }
    }
}

/// Expert coordinator errors.
#[derive(Error, Debug)]
pub enum ExpertError {
    /// Expert id is not registered.
    #[error("unknown expert")]
    UnknownExpert,

    /// Challenge was already consumed or never issued.
    #[error("registration challenge is not pending")]
    ChallengeNotPending,

    /// Challenge expired before the response arrived.
    #[error("registration challenge expired")]
    ChallengeExpired,

    /// Challenge response MAC did not verify.
    #[error("challenge response rejected")]
    ChallengeRejected,

    /// No registered expert satisfies the required capabilities.
    #[error("no eligible expert for capabilities {required:?}")]
    NoEligibleExperts { required: Vec<String> },

    /// A logged delegation is immutable.
    #[error("delegation `{delegation_id}` already reached a terminal verdict")]
    DelegationImmutable { delegation_id: String },

    /// Overall delegation deadline elapsed before a verdict.
    #[error("delegation deadline exceeded")]
    DeadlineExceeded,

    /// No secret material is provisioned for the expert.
    #[error("no key material provisioned for expert")]
    SecretUnavailable,
}

impl ExpertError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownExpert | Self::NoEligibleExperts { .. } => ErrorKind::NotFound,
            Self::ChallengeNotPending | Self::ChallengeExpired => ErrorKind::InvalidToken,
            Self::ChallengeRejected | Self::SecretUnavailable => ErrorKind::Unauthenticated,
            Self::DelegationImmutable { .. } => ErrorKind::Conflict,
            Self::DeadlineExceeded => ErrorKind::Timeout,
        }
    }
}

/// Project aggregate errors.
#[derive(Error, Debug)]
pub enum AggregateError {
    /// Named snapshot does not exist.
    #[error("no snapshot named `{name}`")]
    UnknownSnapshot { name: String },

    /// Snapshot name already materialized.
    #[error("snapshot name `{name}` is taken")]
    SnapshotNameTaken { name: String },

    /// Requested path is not present in the shadow tree.
    #[error("shadow path not found")]
    PathNotFound,
}

impl AggregateError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownSnapshot { .. } | Self::PathNotFound => ErrorKind::NotFound,
            Self::SnapshotNameTaken { .. } => ErrorKind::Conflict,
        }
    }
}

/// Pair session errors.
#[derive(Error, Debug)]
pub enum PairError {
    /// Pair id is unknown.
    #[error("no such pair session")]
    NotFound,

    /// Caller is not one of the pair's two participants.
    #[error("caller is not a participant of this pair session")]
    NotParticipant,

    /// Operation is invalid in the pair's current state.
    #[error("pair session is {state}, operation requires {required}")]
    WrongState {
        state: &'static str,
        required: &'static str,
    },
}

impl PairError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::NotParticipant => ErrorKind::PermissionDenied,
            Self::WrongState { .. } => ErrorKind::Conflict,
        }
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),

    #[error("failed to read config file {path}: {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    /// Covers unknown options as well: parsing is strict.
    #[error("failed to parse config: {0}")]
    ParseFailed(String),

    #[error("invalid config: {0}")]
    Validation(String),

    /// The authentication secret could not be loaded.
    #[error("authentication secret unavailable")]
    SecretUnavailable,
}

/// Canonical encoding errors.
#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("unsupported log format version {0}")]
    UnsupportedVersion(u8),

    #[error("record truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("invalid UTF-8 in field {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("unknown event type `{0}`")]
    UnknownEventType(String),

    #[error("payload does not match event type `{event_type}`: {reason}")]
    PayloadMismatch {
        event_type: &'static str,
        reason: String,
    },

    #[error("trailing bytes after record")]
    TrailingBytes,
}
