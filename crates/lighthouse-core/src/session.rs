//! Session security: issue, bind, validate, and revoke session tokens.
//!
//! A token is `session_id:agent_id:issued_at_ms:mac` where
//! `mac = HMAC(secret, session_id ‖ agent_id ‖ issued_at_ms)`, transported
//! base64url-encoded so clients treat it as opaque. A token authenticates
//! exactly one session, and a session is bound to the (ip, user agent) pair
//! it was created from: presenting the token from anywhere else revokes the
//! session and fails with `bound_mismatch`.
//!
//! The manager shares the process-wide identity registry and HMAC secret; it
//! never constructs its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SessionError;
use crate::identity::{AgentIdentity, IdentityRegistry, constant_time_eq};
use crate::rate_limit::RateLimiter;
use crate::secret::AuthSecret;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Active,
    Revoked,
    Expired,
}

/// Timeouts and caps applied by the manager.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_concurrent_per_agent: u32,
    pub idle_timeout: Duration,
    pub absolute_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_concurrent_per_agent: 4,
            idle_timeout: Duration::from_secs(30 * 60),
            absolute_timeout: Duration::from_secs(12 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    session_id: String,
    agent_id: String,
    created: Instant,
    last_activity: Instant,
    state: SessionState,
    ip_addr: String,
    user_agent: String,
}

/// Issued token plus the session id it authenticates.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session_id: String,
    pub token: String,
}

/// Session manager. One per process, sharing the singleton registry/secret.
pub struct SessionManager {
    secret: Arc<AuthSecret>,
    registry: Arc<IdentityRegistry>,
    limits: SessionLimits,
    sessions: RwLock<HashMap<String, Session>>,
    limiter: Mutex<RateLimiter>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        secret: Arc<AuthSecret>,
        registry: Arc<IdentityRegistry>,
        limits: SessionLimits,
        rate_limit_per_minute: u32,
    ) -> Self {
        Self {
            secret,
            registry,
            limits,
            sessions: RwLock::new(HashMap::new()),
            limiter: Mutex::new(RateLimiter::new(rate_limit_per_minute)),
        }
    }

    /// Create a session for `agent_id`, binding it to `(ip, user_agent)`.
    pub fn create_session(
        &self,
        agent_id: &str,
        credential: &str,
        ip_addr: &str,
        user_agent: &str,
    ) -> Result<IssuedSession, SessionError> {
        if self.registry.authenticate(agent_id).is_none() {
            return Err(SessionError::UnknownAgent);
        }
        if !self.registry.verify_credential(agent_id, credential) {
            return Err(SessionError::InvalidCredential);
        }

        let mut sessions = self.write_sessions();
        Self::expire_stale(&mut sessions, &self.limits);
        let active = sessions
            .values()
            .filter(|s| s.agent_id == agent_id && s.state == SessionState::Active)
            .count();
        if active >= self.limits.max_concurrent_per_agent as usize {
            return Err(SessionError::TooManySessions {
                limit: self.limits.max_concurrent_per_agent,
            });
        }

        let session_id = generate_session_id();
        let issued_at_ms = chrono::Utc::now().timestamp_millis();
        let token = self.encode_token(&session_id, agent_id, issued_at_ms);

        let now = Instant::now();
        sessions.insert(
            session_id.clone(),
            Session {
                session_id: session_id.clone(),
                agent_id: agent_id.to_string(),
                created: now,
                last_activity: now,
                state: SessionState::Active,
                ip_addr: ip_addr.to_string(),
                user_agent: user_agent.to_string(),
            },
        );
        info!(agent_id, session_id, "session created");

        Ok(IssuedSession { session_id, token })
    }

    /// Validate a token presented from `(ip, user_agent)` and return the
    /// caller's identity. Refreshes the session's activity clock.
    pub fn validate(
        &self,
        token: &str,
        ip_addr: &str,
        user_agent: &str,
    ) -> Result<AgentIdentity, SessionError> {
        let parsed = self.parse_token(token)?;

        let mut sessions = self.write_sessions();
        let session = sessions
            .get_mut(&parsed.session_id)
            .ok_or(SessionError::InvalidToken)?;
        if session.agent_id != parsed.agent_id {
            return Err(SessionError::InvalidToken);
        }

        match session.state {
            SessionState::Revoked => return Err(SessionError::Revoked),
            SessionState::Expired => return Err(SessionError::Expired),
            SessionState::Pending | SessionState::Active => {}
        }

        if session.created.elapsed() > self.limits.absolute_timeout
            || session.last_activity.elapsed() > self.limits.idle_timeout
        {
            session.state = SessionState::Expired;
            return Err(SessionError::Expired);
        }

        // Rebinding to a different origin revokes the session outright.
        if !constant_time_eq(session.ip_addr.as_bytes(), ip_addr.as_bytes())
            || !constant_time_eq(session.user_agent.as_bytes(), user_agent.as_bytes())
        {
            session.state = SessionState::Revoked;
            warn!(
                session_id = session.session_id,
                agent_id = session.agent_id,
                "session binding mismatch; revoked"
            );
            return Err(SessionError::BoundMismatch);
        }

        let agent_id = session.agent_id.clone();
        drop(sessions);

        {
            let mut limiter = self.limiter.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !limiter.check(&agent_id) {
                return Err(SessionError::RateLimited);
            }
        }

        let identity = self
            .registry
            .authenticate(&agent_id)
            .ok_or(SessionError::UnknownAgent)?;

        let mut sessions = self.write_sessions();
        if let Some(session) = sessions.get_mut(&parsed.session_id) {
            session.last_activity = Instant::now();
        }

        Ok(identity)
    }

    /// Revoke the session a token authenticates. Returns its session id.
    pub fn revoke(&self, token: &str, reason: &str) -> Result<String, SessionError> {
        let parsed = self.parse_token(token)?;
        let mut sessions = self.write_sessions();
        let session = sessions
            .get_mut(&parsed.session_id)
            .ok_or(SessionError::NotFound)?;
        session.state = SessionState::Revoked;
        info!(session_id = session.session_id, reason, "session revoked");
        Ok(session.session_id.clone())
    }

    /// Revoke every session of an agent. Returns the revoked session ids.
    pub fn revoke_agent(&self, agent_id: &str, reason: &str) -> Vec<String> {
        let mut sessions = self.write_sessions();
        let mut revoked = Vec::new();
        for session in sessions.values_mut() {
            if session.agent_id == agent_id && session.state == SessionState::Active {
                session.state = SessionState::Revoked;
                revoked.push(session.session_id.clone());
            }
        }
        info!(agent_id, reason, count = revoked.len(), "agent sessions revoked");
        revoked
    }

    /// Active sessions currently held by an agent.
    #[must_use]
    pub fn active_sessions(&self, agent_id: &str) -> usize {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions
            .values()
            .filter(|s| s.agent_id == agent_id && s.state == SessionState::Active)
            .count()
    }

    fn write_sessions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Session>> {
        self.sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn expire_stale(sessions: &mut HashMap<String, Session>, limits: &SessionLimits) {
        for session in sessions.values_mut() {
            if session.state == SessionState::Active
                && (session.created.elapsed() > limits.absolute_timeout
                    || session.last_activity.elapsed() > limits.idle_timeout)
            {
                session.state = SessionState::Expired;
            }
        }
    }

    fn encode_token(&self, session_id: &str, agent_id: &str, issued_at_ms: i64) -> String {
        let issued = issued_at_ms.to_string();
        let mac = self.secret.mac(&[
            session_id.as_bytes(),
            agent_id.as_bytes(),
            issued.as_bytes(),
        ]);
        let raw = format!("{session_id}:{agent_id}:{issued}:{}", hex::encode(mac));
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    fn parse_token(&self, token: &str) -> Result<ParsedToken, SessionError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| SessionError::InvalidToken)?;
        let raw = String::from_utf8(raw).map_err(|_| SessionError::InvalidToken)?;

        // session ids contain no `:`; agent ids may, so peel from both ends.
        let (session_id, rest) = raw.split_once(':').ok_or(SessionError::InvalidToken)?;
        let (rest, mac_hex) = rest.rsplit_once(':').ok_or(SessionError::InvalidToken)?;
        let (agent_id, issued) = rest.rsplit_once(':').ok_or(SessionError::InvalidToken)?;

        let mac = hex::decode(mac_hex).map_err(|_| SessionError::InvalidToken)?;
        if !self.secret.verify(
            &[session_id.as_bytes(), agent_id.as_bytes(), issued.as_bytes()],
            &mac,
        ) {
            return Err(SessionError::InvalidToken);
        }

        Ok(ParsedToken {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
        })
    }
}

struct ParsedToken {
    session_id: String,
    agent_id: String,
}

fn generate_session_id() -> String {
    let mut buf = [0u8; 12];
    rand::rng().fill_bytes(&mut buf);
    format!("sess_{}", hex::encode(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventPayload, EventType};
    use crate::identity::{SYSTEM_AGENT_ID, credential_hash};

    fn registry_with_alice() -> Arc<IdentityRegistry> {
        let registry = IdentityRegistry::new();
        registry.apply_event(&Event {
            sequence: 1,
            event_id: "ev_boot".into(),
            event_type: EventType::IdentityBootstrapped,
            aggregate_id: "agent:alice".into(),
            agent_id: SYSTEM_AGENT_ID.into(),
            timestamp_ms: 0,
            causation_id: None,
            payload: EventPayload::IdentityBootstrapped {
                agent_id: "alice".into(),
                role: "agent".into(),
                capabilities: vec![],
                credential_hash: credential_hash("pw"),
            },
            integrity_tag: String::new(),
        });
        registry
    }

    fn manager(limits: SessionLimits) -> SessionManager {
        SessionManager::new(
            Arc::new(AuthSecret::new(b"test-secret".to_vec())),
            registry_with_alice(),
            limits,
            1000,
        )
    }

    #[test]
    fn create_and_validate_roundtrip() {
        let manager = manager(SessionLimits::default());
        let issued = manager
            .create_session("alice", "pw", "10.0.0.1", "X")
            .unwrap();
        let identity = manager.validate(&issued.token, "10.0.0.1", "X").unwrap();
        assert_eq!(identity.agent_id, "alice");
    }

    #[test]
    fn unknown_agent_is_not_auto_created() {
        let manager = manager(SessionLimits::default());
        let err = manager
            .create_session("mallory", "pw", "10.0.0.1", "X")
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownAgent));
        // A second attempt fails identically: nothing was created.
        let err = manager
            .create_session("mallory", "pw", "10.0.0.1", "X")
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownAgent));
    }

    #[test]
    fn bad_credential_rejected() {
        let manager = manager(SessionLimits::default());
        let err = manager
            .create_session("alice", "wrong", "10.0.0.1", "X")
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidCredential));
    }

    #[test]
    fn different_ip_is_bound_mismatch_and_revokes() {
        let manager = manager(SessionLimits::default());
        let issued = manager
            .create_session("alice", "pw", "10.0.0.1", "X")
            .unwrap();

        let err = manager.validate(&issued.token, "10.0.0.2", "X").unwrap_err();
        assert!(matches!(err, SessionError::BoundMismatch));

        // The mismatch revoked the session: the original origin fails too.
        let err = manager.validate(&issued.token, "10.0.0.1", "X").unwrap_err();
        assert!(matches!(err, SessionError::Revoked));
    }

    #[test]
    fn different_user_agent_is_bound_mismatch() {
        let manager = manager(SessionLimits::default());
        let issued = manager
            .create_session("alice", "pw", "10.0.0.1", "X")
            .unwrap();
        let err = manager.validate(&issued.token, "10.0.0.1", "Y").unwrap_err();
        assert!(matches!(err, SessionError::BoundMismatch));
    }

    #[test]
    fn concurrency_cap_enforced() {
        let limits = SessionLimits {
            max_concurrent_per_agent: 2,
            ..SessionLimits::default()
        };
        let manager = manager(limits);
        manager.create_session("alice", "pw", "ip", "ua").unwrap();
        manager.create_session("alice", "pw", "ip", "ua").unwrap();
        let err = manager
            .create_session("alice", "pw", "ip", "ua")
            .unwrap_err();
        assert!(matches!(err, SessionError::TooManySessions { limit: 2 }));
    }

    #[test]
    fn revoked_token_fails() {
        let manager = manager(SessionLimits::default());
        let issued = manager
            .create_session("alice", "pw", "ip", "ua")
            .unwrap();
        manager.revoke(&issued.token, "logout").unwrap();
        let err = manager.validate(&issued.token, "ip", "ua").unwrap_err();
        assert!(matches!(err, SessionError::Revoked));
    }

    #[test]
    fn revoke_agent_clears_all_sessions() {
        let manager = manager(SessionLimits::default());
        manager.create_session("alice", "pw", "ip", "ua").unwrap();
        manager.create_session("alice", "pw", "ip", "ua").unwrap();
        let revoked = manager.revoke_agent("alice", "security");
        assert_eq!(revoked.len(), 2);
        assert_eq!(manager.active_sessions("alice"), 0);
    }

    #[test]
    fn idle_timeout_expires_session() {
        let limits = SessionLimits {
            idle_timeout: Duration::from_millis(0),
            ..SessionLimits::default()
        };
        let manager = manager(limits);
        let issued = manager
            .create_session("alice", "pw", "ip", "ua")
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let err = manager.validate(&issued.token, "ip", "ua").unwrap_err();
        assert!(matches!(err, SessionError::Expired));
    }

    #[test]
    fn forged_token_rejected() {
        let manager = manager(SessionLimits::default());
        let issued = manager
            .create_session("alice", "pw", "ip", "ua")
            .unwrap();

        // Token minted under a different secret fails even with valid shape.
        let other = SessionManager::new(
            Arc::new(AuthSecret::new(b"other-secret".to_vec())),
            registry_with_alice(),
            SessionLimits::default(),
            1000,
        );
        let err = other.validate(&issued.token, "ip", "ua").unwrap_err();
        assert!(matches!(err, SessionError::InvalidToken));

        // Garbage is rejected outright.
        let err = manager.validate("not-a-token", "ip", "ua").unwrap_err();
        assert!(matches!(err, SessionError::InvalidToken));
    }

    #[test]
    fn rate_limit_gates_validate() {
        let manager = SessionManager::new(
            Arc::new(AuthSecret::new(b"s".to_vec())),
            registry_with_alice(),
            SessionLimits::default(),
            2,
        );
        let issued = manager
            .create_session("alice", "pw", "ip", "ua")
            .unwrap();
        assert!(manager.validate(&issued.token, "ip", "ua").is_ok());
        assert!(manager.validate(&issued.token, "ip", "ua").is_ok());
        let err = manager.validate(&issued.token, "ip", "ua").unwrap_err();
        assert!(matches!(err, SessionError::RateLimited));
    }

    #[test]
    fn tokens_are_opaque_base64() {
        let manager = manager(SessionLimits::default());
        let issued = manager
            .create_session("alice", "pw", "ip", "ua")
            .unwrap();
        assert!(!issued.token.contains(':'));
        assert!(URL_SAFE_NO_PAD.decode(issued.token.as_bytes()).is_ok());
    }
}
