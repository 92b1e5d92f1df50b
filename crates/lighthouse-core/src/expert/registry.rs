//! Expert registry: challenge authentication, capability lookup, quarantine.
//!
//! Registration is a two-step proof of possession: the registry issues a
//! single-use, expiring challenge nonce, and the expert answers with
//! `HMAC(expert_secret, nonce)`. Expert secrets live under `keys/` in the
//! data directory, provisioned out-of-band; the core only ever reads them.
//!
//! An expert that has been issued a challenge is visible as `unverified`
//! until its response verifies; only then does it become `active`.
//! Registry contents are derived from `expert.*` events; quarantining an
//! expert is an event, and neither an unverified nor a quarantined expert
//! is ever selected for new delegations.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::error::ExpertError;
use crate::event::{Event, EventPayload};

type HmacSha256 = Hmac<Sha256>;

/// Expert lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertStatus {
    Unverified,
    Active,
    Quarantined,
}

/// A registered expert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpertRecord {
    pub expert_id: String,
    pub capabilities: BTreeSet<String>,
    pub public_id: String,
    pub status: ExpertStatus,
    /// Delegations currently assigned. Selection prefers idle experts.
    pub in_flight: u32,
}

/// An issued registration challenge.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub challenge_id: String,
    pub nonce: String,
    pub expires_in: Duration,
}

#[derive(Debug)]
struct PendingChallenge {
    expert_id: String,
    capabilities: BTreeSet<String>,
    public_id: String,
    nonce: String,
    issued: Instant,
}

/// Source of per-expert secret material.
pub trait SecretProvider: Send + Sync {
    fn secret_for(&self, expert_id: &str) -> Option<Vec<u8>>;
}

/// Reads `keys/<expert_id>.key` from the data directory.
pub struct KeysDirProvider {
    keys_dir: PathBuf,
}

impl KeysDirProvider {
    #[must_use]
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            keys_dir: keys_dir.into(),
        }
    }
}

impl SecretProvider for KeysDirProvider {
    fn secret_for(&self, expert_id: &str) -> Option<Vec<u8>> {
        // Expert ids become file names; refuse anything path-like.
        if expert_id.contains(['/', '\\', '.']) {
            return None;
        }
        let path = self.keys_dir.join(format!("{expert_id}.key"));
        let raw = std::fs::read(path).ok()?;
        let trimmed: Vec<u8> = raw
            .strip_suffix(b"\n")
            .unwrap_or(&raw)
            .to_vec();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

struct RegistryInner {
    experts: HashMap<String, ExpertRecord>,
    pending: HashMap<String, PendingChallenge>,
}

/// The expert registry.
pub struct ExpertRegistry {
    secrets: Box<dyn SecretProvider>,
    challenge_ttl: Duration,
    inner: RwLock<RegistryInner>,
}

impl ExpertRegistry {
    #[must_use]
    pub fn new(secrets: Box<dyn SecretProvider>, challenge_ttl: Duration) -> Self {
        Self {
            secrets,
            challenge_ttl,
            inner: RwLock::new(RegistryInner {
                experts: HashMap::new(),
                pending: HashMap::new(),
            }),
        }
    }

    /// Step one: issue a challenge for an expert wanting to register.
    ///
    /// The expert becomes visible as `unverified` until its response
    /// verifies. An already-registered expert keeps its current status.
    pub fn begin_registration(
        &self,
        expert_id: &str,
        capabilities: impl IntoIterator<Item = String>,
        public_id: &str,
    ) -> Challenge {
        let mut nonce_bytes = [0u8; 24];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);
        let mut id_bytes = [0u8; 8];
        rand::rng().fill_bytes(&mut id_bytes);
        let challenge_id = format!("chal_{}", hex::encode(id_bytes));
        let capabilities: BTreeSet<String> = capabilities.into_iter().collect();

        let mut inner = self.write();
        inner
            .experts
            .entry(expert_id.to_string())
            .or_insert_with(|| ExpertRecord {
                expert_id: expert_id.to_string(),
                capabilities: capabilities.clone(),
                public_id: public_id.to_string(),
                status: ExpertStatus::Unverified,
                in_flight: 0,
            });
        inner.pending.insert(
            challenge_id.clone(),
            PendingChallenge {
                expert_id: expert_id.to_string(),
                capabilities,
                public_id: public_id.to_string(),
                nonce: nonce.clone(),
                issued: Instant::now(),
            },
        );

        Challenge {
            challenge_id,
            nonce,
            expires_in: self.challenge_ttl,
        }
    }

    /// Step two: verify `HMAC(expert_secret, nonce)`. The challenge is
    /// consumed whether or not verification succeeds.
    pub fn complete_registration(
        &self,
        challenge_id: &str,
        response_mac_hex: &str,
    ) -> Result<ExpertRecord, ExpertError> {
        let pending = {
            let mut inner = self.write();
            inner
                .pending
                .remove(challenge_id)
                .ok_or(ExpertError::ChallengeNotPending)?
        };

        if pending.issued.elapsed() > self.challenge_ttl {
            return Err(ExpertError::ChallengeExpired);
        }

        let secret = self
            .secrets
            .secret_for(&pending.expert_id)
            .ok_or(ExpertError::SecretUnavailable)?;
        let response = hex::decode(response_mac_hex).map_err(|_| ExpertError::ChallengeRejected)?;

        let mut mac =
            HmacSha256::new_from_slice(&secret).expect("hmac accepts any key length");
        mac.update(pending.nonce.as_bytes());
        if mac.verify_slice(&response).is_err() {
            warn!(expert_id = pending.expert_id, "challenge response rejected");
            return Err(ExpertError::ChallengeRejected);
        }

        let mut inner = self.write();
        let record = inner
            .experts
            .entry(pending.expert_id.clone())
            .or_insert_with(|| ExpertRecord {
                expert_id: pending.expert_id.clone(),
                capabilities: BTreeSet::new(),
                public_id: String::new(),
                status: ExpertStatus::Unverified,
                in_flight: 0,
            });
        record.status = ExpertStatus::Active;
        record.capabilities = pending.capabilities;
        record.public_id = pending.public_id;
        let record = record.clone();
        drop(inner);
        info!(expert_id = record.expert_id, "expert registered");
        Ok(record)
    }

    /// Compute the expected response for an expert's secret. Test and client
    /// convenience; the secret itself never crosses the registry boundary.
    #[must_use]
    pub fn response_for(secret: &[u8], nonce: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(nonce.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Select up to `n` active experts whose capabilities intersect the
    /// required set, preferring idle experts over loaded ones. `exclude`
    /// skips experts already used in this delegation.
    pub fn select(
        &self,
        required: &[String],
        n: usize,
        exclude: &[String],
    ) -> Result<Vec<String>, ExpertError> {
        let inner = self.read();
        let mut eligible: Vec<&ExpertRecord> = inner
            .experts
            .values()
            .filter(|e| e.status == ExpertStatus::Active)
            .filter(|e| !exclude.contains(&e.expert_id))
            .filter(|e| {
                required.is_empty() || required.iter().any(|cap| e.capabilities.contains(cap))
            })
            .collect();
        if eligible.is_empty() {
            return Err(ExpertError::NoEligibleExperts {
                required: required.to_vec(),
            });
        }
        eligible.sort_by(|a, b| {
            a.in_flight
                .cmp(&b.in_flight)
                .then_with(|| a.expert_id.cmp(&b.expert_id))
        });
        Ok(eligible
            .into_iter()
            .take(n)
            .map(|e| e.expert_id.clone())
            .collect())
    }

    /// Mark experts as carrying one more in-flight delegation.
    pub fn mark_dispatched(&self, expert_ids: &[String]) {
        let mut inner = self.write();
        for id in expert_ids {
            if let Some(expert) = inner.experts.get_mut(id) {
                expert.in_flight = expert.in_flight.saturating_add(1);
            }
        }
    }

    /// Release in-flight slots after a delegation settles.
    pub fn mark_settled(&self, expert_ids: &[String]) {
        let mut inner = self.write();
        for id in expert_ids {
            if let Some(expert) = inner.experts.get_mut(id) {
                expert.in_flight = expert.in_flight.saturating_sub(1);
            }
        }
    }

    /// Look up a registered expert.
    #[must_use]
    pub fn get(&self, expert_id: &str) -> Option<ExpertRecord> {
        self.read().experts.get(expert_id).cloned()
    }

    /// Fold an `expert.*` event into the registry.
    pub fn apply_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::ExpertRegistered {
                expert_id,
                capabilities,
                public_id,
            } => {
                let mut inner = self.write();
                let record = inner
                    .experts
                    .entry(expert_id.clone())
                    .or_insert_with(|| ExpertRecord {
                        expert_id: expert_id.clone(),
                        capabilities: BTreeSet::new(),
                        public_id: String::new(),
                        status: ExpertStatus::Unverified,
                        in_flight: 0,
                    });
                // A logged registration supersedes any unverified challenge
                // state, but never reinstates a quarantined expert.
                if record.status != ExpertStatus::Quarantined {
                    record.status = ExpertStatus::Active;
                }
                record.capabilities = capabilities.iter().cloned().collect();
                record.public_id = public_id.clone();
            }
            EventPayload::ExpertQuarantined { expert_id, .. } => {
                let mut inner = self.write();
                if let Some(expert) = inner.experts.get_mut(expert_id) {
                    expert.status = ExpertStatus::Quarantined;
                } else {
                    warn!(expert_id, "quarantine event for unknown expert");
                }
            }
            _ => {}
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// In-memory secrets for tests and embedded deployments.
#[derive(Default)]
pub struct StaticSecrets {
    secrets: HashMap<String, Vec<u8>>,
}

impl StaticSecrets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, expert_id: &str, secret: &[u8]) -> Self {
        self.secrets.insert(expert_id.to_string(), secret.to_vec());
        self
    }
}

impl SecretProvider for StaticSecrets {
    fn secret_for(&self, expert_id: &str) -> Option<Vec<u8>> {
        self.secrets.get(expert_id).cloned()
    }
}
