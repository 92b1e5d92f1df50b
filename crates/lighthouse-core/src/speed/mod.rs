//! Speed layer: tiered command classification.
//!
//! Three tiers answer "is this command safe?": a memory cache keyed by
//! fingerprint, a compiled policy rule set, and a learned-pattern classifier.
//! Any tier may approve, deny, or abstain; the first non-abstaining tier
//! wins. When every tier abstains (or a rule demands it), the request
//! escalates to the expert coordinator.
//!
//! The dispatcher coalesces concurrent escalations with identical
//! fingerprints into a single upstream delegation and fans the result out. A
//! circuit breaker watches escalation failures; while open, escalations fail
//! closed unless the caller holds `system.admin`.

pub mod fingerprint;
pub mod memory;
pub mod pattern;
pub mod policy;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use crate::authz::{self, Permission};
use crate::circuit::{CircuitBreaker, CircuitConfig};
use crate::event::DelegationVerdict;
use crate::identity::AgentIdentity;

use fingerprint::{CommandRequest, Fingerprint};
use memory::{CachedDecision, MemoryCache};
use pattern::{CommandFeatures, PatternClassifier};
use policy::PolicyEngine;

/// Verdict from a single tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierVerdict {
    Approve,
    Deny,
    Abstain,
    Escalate,
}

/// Which stage produced the final decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    MemoryCache,
    Policy,
    Pattern,
    Expert,
    CircuitFailClosed,
}

/// The speed layer's answer for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub fingerprint: Fingerprint,
    pub verdict: DelegationVerdict,
    pub source: DecisionSource,
    pub reason: String,
}

/// Result handed back by the escalation path.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationOutcome {
    pub verdict: DelegationVerdict,
    pub reason: String,
}

/// Upstream contract: the expert coordinator, as seen from the speed layer.
#[async_trait::async_trait]
pub trait Escalator: Send + Sync {
    async fn escalate(
        &self,
        request: &CommandRequest,
        fingerprint: &Fingerprint,
        requester: &AgentIdentity,
        deadline: Duration,
    ) -> Result<EscalationOutcome, crate::error::Error>;
}

/// Speed layer tunables.
#[derive(Debug, Clone)]
pub struct SpeedLayerOptions {
    pub memory_capacity: usize,
    /// Deadline handed to expert escalation.
    pub expert_deadline: Duration,
    /// Minimum classifier confidence for a pattern verdict to settle.
    pub pattern_confidence_floor: f64,
    pub circuit: CircuitConfig,
}

impl Default for SpeedLayerOptions {
    fn default() -> Self {
        Self {
            memory_capacity: 8192,
            expert_deadline: Duration::from_secs(30),
            pattern_confidence_floor: 0.75,
            circuit: CircuitConfig::default(),
        }
    }
}

/// The three-tier classifier plus escalation dispatcher.
pub struct SpeedLayer {
    memory: MemoryCache,
    policy: PolicyEngine,
    classifier: Arc<dyn PatternClassifier>,
    escalator: Arc<dyn Escalator>,
    circuit: StdMutex<CircuitBreaker>,
    in_flight: Mutex<HashMap<Fingerprint, watch::Receiver<Option<Decision>>>>,
    options: SpeedLayerOptions,
}

impl SpeedLayer {
    #[must_use]
    pub fn new(
        policy: PolicyEngine,
        classifier: Arc<dyn PatternClassifier>,
        escalator: Arc<dyn Escalator>,
        options: SpeedLayerOptions,
    ) -> Self {
        Self {
            memory: MemoryCache::new(options.memory_capacity),
            policy,
            classifier,
            escalator,
            circuit: StdMutex::new(CircuitBreaker::new(options.circuit.clone())),
            in_flight: Mutex::new(HashMap::new()),
            options,
        }
    }

    /// Classify a command for an authenticated caller.
    pub async fn validate(&self, request: &CommandRequest, identity: &AgentIdentity) -> Decision {
        let fp = fingerprint::fingerprint(request, identity.role);

        // Tier 1: memory cache.
        if let Some(cached) = self.memory.get(&fp) {
            debug!(fingerprint = %fp, "memory cache hit");
            return Decision {
                fingerprint: fp,
                verdict: cached.verdict,
                source: DecisionSource::MemoryCache,
                reason: cached.reason,
            };
        }

        // Tier 2: compiled policy rules.
        if let Some(matched) = self.policy.evaluate(request, identity.role) {
            match matched.verdict {
                TierVerdict::Approve => {
                    return self.settle(
                        fp,
                        DelegationVerdict::Approve,
                        DecisionSource::Policy,
                        matched.reason,
                    );
                }
                TierVerdict::Deny => {
                    return self.settle(
                        fp,
                        DelegationVerdict::Deny,
                        DecisionSource::Policy,
                        matched.reason,
                    );
                }
                TierVerdict::Escalate => {
                    return self.escalate(request, fp, identity, matched.reason).await;
                }
                TierVerdict::Abstain => {}
            }
        }

        // Tier 3: learned patterns, consulted only after the caches abstain.
        let features = CommandFeatures::extract(request);
        let classified = self.classifier.classify(&features);
        if classified.confidence >= self.options.pattern_confidence_floor {
            match classified.verdict {
                TierVerdict::Approve => {
                    return self.settle(
                        fp,
                        DelegationVerdict::Approve,
                        DecisionSource::Pattern,
                        format!("pattern classifier ({:.2})", classified.confidence),
                    );
                }
                TierVerdict::Deny => {
                    return self.settle(
                        fp,
                        DelegationVerdict::Deny,
                        DecisionSource::Pattern,
                        format!("pattern classifier ({:.2})", classified.confidence),
                    );
                }
                TierVerdict::Escalate | TierVerdict::Abstain => {}
            }
        }

        // All tiers abstained.
        self.escalate(request, fp, identity, "no tier reached a verdict".to_string())
            .await
    }

    /// Current escalation circuit status.
    #[must_use]
    pub fn circuit_status(&self) -> crate::circuit::CircuitStatus {
        self.circuit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .status()
    }

    fn settle(
        &self,
        fingerprint: Fingerprint,
        verdict: DelegationVerdict,
        source: DecisionSource,
        reason: String,
    ) -> Decision {
        self.memory.put(
            fingerprint.clone(),
            CachedDecision {
                verdict,
                reason: reason.clone(),
            },
        );
        Decision {
            fingerprint,
            verdict,
            source,
            reason,
        }
    }

    async fn escalate(
        &self,
        request: &CommandRequest,
        fp: Fingerprint,
        identity: &AgentIdentity,
        reason: String,
    ) -> Decision {
        // Fail closed while the circuit is open, except for system admins,
        // who may still reach the coordinator.
        let is_admin = authz::role_has(identity.role, Permission::SystemAdmin);
        {
            let mut circuit = self
                .circuit
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !circuit.allow() && !is_admin {
                let retry_after_ms = circuit.retry_after_ms();
                return Decision {
                    fingerprint: fp,
                    verdict: DelegationVerdict::Deny,
                    source: DecisionSource::CircuitFailClosed,
                    reason: format!("escalation circuit open; retry in {retry_after_ms} ms"),
                };
            }
        }

        // Coalesce concurrent escalations of the same fingerprint.
        let (tx, follower) = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(rx) = in_flight.get(&fp) {
                (None, Some(rx.clone()))
            } else {
                let (tx, rx) = watch::channel(None);
                in_flight.insert(fp.clone(), rx);
                (Some(tx), None)
            }
        };

        if let Some(mut rx) = follower {
            debug!(fingerprint = %fp, "coalescing with in-flight escalation");
            let decision = match rx.wait_for(Option::is_some).await {
                Ok(settled) => (*settled).clone(),
                Err(_) => None,
            };
            return decision.unwrap_or(Decision {
                fingerprint: fp,
                verdict: DelegationVerdict::Deny,
                source: DecisionSource::Expert,
                reason: "coalesced escalation failed".to_string(),
            });
        }
        let tx = tx.expect("leader holds the sender");

        let outcome = tokio::time::timeout(
            self.options.expert_deadline,
            self.escalator
                .escalate(request, &fp, identity, self.options.expert_deadline),
        )
        .await;

        let decision = match outcome {
            Ok(Ok(outcome)) => {
                self.record_circuit(true);
                let decision = Decision {
                    fingerprint: fp.clone(),
                    verdict: outcome.verdict,
                    source: DecisionSource::Expert,
                    reason: format!("{reason}; {}", outcome.reason),
                };
                self.memory.put(
                    fp.clone(),
                    CachedDecision {
                        verdict: decision.verdict,
                        reason: decision.reason.clone(),
                    },
                );
                decision
            }
            Ok(Err(err)) => {
                self.record_circuit(false);
                warn!(fingerprint = %fp, kind = %err.kind(), "escalation failed; failing closed");
                Decision {
                    fingerprint: fp.clone(),
                    verdict: DelegationVerdict::Deny,
                    source: DecisionSource::Expert,
                    reason: "escalation failed".to_string(),
                }
            }
            Err(_) => {
                self.record_circuit(false);
                Decision {
                    fingerprint: fp.clone(),
                    verdict: DelegationVerdict::Timeout,
                    source: DecisionSource::Expert,
                    reason: "escalation deadline exceeded".to_string(),
                }
            }
        };

        let _ = tx.send(Some(decision.clone()));
        self.in_flight.lock().await.remove(&fp);
        decision
    }

    fn record_circuit(&self, success: bool) {
        let mut circuit = self
            .circuit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if success {
            circuit.record_success();
        } else {
            circuit.record_failure();
        }
    }
}
