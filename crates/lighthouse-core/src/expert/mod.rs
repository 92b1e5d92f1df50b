//! Expert coordinator: delegation routing and consensus adjudication.
//!
//! A delegation fans a command out to N experts in parallel, each call under
//! its own deadline, and folds the responses through a fixed consensus rule.
//! Ties break toward deny; timeouts count as abstentions; an all-abstain
//! panel fails closed. A delegation that has logged its verdict is immutable.
//!
//! State machine per delegation:
//! `pending → dispatched → collecting → decided → logged`.

pub mod registry;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ExpertError;
use crate::event::{
    DelegationVerdict, EventDraft, EventPayload, ExpertResponseRecord, ExpertVerdict,
};
use crate::speed::fingerprint::{CommandRequest, Fingerprint};
use crate::store::EventStore;

use registry::ExpertRegistry;

/// Delegation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationState {
    Pending,
    Dispatched,
    Collecting,
    Decided,
    Logged,
}

/// An annotation attached to an expert response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpertAnnotation {
    pub path: String,
    pub line: u32,
    pub category: String,
    pub message: String,
}

/// One expert's full response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertResponse {
    pub expert_id: String,
    pub verdict: ExpertVerdict,
    /// Confidence in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub annotations: Vec<ExpertAnnotation>,
}

/// Transport contract for reaching an expert. Implementations are external
/// adapters (HTTP, MCP, in-process harnesses).
#[async_trait::async_trait]
pub trait ExpertClient: Send + Sync {
    async fn evaluate(
        &self,
        expert_id: &str,
        request: &CommandRequest,
        deadline: Duration,
    ) -> Result<ExpertResponse, ExpertError>;
}

/// Consensus thresholds.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Panel size: 1, 3, or 5.
    pub n: usize,
    pub tau_approve: f64,
    pub tau_deny: f64,
    /// Subtracted from the requester's deadline before dispatch.
    pub safety_margin: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            n: 3,
            tau_approve: 0.6,
            tau_deny: 0.7,
            safety_margin: Duration::from_millis(250),
        }
    }
}

/// The settled result of a delegation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationOutcome {
    pub delegation_id: String,
    pub fingerprint: String,
    pub verdict: DelegationVerdict,
    pub responses: Vec<ExpertResponseRecord>,
    /// Annotations carried by expert responses, for shadow materialization.
    pub annotations: Vec<ExpertAnnotation>,
}

#[derive(Debug, Clone)]
struct DelegationRecord {
    state: DelegationState,
    outcome: DelegationOutcome,
}

/// The fixed consensus rule.
///
/// 1. Any deny with confidence ≥ τ_deny decides deny.
/// 2. Approvals with confidence ≥ τ_approve reaching ⌈N/2⌉ decide approve.
/// 3. Any needs-revision decides needs-revision.
/// 4. Otherwise deny (fail closed).
#[must_use]
pub fn consensus(
    responses: &[ExpertResponseRecord],
    n: usize,
    tau_approve: f64,
    tau_deny: f64,
) -> DelegationVerdict {
    if responses
        .iter()
        .any(|r| r.verdict == ExpertVerdict::Deny && r.confidence >= tau_deny)
    {
        return DelegationVerdict::Deny;
    }
    let approvals = responses
        .iter()
        .filter(|r| r.verdict == ExpertVerdict::Approve && r.confidence >= tau_approve)
        .count();
    if approvals >= n.div_ceil(2) {
        return DelegationVerdict::Approve;
    }
    if responses
        .iter()
        .any(|r| r.verdict == ExpertVerdict::NeedsRevision)
    {
        return DelegationVerdict::NeedsRevision;
    }
    DelegationVerdict::Deny
}

/// Coordinates expert delegations and logs their verdicts.
pub struct ExpertCoordinator {
    registry: Arc<ExpertRegistry>,
    client: Arc<dyn ExpertClient>,
    store: Arc<EventStore>,
    config: ConsensusConfig,
    delegations: RwLock<HashMap<String, DelegationRecord>>,
}

impl ExpertCoordinator {
    #[must_use]
    pub fn new(
        registry: Arc<ExpertRegistry>,
        client: Arc<dyn ExpertClient>,
        store: Arc<EventStore>,
        config: ConsensusConfig,
    ) -> Self {
        Self {
            registry,
            client,
            store,
            config,
            delegations: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ExpertRegistry> {
        &self.registry
    }

    /// Run a full delegation: select, dispatch, collect, decide, log.
    pub async fn delegate(
        &self,
        request: &CommandRequest,
        fingerprint: &Fingerprint,
        requester_agent_id: &str,
        required_capabilities: &[String],
        requester_deadline: Duration,
    ) -> Result<DelegationOutcome, ExpertError> {
        let deadline = requester_deadline.saturating_sub(self.config.safety_margin);
        if deadline.is_zero() {
            return Err(ExpertError::DeadlineExceeded);
        }

        let delegation_id = generate_delegation_id();
        let selected = self
            .registry
            .select(required_capabilities, self.config.n, &[])?;
        self.registry.mark_dispatched(&selected);
        info!(
            delegation_id,
            experts = selected.len(),
            fingerprint = %fingerprint,
            "delegation dispatched"
        );

        // Collect responses in parallel; each call carries the deadline and
        // a timed-out expert is replaced at most once.
        let mut join_set = tokio::task::JoinSet::new();
        for expert_id in &selected {
            let client = Arc::clone(&self.client);
            let expert_id = expert_id.clone();
            let request = request.clone();
            join_set.spawn(async move {
                let result = tokio::time::timeout(
                    deadline,
                    client.evaluate(&expert_id, &request, deadline),
                )
                .await;
                (expert_id, result)
            });
        }

        let mut responses: Vec<ExpertResponseRecord> = Vec::new();
        let mut annotations = Vec::new();
        let mut used = selected.clone();
        let mut settled = selected.clone();

        while let Some(joined) = join_set.join_next().await {
            let Ok((expert_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(Ok(response)) => {
                    annotations.extend(response.annotations.iter().cloned());
                    responses.push(ExpertResponseRecord {
                        expert_id: response.expert_id,
                        verdict: response.verdict,
                        confidence: response.confidence.clamp(0.0, 1.0),
                    });
                }
                Ok(Err(err)) => {
                    warn!(expert_id, kind = %err.kind(), "expert call failed; counts as abstain");
                    responses.push(abstain(&expert_id));
                }
                Err(_) => {
                    // Timeout: re-select one replacement, once. A replacement
                    // that also fails leaves the seat as an abstention.
                    match self.registry.select(required_capabilities, 1, &used) {
                        Ok(replacements) => {
                            let replacement = replacements[0].clone();
                            info!(
                                delegation_id,
                                timed_out = expert_id,
                                replacement,
                                "re-selecting after expert timeout"
                            );
                            used.push(replacement.clone());
                            settled.push(replacement.clone());
                            self.registry.mark_dispatched(std::slice::from_ref(&replacement));
                            let outcome = tokio::time::timeout(
                                deadline,
                                self.client.evaluate(&replacement, request, deadline),
                            )
                            .await;
                            match outcome {
                                Ok(Ok(response)) => {
                                    annotations.extend(response.annotations.iter().cloned());
                                    responses.push(ExpertResponseRecord {
                                        expert_id: response.expert_id,
                                        verdict: response.verdict,
                                        confidence: response.confidence.clamp(0.0, 1.0),
                                    });
                                }
                                _ => responses.push(abstain(&replacement)),
                            }
                        }
                        Err(_) => responses.push(abstain(&expert_id)),
                    }
                }
            }
        }

        self.registry.mark_settled(&settled);

        let verdict = consensus(
            &responses,
            self.config.n,
            self.config.tau_approve,
            self.config.tau_deny,
        );

        let outcome = DelegationOutcome {
            delegation_id: delegation_id.clone(),
            fingerprint: fingerprint.as_str().to_string(),
            verdict,
            responses,
            annotations,
        };

        self.delegations
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                delegation_id.clone(),
                DelegationRecord {
                    state: DelegationState::Decided,
                    outcome: outcome.clone(),
                },
            );

        self.log_decision(&outcome, requester_agent_id).await;
        Ok(outcome)
    }

    /// Look up a settled delegation.
    #[must_use]
    pub fn delegation(&self, delegation_id: &str) -> Option<(DelegationState, DelegationOutcome)> {
        self.delegations
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(delegation_id)
            .map(|r| (r.state, r.outcome.clone()))
    }

    async fn log_decision(&self, outcome: &DelegationOutcome, _requester: &str) {
        let draft = EventDraft::new(
            format!("delegation:{}", outcome.delegation_id),
            EventPayload::ExpertDecision {
                delegation_id: outcome.delegation_id.clone(),
                fingerprint: outcome.fingerprint.clone(),
                verdict: outcome.verdict,
                responses: outcome.responses.clone(),
            },
        )
        .caused_by(outcome.delegation_id.clone());

        match self.store.append_trusted(draft).await {
            Ok(receipt) => {
                let mut delegations = self
                    .delegations
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(record) = delegations.get_mut(&outcome.delegation_id) {
                    record.state = DelegationState::Logged;
                }
                info!(
                    delegation_id = outcome.delegation_id,
                    sequence = receipt.sequence,
                    verdict = ?outcome.verdict,
                    "delegation verdict logged"
                );
            }
            Err(err) => {
                warn!(
                    delegation_id = outcome.delegation_id,
                    kind = %err.kind(),
                    "failed to log delegation verdict"
                );
            }
        }

        // Annotations carried by expert responses land on the shadow paths
        // they describe, caused by this delegation.
        for annotation in &outcome.annotations {
            let draft = EventDraft::new(
                format!("file:{}", annotation.path),
                EventPayload::AnnotationAdded {
                    path: annotation.path.clone(),
                    line: annotation.line,
                    category: annotation.category.clone(),
                    message: annotation.message.clone(),
                    author: format!("delegation:{}", outcome.delegation_id),
                },
            )
            .caused_by(outcome.delegation_id.clone());
            if let Err(err) = self.store.append_trusted(draft).await {
                warn!(kind = %err.kind(), "failed to log expert annotation");
            }
        }
    }
}

/// Transport stub for deployments with no expert adapter wired: every call
/// abstains, so consensus fails closed.
#[derive(Debug, Default)]
pub struct NullExpertClient;

#[async_trait::async_trait]
impl ExpertClient for NullExpertClient {
    async fn evaluate(
        &self,
        expert_id: &str,
        _request: &CommandRequest,
        _deadline: Duration,
    ) -> Result<ExpertResponse, ExpertError> {
        Ok(ExpertResponse {
            expert_id: expert_id.to_string(),
            verdict: ExpertVerdict::Abstain,
            confidence: 0.0,
            annotations: vec![],
        })
    }
}

fn abstain(expert_id: &str) -> ExpertResponseRecord {
    ExpertResponseRecord {
        expert_id: expert_id.to_string(),
        verdict: ExpertVerdict::Abstain,
        confidence: 0.0,
    }
}

fn generate_delegation_id() -> String {
    use rand::RngCore;
    let mut buf = [0u8; 12];
    rand::rng().fill_bytes(&mut buf);
    format!("dlg_{}", hex::encode(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityRegistry, Role};
    use crate::secret::AuthSecret;
    use crate::speed::fingerprint::fingerprint;
    use crate::store::StoreOptions;
    use registry::StaticSecrets;
    use std::collections::HashMap as StdHashMap;
    use tempfile::TempDir;

    fn record(expert: &str, verdict: ExpertVerdict, confidence: f64) -> ExpertResponseRecord {
        ExpertResponseRecord {
            expert_id: expert.to_string(),
            verdict,
            confidence,
        }
    }

    // --- Consensus rule ---

    #[test]
    fn confident_deny_decides() {
        let responses = vec![
            record("a", ExpertVerdict::Approve, 0.9),
            record("b", ExpertVerdict::Approve, 0.9),
            record("c", ExpertVerdict::Deny, 0.8),
        ];
        assert_eq!(consensus(&responses, 3, 0.6, 0.7), DelegationVerdict::Deny);
    }

    #[test]
    fn weak_deny_does_not_veto() {
        let responses = vec![
            record("a", ExpertVerdict::Approve, 0.9),
            record("b", ExpertVerdict::Approve, 0.8),
            record("c", ExpertVerdict::Deny, 0.3),
        ];
        assert_eq!(consensus(&responses, 3, 0.6, 0.7), DelegationVerdict::Approve);
    }

    #[test]
    fn majority_approval_with_abstention() {
        // S5: approve(0.9), approve(0.8), abstain → approve.
        let responses = vec![
            record("a", ExpertVerdict::Approve, 0.9),
            record("b", ExpertVerdict::Approve, 0.8),
            record("c", ExpertVerdict::Abstain, 0.0),
        ];
        assert_eq!(consensus(&responses, 3, 0.6, 0.7), DelegationVerdict::Approve);
    }

    #[test]
    fn all_abstain_fails_closed() {
        let responses = vec![
            record("a", ExpertVerdict::Abstain, 0.0),
            record("b", ExpertVerdict::Abstain, 0.0),
            record("c", ExpertVerdict::Abstain, 0.0),
        ];
        assert_eq!(consensus(&responses, 3, 0.6, 0.7), DelegationVerdict::Deny);
    }

    #[test]
    fn needs_revision_when_no_majority() {
        let responses = vec![
            record("a", ExpertVerdict::Approve, 0.9),
            record("b", ExpertVerdict::NeedsRevision, 0.5),
            record("c", ExpertVerdict::Abstain, 0.0),
        ];
        assert_eq!(
            consensus(&responses, 3, 0.6, 0.7),
            DelegationVerdict::NeedsRevision
        );
    }

    #[test]
    fn low_confidence_approvals_do_not_count() {
        let responses = vec![
            record("a", ExpertVerdict::Approve, 0.5),
            record("b", ExpertVerdict::Approve, 0.5),
            record("c", ExpertVerdict::Abstain, 0.0),
        ];
        assert_eq!(consensus(&responses, 3, 0.6, 0.7), DelegationVerdict::Deny);
    }

    #[test]
    fn single_expert_panel() {
        let approve = vec![record("a", ExpertVerdict::Approve, 0.9)];
        assert_eq!(consensus(&approve, 1, 0.6, 0.7), DelegationVerdict::Approve);
        let abstain = vec![record("a", ExpertVerdict::Abstain, 0.0)];
        assert_eq!(consensus(&abstain, 1, 0.6, 0.7), DelegationVerdict::Deny);
    }

    // --- Coordinator ---

    struct ScriptedClient {
        responses: StdHashMap<String, (ExpertVerdict, f64)>,
        slow: Vec<String>,
    }

    #[async_trait::async_trait]
    impl ExpertClient for ScriptedClient {
        async fn evaluate(
            &self,
            expert_id: &str,
            _request: &CommandRequest,
            _deadline: Duration,
        ) -> Result<ExpertResponse, ExpertError> {
            if self.slow.iter().any(|s| s == expert_id) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            let (verdict, confidence) = self
                .responses
                .get(expert_id)
                .copied()
                .ok_or(ExpertError::UnknownExpert)?;
            Ok(ExpertResponse {
                expert_id: expert_id.to_string(),
                verdict,
                confidence,
                annotations: vec![],
            })
        }
    }

    fn store(dir: &TempDir) -> Arc<EventStore> {
        Arc::new(
            EventStore::open(
                StoreOptions::new(dir.path()),
                Arc::new(AuthSecret::new(b"s".to_vec())),
                IdentityRegistry::new(),
            )
            .unwrap(),
        )
    }

    fn expert_registry(ids: &[&str]) -> Arc<ExpertRegistry> {
        let mut secrets = StaticSecrets::new();
        for id in ids {
            secrets = secrets.with(id, b"k");
        }
        let registry = ExpertRegistry::new(Box::new(secrets), Duration::from_secs(60));
        for id in ids {
            let challenge =
                registry.begin_registration(id, vec!["security".to_string()], "pk");
            let response = ExpertRegistry::response_for(b"k", &challenge.nonce);
            registry
                .complete_registration(&challenge.challenge_id, &response)
                .unwrap();
        }
        Arc::new(registry)
    }

    fn fp() -> Fingerprint {
        fingerprint(&CommandRequest::new("refactor module X"), Role::Agent)
    }

    #[tokio::test]
    async fn delegation_reaches_consensus_and_logs() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let registry = expert_registry(&["e1", "e2", "e3"]);
        let client = ScriptedClient {
            responses: StdHashMap::from([
                ("e1".to_string(), (ExpertVerdict::Approve, 0.9)),
                ("e2".to_string(), (ExpertVerdict::Approve, 0.8)),
                ("e3".to_string(), (ExpertVerdict::Abstain, 0.0)),
            ]),
            slow: vec![],
        };
        let coordinator = ExpertCoordinator::new(
            registry,
            Arc::new(client),
            Arc::clone(&store),
            ConsensusConfig::default(),
        );

        let outcome = coordinator
            .delegate(
                &CommandRequest::new("refactor module X"),
                &fp(),
                "alice",
                &["security".to_string()],
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(outcome.verdict, DelegationVerdict::Approve);
        assert_eq!(outcome.responses.len(), 3);

        // The decision event is in the log, caused by the delegation id.
        let (state, _) = coordinator.delegation(&outcome.delegation_id).unwrap();
        assert_eq!(state, DelegationState::Logged);
        let (head, _) = store.head().await;
        let event = store.read_event(head).await.unwrap();
        assert_eq!(event.event_type, crate::event::EventType::ExpertDecision);
        assert_eq!(event.causation_id.as_deref(), Some(outcome.delegation_id.as_str()));
    }

    #[tokio::test]
    async fn timed_out_expert_is_replaced_once() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let registry = expert_registry(&["e1", "e2", "e3", "e4"]);
        let client = ScriptedClient {
            responses: StdHashMap::from([
                ("e1".to_string(), (ExpertVerdict::Approve, 0.9)),
                ("e2".to_string(), (ExpertVerdict::Approve, 0.9)),
                ("e4".to_string(), (ExpertVerdict::Approve, 0.9)),
            ]),
            slow: vec!["e3".to_string()],
        };
        let mut config = ConsensusConfig::default();
        config.safety_margin = Duration::from_millis(0);
        let coordinator =
            ExpertCoordinator::new(registry, Arc::new(client), store, config);

        let outcome = coordinator
            .delegate(
                &CommandRequest::new("refactor module X"),
                &fp(),
                "alice",
                &["security".to_string()],
                Duration::from_millis(300),
            )
            .await
            .unwrap();

        assert_eq!(outcome.verdict, DelegationVerdict::Approve);
        assert!(
            outcome.responses.iter().any(|r| r.expert_id == "e4"),
            "replacement voted: {:?}",
            outcome.responses
        );
    }

    #[tokio::test]
    async fn no_eligible_experts_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let registry = Arc::new(ExpertRegistry::new(
            Box::new(StaticSecrets::new()),
            Duration::from_secs(60),
        ));
        let client = ScriptedClient {
            responses: StdHashMap::new(),
            slow: vec![],
        };
        let coordinator = ExpertCoordinator::new(
            registry,
            Arc::new(client),
            store,
            ConsensusConfig::default(),
        );

        let err = coordinator
            .delegate(
                &CommandRequest::new("refactor module X"),
                &fp(),
                "alice",
                &["security".to_string()],
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExpertError::NoEligibleExperts { .. }));
    }

    #[tokio::test]
    async fn exhausted_deadline_is_rejected_before_dispatch() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let registry = expert_registry(&["e1"]);
        let client = ScriptedClient {
            responses: StdHashMap::new(),
            slow: vec![],
        };
        let coordinator = ExpertCoordinator::new(
            registry,
            Arc::new(client),
            store,
            ConsensusConfig::default(),
        );

        let err = coordinator
            .delegate(
                &CommandRequest::new("x y"),
                &fp(),
                "alice",
                &[],
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExpertError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn in_flight_counts_settle_after_delegation() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let registry = expert_registry(&["e1", "e2", "e3"]);
        let client = ScriptedClient {
            responses: StdHashMap::from([
                ("e1".to_string(), (ExpertVerdict::Approve, 0.9)),
                ("e2".to_string(), (ExpertVerdict::Approve, 0.9)),
                ("e3".to_string(), (ExpertVerdict::Approve, 0.9)),
            ]),
            slow: vec![],
        };
        let coordinator = ExpertCoordinator::new(
            Arc::clone(&registry),
            Arc::new(client),
            store,
            ConsensusConfig::default(),
        );

        coordinator
            .delegate(
                &CommandRequest::new("refactor module X"),
                &fp(),
                "alice",
                &[],
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        for id in ["e1", "e2", "e3"] {
            assert_eq!(registry.get(id).unwrap().in_flight, 0);
        }
    }
}
