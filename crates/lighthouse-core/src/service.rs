//! The coordination core facade.
//!
//! [`CoreService`] is the single construction point: it builds the
//! process-wide identity registry and HMAC secret exactly once and threads
//! the same `Arc`s into every component. Adapters call the methods here and
//! do nothing else.
//!
//! Mutating flow: identify (session) → classify (speed layer) → authorize →
//! append (store) → materialize (derived views). Query flow: identify →
//! authorize → read.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::aggregate::{Materializer, ProjectAggregate, ShadowSearchPage, ShadowSearchQuery};
use crate::authz::{self, Permission};
use crate::circuit::CircuitConfig;
use crate::config::CoreConfig;
use crate::error::{AggregateError, Error, SessionError};
use crate::event::{Event, EventDraft, EventPayload};
use crate::expert::registry::{Challenge, ExpertRegistry, KeysDirProvider};
use crate::expert::{
    ConsensusConfig, DelegationOutcome, ExpertClient, ExpertCoordinator,
};
use crate::identity::{AgentIdentity, IdentityRegistry, Role, credential_hash};
use crate::pair::PairManager;
use crate::secret::AuthSecret;
use crate::session::{IssuedSession, SessionLimits, SessionManager};
use crate::speed::fingerprint::{CommandRequest, Fingerprint};
use crate::speed::pattern::PatternClassifier;
use crate::speed::policy::PolicyEngine;
use crate::speed::{
    Decision, EscalationOutcome, Escalator, SpeedLayer, SpeedLayerOptions,
};
use crate::store::{AppendReceipt, EventStore, QueryFilter, QueryPage, StoreOptions};

/// Origin of a client connection, bound into its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOrigin {
    pub ip_addr: String,
    pub user_agent: String,
}

impl ClientOrigin {
    #[must_use]
    pub fn new(ip_addr: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_addr: ip_addr.into(),
            user_agent: user_agent.into(),
        }
    }
}

struct CoordinatorEscalator {
    coordinator: Arc<ExpertCoordinator>,
}

#[async_trait::async_trait]
impl Escalator for CoordinatorEscalator {
    async fn escalate(
        &self,
        request: &CommandRequest,
        fingerprint: &Fingerprint,
        requester: &AgentIdentity,
        deadline: Duration,
    ) -> Result<EscalationOutcome, Error> {
        let outcome = self
            .coordinator
            .delegate(request, fingerprint, &requester.agent_id, &[], deadline)
            .await?;
        Ok(EscalationOutcome {
            verdict: outcome.verdict,
            reason: format!(
                "delegation {} settled with {} responses",
                outcome.delegation_id,
                outcome.responses.len()
            ),
        })
    }
}

/// The assembled coordination core.
pub struct CoreService {
    config: CoreConfig,
    registry: Arc<IdentityRegistry>,
    sessions: SessionManager,
    store: Arc<EventStore>,
    speed: SpeedLayer,
    coordinator: Arc<ExpertCoordinator>,
    materializer: Arc<Materializer>,
    pairs: PairManager,
}

impl CoreService {
    /// Open the data directory and assemble every component around the
    /// process-wide singletons. Derived state is folded from the log.
    pub async fn open(
        config: CoreConfig,
        expert_client: Arc<dyn ExpertClient>,
        classifier: Arc<dyn PatternClassifier>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let secret = Arc::new(AuthSecret::new(config.auth_secret()?.to_vec()));
        let registry = IdentityRegistry::new();

        let mut store_options = StoreOptions::new(&config.data_dir);
        store_options.rate_limit_per_minute = config.rate_limit_per_agent;
        let store = Arc::new(EventStore::open(
            store_options,
            Arc::clone(&secret),
            Arc::clone(&registry),
        )?);

        let expert_registry = Arc::new(ExpertRegistry::new(
            Box::new(KeysDirProvider::new(config.data_dir.join("keys"))),
            Duration::from_secs(config.expert.challenge_ttl_secs),
        ));
        let coordinator = Arc::new(ExpertCoordinator::new(
            Arc::clone(&expert_registry),
            expert_client,
            Arc::clone(&store),
            ConsensusConfig {
                n: config.expert.consensus_n,
                tau_approve: config.expert.tau_approve,
                tau_deny: config.expert.tau_deny,
                safety_margin: Duration::from_millis(config.expert.deadline_safety_margin_ms),
            },
        ));

        let speed = SpeedLayer::new(
            PolicyEngine::new(PolicyEngine::builtin_rules())?,
            classifier,
            Arc::new(CoordinatorEscalator {
                coordinator: Arc::clone(&coordinator),
            }),
            SpeedLayerOptions {
                memory_capacity: config.speed_layer.memory_cache_capacity,
                expert_deadline: Duration::from_millis(config.speed_layer.expert_deadline_ms),
                pattern_confidence_floor: 0.75,
                circuit: CircuitConfig {
                    failure_rate_threshold: config.speed_layer.circuit_failure_rate,
                    open_cooldown: Duration::from_millis(config.speed_layer.circuit_cooldown_ms),
                    ..CircuitConfig::default()
                },
            },
        );

        let sessions = SessionManager::new(
            Arc::clone(&secret),
            Arc::clone(&registry),
            SessionLimits {
                max_concurrent_per_agent: config.max_concurrent_sessions_per_agent,
                idle_timeout: Duration::from_secs(config.session_idle_timeout_secs),
                absolute_timeout: Duration::from_secs(config.session_absolute_timeout_secs),
            },
            config.rate_limit_per_agent,
        );

        let materializer = Arc::new(Materializer::new(
            Arc::clone(&store),
            &config.data_dir,
            config.shadow_search.page_size,
        ));
        let pairs = PairManager::new(Arc::clone(&store));

        // Fold the whole log into the derived views.
        {
            let registry = Arc::clone(&registry);
            let expert_registry = Arc::clone(&expert_registry);
            let materializer = Arc::clone(&materializer);
            store
                .replay(|event| {
                    registry.apply_event(event);
                    expert_registry.apply_event(event);
                    materializer.apply_live(event);
                    pairs.apply_event(event);
                })
                .await?;
        }

        let (head, _) = store.head().await;
        info!(head, "coordination core ready");

        Ok(Self {
            config,
            registry,
            sessions,
            store,
            speed,
            coordinator,
            materializer,
            pairs,
        })
    }

    /// The process-wide identity registry shared by every component.
    #[must_use]
    pub fn identity_registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // --- Identity bootstrap (trusted, explicit; never automatic) ---

    /// Append an explicit bootstrap event creating an agent identity.
    pub async fn bootstrap_agent(
        &self,
        agent_id: &str,
        role: Role,
        credential: &str,
        capabilities: Vec<String>,
    ) -> Result<AppendReceipt, Error> {
        let draft = EventDraft::new(
            format!("agent:{agent_id}"),
            EventPayload::IdentityBootstrapped {
                agent_id: agent_id.to_string(),
                role: role.as_str().to_string(),
                capabilities,
                credential_hash: credential_hash(credential),
            },
        );
        let receipt = self.store.append_trusted(draft).await?;
        self.materialize(receipt.sequence).await?;
        Ok(receipt)
    }

    /// Append an explicit promotion event changing an agent's role.
    pub async fn promote_agent(
        &self,
        session_token: &str,
        origin: &ClientOrigin,
        agent_id: &str,
        role: Role,
    ) -> Result<AppendReceipt, Error> {
        let caller = self.identify(session_token, origin)?;
        authz::authorize(&caller, Permission::SystemAdmin)?;
        let draft = EventDraft::new(
            format!("agent:{agent_id}"),
            EventPayload::IdentityPromoted {
                agent_id: agent_id.to_string(),
                role: role.as_str().to_string(),
            },
        );
        let receipt = self.store.append(draft, &caller.agent_id).await?;
        self.materialize(receipt.sequence).await?;
        Ok(receipt)
    }

    // --- Sessions ---

    /// `session.create`: validate the credential and issue a bound token.
    ///
    /// Sessions are runtime state; only revocations are logged.
    pub async fn create_session(
        &self,
        agent_id: &str,
        credential: &str,
        origin: &ClientOrigin,
    ) -> Result<IssuedSession, Error> {
        Ok(self.sessions.create_session(
            agent_id,
            credential,
            &origin.ip_addr,
            &origin.user_agent,
        )?)
    }

    /// `session.validate`: resolve a token to an identity.
    pub fn validate_session(
        &self,
        token: &str,
        origin: &ClientOrigin,
    ) -> Result<AgentIdentity, Error> {
        Ok(self.identify(token, origin)?)
    }

    /// Revoke one session; the revocation is an event.
    pub async fn revoke_session(
        &self,
        token: &str,
        reason: &str,
    ) -> Result<AppendReceipt, Error> {
        let session_id = self.sessions.revoke(token, reason)?;
        let draft = EventDraft::new(
            format!("session:{session_id}"),
            EventPayload::SessionRevoked {
                session_id,
                reason: reason.to_string(),
            },
        );
        let receipt = self.store.append_trusted(draft).await?;
        self.materialize(receipt.sequence).await?;
        Ok(receipt)
    }

    /// Revoke every session an agent holds.
    pub async fn revoke_agent_sessions(
        &self,
        session_token: &str,
        origin: &ClientOrigin,
        agent_id: &str,
        reason: &str,
    ) -> Result<Vec<AppendReceipt>, Error> {
        let caller = self.identify(session_token, origin)?;
        authz::authorize(&caller, Permission::SystemAdmin)?;
        let mut receipts = Vec::new();
        for session_id in self.sessions.revoke_agent(agent_id, reason) {
            let draft = EventDraft::new(
                format!("session:{session_id}"),
                EventPayload::SessionRevoked {
                    session_id,
                    reason: reason.to_string(),
                },
            );
            let receipt = self.store.append_trusted(draft).await?;
            self.materialize(receipt.sequence).await?;
            receipts.push(receipt);
        }
        Ok(receipts)
    }

    // --- Command validation (speed layer) ---

    /// `command.validate`: classify through the tiered pipeline, escalating
    /// to experts when no tier settles.
    pub async fn validate_command(
        &self,
        command: &CommandRequest,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<Decision, Error> {
        let identity = self.identify(session_token, origin)?;
        Ok(self.speed.validate(command, &identity).await)
    }

    // --- Event log ---

    /// `event.append`: append a caller-supplied draft.
    pub async fn append_event(
        &self,
        draft: EventDraft,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<AppendReceipt, Error> {
        let identity = self.identify(session_token, origin)?;
        let receipt = self.store.append(draft, &identity.agent_id).await?;
        self.materialize(receipt.sequence).await?;
        Ok(receipt)
    }

    /// `event.query`: a page of events the caller may read.
    pub async fn query_events(
        &self,
        filter: &QueryFilter,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<QueryPage, Error> {
        let identity = self.identify(session_token, origin)?;
        Ok(self.store.query(filter, &identity).await?)
    }

    // --- Experts ---

    /// `expert.register` step one: issue a challenge.
    pub fn expert_register_begin(
        &self,
        session_token: &str,
        origin: &ClientOrigin,
        expert_id: &str,
        capabilities: Vec<String>,
        public_id: &str,
    ) -> Result<Challenge, Error> {
        let identity = self.identify(session_token, origin)?;
        authz::authorize(&identity, Permission::ExpertRegister)?;
        Ok(self
            .coordinator
            .registry()
            .begin_registration(expert_id, capabilities, public_id))
    }

    /// `expert.register` step two: verify the challenge response and log
    /// the registration.
    pub async fn expert_register_complete(
        &self,
        challenge_id: &str,
        response_mac_hex: &str,
    ) -> Result<String, Error> {
        let record = self
            .coordinator
            .registry()
            .complete_registration(challenge_id, response_mac_hex)?;
        let draft = EventDraft::new(
            format!("expert:{}", record.expert_id),
            EventPayload::ExpertRegistered {
                expert_id: record.expert_id.clone(),
                capabilities: record.capabilities.iter().cloned().collect(),
                public_id: record.public_id.clone(),
            },
        );
        let receipt = self.store.append_trusted(draft).await?;
        self.materialize(receipt.sequence).await?;
        Ok(record.expert_id)
    }

    /// `expert.delegate`: run a delegation directly.
    pub async fn expert_delegate(
        &self,
        command: &CommandRequest,
        required_capabilities: &[String],
        deadline: Duration,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<DelegationOutcome, Error> {
        let identity = self.identify(session_token, origin)?;
        authz::authorize(&identity, Permission::ExpertDelegate)?;
        let fp = crate::speed::fingerprint::fingerprint(command, identity.role);
        Ok(self
            .coordinator
            .delegate(command, &fp, &identity.agent_id, required_capabilities, deadline)
            .await?)
    }

    /// Quarantine an expert. Event-driven; requires `system.admin`.
    pub async fn quarantine_expert(
        &self,
        session_token: &str,
        origin: &ClientOrigin,
        expert_id: &str,
        reason: &str,
    ) -> Result<AppendReceipt, Error> {
        let caller = self.identify(session_token, origin)?;
        authz::authorize(&caller, Permission::SystemAdmin)?;
        let draft = EventDraft::new(
            format!("expert:{expert_id}"),
            EventPayload::ExpertQuarantined {
                expert_id: expert_id.to_string(),
                reason: reason.to_string(),
            },
        );
        let receipt = self.store.append(draft, &caller.agent_id).await?;
        self.materialize(receipt.sequence).await?;
        Ok(receipt)
    }

    // --- Pair sessions ---

    /// `pair.request`: a builder opens a pair session.
    pub async fn pair_request(
        &self,
        task: &str,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<(String, AppendReceipt), Error> {
        let identity = self.identify(session_token, origin)?;
        let result = self.pairs.request(&identity, task).await?;
        self.materialize(result.1.sequence).await?;
        Ok(result)
    }

    /// An expert accepts a pending pair request.
    pub async fn pair_accept(
        &self,
        pair_id: &str,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<AppendReceipt, Error> {
        let identity = self.identify(session_token, origin)?;
        let receipt = self.pairs.accept(&identity, pair_id).await?;
        self.materialize(receipt.sequence).await?;
        Ok(receipt)
    }

    /// `pair.suggest`: append a line-anchored suggestion.
    pub async fn pair_suggest(
        &self,
        pair_id: &str,
        line: u32,
        text: &str,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<AppendReceipt, Error> {
        let identity = self.identify(session_token, origin)?;
        let receipt = self.pairs.suggest(&identity, pair_id, line, text).await?;
        self.materialize(receipt.sequence).await?;
        Ok(receipt)
    }

    /// Close a pair session.
    pub async fn pair_close(
        &self,
        pair_id: &str,
        reason: &str,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<AppendReceipt, Error> {
        let identity = self.identify(session_token, origin)?;
        let receipt = self.pairs.close(&identity, pair_id, reason).await?;
        self.materialize(receipt.sequence).await?;
        Ok(receipt)
    }

    // --- Shadow filesystem ---

    /// `snapshot.create`: name the current head state.
    pub async fn snapshot_create(
        &self,
        name: &str,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<AppendReceipt, Error> {
        let identity = self.identify(session_token, origin)?;
        authz::authorize(&identity, Permission::EventAppend)?;
        if self.materializer.snapshot_exists(name) {
            return Err(AggregateError::SnapshotNameTaken {
                name: name.to_string(),
            }
            .into());
        }
        let (at_sequence, _) = self.store.head().await;
        let draft = EventDraft::new(
            format!("snapshot:{name}"),
            EventPayload::SnapshotCreated {
                name: name.to_string(),
                at_sequence,
            },
        );
        let receipt = self.store.append(draft, &identity.agent_id).await?;
        self.materialize(receipt.sequence).await?;
        Ok(receipt)
    }

    /// `shadow.search`: bounded path-first search.
    pub fn shadow_search(
        &self,
        query: &ShadowSearchQuery,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<ShadowSearchPage, Error> {
        let identity = self.identify(session_token, origin)?;
        authz::authorize(&identity, Permission::ShadowRead)?;
        Ok(self.materializer.search(query))
    }

    /// `shadow.annotate`: attach a line-anchored note to a shadow path.
    pub async fn shadow_annotate(
        &self,
        path: &str,
        line: u32,
        category: &str,
        message: &str,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<AppendReceipt, Error> {
        let identity = self.identify(session_token, origin)?;
        authz::authorize(&identity, Permission::ShadowWrite)?;
        let draft = EventDraft::new(
            format!("file:{path}"),
            EventPayload::AnnotationAdded {
                path: path.to_string(),
                line,
                category: category.to_string(),
                message: message.to_string(),
                author: identity.agent_id.clone(),
            },
        );
        let receipt = self.store.append(draft, &identity.agent_id).await?;
        self.materialize(receipt.sequence).await?;
        Ok(receipt)
    }

    /// Time travel: the shadow state as of a past sequence.
    pub async fn state_at(
        &self,
        sequence: u64,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<ProjectAggregate, Error> {
        let identity = self.identify(session_token, origin)?;
        authz::authorize(&identity, Permission::ShadowRead)?;
        Ok(self.materializer.state_at(sequence).await?)
    }

    /// Materialize a named snapshot.
    pub async fn snapshot_view(
        &self,
        name: &str,
        session_token: &str,
        origin: &ClientOrigin,
    ) -> Result<ProjectAggregate, Error> {
        let identity = self.identify(session_token, origin)?;
        authz::authorize(&identity, Permission::ShadowRead)?;
        self.materializer.snapshot(name).await
    }

    /// Verify the full chain. CLI surface for `lh verify-log`.
    pub async fn verify_log(&self) -> Result<bool, Error> {
        let (head, _) = self.store.head().await;
        Ok(self.store.integrity_check(1, head).await?)
    }

    fn identify(&self, token: &str, origin: &ClientOrigin) -> Result<AgentIdentity, SessionError> {
        self.sessions
            .validate(token, &origin.ip_addr, &origin.user_agent)
    }

    /// Fold a freshly appended event into every derived view.
    async fn materialize(&self, sequence: u64) -> Result<(), Error> {
        let event: Event = self.store.read_event(sequence).await?;
        self.registry.apply_event(&event);
        self.coordinator.registry().apply_event(&event);
        self.materializer.apply_live(&event);
        self.pairs.apply_event(&event);
        Ok(())
    }
}
