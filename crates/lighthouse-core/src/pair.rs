//! Pair sessions: one builder and one expert exchanging suggestions.
//!
//! A pair session is an event chain under `pair:<id>`:
//! `pair.requested → pair.accepted → (pair.suggestion | pair.comment)* →
//! pair.closed`. Exactly two participants; only they may append into the
//! pair's aggregate, and the acceptance references the request it answers
//! through `causation_id`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::authz::{self, Permission};
use crate::error::{Error, PairError};
use crate::event::{Event, EventDraft, EventPayload};
use crate::identity::{AgentIdentity, Role};
use crate::store::{AppendReceipt, EventStore};

/// Pair lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    Requested,
    Active,
    Closed,
}

impl PairState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

/// Derived view of one pair session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSession {
    pub pair_id: String,
    pub builder_id: String,
    pub expert_id: Option<String>,
    pub state: PairState,
    /// Event id of the opening `pair.requested`, referenced by acceptance.
    pub request_event_id: String,
}

impl PairSession {
    fn participant(&self, agent_id: &str) -> bool {
        self.builder_id == agent_id || self.expert_id.as_deref() == Some(agent_id)
    }
}

/// Manages pair sessions over the event log.
pub struct PairManager {
    store: Arc<EventStore>,
    sessions: RwLock<HashMap<String, PairSession>>,
}

impl PairManager {
    #[must_use]
    pub fn new(store: Arc<EventStore>) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// A builder opens a pair session.
    pub async fn request(
        &self,
        builder: &AgentIdentity,
        task: &str,
    ) -> Result<(String, AppendReceipt), Error> {
        authz::authorize(builder, Permission::PairStart)?;

        let pair_id = generate_pair_id();
        let request_event_id = crate::event::generate_event_id();
        let mut draft = EventDraft::new(
            format!("pair:{pair_id}"),
            EventPayload::PairRequested {
                pair_id: pair_id.clone(),
                builder_id: builder.agent_id.clone(),
                task: task.to_string(),
            },
        );
        draft.event_id = Some(request_event_id.clone());
        let receipt = self.store.append(draft, &builder.agent_id).await?;

        self.write().insert(
            pair_id.clone(),
            PairSession {
                pair_id: pair_id.clone(),
                builder_id: builder.agent_id.clone(),
                expert_id: None,
                state: PairState::Requested,
                request_event_id,
            },
        );
        info!(pair_id, builder = builder.agent_id, "pair session requested");
        Ok((pair_id, receipt))
    }

    /// An expert accepts a pending request, becoming the second participant.
    pub async fn accept(
        &self,
        expert: &AgentIdentity,
        pair_id: &str,
    ) -> Result<AppendReceipt, Error> {
        authz::authorize(expert, Permission::PairStart)?;
        if expert.role != Role::Expert && expert.role != Role::SystemAdmin {
            return Err(PairError::NotParticipant.into());
        }

        let request_event_id = {
            let sessions = self.read();
            let session = sessions.get(pair_id).ok_or(PairError::NotFound)?;
            if session.state != PairState::Requested {
                return Err(PairError::WrongState {
                    state: session.state.as_str(),
                    required: PairState::Requested.as_str(),
                }
                .into());
            }
            if session.builder_id == expert.agent_id {
                return Err(PairError::NotParticipant.into());
            }
            session.request_event_id.clone()
        };

        let draft = EventDraft::new(
            format!("pair:{pair_id}"),
            EventPayload::PairAccepted {
                pair_id: pair_id.to_string(),
                expert_id: expert.agent_id.clone(),
            },
        )
        .caused_by(request_event_id);
        let receipt = self.store.append(draft, &expert.agent_id).await?;

        let mut sessions = self.write();
        if let Some(session) = sessions.get_mut(pair_id) {
            session.expert_id = Some(expert.agent_id.clone());
            session.state = PairState::Active;
        }
        info!(pair_id, expert = expert.agent_id, "pair session accepted");
        Ok(receipt)
    }

    /// Append a line-anchored suggestion into an active pair.
    pub async fn suggest(
        &self,
        author: &AgentIdentity,
        pair_id: &str,
        line: u32,
        text: &str,
    ) -> Result<AppendReceipt, Error> {
        self.check_active_participant(pair_id, author)?;
        let draft = EventDraft::new(
            format!("pair:{pair_id}"),
            EventPayload::PairSuggestion {
                pair_id: pair_id.to_string(),
                line,
                text: text.to_string(),
                author: author.agent_id.clone(),
            },
        );
        Ok(self.store.append(draft, &author.agent_id).await?)
    }

    /// Append a free-form comment into an active pair.
    pub async fn comment(
        &self,
        author: &AgentIdentity,
        pair_id: &str,
        text: &str,
    ) -> Result<AppendReceipt, Error> {
        self.check_active_participant(pair_id, author)?;
        let draft = EventDraft::new(
            format!("pair:{pair_id}"),
            EventPayload::PairComment {
                pair_id: pair_id.to_string(),
                text: text.to_string(),
                author: author.agent_id.clone(),
            },
        );
        Ok(self.store.append(draft, &author.agent_id).await?)
    }

    /// Close the pair. Either participant may close it.
    pub async fn close(
        &self,
        caller: &AgentIdentity,
        pair_id: &str,
        reason: &str,
    ) -> Result<AppendReceipt, Error> {
        {
            let sessions = self.read();
            let session = sessions.get(pair_id).ok_or(PairError::NotFound)?;
            if !session.participant(&caller.agent_id) {
                return Err(PairError::NotParticipant.into());
            }
            if session.state == PairState::Closed {
                return Err(PairError::WrongState {
                    state: session.state.as_str(),
                    required: "requested or active",
                }
                .into());
            }
        }

        let draft = EventDraft::new(
            format!("pair:{pair_id}"),
            EventPayload::PairClosed {
                pair_id: pair_id.to_string(),
                reason: reason.to_string(),
            },
        );
        let receipt = self.store.append(draft, &caller.agent_id).await?;

        let mut sessions = self.write();
        if let Some(session) = sessions.get_mut(pair_id) {
            session.state = PairState::Closed;
        }
        info!(pair_id, reason, "pair session closed");
        Ok(receipt)
    }

    /// Current derived view of a pair session.
    #[must_use]
    pub fn session(&self, pair_id: &str) -> Option<PairSession> {
        self.read().get(pair_id).cloned()
    }

    /// Fold a `pair.*` event into the derived view. Used when rebuilding
    /// from the log at startup.
    pub fn apply_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::PairRequested {
                pair_id,
                builder_id,
                ..
            } => {
                self.write().insert(
                    pair_id.clone(),
                    PairSession {
                        pair_id: pair_id.clone(),
                        builder_id: builder_id.clone(),
                        expert_id: None,
                        state: PairState::Requested,
                        request_event_id: event.event_id.clone(),
                    },
                );
            }
            EventPayload::PairAccepted {
                pair_id, expert_id, ..
            } => {
                if let Some(session) = self.write().get_mut(pair_id) {
                    session.expert_id = Some(expert_id.clone());
                    session.state = PairState::Active;
                }
            }
            EventPayload::PairClosed { pair_id, .. } => {
                if let Some(session) = self.write().get_mut(pair_id) {
                    session.state = PairState::Closed;
                }
            }
            _ => {}
        }
    }

    fn check_active_participant(
        &self,
        pair_id: &str,
        caller: &AgentIdentity,
    ) -> Result<(), PairError> {
        let sessions = self.read();
        let session = sessions.get(pair_id).ok_or(PairError::NotFound)?;
        if !session.participant(&caller.agent_id) {
            return Err(PairError::NotParticipant);
        }
        if session.state != PairState::Active {
            return Err(PairError::WrongState {
                state: session.state.as_str(),
                required: PairState::Active.as_str(),
            });
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PairSession>> {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, PairSession>> {
        self.sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn generate_pair_id() -> String {
    let mut buf = [0u8; 8];
    rand::rng().fill_bytes(&mut buf);
    format!("pr_{}", hex::encode(buf))
}
