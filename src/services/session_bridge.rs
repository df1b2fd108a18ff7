//! Bridge between external sessions and agent lifecycle events.
//!
//! Keeps the two inverse maps `agent ↔ session` (a partial bijection: entries
//! are created on spawn and removed on terminal state), translates session
//! events into `agent.*` events on the per-agent channel, and forwards
//! `token.usage` reports for the budget engine's feed. The concrete session
//! API sits behind [`SessionGateway`]; gateway failures propagate as
//! `agent.failed` events carrying the underlying message.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::error::SessionError;
use crate::domain::models::{SessionEvent, SessionInfo, SessionState, SpawnOptions};
use crate::services::event_bus::{EventBus, EventCategory, EventPayload, EventSeverity};

/// The external session API consumed by the bridge.
#[async_trait]
pub trait SessionGateway: Send + Sync {
    /// Spawn a session for an agent, returning its session id.
    async fn spawn(&self, options: &SpawnOptions) -> Result<String, SessionError>;
    async fn pause(&self, session_id: &str) -> Result<(), SessionError>;
    async fn resume(&self, session_id: &str) -> Result<(), SessionError>;
    async fn kill(&self, session_id: &str, force: bool) -> Result<(), SessionError>;
    async fn status(&self, session_id: &str) -> Result<SessionState, SessionError>;
}

#[derive(Default)]
struct Maps {
    by_agent: HashMap<String, SessionInfo>,
    by_session: HashMap<String, String>,
}

/// The session integration layer.
pub struct SessionBridge {
    gateway: Arc<dyn SessionGateway>,
    bus: Arc<EventBus>,
    maps: RwLock<Maps>,
}

impl SessionBridge {
    pub fn new(gateway: Arc<dyn SessionGateway>, bus: Arc<EventBus>) -> Self {
        Self {
            gateway,
            bus,
            maps: RwLock::new(Maps::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Spawn a session for `options.agent_id` and record the mapping.
    pub async fn spawn_session(&self, options: SpawnOptions) -> Result<String, SessionError> {
        let agent_id = options.agent_id.clone();
        {
            let maps = self.maps.read().await;
            if maps.by_agent.contains_key(&agent_id) {
                return Err(SessionError::AgentAlreadyMapped(agent_id));
            }
        }

        let session_id = match self.gateway.spawn(&options).await {
            Ok(session_id) => session_id,
            Err(error) => {
                self.emit_gateway_failure(&agent_id, "", &error);
                return Err(error);
            }
        };

        {
            let mut maps = self.maps.write().await;
            maps.by_agent.insert(
                agent_id.clone(),
                SessionInfo {
                    session_id: session_id.clone(),
                    agent_id: agent_id.clone(),
                    state: SessionState::Running,
                    spawned_at: Utc::now(),
                },
            );
            maps.by_session.insert(session_id.clone(), agent_id.clone());
        }

        self.bus.emit(
            EventSeverity::Info,
            EventCategory::Agent,
            EventPayload::AgentSpawned {
                agent_id,
                session_id: session_id.clone(),
            },
        );
        Ok(session_id)
    }

    /// Pause the agent's session.
    pub async fn pause_session(&self, agent_id: &str) -> Result<(), SessionError> {
        let session_id = self.session_for(agent_id).await?;
        if let Err(error) = self.gateway.pause(&session_id).await {
            self.emit_gateway_failure(agent_id, &session_id, &error);
            return Err(error);
        }
        self.set_state(agent_id, SessionState::Paused).await;
        self.bus.emit(
            EventSeverity::Info,
            EventCategory::Agent,
            EventPayload::AgentPaused {
                agent_id: agent_id.to_string(),
                session_id,
            },
        );
        Ok(())
    }

    /// Resume the agent's paused session.
    pub async fn resume_session(&self, agent_id: &str) -> Result<(), SessionError> {
        let session_id = self.session_for(agent_id).await?;
        if let Err(error) = self.gateway.resume(&session_id).await {
            self.emit_gateway_failure(agent_id, &session_id, &error);
            return Err(error);
        }
        self.set_state(agent_id, SessionState::Running).await;
        self.bus.emit(
            EventSeverity::Info,
            EventCategory::Agent,
            EventPayload::AgentResumed {
                agent_id: agent_id.to_string(),
                session_id,
            },
        );
        Ok(())
    }

    /// Kill the agent's session and clear the mapping. Idempotent: an agent
    /// without a session is a no-op and emits nothing.
    pub async fn kill_session(&self, agent_id: &str, force: bool) -> Result<(), SessionError> {
        let session_id = {
            let maps = self.maps.read().await;
            match maps.by_agent.get(agent_id) {
                Some(info) => info.session_id.clone(),
                None => return Ok(()),
            }
        };
        if let Err(error) = self.gateway.kill(&session_id, force).await {
            self.emit_gateway_failure(agent_id, &session_id, &error);
            return Err(error);
        }
        self.remove_mapping(agent_id).await;
        self.bus.emit(
            EventSeverity::Warning,
            EventCategory::Agent,
            EventPayload::AgentKilled {
                agent_id: agent_id.to_string(),
                session_id,
                force,
            },
        );
        Ok(())
    }

    /// Current gateway-side state of the agent's session.
    pub async fn status_of(&self, agent_id: &str) -> Result<SessionState, SessionError> {
        let session_id = self.session_for(agent_id).await?;
        self.gateway.status(&session_id).await
    }

    /// True iff the agent currently has a session mapping.
    pub async fn has_session(&self, agent_id: &str) -> bool {
        self.maps.read().await.by_agent.contains_key(agent_id)
    }

    /// All live mappings, oldest spawn first.
    pub async fn list_active(&self) -> Vec<SessionInfo> {
        let maps = self.maps.read().await;
        let mut sessions: Vec<SessionInfo> = maps.by_agent.values().cloned().collect();
        sessions.sort_by(|a, b| a.spawned_at.cmp(&b.spawned_at));
        sessions
    }

    // -------------------------------------------------------------------------
    // Inbound session events
    // -------------------------------------------------------------------------

    /// Translate a gateway-reported session event into the agent's channel.
    /// Unknown sessions warn and no-op. Terminal states clear the mapping.
    pub async fn handle_session_event(&self, session_id: &str, event: SessionEvent) {
        let Some(agent_id) = self.maps.read().await.by_session.get(session_id).cloned() else {
            tracing::warn!(session_id, "event for unmapped session");
            return;
        };

        let payload = match &event {
            SessionEvent::Started => EventPayload::AgentStarted {
                agent_id: agent_id.clone(),
                session_id: session_id.to_string(),
            },
            SessionEvent::Paused => EventPayload::AgentPaused {
                agent_id: agent_id.clone(),
                session_id: session_id.to_string(),
            },
            SessionEvent::Resumed => EventPayload::AgentResumed {
                agent_id: agent_id.clone(),
                session_id: session_id.to_string(),
            },
            SessionEvent::Completed => EventPayload::AgentCompleted {
                agent_id: agent_id.clone(),
                session_id: session_id.to_string(),
            },
            SessionEvent::Failed { error } => EventPayload::AgentFailed {
                agent_id: agent_id.clone(),
                session_id: session_id.to_string(),
                error: error.clone(),
            },
            SessionEvent::Killed { force } => EventPayload::AgentKilled {
                agent_id: agent_id.clone(),
                session_id: session_id.to_string(),
                force: *force,
            },
            SessionEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
                cost,
            } => EventPayload::TokenUsage {
                agent_id: agent_id.clone(),
                session_id: session_id.to_string(),
                prompt_tokens: *prompt_tokens,
                completion_tokens: *completion_tokens,
                cost: *cost,
            },
        };

        let (severity, new_state) = match &event {
            SessionEvent::Started | SessionEvent::Resumed => {
                (EventSeverity::Info, Some(SessionState::Running))
            }
            SessionEvent::Paused => (EventSeverity::Info, Some(SessionState::Paused)),
            SessionEvent::Completed => (EventSeverity::Info, Some(SessionState::Completed)),
            SessionEvent::Failed { .. } => (EventSeverity::Error, Some(SessionState::Failed)),
            SessionEvent::Killed { .. } => (EventSeverity::Warning, Some(SessionState::Killed)),
            SessionEvent::TokenUsage { .. } => (EventSeverity::Debug, None),
        };

        if let Some(state) = new_state {
            if state.is_terminal() {
                self.remove_mapping(&agent_id).await;
            } else {
                self.set_state(&agent_id, state).await;
            }
        }
        self.bus.emit(severity, EventCategory::Agent, payload);
    }

    // -------------------------------------------------------------------------
    // Private helpers
    // -------------------------------------------------------------------------

    async fn session_for(&self, agent_id: &str) -> Result<String, SessionError> {
        self.maps
            .read()
            .await
            .by_agent
            .get(agent_id)
            .map(|info| info.session_id.clone())
            .ok_or_else(|| SessionError::NoSessionForAgent(agent_id.to_string()))
    }

    async fn set_state(&self, agent_id: &str, state: SessionState) {
        if let Some(info) = self.maps.write().await.by_agent.get_mut(agent_id) {
            info.state = state;
        }
    }

    async fn remove_mapping(&self, agent_id: &str) {
        let mut maps = self.maps.write().await;
        if let Some(info) = maps.by_agent.remove(agent_id) {
            maps.by_session.remove(&info.session_id);
        }
    }

    fn emit_gateway_failure(&self, agent_id: &str, session_id: &str, error: &SessionError) {
        tracing::error!(agent_id, session_id, %error, "session gateway call failed");
        self.bus.emit(
            EventSeverity::Error,
            EventCategory::Agent,
            EventPayload::AgentFailed {
                agent_id: agent_id.to_string(),
                session_id: session_id.to_string(),
                error: error.to_string(),
            },
        );
    }
}

/// In-process gateway that fabricates sessions. Backs the daemon's dry-run
/// mode and the test suite; a real deployment supplies its own gateway.
pub struct LoopbackGateway {
    counter: std::sync::atomic::AtomicU64,
    states: RwLock<HashMap<String, SessionState>>,
}

impl LoopbackGateway {
    pub fn new() -> Self {
        Self {
            counter: std::sync::atomic::AtomicU64::new(0),
            states: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for LoopbackGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionGateway for LoopbackGateway {
    async fn spawn(&self, options: &SpawnOptions) -> Result<String, SessionError> {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let session_id = format!("loopback-{}-{n}", options.agent_id);
        self.states
            .write()
            .await
            .insert(session_id.clone(), SessionState::Running);
        Ok(session_id)
    }

    async fn pause(&self, session_id: &str) -> Result<(), SessionError> {
        self.transition(session_id, SessionState::Paused).await
    }

    async fn resume(&self, session_id: &str) -> Result<(), SessionError> {
        self.transition(session_id, SessionState::Running).await
    }

    async fn kill(&self, session_id: &str, _force: bool) -> Result<(), SessionError> {
        self.transition(session_id, SessionState::Killed).await
    }

    async fn status(&self, session_id: &str) -> Result<SessionState, SessionError> {
        self.states
            .read()
            .await
            .get(session_id)
            .copied()
            .ok_or_else(|| SessionError::Gateway(format!("unknown session {session_id}")))
    }
}

impl LoopbackGateway {
    async fn transition(&self, session_id: &str, state: SessionState) -> Result<(), SessionError> {
        let mut states = self.states.write().await;
        match states.get_mut(session_id) {
            Some(current) => {
                *current = state;
                Ok(())
            }
            None => Err(SessionError::Gateway(format!(
                "unknown session {session_id}"
            ))),
        }
    }
}
