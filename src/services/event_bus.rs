//! Shared event hub for agent lifecycle, scheduling, and budget control events.
//!
//! A single broadcast-based bus with sequence numbering. Components hold the
//! bus by capability and publish typed payloads; consumers subscribe and
//! filter on topic. For a single agent, events are delivered in publish order;
//! across agents no global order is promised beyond sequence assignment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::models::ThresholdAction;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing sequence number assigned by the bus on publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

/// Event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Event category for filtering and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Agent,
    Scheduling,
    Budget,
    Node,
}

/// Event envelope carrying metadata and the typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEvent {
    pub id: EventId,
    pub sequence: SequenceNumber,
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    pub category: EventCategory,
    /// The agent this event concerns, when there is one.
    pub agent_id: Option<String>,
    /// The node this event concerns, when there is one.
    pub node_id: Option<String>,
    pub payload: EventPayload,
}

impl FleetEvent {
    /// Build an event envelope; agent and node ids are lifted from the payload.
    pub fn new(severity: EventSeverity, category: EventCategory, payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            sequence: SequenceNumber(0), // assigned by the bus
            timestamp: Utc::now(),
            severity,
            category,
            agent_id: payload.agent_id().map(str::to_string),
            node_id: payload.node_id().map(str::to_string),
            payload,
        }
    }

    /// The channel this event is delivered on, e.g. `agent.X.events` or
    /// `scheduling.succeeded`.
    pub fn topic(&self) -> String {
        self.payload.topic()
    }
}

/// Typed event payloads for the fleet control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    // Agent lifecycle (per-agent channel `agent.<id>.events`)
    AgentSpawned {
        agent_id: String,
        session_id: String,
    },
    AgentStarted {
        agent_id: String,
        session_id: String,
    },
    AgentPaused {
        agent_id: String,
        session_id: String,
    },
    AgentResumed {
        agent_id: String,
        session_id: String,
    },
    AgentCompleted {
        agent_id: String,
        session_id: String,
    },
    AgentFailed {
        agent_id: String,
        session_id: String,
        error: String,
    },
    AgentKilled {
        agent_id: String,
        session_id: String,
        force: bool,
    },
    TokenUsage {
        agent_id: String,
        session_id: String,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost: f64,
    },

    // Scheduling channel (`scheduling.*`)
    SchedulingRequested {
        agent_id: String,
    },
    SchedulingSucceeded {
        agent_id: String,
        node_id: String,
        affinity_score: f64,
        preempted_agents: Vec<String>,
    },
    SchedulingFailed {
        agent_id: String,
        reason: String,
    },
    SchedulingPreempted {
        agent_id: String,
        node_id: String,
        preempted_by: String,
    },
    SchedulingResumed {
        agent_id: String,
    },
    SchedulingUnscheduled {
        agent_id: String,
        node_id: Option<String>,
    },

    // Budget control (consumed by the supervisor and collaborators)
    ThresholdTriggered {
        budget_id: Uuid,
        agent_id: String,
        threshold_pct: f64,
        action: ThresholdAction,
        message: String,
    },
    AgentBlocked {
        agent_id: String,
        budget_id: Uuid,
        threshold_pct: f64,
    },
    AgentUnblocked {
        agent_id: String,
        approved_by: Option<String>,
    },
    AgentKillRequested {
        agent_id: String,
        budget_id: Uuid,
        reason: String,
    },
    /// Hand-off to the notification collaborator; delivery is external.
    NotificationRequested {
        agent_id: String,
        channels: Vec<String>,
        message: String,
    },

    // Node lifecycle
    NodeRegistered {
        node_id: String,
    },
    NodeRemoved {
        node_id: String,
        reason: String,
    },
}

impl EventPayload {
    /// The agent this payload concerns, if any.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::AgentSpawned { agent_id, .. }
            | Self::AgentStarted { agent_id, .. }
            | Self::AgentPaused { agent_id, .. }
            | Self::AgentResumed { agent_id, .. }
            | Self::AgentCompleted { agent_id, .. }
            | Self::AgentFailed { agent_id, .. }
            | Self::AgentKilled { agent_id, .. }
            | Self::TokenUsage { agent_id, .. }
            | Self::SchedulingRequested { agent_id }
            | Self::SchedulingSucceeded { agent_id, .. }
            | Self::SchedulingFailed { agent_id, .. }
            | Self::SchedulingPreempted { agent_id, .. }
            | Self::SchedulingResumed { agent_id }
            | Self::SchedulingUnscheduled { agent_id, .. }
            | Self::ThresholdTriggered { agent_id, .. }
            | Self::AgentBlocked { agent_id, .. }
            | Self::AgentUnblocked { agent_id, .. }
            | Self::AgentKillRequested { agent_id, .. }
            | Self::NotificationRequested { agent_id, .. } => Some(agent_id),
            Self::NodeRegistered { .. } | Self::NodeRemoved { .. } => None,
        }
    }

    /// The node this payload concerns, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::SchedulingSucceeded { node_id, .. }
            | Self::SchedulingPreempted { node_id, .. }
            | Self::NodeRegistered { node_id }
            | Self::NodeRemoved { node_id, .. } => Some(node_id),
            Self::SchedulingUnscheduled { node_id, .. } => node_id.as_deref(),
            _ => None,
        }
    }

    /// The channel name this payload is delivered on.
    pub fn topic(&self) -> String {
        match self {
            Self::AgentSpawned { agent_id, .. }
            | Self::AgentStarted { agent_id, .. }
            | Self::AgentPaused { agent_id, .. }
            | Self::AgentResumed { agent_id, .. }
            | Self::AgentCompleted { agent_id, .. }
            | Self::AgentFailed { agent_id, .. }
            | Self::AgentKilled { agent_id, .. }
            | Self::TokenUsage { agent_id, .. } => format!("agent.{agent_id}.events"),
            Self::SchedulingRequested { .. } => "scheduling.requested".to_string(),
            Self::SchedulingSucceeded { .. } => "scheduling.succeeded".to_string(),
            Self::SchedulingFailed { .. } => "scheduling.failed".to_string(),
            Self::SchedulingPreempted { .. } => "scheduling.preempted".to_string(),
            Self::SchedulingResumed { .. } => "scheduling.resumed".to_string(),
            Self::SchedulingUnscheduled { .. } => "scheduling.unscheduled".to_string(),
            Self::ThresholdTriggered { .. } => "budget.threshold".to_string(),
            Self::AgentBlocked { .. } => "budget.blocked".to_string(),
            Self::AgentUnblocked { .. } => "budget.unblocked".to_string(),
            Self::AgentKillRequested { .. } => "budget.kill-requested".to_string(),
            Self::NotificationRequested { .. } => "budget.notify".to_string(),
            Self::NodeRegistered { .. } => "node.registered".to_string(),
            Self::NodeRemoved { .. } => "node.removed".to_string(),
        }
    }

    /// The external event-type name, e.g. `agent.spawned` or `token.usage`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AgentSpawned { .. } => "agent.spawned",
            Self::AgentStarted { .. } => "agent.started",
            Self::AgentPaused { .. } => "agent.paused",
            Self::AgentResumed { .. } => "agent.resumed",
            Self::AgentCompleted { .. } => "agent.completed",
            Self::AgentFailed { .. } => "agent.failed",
            Self::AgentKilled { .. } => "agent.killed",
            Self::TokenUsage { .. } => "token.usage",
            Self::SchedulingRequested { .. } => "scheduling.requested",
            Self::SchedulingSucceeded { .. } => "scheduling.succeeded",
            Self::SchedulingFailed { .. } => "scheduling.failed",
            Self::SchedulingPreempted { .. } => "scheduling.preempted",
            Self::SchedulingResumed { .. } => "scheduling.resumed",
            Self::SchedulingUnscheduled { .. } => "scheduling.unscheduled",
            Self::ThresholdTriggered { .. } => "budget.threshold",
            Self::AgentBlocked { .. } => "budget.blocked",
            Self::AgentUnblocked { .. } => "budget.unblocked",
            Self::AgentKillRequested { .. } => "budget.kill-requested",
            Self::NotificationRequested { .. } => "budget.notify",
            Self::NodeRegistered { .. } => "node.registered",
            Self::NodeRemoved { .. } => "node.removed",
        }
    }
}

/// Configuration for the event bus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of the broadcast channel; slow subscribers lag past this.
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Central event bus broadcasting to any number of subscribers.
pub struct EventBus {
    sender: broadcast::Sender<FleetEvent>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity);
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish an event, assigning its sequence number.
    ///
    /// Send errors (no subscribers) are ignored.
    pub fn publish(&self, mut event: FleetEvent) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        event.sequence = SequenceNumber(seq);
        tracing::trace!(topic = %event.topic(), sequence = seq, "publishing event");
        let _ = self.sender.send(event);
    }

    /// Build and publish an event in one step.
    pub fn emit(&self, severity: EventSeverity, category: EventCategory, payload: EventPayload) {
        self.publish(FleetEvent::new(severity, category, payload));
    }

    /// Subscribe to the full event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }

    /// The next sequence number that will be assigned.
    pub fn current_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.sequence.load(Ordering::SeqCst))
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}
