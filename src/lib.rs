//! Hivemind - control plane for fleets of long-running LLM agent workers
//!
//! Decides where each agent runs (placement), whether it may keep running as
//! it accrues cost (budget enforcement), and when to preempt, block, or
//! terminate it. Agents themselves are opaque external sessions driven
//! through a gateway; this crate owns their scheduling, accounting, and
//! lifecycle metadata:
//! - Resource-aware, affinity-driven, preemption-capable placement scheduler
//! - Per-task / per-agent / per-swarm / per-project budget engine with a
//!   staged threshold ladder (warn, notify, block, kill, audit)
//! - Session bridge translating external session events into agent lifecycle
//!   and token-usage events

pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export the assembly types for convenience
pub use services::supervisor::{ControlPlane, ControlPlaneConfig, Supervisor, SupervisorConfig};
