//! Application configuration.

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::models::BinPackingStrategy;
use crate::services::{
    AuditLogConfig, BudgetEngineConfig, ControlPlaneConfig, EventBusConfig, PreemptionConfig,
    ResourceIndexConfig, SchedulerConfig, SupervisorConfig,
};

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for persisted documents (budgets.json). Defaults to
    /// `${HOME}/.config/hivemind` when unset.
    pub data_dir: Option<PathBuf>,
    pub scheduler: SchedulerSection,
    pub preemption: PreemptionSection,
    pub budget: BudgetSection,
    pub index: IndexSection,
    pub events: EventsSection,
    pub audit: AuditSection,
    pub supervisor: SupervisorSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub strategy: BinPackingStrategy,
    pub preemption_enabled: bool,
    pub default_deadline_secs: u64,
    pub decision_log_entries: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            strategy: BinPackingStrategy::BestFit,
            preemption_enabled: true,
            default_deadline_secs: 30,
            decision_log_entries: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreemptionSection {
    pub enabled: bool,
    pub min_priority_difference: u32,
    pub max_victims_per_request: usize,
    pub checkpoint_victims: bool,
}

impl Default for PreemptionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            min_priority_difference: 100,
            max_victims_per_request: 3,
            checkpoint_victims: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub default_max_tokens: u64,
    pub default_max_cost: f64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            default_max_tokens: 10_000_000,
            default_max_cost: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSection {
    pub node_ttl_secs: u64,
}

impl Default for IndexSection {
    fn default() -> Self {
        Self { node_ttl_secs: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub channel_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    pub max_entries: usize,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub stale_sweep_interval_secs: u64,
    pub cooldown_prune_interval_secs: u64,
    pub cooldown_max_age_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            stale_sweep_interval_secs: 60,
            cooldown_prune_interval_secs: 300,
            cooldown_max_age_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
    /// Optional log file directory; stderr only when unset.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
        }
    }
}

impl Config {
    /// Resolve the data directory, defaulting under `${HOME}/.config`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
                .join("hivemind")
        })
    }

    /// Translate into the control-plane assembly bundle.
    pub fn control_plane_config(&self) -> ControlPlaneConfig {
        ControlPlaneConfig {
            events: EventBusConfig {
                channel_capacity: self.events.channel_capacity,
            },
            index: ResourceIndexConfig {
                node_ttl_secs: self.index.node_ttl_secs,
            },
            scheduler: SchedulerConfig {
                strategy: self.scheduler.strategy,
                preemption_enabled: self.scheduler.preemption_enabled,
                default_deadline_secs: self.scheduler.default_deadline_secs,
                decision_log_entries: self.scheduler.decision_log_entries,
            },
            preemption: PreemptionConfig {
                enabled: self.preemption.enabled,
                min_priority_difference: self.preemption.min_priority_difference,
                max_victims_per_request: self.preemption.max_victims_per_request,
                checkpoint_victims: self.preemption.checkpoint_victims,
            },
            budget: BudgetEngineConfig {
                default_max_tokens: self.budget.default_max_tokens,
                default_max_cost: self.budget.default_max_cost,
            },
            audit: AuditLogConfig {
                max_entries: self.audit.max_entries,
            },
            supervisor: SupervisorConfig {
                stale_sweep_interval_secs: self.supervisor.stale_sweep_interval_secs,
                cooldown_prune_interval_secs: self.supervisor.cooldown_prune_interval_secs,
                cooldown_max_age_secs: self.supervisor.cooldown_max_age_secs,
            },
        }
    }
}
