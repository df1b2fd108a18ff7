use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use super::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid node TTL: {0}. Must be positive")]
    InvalidNodeTtl(u64),

    #[error("Invalid scheduling deadline: {0}. Must be positive")]
    InvalidDeadline(u64),

    #[error("Invalid event channel capacity: {0}. Must be at least 1")]
    InvalidChannelCapacity(usize),

    #[error("Invalid default max cost: {0}. Must be positive")]
    InvalidDefaultMaxCost(f64),

    #[error("Invalid victim cap: {0}. Must be at least 1")]
    InvalidVictimCap(usize),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .hivemind/config.yaml (project config)
    /// 3. .hivemind/local.yaml (project local overrides, optional)
    /// 4. Environment variables (HIVEMIND_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".hivemind/config.yaml"))
            .merge(Yaml::file(".hivemind/local.yaml"))
            .merge(Env::prefixed("HIVEMIND_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.index.node_ttl_secs == 0 {
            return Err(ConfigError::InvalidNodeTtl(config.index.node_ttl_secs));
        }

        if config.scheduler.default_deadline_secs == 0 {
            return Err(ConfigError::InvalidDeadline(
                config.scheduler.default_deadline_secs,
            ));
        }

        if config.events.channel_capacity == 0 {
            return Err(ConfigError::InvalidChannelCapacity(
                config.events.channel_capacity,
            ));
        }

        if config.budget.default_max_cost <= 0.0 {
            return Err(ConfigError::InvalidDefaultMaxCost(
                config.budget.default_max_cost,
            ));
        }

        if config.preemption.max_victims_per_request == 0 {
            return Err(ConfigError::InvalidVictimCap(
                config.preemption.max_victims_per_request,
            ));
        }

        Ok(())
    }
}
