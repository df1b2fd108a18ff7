//! Infrastructure: configuration, logging setup, and persistence.

pub mod config;
pub mod logging;
pub mod persistence;

pub use config::{Config, ConfigLoader};
pub use persistence::{BudgetsDocument, JsonBudgetStore};
