//! Best-effort JSON persistence for budget configurations and alerts.
//!
//! `budgets.json` is the only persisted document. Live tracking state never
//! touches disk. Read errors reset to empty maps with a warning; write errors
//! are logged and the in-memory state stays authoritative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::error::PersistenceError;
use crate::domain::models::{BudgetAlert, BudgetConfig};

/// Schema version written into the document.
const DOCUMENT_VERSION: &str = "1.0.0";

/// On-disk shape of `budgets.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetsDocument {
    /// Configurations keyed by `<kind>:<scope>`.
    #[serde(default)]
    pub configs: HashMap<String, BudgetConfig>,
    /// Alerts grouped by project id.
    #[serde(default)]
    pub alerts: HashMap<String, Vec<BudgetAlert>>,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// File-backed store for the budgets document.
pub struct JsonBudgetStore {
    path: PathBuf,
}

impl JsonBudgetStore {
    /// Store rooted at `data_dir`; the document lives at `<data_dir>/budgets.json`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("budgets.json"),
        }
    }

    /// The document path this store reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file is an empty document; a corrupt or
    /// unreadable file resets to empty with a warning.
    pub async fn load(&self) -> BudgetsDocument {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<BudgetsDocument>(&bytes) {
                Ok(document) => document,
                Err(error) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        %error,
                        "budgets document corrupt, resetting to empty"
                    );
                    BudgetsDocument::default()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                BudgetsDocument::default()
            }
            Err(error) => {
                tracing::warn!(
                    path = %self.path.display(),
                    %error,
                    "budgets document unreadable, resetting to empty"
                );
                BudgetsDocument::default()
            }
        }
    }

    /// Write the document, creating the parent directory if missing.
    pub async fn save(
        &self,
        configs: &HashMap<String, BudgetConfig>,
        alerts: &HashMap<String, Vec<BudgetAlert>>,
    ) -> Result<(), PersistenceError> {
        let document = BudgetsDocument {
            configs: configs.clone(),
            alerts: alerts.clone(),
            version: DOCUMENT_VERSION.to_string(),
            updated_at: Some(Utc::now()),
        };
        let json = serde_json::to_vec_pretty(&document).map_err(|error| {
            PersistenceError::Corrupt {
                path: self.path.display().to_string(),
                message: error.to_string(),
            }
        })?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| PersistenceError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|source| PersistenceError::Io {
                path: self.path.display().to_string(),
                source,
            })
    }
}
