//! Release history ledger: one YAML document per (namespace, release name), read once
//! at task start and rewritten in full once at task end.

use std::sync::Arc;

use drover_core::ReleaseHistory;
use drover_persist::{HistoryStore, SaveMode, ScopeKey, VersionConflict};
use metrics::counter;
use tracing::{debug, info};

use crate::error::{Result, RolloutError};

/// A loaded history plus the store version it was read at.
#[derive(Debug, Clone)]
pub struct LoadedHistory {
    pub scope: ScopeKey,
    pub history: ReleaseHistory,
    version: Option<String>,
}

impl LoadedHistory {
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

pub struct Ledger {
    store: Arc<dyn HistoryStore>,
    cas: bool,
}

impl Ledger {
    pub fn new(store: Arc<dyn HistoryStore>, cas: bool) -> Self {
        Self { store, cas }
    }

    /// Missing document means an empty history; a store failure is an error.
    pub async fn load(&self, scope: &ScopeKey) -> Result<LoadedHistory> {
        let stored = self.store.fetch(scope).await.map_err(RolloutError::Persistence)?;
        let Some(stored) = stored else {
            debug!(scope = %scope, "no release history yet");
            return Ok(LoadedHistory { scope: scope.clone(), history: ReleaseHistory::new(), version: None });
        };
        let mut history = if stored.document.trim().is_empty() {
            ReleaseHistory::new()
        } else {
            serde_yaml::from_str::<ReleaseHistory>(&stored.document)
                .map_err(|e| RolloutError::Persistence(anyhow::Error::new(e).context(format!("decoding release history for {}", scope))))?
        };
        history.normalize();
        debug!(scope = %scope, releases = history.releases.len(), version = %stored.version, "release history loaded");
        Ok(LoadedHistory { scope: scope.clone(), history, version: Some(stored.version) })
    }

    pub async fn save(&self, loaded: &mut LoadedHistory) -> Result<()> {
        let doc = serde_yaml::to_string(&loaded.history)
            .map_err(|e| RolloutError::Persistence(anyhow::Error::new(e).context("encoding release history")))?;
        let mode = if self.cas { SaveMode::IfVersion(loaded.version.clone()) } else { SaveMode::Overwrite };
        match self.store.save(&loaded.scope, &doc, mode).await {
            Ok(version) => {
                counter!("ledger_save_total", 1u64);
                info!(scope = %loaded.scope, releases = loaded.history.releases.len(), "release history saved");
                loaded.version = Some(version);
                Ok(())
            }
            Err(e) => match e.downcast_ref::<VersionConflict>() {
                Some(conflict) => {
                    counter!("ledger_conflict_total", 1u64);
                    Err(RolloutError::Conflict(conflict.to_string()))
                }
                None => Err(RolloutError::Persistence(e)),
            },
        }
    }
}
