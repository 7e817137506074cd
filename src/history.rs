use crate::rules::Alert;
use crate::state::StateSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid state file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk form of the daemon state. Cooldowns are stored as epoch millis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub snapshot: Option<StateSnapshot>,
    #[serde(default)]
    pub cooldowns: BTreeMap<String, i64>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    retention_ms: i64,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            path: path.into(),
            retention_ms: retention.as_millis().min(i64::MAX as u128) as i64,
        }
    }

    /// `Ok(None)` when no state has been written yet.
    pub fn load(&self) -> Result<Option<StateFile>, HistoryError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(HistoryError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| HistoryError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    pub fn load_or_default(&self) -> StateFile {
        match self.load() {
            Ok(Some(file)) => file,
            Ok(None) => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                StateFile::default()
            }
            Err(err) => {
                warn!(error = %err, "state file unusable, starting fresh");
                StateFile::default()
            }
        }
    }

    /// Drops alerts past retention, then replaces the file atomically.
    pub fn save(&self, mut file: StateFile, now_ms: i64) -> Result<(), HistoryError> {
        let cutoff = now_ms.saturating_sub(self.retention_ms);
        file.alerts.retain(|a| a.triggered_at >= cutoff);

        let write_err = |source| HistoryError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let body = serde_json::to_vec_pretty(&file).map_err(|source| HistoryError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(write_err)?;
        std::fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }
}
