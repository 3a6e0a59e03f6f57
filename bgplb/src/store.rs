use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// On-disk driver state. Only network identity is persisted; endpoint
/// wiring is rebuilt by the daemon re-driving `Join` after a restart.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, PersistedNetwork>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistedNetwork {}

/// Single-file durable store, replaced wholesale on every mutation.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the state file once at startup. A missing file is a fresh
    /// install; an unreadable one is dropped with a warning so the daemon
    /// can re-drive us from its own state.
    pub fn load(&self) -> PersistedState {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return PersistedState::default();
            }
            Err(e) => {
                warn!(%e, "could not read state file {}, starting empty", self.path.display());
                return PersistedState::default();
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(%e, "state file {} is corrupt, starting empty", self.path.display());
                PersistedState::default()
            }
        }
    }

    /// Persist the current network key-set. Full-file replace via a
    /// sibling temp file so a crash mid-write never truncates the state.
    pub fn save<'a>(&self, network_ids: impl Iterator<Item = &'a String>) -> Result<()> {
        let state = PersistedState {
            networks: network_ids
                .map(|id| (id.clone(), PersistedNetwork::default()))
                .collect(),
        };
        let raw = serde_json::to_vec_pretty(&state)
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let mut tmp = self.path.clone();
        tmp.set_extension("json.tmp");
        fs::write(&tmp, raw).map_err(|e| Error::Persistence(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }
}
