use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{persistence_error, EntglResult};
use crate::model::{Document, OplogEntry, SnapshotMetadata, VectorClock};

/// Serializable image of a store's replicated state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub documents: Vec<Document>,
    pub oplog: Vec<OplogEntry>,
    pub vector_clock: VectorClock,
    pub snapshots: Vec<SnapshotMetadata>,
}

/// Durability hook for the in-memory driver. A synchronous interface keeps the
/// store's critical section simple; backends that need async I/O wrap their own
/// runtime handle.
pub trait StorePersistence: Send + Sync {
    fn save_state(&self, state: &PersistedState) -> EntglResult<()>;
    fn load_state(&self) -> EntglResult<Option<PersistedState>>;
}

/// JSON-file persistence for desktop deployments and tests.
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl StorePersistence for FilePersistence {
    fn save_state(&self, state: &PersistedState) -> EntglResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| persistence_error(format!("creating {parent:?}: {err}")))?;
        }
        let serialized = serde_json::to_vec(state)?;
        fs::write(&self.path, serialized)
            .map_err(|err| persistence_error(format!("writing {:?}: {err}", self.path)))
    }

    fn load_state(&self) -> EntglResult<Option<PersistedState>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(persistence_error(format!(
                    "reading {:?}: {err}",
                    self.path
                )))
            }
        };
        let state = serde_json::from_slice(&bytes)
            .map_err(|err| persistence_error(format!("decoding {:?}: {err}", self.path)))?;
        Ok(Some(state))
    }
}
