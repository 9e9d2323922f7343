//! Durable applier state.
//!
//! The applier saves its configuration and the last applied tick so that a
//! restarted replica can [`resume`](crate::Applier::resume) where it left off.

use crate::config::ApplierConfig;
use crate::error::{ApplierError, ApplierResult};
use logship_core::{ServerId, Tick};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// What survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedState {
    /// Tick up to which the replica holds every in-scope effect.
    pub last_applied_tick: Tick,
    /// Tick of the last entry handled. Entries between the applied and the
    /// processed tick that were outside transactions are already applied.
    pub last_processed_tick: Tick,
    /// Identity of the source the tick refers to.
    pub server_id: Option<ServerId>,
    /// Stored configuration.
    pub configuration: Option<ApplierConfig>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            last_applied_tick: Tick::zero(),
            last_processed_tick: Tick::zero(),
            server_id: None,
            configuration: None,
        }
    }
}

/// Storage for [`PersistedState`].
pub trait StateStore: Send + Sync {
    /// Loads the saved state, `None` if nothing was saved.
    fn load(&self) -> ApplierResult<Option<PersistedState>>;

    /// Replaces the saved state.
    fn save(&self, state: &PersistedState) -> ApplierResult<()>;

    /// Deletes the saved state.
    fn remove(&self) -> ApplierResult<()>;
}

/// Keeps state in memory; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<PersistedState>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> ApplierResult<Option<PersistedState>> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &PersistedState) -> ApplierResult<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }

    fn remove(&self) -> ApplierResult<()> {
        *self.state.lock() = None;
        Ok(())
    }
}

/// Keeps state in a JSON file.
///
/// Saves write a sibling temporary file and rename it over the target, so a
/// crash leaves either the old or the new state.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStateStore {
    /// Creates a store at `path`. Parent directories are created on save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> ApplierResult<Option<PersistedState>> {
        let _guard = self.lock.lock();
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(persistence(&self.path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| persistence(&self.path, e))
    }

    fn save(&self, state: &PersistedState) -> ApplierResult<()> {
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| persistence(parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| persistence(&self.path, e))?;
        let temp = self.temp_path();
        fs::write(&temp, bytes).map_err(|e| persistence(&temp, e))?;
        fs::rename(&temp, &self.path).map_err(|e| persistence(&self.path, e))
    }

    fn remove(&self) -> ApplierResult<()> {
        let _guard = self.lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(persistence(&self.path, err)),
        }
    }
}

fn persistence(path: &Path, err: impl std::fmt::Display) -> ApplierError {
    ApplierError::Persistence(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> PersistedState {
        PersistedState {
            last_applied_tick: Tick::from(42),
            last_processed_tick: Tick::from(45),
            server_id: Some(ServerId::generate()),
            configuration: Some(ApplierConfig::new("loop://a", "root", "pw")),
        }
    }

    #[test]
    fn memory_store() {
        let store = MemoryStateStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap().unwrap().last_applied_tick, Tick::from(42));
        store.remove().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replica").join("applier-state.json");
        let state = sample();

        FileStateStore::new(&path).save(&state).unwrap();
        let reopened = FileStateStore::new(&path);
        assert_eq!(reopened.load().unwrap(), Some(state));
        assert!(!reopened.temp_path().exists());

        reopened.remove().unwrap();
        assert!(reopened.load().unwrap().is_none());
        reopened.remove().unwrap();
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();
        let err = FileStateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, ApplierError::Persistence(_)));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, br#"{"lastAppliedTick": "7"}"#).unwrap();
        let state = FileStateStore::new(&path).load().unwrap().unwrap();
        assert_eq!(state.last_applied_tick, Tick::from(7));
        assert!(state.last_processed_tick.is_zero());
        assert!(state.configuration.is_none());
    }
}
