//! JSON document store backed by a single file.

use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::LifecycleError;
use crate::model::{Snapshot, SnapshotId, Volume, VolumeId};

use super::files;
use super::{StoreState, VolumeStore};

/// Store that reads the whole document before each call and rewrites it
/// after each mutation.
#[derive(Debug)]
pub struct JsonFileStore {
    path: Utf8PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens a store at `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Location of the backing document.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn load(&self) -> Result<StoreState, LifecycleError> {
        let contents =
            files::read_optional(&self.path).map_err(|err| LifecycleError::Store(err.to_string()))?;
        match contents {
            Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(StoreState::default()),
        }
    }

    fn persist(&self, state: &StoreState) -> Result<(), LifecycleError> {
        let rendered = serde_json::to_string_pretty(state)?;
        files::write_replace(&self.path, &rendered)
            .map_err(|err| LifecycleError::Store(err.to_string()))
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T, LifecycleError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self.load()?;
        Ok(f(&state))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> Result<T, LifecycleError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.load()?;
        let outcome = f(&mut state);
        self.persist(&state)?;
        Ok(outcome)
    }
}

impl VolumeStore for JsonFileStore {
    fn find_volume(&self, id: &VolumeId) -> Result<Option<Volume>, LifecycleError> {
        self.read(|state| state.volume(id))
    }

    fn find_by_group(&self, group: &str) -> Result<Vec<Volume>, LifecycleError> {
        self.filter_volumes(&|volume: &Volume| volume.group == group)
    }

    fn filter_volumes(
        &self,
        predicate: &dyn Fn(&Volume) -> bool,
    ) -> Result<Vec<Volume>, LifecycleError> {
        self.read(|state| state.volumes_where(predicate))
    }

    fn save_volume(&self, volume: &Volume) -> Result<(), LifecycleError> {
        self.mutate(|state| state.upsert_volume(volume))
    }

    fn delete_volume(&self, id: &VolumeId) -> Result<bool, LifecycleError> {
        self.mutate(|state| state.remove_volume(id))
    }

    fn find_snapshot(&self, id: &SnapshotId) -> Result<Option<Snapshot>, LifecycleError> {
        self.read(|state| state.snapshot(id))
    }

    fn snapshots_of(&self, volume_id: &VolumeId) -> Result<Vec<Snapshot>, LifecycleError> {
        self.read(|state| state.snapshots_for(volume_id))
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), LifecycleError> {
        self.mutate(|state| state.upsert_snapshot(snapshot))
    }

    fn delete_snapshot(&self, id: &SnapshotId) -> Result<bool, LifecycleError> {
        self.mutate(|state| state.remove_snapshot(id))
    }
}
