//! Document store for volume and snapshot records.
//!
//! The engine needs only find-by-identifier, find-by-group, save, delete and
//! filter. [`MemoryStore`] keeps records in process; [`JsonFileStore`]
//! persists the same state as a JSON document for the CLI.

pub mod files;
mod json;

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;
use crate::model::{Snapshot, SnapshotId, Volume, VolumeId};

pub use json::JsonFileStore;

/// Persistence operations required by the orchestrator.
pub trait VolumeStore: Send + Sync {
    /// Looks a volume up by primary key.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Store`] when the store cannot be read.
    fn find_volume(&self, id: &VolumeId) -> Result<Option<Volume>, LifecycleError>;

    /// Volumes sharing `group`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Store`] when the store cannot be read.
    fn find_by_group(&self, group: &str) -> Result<Vec<Volume>, LifecycleError>;

    /// Volumes matching `predicate`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Store`] when the store cannot be read.
    fn filter_volumes(
        &self,
        predicate: &dyn Fn(&Volume) -> bool,
    ) -> Result<Vec<Volume>, LifecycleError>;

    /// Inserts or replaces a volume.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Store`] when the store cannot be written.
    fn save_volume(&self, volume: &Volume) -> Result<(), LifecycleError>;

    /// Removes a volume and every snapshot it owns. Returns whether the
    /// volume existed.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Store`] when the store cannot be written.
    fn delete_volume(&self, id: &VolumeId) -> Result<bool, LifecycleError>;

    /// Looks a snapshot up by primary key.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Store`] when the store cannot be read.
    fn find_snapshot(&self, id: &SnapshotId) -> Result<Option<Snapshot>, LifecycleError>;

    /// Snapshots owned by `volume_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Store`] when the store cannot be read.
    fn snapshots_of(&self, volume_id: &VolumeId) -> Result<Vec<Snapshot>, LifecycleError>;

    /// Inserts or replaces a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Store`] when the store cannot be written.
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), LifecycleError>;

    /// Removes a snapshot. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Store`] when the store cannot be written.
    fn delete_snapshot(&self, id: &SnapshotId) -> Result<bool, LifecycleError>;
}

/// Serialisable contents of a store. Insertion order is preserved so the
/// first member of a group stays first.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    /// Volume records.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Snapshot records.
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
}

impl StoreState {
    fn volume(&self, id: &VolumeId) -> Option<Volume> {
        self.volumes.iter().find(|volume| volume.id == *id).cloned()
    }

    fn volumes_where(&self, predicate: &dyn Fn(&Volume) -> bool) -> Vec<Volume> {
        self.volumes
            .iter()
            .filter(|volume| predicate(volume))
            .cloned()
            .collect()
    }

    fn upsert_volume(&mut self, volume: &Volume) {
        match self.volumes.iter_mut().find(|existing| existing.id == volume.id) {
            Some(existing) => existing.clone_from(volume),
            None => self.volumes.push(volume.clone()),
        }
    }

    fn remove_volume(&mut self, id: &VolumeId) -> bool {
        let before = self.volumes.len();
        self.volumes.retain(|volume| volume.id != *id);
        self.snapshots.retain(|snapshot| snapshot.volume_id != *id);
        self.volumes.len() != before
    }

    fn snapshot(&self, id: &SnapshotId) -> Option<Snapshot> {
        self.snapshots.iter().find(|snapshot| snapshot.id == *id).cloned()
    }

    fn snapshots_for(&self, volume_id: &VolumeId) -> Vec<Snapshot> {
        self.snapshots
            .iter()
            .filter(|snapshot| snapshot.volume_id == *volume_id)
            .cloned()
            .collect()
    }

    fn upsert_snapshot(&mut self, snapshot: &Snapshot) {
        match self
            .snapshots
            .iter_mut()
            .find(|existing| existing.id == snapshot.id)
        {
            Some(existing) => existing.clone_from(snapshot),
            None => self.snapshots.push(snapshot.clone()),
        }
    }

    fn remove_snapshot(&mut self, id: &SnapshotId) -> bool {
        let before = self.snapshots.len();
        self.snapshots.retain(|snapshot| snapshot.id != *id);
        self.snapshots.len() != before
    }
}

/// Process-local store guarded by a mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot_state(&self) -> StoreState {
        self.with_state(|state| state.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl VolumeStore for MemoryStore {
    fn find_volume(&self, id: &VolumeId) -> Result<Option<Volume>, LifecycleError> {
        Ok(self.with_state(|state| state.volume(id)))
    }

    fn find_by_group(&self, group: &str) -> Result<Vec<Volume>, LifecycleError> {
        self.filter_volumes(&|volume: &Volume| volume.group == group)
    }

    fn filter_volumes(
        &self,
        predicate: &dyn Fn(&Volume) -> bool,
    ) -> Result<Vec<Volume>, LifecycleError> {
        Ok(self.with_state(|state| state.volumes_where(predicate)))
    }

    fn save_volume(&self, volume: &Volume) -> Result<(), LifecycleError> {
        self.with_state(|state| state.upsert_volume(volume));
        Ok(())
    }

    fn delete_volume(&self, id: &VolumeId) -> Result<bool, LifecycleError> {
        Ok(self.with_state(|state| state.remove_volume(id)))
    }

    fn find_snapshot(&self, id: &SnapshotId) -> Result<Option<Snapshot>, LifecycleError> {
        Ok(self.with_state(|state| state.snapshot(id)))
    }

    fn snapshots_of(&self, volume_id: &VolumeId) -> Result<Vec<Snapshot>, LifecycleError> {
        Ok(self.with_state(|state| state.snapshots_for(volume_id)))
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), LifecycleError> {
        self.with_state(|state| state.upsert_snapshot(snapshot));
        Ok(())
    }

    fn delete_snapshot(&self, id: &SnapshotId) -> Result<bool, LifecycleError> {
        Ok(self.with_state(|state| state.remove_snapshot(id)))
    }
}

#[cfg(test)]
mod tests;
