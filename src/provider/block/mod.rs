//! Block-storage cloud volumes (Scaleway Block Storage).
//!
//! Volumes are plain block devices attached to instances through the
//! instance's volume map. Volume names are not unique on this backend, so
//! creation never looks names up; every create allocates a new resource.

pub mod api;
pub mod client;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::credential::Credential;
use crate::error::LifecycleError;
use crate::model::{Labels, Snapshot, SnapshotPatch, Volume, VolumePatch};
use crate::naming::{next_slot, slot_name};
use crate::script::MountTarget;
use crate::wait::{PollBudget, PollOutcome, poll_until};

use self::api::{BlockApi, BlockVolume, NewBlockSnapshot, NewBlockVolume, VolumeSource};
use self::client::ScalewayBlockClient;

use super::{
    BackendFuture, CreateRequest, ProviderKind, SnapshotSpec, VolumeProvider, no_op,
    tolerate_missing,
};

const STATUS_AVAILABLE: &str = "available";
const STATUS_IN_USE: &str = "in_use";
const STATUS_ERROR: &str = "error";
const BYTES_PER_KB: u64 = 1024;

/// Builds the adapter from a `block` credential.
///
/// # Errors
///
/// Returns [`LifecycleError::Credential`] when a required field is missing.
pub fn build(
    credential: &Credential,
    config: &EngineConfig,
) -> Result<Arc<dyn VolumeProvider>, LifecycleError> {
    let settings = BlockSettings::from_credential(credential)?;
    let client = ScalewayBlockClient::new(credential.require("secret_key")?);
    Ok(Arc::new(BlockStorageProvider::new(
        client,
        settings,
        PollBudget::from_config(config),
    )))
}

/// Project and placement defaults read from the credential.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockSettings {
    /// Project owning new volumes.
    pub project_id: String,
    /// Zone used when a volume has none.
    pub zone: String,
    /// Provisioned IOPS class for new volumes.
    pub perf_iops: Option<u32>,
}

impl BlockSettings {
    /// Reads settings from `credential`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Credential`] when a required field is missing.
    pub fn from_credential(credential: &Credential) -> Result<Self, LifecycleError> {
        Ok(Self {
            project_id: credential.require("project_id")?.to_owned(),
            zone: credential.require("zone")?.to_owned(),
            perf_iops: credential
                .get("perf_iops")
                .and_then(serde_json::Value::as_u64)
                .and_then(|iops| u32::try_from(iops).ok()),
        })
    }
}

/// Stable device path of a block volume inside the guest.
#[must_use]
pub fn device_path(volume_id: &str) -> String {
    format!("/dev/disk/by-id/scsi-0SCW_sbs_volume-{volume_id}")
}

fn tags(labels: &Labels) -> Vec<String> {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

const fn kb_to_bytes(size_kb: u64) -> u64 {
    size_kb.saturating_mul(BYTES_PER_KB)
}

/// Adapter over any [`BlockApi`].
pub struct BlockStorageProvider<A> {
    api: A,
    settings: BlockSettings,
    budget: PollBudget,
}

impl<A: BlockApi> BlockStorageProvider<A> {
    /// Wraps `api` with credential defaults and a polling budget.
    #[must_use]
    pub const fn new(api: A, settings: BlockSettings, budget: PollBudget) -> Self {
        Self {
            api,
            settings,
            budget,
        }
    }

    fn zone_of<'v>(&'v self, volume: &'v Volume) -> &'v str {
        volume.zone.as_deref().unwrap_or(&self.settings.zone)
    }

    async fn current(&self, zone: &str, volume: &Volume) -> Result<BlockVolume, LifecycleError> {
        self.api
            .get_volume(zone, &volume.identifier)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                entity: String::from("block volume"),
                id: volume.identifier.clone(),
            })
    }

    async fn wait_for_status(
        &self,
        zone: &str,
        id: &str,
        expected: &str,
    ) -> Result<BlockVolume, LifecycleError> {
        let api = &self.api;
        poll_until(&self.budget, &format!("block volume {id}"), expected, move || async move {
            Ok(match api.get_volume(zone, id).await? {
                None => PollOutcome::Failed(format!("volume {id} disappeared")),
                Some(volume) if volume.status == expected => PollOutcome::Ready(volume),
                Some(volume) if volume.status == STATUS_ERROR => {
                    PollOutcome::Failed(format!("volume {id} entered error state"))
                }
                Some(volume) => PollOutcome::Pending(volume.status),
            })
        })
        .await
    }

    async fn wait_until_gone(&self, zone: &str, id: &str) -> Result<(), LifecycleError> {
        let api = &self.api;
        poll_until(&self.budget, &format!("block volume {id}"), "deleted", move || async move {
            Ok(match api.get_volume(zone, id).await? {
                None => PollOutcome::Ready(()),
                Some(volume) => PollOutcome::Pending(volume.status),
            })
        })
        .await
    }

    async fn allocate(
        &self,
        request: CreateRequest<'_>,
        source: VolumeSource,
        size_bytes: u64,
    ) -> Result<VolumePatch, LifecycleError> {
        let volume = request.volume;
        let zone = self.zone_of(volume).to_owned();
        let slot = next_slot(request.used_slots());
        let name = slot_name(&volume.group, slot);
        let new_volume = NewBlockVolume {
            name: name.clone(),
            project_id: self.settings.project_id.clone(),
            size_bytes,
            source,
            perf_iops: self.settings.perf_iops,
            tags: tags(&volume.labels),
        };

        let created = self.api.create_volume(&zone, &new_volume).await?;
        debug!(volume = %created.id, %zone, %name, "block volume requested");
        let ready = self
            .wait_for_status(&zone, &created.id, STATUS_AVAILABLE)
            .await?;
        info!(volume = %ready.id, %zone, %name, "block volume available");

        Ok(
            VolumePatch::allocated(name, ready.id.clone(), device_path(&ready.id))
                .with_slot(slot)
                .with_zone(zone),
        )
    }

    async fn attach_to(
        &self,
        volume: &Volume,
        host: &str,
    ) -> Result<VolumePatch, LifecycleError> {
        let zone = self.zone_of(volume);
        let current = self.current(zone, volume).await?;
        match current.attached_to.as_deref() {
            Some(server) if server == host => {
                debug!(volume = %current.id, host, "already attached");
                return Ok(VolumePatch::default().with_vm_name(host));
            }
            Some(server) => {
                return Err(LifecycleError::Conflict(format!(
                    "block volume {} is attached to {server}",
                    current.id
                )));
            }
            None => {}
        }

        let mut volumes = self.api.server_volumes(zone, host).await?;
        let index = next_slot(volumes.keys().filter_map(|key| key.parse().ok()));
        volumes.insert(index.to_string(), current.id.clone());
        self.api.set_server_volumes(zone, host, &volumes).await?;
        self.wait_for_status(zone, &current.id, STATUS_IN_USE).await?;
        info!(volume = %current.id, host, index, "block volume attached");
        Ok(VolumePatch::default().with_vm_name(host))
    }

    async fn detach_from(
        &self,
        zone: &str,
        volume_id: &str,
        server: &str,
    ) -> Result<(), LifecycleError> {
        let mut volumes: BTreeMap<String, String> = self.api.server_volumes(zone, server).await?;
        volumes.retain(|_, id| id != volume_id);
        self.api.set_server_volumes(zone, server, &volumes).await?;
        self.wait_for_status(zone, volume_id, STATUS_AVAILABLE).await?;
        info!(volume = volume_id, server, "block volume detached");
        Ok(())
    }

    async fn release(&self, volume: &Volume) -> Result<(), LifecycleError> {
        let zone = self.zone_of(volume);
        let Some(current) = self.api.get_volume(zone, &volume.identifier).await? else {
            debug!(volume = %volume.identifier, "block volume already gone");
            return Ok(());
        };
        if let Some(server) = current.attached_to.as_deref() {
            if volume.vm_name.as_deref() != Some(server) {
                return Err(LifecycleError::Conflict(format!(
                    "block volume {} is attached to {server}, not to its recorded host",
                    current.id
                )));
            }
            self.detach_from(zone, &current.id, server).await?;
        }
        tolerate_missing(
            self.api.delete_volume(zone, &current.id).await,
            "block volume",
        )?;
        self.wait_until_gone(zone, &current.id).await
    }

    async fn grow(&self, volume: &Volume, new_size_kb: u64) -> Result<VolumePatch, LifecycleError> {
        let zone = self.zone_of(volume);
        let id = volume.identifier.as_str();
        let size_bytes = kb_to_bytes(new_size_kb);
        self.api.resize_volume(zone, id, size_bytes).await?;

        let api = &self.api;
        poll_until(&self.budget, &format!("block volume {id}"), "resized", move || async move {
            Ok(match api.get_volume(zone, id).await? {
                None => PollOutcome::Failed(format!("volume {id} disappeared")),
                Some(current)
                    if current.size >= size_bytes
                        && (current.status == STATUS_AVAILABLE
                            || current.status == STATUS_IN_USE) =>
                {
                    PollOutcome::Ready(())
                }
                Some(current) if current.status == STATUS_ERROR => {
                    PollOutcome::Failed(format!("volume {id} entered error state"))
                }
                Some(current) => PollOutcome::Pending(current.status),
            })
        })
        .await?;

        Ok(VolumePatch {
            size_kb: Some(new_size_kb),
            ..VolumePatch::default()
        })
    }

    async fn snapshot(
        &self,
        volume: &Volume,
        spec: &SnapshotSpec,
    ) -> Result<SnapshotPatch, LifecycleError> {
        let zone = self.zone_of(volume);
        let request = NewBlockSnapshot {
            name: spec.name.clone(),
            volume_id: volume.identifier.clone(),
            project_id: self.settings.project_id.clone(),
            tags: tags(&spec.labels),
        };
        let created = self.api.create_snapshot(zone, &request).await?;
        let id = created.id.as_str();

        let api = &self.api;
        let ready = poll_until(
            &self.budget,
            &format!("block snapshot {id}"),
            STATUS_AVAILABLE,
            move || async move {
                Ok(match api.get_snapshot(zone, id).await? {
                    None => PollOutcome::Failed(format!("snapshot {id} disappeared")),
                    Some(snapshot) if snapshot.status == STATUS_AVAILABLE => {
                        PollOutcome::Ready(snapshot)
                    }
                    Some(snapshot) if snapshot.status == STATUS_ERROR => {
                        PollOutcome::Failed(format!("snapshot {id} entered error state"))
                    }
                    Some(snapshot) => PollOutcome::Pending(snapshot.status),
                })
            },
        )
        .await?;
        info!(snapshot = %ready.id, name = %ready.name, "block snapshot available");

        Ok(SnapshotPatch {
            identifier: ready.id,
            description: ready.name,
            size_bytes: Some(ready.size),
            labels: spec.labels.clone(),
        })
    }
}

impl<A: BlockApi> VolumeProvider for BlockStorageProvider<A> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::BlockStorage
    }

    fn create_volume<'a>(&'a self, request: CreateRequest<'a>) -> BackendFuture<'a, VolumePatch> {
        Box::pin(async move {
            let size_bytes = kb_to_bytes(request.volume.size_kb);
            self.allocate(request, VolumeSource::Empty, size_bytes).await
        })
    }

    fn delete_volume<'a>(&'a self, volume: &'a Volume) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if !volume.is_allocated() {
                return Ok(());
            }
            self.release(volume).await
        })
    }

    fn attach<'a>(&'a self, volume: &'a Volume, host: &'a str) -> BackendFuture<'a, VolumePatch> {
        Box::pin(self.attach_to(volume, host))
    }

    fn detach<'a>(&'a self, volume: &'a Volume) -> BackendFuture<'a, VolumePatch> {
        Box::pin(async move {
            let zone = self.zone_of(volume);
            let current = self.current(zone, volume).await?;
            if let Some(server) = current.attached_to.as_deref() {
                self.detach_from(zone, &current.id, server).await?;
            }
            Ok(VolumePatch::detached())
        })
    }

    fn resize<'a>(
        &'a self,
        volume: &'a Volume,
        new_size_kb: u64,
    ) -> BackendFuture<'a, VolumePatch> {
        Box::pin(self.grow(volume, new_size_kb))
    }

    fn take_snapshot<'a>(
        &'a self,
        volume: &'a Volume,
        spec: &'a SnapshotSpec,
    ) -> BackendFuture<'a, SnapshotPatch> {
        Box::pin(self.snapshot(volume, spec))
    }

    fn remove_snapshot<'a>(
        &'a self,
        volume: &'a Volume,
        snapshot: &'a Snapshot,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if snapshot.identifier.is_empty() {
                return Ok(());
            }
            let zone = self.zone_of(volume);
            tolerate_missing(
                self.api.delete_snapshot(zone, &snapshot.identifier).await,
                "block snapshot",
            )
        })
    }

    fn restore_snapshot<'a>(
        &'a self,
        source: &'a Volume,
        snapshot: &'a Snapshot,
        request: CreateRequest<'a>,
    ) -> BackendFuture<'a, VolumePatch> {
        Box::pin(async move {
            if snapshot.identifier.is_empty() {
                return Err(LifecycleError::Validation(format!(
                    "snapshot {} of volume {} was never confirmed by the backend",
                    snapshot.id, source.id
                )));
            }
            let size_bytes = kb_to_bytes(request.volume.size_kb)
                .max(snapshot.size_bytes.unwrap_or_default());
            let mut patch = self
                .allocate(
                    request,
                    VolumeSource::Snapshot(snapshot.identifier.clone()),
                    size_bytes,
                )
                .await?;
            patch.size_kb = Some(size_bytes.div_ceil(BYTES_PER_KB));
            Ok(patch)
        })
    }

    fn add_access<'a>(&'a self, _volume: &'a Volume, _address: &'a str) -> BackendFuture<'a, ()> {
        no_op()
    }

    fn remove_access<'a>(
        &'a self,
        _volume: &'a Volume,
        _address: &'a str,
    ) -> BackendFuture<'a, ()> {
        no_op()
    }

    fn mount_target(&self, volume: &Volume) -> Result<MountTarget, LifecycleError> {
        if !volume.is_allocated() {
            return Err(LifecycleError::Validation(format!(
                "volume {} is not allocated",
                volume.id
            )));
        }
        let device = if volume.path.is_empty() {
            device_path(&volume.identifier)
        } else {
            volume.path.clone()
        };
        Ok(MountTarget::BlockDevice { device })
    }
}

#[cfg(test)]
mod tests;
