//! Virtual-machine persistent disks (Compute Engine).
//!
//! Every mutating call returns an operation handle that is polled until
//! `DONE`. Disk names are unique per zone, so a name collision on insert
//! means a concurrent caller took the slot and the next free slot is tried.

pub mod api;
pub mod client;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::credential::Credential;
use crate::error::LifecycleError;
use crate::model::{Labels, Snapshot, SnapshotPatch, Volume, VolumePatch, kb_to_gb_ceil};
use crate::naming::{next_slot, next_slot_after, sanitize_label, slot_name};
use crate::script::MountTarget;
use crate::wait::{PollBudget, PollOutcome, poll_until};

use self::api::{Disk, DiskApi, NewDisk, Operation};
use self::client::{ComputeClient, DEFAULT_API_BASE};

use super::{
    BackendFuture, CreateRequest, ProviderKind, SnapshotSpec, VolumeProvider, no_op,
    tolerate_missing,
};

const MAX_NAME_ATTEMPTS: u32 = 5;
const SNAPSHOT_READY: &str = "READY";
const SNAPSHOT_FAILED: &str = "FAILED";

/// Builds the adapter from a `gce` credential.
///
/// # Errors
///
/// Returns [`LifecycleError::Credential`] when a required field is missing.
pub fn build(
    credential: &Credential,
    config: &EngineConfig,
) -> Result<Arc<dyn VolumeProvider>, LifecycleError> {
    let settings = DiskSettings::from_credential(credential)?;
    let client = ComputeClient::new(
        credential.get_str("api_base").unwrap_or(DEFAULT_API_BASE),
        credential.require("project")?,
        credential.require("access_token")?,
    );
    Ok(Arc::new(ComputeDiskProvider::new(
        client,
        settings,
        PollBudget::from_config(config),
    )))
}

/// Placement defaults read from the credential.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskSettings {
    /// Zone used when a volume has none.
    pub zone: String,
    /// Disk type used when a volume has no offering.
    pub disk_type: Option<String>,
}

impl DiskSettings {
    /// Reads settings from `credential`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Credential`] when the zone is missing.
    pub fn from_credential(credential: &Credential) -> Result<Self, LifecycleError> {
        Ok(Self {
            zone: credential.require("zone")?.to_owned(),
            disk_type: credential.get_str("disk_type").map(str::to_owned),
        })
    }
}

/// Stable device path of a disk attached with its own name as device name.
#[must_use]
pub fn device_path(disk_name: &str) -> String {
    format!("/dev/disk/by-id/google-{disk_name}")
}

fn sanitize_labels(labels: &Labels) -> Labels {
    labels
        .iter()
        .map(|(key, value)| (sanitize_label(key), sanitize_label(value)))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Adapter over any [`DiskApi`].
pub struct ComputeDiskProvider<A> {
    api: A,
    settings: DiskSettings,
    budget: PollBudget,
}

impl<A: DiskApi> ComputeDiskProvider<A> {
    /// Wraps `api` with credential defaults and a polling budget.
    #[must_use]
    pub const fn new(api: A, settings: DiskSettings, budget: PollBudget) -> Self {
        Self {
            api,
            settings,
            budget,
        }
    }

    fn zone_of<'v>(&'v self, volume: &'v Volume) -> &'v str {
        volume.zone.as_deref().unwrap_or(&self.settings.zone)
    }

    async fn wait(&self, operation: Operation) -> Result<(), LifecycleError> {
        if operation.is_done() {
            return operation
                .error
                .map_or(Ok(()), |payload| {
                    Err(LifecycleError::BackendOperation {
                        operation: operation.name.clone(),
                        payload,
                    })
                });
        }
        let api = &self.api;
        let handle = &operation;
        poll_until(
            &self.budget,
            &format!("operation {}", operation.name),
            "DONE",
            move || async move {
                let current = api.get_operation(handle).await?;
                Ok(match (current.is_done(), current.error) {
                    (true, Some(payload)) => PollOutcome::Failed(payload),
                    (true, None) => PollOutcome::Ready(()),
                    (false, _) => PollOutcome::Pending(current.status),
                })
            },
        )
        .await
    }

    async fn disk(&self, zone: &str, volume: &Volume) -> Result<Disk, LifecycleError> {
        self.api
            .get_disk(zone, &volume.resource_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                entity: String::from("disk"),
                id: volume.resource_id.clone(),
            })
    }

    async fn allocate(
        &self,
        request: CreateRequest<'_>,
        source_snapshot: Option<String>,
    ) -> Result<VolumePatch, LifecycleError> {
        let volume = request.volume;
        let zone = self.zone_of(volume).to_owned();
        let labels = sanitize_labels(&volume.labels);
        let mut slot = next_slot(request.used_slots());

        for _ in 0..MAX_NAME_ATTEMPTS {
            let new_disk = NewDisk {
                name: slot_name(&volume.group, slot),
                size_gb: kb_to_gb_ceil(volume.size_kb).max(1),
                disk_type: volume
                    .disk_offering_type
                    .clone()
                    .or_else(|| self.settings.disk_type.clone()),
                labels: labels.clone(),
                source_snapshot: source_snapshot.clone(),
            };
            let operation = match self.api.insert_disk(&zone, &new_disk).await {
                Ok(operation) => operation,
                Err(err) if err.is_already_exists() => {
                    warn!(disk = %new_disk.name, %zone, "disk name taken, trying next slot");
                    slot = next_slot_after(request.used_slots(), slot);
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.wait(operation).await?;

            let created = self
                .api
                .get_disk(&zone, &new_disk.name)
                .await?
                .ok_or_else(|| LifecycleError::NotFound {
                    entity: String::from("disk"),
                    id: new_disk.name.clone(),
                })?;
            info!(disk = %created.name, %zone, size_gb = created.size_gb, "disk ready");
            return Ok(VolumePatch::allocated(
                created.name.clone(),
                created.id,
                device_path(&created.name),
            )
            .with_slot(slot)
            .with_zone(zone)
            .with_labels(labels));
        }

        Err(LifecycleError::Conflict(format!(
            "no free disk name for group {} after {MAX_NAME_ATTEMPTS} attempts",
            volume.group
        )))
    }

    async fn attach_to(&self, volume: &Volume, host: &str) -> Result<VolumePatch, LifecycleError> {
        let zone = self.zone_of(volume);
        let disk = self.disk(zone, volume).await?;
        if disk.users.iter().any(|user| user == host) {
            debug!(disk = %disk.name, host, "already attached");
            return Ok(VolumePatch::default().with_vm_name(host));
        }
        if let Some(user) = disk.users.first() {
            return Err(LifecycleError::Conflict(format!(
                "disk {} is attached to {user}",
                disk.name
            )));
        }
        let operation = self.api.attach_disk(zone, host, &disk.name).await?;
        self.wait(operation).await?;
        info!(disk = %disk.name, host, "disk attached");
        Ok(VolumePatch::default().with_vm_name(host))
    }

    async fn detach_all(&self, zone: &str, disk: &Disk) -> Result<(), LifecycleError> {
        for user in &disk.users {
            let operation = self.api.detach_disk(zone, user, &disk.name).await?;
            self.wait(operation).await?;
            info!(disk = %disk.name, host = %user, "disk detached");
        }
        Ok(())
    }

    async fn release(&self, volume: &Volume) -> Result<(), LifecycleError> {
        let zone = self.zone_of(volume);
        let Some(disk) = self.api.get_disk(zone, &volume.resource_id).await? else {
            debug!(disk = %volume.resource_id, "disk already gone");
            return Ok(());
        };
        let recorded = volume.vm_name.as_deref();
        if let Some(user) = disk.users.iter().find(|user| Some(user.as_str()) != recorded) {
            return Err(LifecycleError::Conflict(format!(
                "disk {} is attached to {user}, not to its recorded host",
                disk.name
            )));
        }
        self.detach_all(zone, &disk).await?;

        match self.api.delete_disk(zone, &disk.name).await {
            Ok(operation) => self.wait(operation).await,
            Err(err) => tolerate_missing(Err(err), "disk"),
        }
    }

    async fn grow(&self, volume: &Volume, new_size_kb: u64) -> Result<VolumePatch, LifecycleError> {
        if new_size_kb <= volume.size_kb {
            return Err(LifecycleError::Validation(format!(
                "disk {} is already {} KB; {new_size_kb} KB is not larger",
                volume.resource_id, volume.size_kb
            )));
        }
        let zone = self.zone_of(volume);
        let disk = self.disk(zone, volume).await?;
        let size_gb = kb_to_gb_ceil(new_size_kb);
        if size_gb > disk.size_gb {
            let operation = self.api.resize_disk(zone, &disk.name, size_gb).await?;
            self.wait(operation).await?;
            info!(disk = %disk.name, size_gb, "disk resized");
        } else {
            debug!(disk = %disk.name, size_gb, "disk already holds the requested size");
        }
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
        let labels = sanitize_labels(&spec.labels);
        let operation = self
            .api
            .create_snapshot(zone, &volume.resource_id, &spec.name, &labels)
            .await?;
        self.wait(operation).await?;

        let api = &self.api;
        let name = spec.name.as_str();
        let ready = poll_until(
            &self.budget,
            &format!("snapshot {name}"),
            SNAPSHOT_READY,
            move || async move {
                Ok(match api.get_snapshot(name).await? {
                    None => PollOutcome::Pending(String::from("absent")),
                    Some(snapshot) if snapshot.status == SNAPSHOT_READY => {
                        PollOutcome::Ready(snapshot)
                    }
                    Some(snapshot) if snapshot.status == SNAPSHOT_FAILED => {
                        PollOutcome::Failed(format!("snapshot {name} failed"))
                    }
                    Some(snapshot) => PollOutcome::Pending(snapshot.status),
                })
            },
        )
        .await?;
        info!(snapshot = %ready.name, disk = %volume.resource_id, "snapshot ready");

        Ok(SnapshotPatch {
            identifier: ready.id,
            description: ready.name,
            size_bytes: ready.storage_bytes,
            labels,
        })
    }

    async fn relocate(&self, volume: &Volume, zone: &str) -> Result<VolumePatch, LifecycleError> {
        if volume.is_in_zone(zone) {
            return Ok(VolumePatch::default());
        }
        let source_zone = self.zone_of(volume);
        let disk = self.disk(source_zone, volume).await?;
        if let Some(user) = disk.users.first() {
            return Err(LifecycleError::Conflict(format!(
                "disk {} must be detached from {user} before moving",
                disk.name
            )));
        }
        let operation = self.api.move_disk(source_zone, &disk.name, zone).await?;
        self.wait(operation).await?;

        let moved = self
            .api
            .get_disk(zone, &disk.name)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                entity: String::from("disk"),
                id: disk.name.clone(),
            })?;
        info!(disk = %moved.name, from = source_zone, to = zone, "disk moved");
        Ok(VolumePatch {
            identifier: Some(moved.id),
            ..VolumePatch::default()
        }
        .with_zone(zone))
    }
}

impl<A: DiskApi> VolumeProvider for ComputeDiskProvider<A> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ComputeDisk
    }

    fn create_volume<'a>(&'a self, request: CreateRequest<'a>) -> BackendFuture<'a, VolumePatch> {
        Box::pin(self.allocate(request, None))
    }

    fn delete_volume<'a>(&'a self, volume: &'a Volume) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if volume.resource_id.is_empty() {
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
            let disk = self.disk(zone, volume).await?;
            self.detach_all(zone, &disk).await?;
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
        _volume: &'a Volume,
        snapshot: &'a Snapshot,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if snapshot.description.is_empty() {
                return Ok(());
            }
            match self.api.delete_snapshot(&snapshot.description).await {
                Ok(operation) => self.wait(operation).await,
                Err(err) => tolerate_missing(Err(err), "snapshot"),
            }
        })
    }

    fn restore_snapshot<'a>(
        &'a self,
        source: &'a Volume,
        snapshot: &'a Snapshot,
        request: CreateRequest<'a>,
    ) -> BackendFuture<'a, VolumePatch> {
        Box::pin(async move {
            if snapshot.description.is_empty() {
                return Err(LifecycleError::Validation(format!(
                    "snapshot {} of volume {} was never confirmed by the backend",
                    snapshot.id, source.id
                )));
            }
            self.allocate(request, Some(snapshot.description.clone()))
                .await
        })
    }

    fn move_volume<'a>(
        &'a self,
        volume: &'a Volume,
        zone: &'a str,
    ) -> BackendFuture<'a, VolumePatch> {
        Box::pin(self.relocate(volume, zone))
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
        if volume.resource_id.is_empty() {
            return Err(LifecycleError::Validation(format!(
                "volume {} is not allocated",
                volume.id
            )));
        }
        let device = if volume.path.is_empty() {
            device_path(&volume.resource_id)
        } else {
            volume.path.clone()
        };
        Ok(MountTarget::BlockDevice { device })
    }
}
