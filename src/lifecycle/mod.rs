//! Backend-agnostic volume lifecycle orchestration.
//!
//! Every operation follows the same shape: load the records it needs, resolve
//! the adapter for the volume's provider and environment, delegate one
//! backend step, apply the returned patch, then save once. Records are only
//! written after the backend confirmed the step, so a failed call leaves the
//! store as it was.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::LifecycleError;
use crate::model::{Labels, Snapshot, SnapshotId, Volume, VolumeId};
use crate::naming::{LabelSource, snapshot_name};
use crate::provider::{CreateRequest, ProviderKind, ProviderRegistry, SnapshotSpec, VolumeProvider};
use crate::script::{MountOptions, render_mount, render_unmount};
use crate::store::VolumeStore;
use crate::team::SnapshotTagger;

/// Inputs for provisioning a new volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateVolumeRequest {
    /// Backend family.
    pub provider: ProviderKind,
    /// Environment used to resolve the credential.
    pub environment: String,
    /// Sibling group.
    pub group: String,
    /// Requested size in kilobytes.
    pub size_kb: u64,
    /// Client granted access once the volume exists.
    pub owner_address: Option<String>,
    /// Snapshot to seed the volume from.
    pub snapshot_id: Option<SnapshotId>,
    /// Placement zone.
    pub zone: Option<String>,
    /// Host to attach the volume to after creation.
    pub vm_name: Option<String>,
    /// Performance class.
    pub disk_offering_type: Option<String>,
    /// Labels mirrored to the backend.
    pub labels: Labels,
}

impl CreateVolumeRequest {
    /// Starts a request with the required fields.
    #[must_use]
    pub fn new(
        provider: ProviderKind,
        environment: impl Into<String>,
        group: impl Into<String>,
        size_kb: u64,
    ) -> Self {
        Self {
            provider,
            environment: environment.into(),
            group: group.into(),
            size_kb,
            owner_address: None,
            snapshot_id: None,
            zone: None,
            vm_name: None,
            disk_offering_type: None,
            labels: Labels::new(),
        }
    }

    /// Grants `address` access after creation.
    #[must_use]
    pub fn owner_address(mut self, address: impl Into<String>) -> Self {
        self.owner_address = Some(address.into());
        self
    }

    /// Seeds the volume from a snapshot.
    #[must_use]
    pub fn from_snapshot(mut self, snapshot_id: SnapshotId) -> Self {
        self.snapshot_id = Some(snapshot_id);
        self
    }

    /// Places the volume in `zone`.
    #[must_use]
    pub fn zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// Attaches the volume to `vm_name` once created.
    #[must_use]
    pub fn vm_name(mut self, vm_name: impl Into<String>) -> Self {
        self.vm_name = Some(vm_name.into());
        self
    }

    /// Requests a performance class.
    #[must_use]
    pub fn disk_offering_type(mut self, offering: impl Into<String>) -> Self {
        self.disk_offering_type = Some(offering.into());
        self
    }

    /// Sets the labels mirrored to the backend.
    #[must_use]
    pub fn labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    fn validate(&self) -> Result<(), LifecycleError> {
        if self.environment.trim().is_empty() {
            return Err(LifecycleError::Validation(String::from(
                "environment must not be empty",
            )));
        }
        if self.group.trim().is_empty() {
            return Err(LifecycleError::Validation(String::from(
                "group must not be empty",
            )));
        }
        if self.size_kb == 0 && self.snapshot_id.is_none() {
            return Err(LifecycleError::Validation(String::from(
                "size_kb must be greater than zero",
            )));
        }
        Ok(())
    }

    fn seed(&self) -> Volume {
        let mut volume = Volume::provisioning(
            self.provider,
            self.environment.as_str(),
            self.group.as_str(),
            self.size_kb,
        );
        volume.zone = non_blank(self.zone.as_deref());
        volume.disk_offering_type = non_blank(self.disk_offering_type.as_deref());
        volume.labels = self.labels.clone();
        volume
    }
}

/// Ownership metadata for a new snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TakeSnapshotRequest {
    /// Team owning the database.
    pub team: Option<String>,
    /// Database engine.
    pub engine: Option<String>,
    /// Database name.
    pub db_name: Option<String>,
    /// Retain past normal rotation.
    pub persist: bool,
}

impl TakeSnapshotRequest {
    fn labels(&self) -> Labels {
        LabelSource {
            team: self.team.as_deref(),
            engine: self.engine.as_deref(),
            db_name: self.db_name.as_deref(),
            persist: self.persist,
        }
        .to_labels()
    }
}

/// Placement and access for a volume restored from a snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RestoreRequest {
    /// Zone for the new volume; the source zone when unset.
    pub zone: Option<String>,
    /// Host to attach the new volume to.
    pub vm_name: Option<String>,
    /// Client granted access to the new volume.
    pub owner_address: Option<String>,
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Where a new volume's data comes from.
#[derive(Clone, Copy)]
enum Source<'a> {
    Empty,
    Snapshot {
        volume: &'a Volume,
        snapshot: &'a Snapshot,
    },
}

/// Loads records, delegates to adapters and persists the results.
#[derive(Debug)]
pub struct LifecycleOrchestrator<S> {
    store: S,
    registry: ProviderRegistry,
    tagger: SnapshotTagger,
}

impl<S: VolumeStore> LifecycleOrchestrator<S> {
    /// Creates an orchestrator over `store` and `registry`. Snapshots carry
    /// only their request labels until a tagger is set.
    #[must_use]
    pub fn new(store: S, registry: ProviderRegistry) -> Self {
        Self {
            store,
            registry,
            tagger: SnapshotTagger::default(),
        }
    }

    /// Adds team billing tags and the backup marker to every snapshot.
    #[must_use]
    pub fn with_snapshot_tagger(mut self, tagger: SnapshotTagger) -> Self {
        self.tagger = tagger;
        self
    }

    /// The document store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The adapter registry.
    #[must_use]
    pub const fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    fn adapter(&self, volume: &Volume) -> Result<Arc<dyn VolumeProvider>, LifecycleError> {
        self.registry.resolve(volume.provider, &volume.environment)
    }

    /// Loads a volume record.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] when no record exists.
    pub fn get_volume(&self, id: &VolumeId) -> Result<Volume, LifecycleError> {
        self.store
            .find_volume(id)?
            .ok_or_else(|| LifecycleError::volume_not_found(id.as_str()))
    }

    fn get_snapshot(&self, id: &SnapshotId) -> Result<Snapshot, LifecycleError> {
        self.store
            .find_snapshot(id)?
            .ok_or_else(|| LifecycleError::snapshot_not_found(id.as_str()))
    }

    fn ready_volume(&self, id: &VolumeId) -> Result<Volume, LifecycleError> {
        let volume = self.get_volume(id)?;
        if !volume.is_allocated() {
            return Err(LifecycleError::Conflict(format!(
                "volume {id} has not been allocated by its backend"
            )));
        }
        Ok(volume)
    }

    /// Snapshots owned by a volume, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] when the volume does not exist.
    pub fn list_snapshots(&self, id: &VolumeId) -> Result<Vec<Snapshot>, LifecycleError> {
        let volume = self.get_volume(id)?;
        self.store.snapshots_of(&volume.id)
    }

    fn siblings(&self, seed: &Volume) -> Result<Vec<Volume>, LifecycleError> {
        let siblings = self.store.find_by_group(&seed.group)?;
        Ok(siblings
            .into_iter()
            .filter(|sibling| {
                sibling.provider == seed.provider
                    && sibling.environment == seed.environment
                    && sibling.is_allocated()
            })
            .collect())
    }

    /// Allocates and saves, then grants access and attaches, saving after
    /// each step.
    async fn provision(
        &self,
        mut volume: Volume,
        source: Source<'_>,
        owner_address: Option<&str>,
        vm_name: Option<&str>,
    ) -> Result<Volume, LifecycleError> {
        let adapter = self.adapter(&volume)?;
        let siblings = self.siblings(&volume)?;
        if let Some(first) = siblings.first() {
            volume.resource_id.clone_from(&first.resource_id);
        }

        let request = CreateRequest {
            volume: &volume,
            siblings: &siblings,
        };
        let patch = match source {
            Source::Empty => adapter.create_volume(request).await?,
            Source::Snapshot {
                volume: origin,
                snapshot,
            } => adapter.restore_snapshot(origin, snapshot, request).await?,
        };
        patch.apply_to(&mut volume);
        self.store.save_volume(&volume)?;
        info!(
            volume = %volume.id,
            provider = %volume.provider,
            group = %volume.group,
            resource = %volume.resource_id,
            "volume created"
        );

        if let Some(address) = owner_address {
            adapter.add_access(&volume, address).await?;
            volume.owner_address = address.to_owned();
            self.store.save_volume(&volume)?;
            info!(volume = %volume.id, address, "access granted");
        }

        if let Some(host) = vm_name {
            adapter.attach(&volume, host).await?.apply_to(&mut volume);
            self.store.save_volume(&volume)?;
            info!(volume = %volume.id, host, "volume attached");
        }
        Ok(volume)
    }

    /// Provisions a new volume, optionally seeded from a snapshot.
    ///
    /// The record is saved as soon as the backend confirmed allocation. The
    /// owner is then granted access and, when a host is requested, the
    /// volume is attached. A failure in either step leaves the saved record
    /// in place so that step can be retried on its own.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Validation`] for unusable input,
    /// [`LifecycleError::NotFound`] for an unknown seed snapshot, or any
    /// backend error.
    pub async fn create_volume(
        &self,
        request: &CreateVolumeRequest,
    ) -> Result<Volume, LifecycleError> {
        request.validate()?;
        let owner = non_blank(request.owner_address.as_deref());
        let host = non_blank(request.vm_name.as_deref());
        let mut seed = request.seed();

        let Some(snapshot_id) = &request.snapshot_id else {
            return self
                .provision(seed, Source::Empty, owner.as_deref(), host.as_deref())
                .await;
        };
        let snapshot = self.get_snapshot(snapshot_id)?;
        let origin = self.get_volume(&snapshot.volume_id)?;
        if origin.provider != seed.provider {
            return Err(LifecycleError::Validation(format!(
                "snapshot {snapshot_id} belongs to a {} volume, not {}",
                origin.provider, seed.provider
            )));
        }
        seed.size_kb = seed.size_kb.max(origin.size_kb);
        let source = Source::Snapshot {
            volume: &origin,
            snapshot: &snapshot,
        };
        self.provision(seed, source, owner.as_deref(), host.as_deref())
            .await
    }

    /// Releases the backend resource and removes the record together with
    /// its snapshot records. A missing record is a success.
    ///
    /// # Errors
    ///
    /// Returns any backend or store error; the record is kept when the
    /// backend refuses.
    pub async fn delete_volume(&self, id: &VolumeId) -> Result<(), LifecycleError> {
        let Some(volume) = self.store.find_volume(id)? else {
            info!(volume = %id, "volume already deleted");
            return Ok(());
        };
        let adapter = self.adapter(&volume)?;
        adapter.delete_volume(&volume).await?;
        self.store.delete_volume(id)?;
        info!(volume = %id, resource = %volume.resource_id, "volume deleted");
        Ok(())
    }

    /// Grows a volume. Shrinking, or resizing to the current size, is
    /// rejected before the backend is called.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Validation`] when `new_size_kb` is not
    /// larger than the current size, or any backend error.
    pub async fn resize(&self, id: &VolumeId, new_size_kb: u64) -> Result<Volume, LifecycleError> {
        let mut volume = self.ready_volume(id)?;
        if new_size_kb <= volume.size_kb {
            return Err(LifecycleError::Validation(format!(
                "volume {id} is {} KB; new size {new_size_kb} KB must be larger",
                volume.size_kb
            )));
        }
        let adapter = self.adapter(&volume)?;
        adapter.resize(&volume, new_size_kb).await?.apply_to(&mut volume);
        volume.size_kb = new_size_kb;
        self.store.save_volume(&volume)?;
        info!(volume = %id, size_kb = new_size_kb, "volume resized");
        Ok(volume)
    }

    /// Takes a snapshot named after the volume's resource, the current time
    /// and the new record's id. Labels are the ownership metadata plus the
    /// tagger's team and backup tags; request labels win on key clashes.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] for an unknown volume or any
    /// backend error; no snapshot record is saved on failure.
    pub async fn take_snapshot(
        &self,
        id: &VolumeId,
        request: &TakeSnapshotRequest,
    ) -> Result<Snapshot, LifecycleError> {
        let volume = self.ready_volume(id)?;
        let adapter = self.adapter(&volume)?;
        let now = Utc::now();
        let base = if volume.resource_id.is_empty() {
            &volume.identifier
        } else {
            &volume.resource_id
        };
        let mut labels = self
            .tagger
            .tags(request.team.as_deref(), request.engine.as_deref())
            .await;
        labels.extend(request.labels());
        let mut snapshot = Snapshot::pending(&volume, now);
        let spec = SnapshotSpec {
            name: snapshot_name(base, now, snapshot.id.as_str()),
            labels,
        };

        adapter
            .take_snapshot(&volume, &spec)
            .await?
            .apply_to(&mut snapshot);
        self.store.save_snapshot(&snapshot)?;
        info!(
            volume = %id,
            snapshot = %snapshot.id,
            name = %snapshot.description,
            "snapshot taken"
        );
        Ok(snapshot)
    }

    /// Deletes a snapshot from the backend and removes its record. A missing
    /// record is a success. With `force`, a backend refusal is logged and
    /// the record removed anyway.
    ///
    /// # Errors
    ///
    /// Returns any backend error when `force` is off, or any store error.
    pub async fn remove_snapshot(
        &self,
        id: &SnapshotId,
        force: bool,
    ) -> Result<(), LifecycleError> {
        let Some(snapshot) = self.store.find_snapshot(id)? else {
            info!(snapshot = %id, "snapshot already removed");
            return Ok(());
        };
        if let Some(volume) = self.store.find_volume(&snapshot.volume_id)? {
            let adapter = self.adapter(&volume)?;
            match adapter.remove_snapshot(&volume, &snapshot).await {
                Ok(()) => {}
                Err(err) if force => {
                    warn!(
                        snapshot = %id,
                        error = %err,
                        "backend refused snapshot removal; forcing"
                    );
                }
                Err(err) => return Err(err),
            }
        } else {
            warn!(snapshot = %id, volume = %snapshot.volume_id, "snapshot owner is gone");
        }
        self.store.delete_snapshot(id)?;
        info!(snapshot = %id, "snapshot removed");
        Ok(())
    }

    /// Restores a snapshot into a new volume carrying the source volume's
    /// group, size and placement. The source volume and snapshot are left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] when the snapshot or its volume
    /// is unknown, or any backend error.
    pub async fn restore_snapshot(
        &self,
        snapshot_id: &SnapshotId,
        request: &RestoreRequest,
    ) -> Result<Volume, LifecycleError> {
        let snapshot = self.get_snapshot(snapshot_id)?;
        let origin = self.get_volume(&snapshot.volume_id)?;

        let mut seed = Volume::provisioning(
            origin.provider,
            origin.environment.as_str(),
            origin.group.as_str(),
            origin.size_kb,
        );
        seed.zone = non_blank(request.zone.as_deref()).or_else(|| origin.zone.clone());
        seed.disk_offering_type.clone_from(&origin.disk_offering_type);
        seed.labels.clone_from(&origin.labels);

        let source = Source::Snapshot {
            volume: &origin,
            snapshot: &snapshot,
        };
        let owner = non_blank(request.owner_address.as_deref());
        let host = non_blank(request.vm_name.as_deref());
        let restored = self
            .provision(seed, source, owner.as_deref(), host.as_deref())
            .await?;
        info!(snapshot = %snapshot_id, volume = %restored.id, "snapshot restored");
        Ok(restored)
    }

    /// Moves a volume to `zone`; a volume already there is returned as is.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Validation`] for a blank zone or any backend
    /// error; the zone is only persisted after the backend confirmed.
    pub async fn move_volume(&self, id: &VolumeId, zone: &str) -> Result<Volume, LifecycleError> {
        let target = zone.trim();
        if target.is_empty() {
            return Err(LifecycleError::Validation(String::from(
                "zone must not be empty",
            )));
        }
        let mut volume = self.ready_volume(id)?;
        if volume.is_in_zone(target) {
            info!(volume = %id, zone = target, "volume already in zone");
            return Ok(volume);
        }
        let adapter = self.adapter(&volume)?;
        adapter
            .move_volume(&volume, target)
            .await?
            .apply_to(&mut volume);
        volume.zone = Some(target.to_owned());
        self.store.save_volume(&volume)?;
        info!(volume = %id, zone = target, "volume moved");
        Ok(volume)
    }

    /// Attaches a volume to `host`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Conflict`] when another host holds the
    /// volume, or any backend error.
    pub async fn attach_volume(&self, id: &VolumeId, host: &str) -> Result<Volume, LifecycleError> {
        let host_name = host.trim();
        if host_name.is_empty() {
            return Err(LifecycleError::Validation(String::from(
                "host must not be empty",
            )));
        }
        let mut volume = self.ready_volume(id)?;
        let adapter = self.adapter(&volume)?;
        adapter.attach(&volume, host_name).await?.apply_to(&mut volume);
        self.store.save_volume(&volume)?;
        info!(volume = %id, host = host_name, "volume attached");
        Ok(volume)
    }

    /// Detaches a volume from whichever host holds it.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn detach_volume(&self, id: &VolumeId) -> Result<Volume, LifecycleError> {
        let mut volume = self.ready_volume(id)?;
        let adapter = self.adapter(&volume)?;
        adapter.detach(&volume).await?.apply_to(&mut volume);
        self.store.save_volume(&volume)?;
        info!(volume = %id, "volume detached");
        Ok(volume)
    }

    /// Attaches a volume to `host` and renders the script that formats and
    /// mounts it there.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotSupported`] for backends without host
    /// mounts, or any attach or rendering error.
    pub async fn mount_script(
        &self,
        id: &VolumeId,
        host: &str,
        options: &MountOptions,
    ) -> Result<String, LifecycleError> {
        let volume = self.attach_volume(id, host).await?;
        let target = self.adapter(&volume)?.mount_target(&volume)?;
        let script = render_mount(&target, options)?;
        info!(volume = %id, host, "mount script rendered");
        Ok(script)
    }

    /// Renders the script that unmounts a volume on its host. Detaching is
    /// a separate step.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] for an unknown volume or
    /// [`LifecycleError::NotSupported`] for backends without host mounts.
    pub fn umount_script(
        &self,
        id: &VolumeId,
        options: &MountOptions,
    ) -> Result<String, LifecycleError> {
        let volume = self.ready_volume(id)?;
        self.adapter(&volume)?.mount_target(&volume)?;
        render_unmount(options)
    }

    /// Grants `address` access and records it as the owner.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn add_access(&self, id: &VolumeId, address: &str) -> Result<Volume, LifecycleError> {
        let client = address.trim();
        if client.is_empty() {
            return Err(LifecycleError::Validation(String::from(
                "address must not be empty",
            )));
        }
        let mut volume = self.ready_volume(id)?;
        let adapter = self.adapter(&volume)?;
        adapter.add_access(&volume, client).await?;
        volume.owner_address = client.to_owned();
        self.store.save_volume(&volume)?;
        info!(volume = %id, address = client, "access granted");
        Ok(volume)
    }

    /// Revokes access for `address`, clearing the owner when it matches.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn remove_access(
        &self,
        id: &VolumeId,
        address: &str,
    ) -> Result<Volume, LifecycleError> {
        let client = address.trim();
        let mut volume = self.ready_volume(id)?;
        let adapter = self.adapter(&volume)?;
        adapter.remove_access(&volume, client).await?;
        if volume.owner_address == client {
            volume.owner_address.clear();
            self.store.save_volume(&volume)?;
        }
        info!(volume = %id, address = client, "access revoked");
        Ok(volume)
    }
}

#[cfg(test)]
mod tests;
