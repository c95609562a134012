//! Container-orchestrator persistent volume claims.
//!
//! Claims are named per group slot like persistent disks and a name
//! collision is retried on the next slot. The orchestrator schedules the
//! consuming pod, so attach and detach only record the host, access control
//! has no meaning, and there is no host mount script.

pub mod api;
pub mod client;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::credential::Credential;
use crate::error::LifecycleError;
use crate::model::{Labels, Snapshot, SnapshotPatch, Volume, VolumePatch, gb_to_kb, kb_to_gb_ceil};
use crate::naming::{next_slot, next_slot_after, sanitize_label, slot_name};
use crate::wait::{PollBudget, PollOutcome, poll_until};

use self::api::{Claim, ClaimApi, NewClaim, NewClaimSnapshot};
use self::client::KubeClient;

use super::{
    BackendFuture, CreateRequest, ProviderKind, SnapshotSpec, VolumeProvider, no_op,
    tolerate_missing,
};

/// Namespace used when the credential does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";
const MAX_NAME_ATTEMPTS: u32 = 5;
const PHASE_BOUND: &str = "Bound";
const PHASE_LOST: &str = "Lost";
const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Builds the adapter from a `k8s` credential.
///
/// # Errors
///
/// Returns [`LifecycleError::Credential`] when a required field is missing
/// or the API server address is malformed.
pub fn build(
    credential: &Credential,
    config: &EngineConfig,
) -> Result<Arc<dyn VolumeProvider>, LifecycleError> {
    let client = KubeClient::connect(
        credential.require("api_server")?,
        credential.get_str("namespace").unwrap_or(DEFAULT_NAMESPACE),
        credential.require("token")?,
    )?;
    Ok(Arc::new(ContainerVolumeProvider::new(
        client,
        ClaimSettings::from_credential(credential),
        PollBudget::from_config(config),
    )))
}

/// Storage classes and binding behaviour read from the credential.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClaimSettings {
    /// Storage class per zone, from the `pools` map.
    pub pools: HashMap<String, String>,
    /// Storage class for volumes without a zone-specific pool.
    pub storage_class: Option<String>,
    /// Volume snapshot class.
    pub snapshot_class: Option<String>,
    /// Whether create waits for the claim to bind. Storage classes with
    /// `WaitForFirstConsumer` binding only bind once a pod mounts the claim.
    pub wait_for_bind: bool,
}

impl ClaimSettings {
    /// Reads settings from `credential`; every field is optional.
    #[must_use]
    pub fn from_credential(credential: &Credential) -> Self {
        Self {
            pools: credential.get_map("pools"),
            storage_class: credential.get_str("storage_class").map(str::to_owned),
            snapshot_class: credential.get_str("snapshot_class").map(str::to_owned),
            wait_for_bind: credential.get_bool("wait_for_bind").unwrap_or(true),
        }
    }

    fn storage_class_for(&self, volume: &Volume) -> Option<String> {
        volume
            .zone
            .as_ref()
            .and_then(|zone| self.pools.get(zone))
            .or(self.storage_class.as_ref())
            .cloned()
    }
}

fn sanitize_labels(labels: &Labels) -> Labels {
    labels
        .iter()
        .map(|(key, value)| (sanitize_label(key), sanitize_label(value)))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Adapter over any [`ClaimApi`].
pub struct ContainerVolumeProvider<A> {
    api: A,
    settings: ClaimSettings,
    budget: PollBudget,
}

impl<A: ClaimApi> ContainerVolumeProvider<A> {
    /// Wraps `api` with credential defaults and a polling budget.
    #[must_use]
    pub const fn new(api: A, settings: ClaimSettings, budget: PollBudget) -> Self {
        Self {
            api,
            settings,
            budget,
        }
    }

    async fn wait_bound(&self, name: &str) -> Result<Claim, LifecycleError> {
        let api = &self.api;
        poll_until(
            &self.budget,
            &format!("claim {name}"),
            PHASE_BOUND,
            move || async move {
                Ok(match api.get_claim(name).await? {
                    None => PollOutcome::Pending(String::from("absent")),
                    Some(claim) if claim.phase == PHASE_BOUND => PollOutcome::Ready(claim),
                    Some(claim) if claim.phase == PHASE_LOST => {
                        PollOutcome::Failed(format!("claim {name} lost its volume"))
                    }
                    Some(claim) => PollOutcome::Pending(claim.phase),
                })
            },
        )
        .await
    }

    async fn allocate(
        &self,
        request: CreateRequest<'_>,
        size_gb: u64,
        source_snapshot: Option<String>,
    ) -> Result<VolumePatch, LifecycleError> {
        let volume = request.volume;
        let labels = sanitize_labels(&volume.labels);
        let mut slot = next_slot(request.used_slots());

        for _ in 0..MAX_NAME_ATTEMPTS {
            let new_claim = NewClaim {
                name: slot_name(&volume.group, slot),
                size_gb,
                storage_class: self.settings.storage_class_for(volume),
                labels: labels.clone(),
                source_snapshot: source_snapshot.clone(),
            };
            let created = match self.api.create_claim(&new_claim).await {
                Ok(claim) => claim,
                Err(err) if err.is_already_exists() => {
                    warn!(claim = %new_claim.name, "claim name taken, trying next slot");
                    slot = next_slot_after(request.used_slots(), slot);
                    continue;
                }
                Err(err) => return Err(err),
            };
            let claim = if self.settings.wait_for_bind {
                self.wait_bound(&created.name).await?
            } else {
                created
            };
            info!(claim = %claim.name, size_gb, phase = %claim.phase, "claim created");
            return Ok(
                VolumePatch::allocated(claim.name.clone(), claim.name, String::new())
                    .with_slot(slot)
                    .with_labels(labels),
            );
        }

        Err(LifecycleError::Conflict(format!(
            "no free claim name for group {} after {MAX_NAME_ATTEMPTS} attempts",
            volume.group
        )))
    }

    async fn grow(&self, volume: &Volume, new_size_kb: u64) -> Result<VolumePatch, LifecycleError> {
        if new_size_kb <= volume.size_kb {
            return Err(LifecycleError::Validation(format!(
                "claim {} is already {} KB; {new_size_kb} KB is not larger",
                volume.identifier, volume.size_kb
            )));
        }
        let claim = self
            .api
            .get_claim(&volume.identifier)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                entity: String::from("claim"),
                id: volume.identifier.clone(),
            })?;
        let current_gb = claim.capacity_bytes.map_or_else(
            || kb_to_gb_ceil(volume.size_kb),
            |bytes| bytes.div_ceil(BYTES_PER_GB),
        );
        let size_gb = kb_to_gb_ceil(new_size_kb);
        if size_gb > current_gb {
            self.api.resize_claim(&claim.name, size_gb).await?;
            info!(claim = %claim.name, size_gb, "claim resize requested");
        } else {
            debug!(claim = %claim.name, size_gb, "claim already holds the requested size");
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
        let labels = sanitize_labels(&spec.labels);
        self.api
            .create_snapshot(&NewClaimSnapshot {
                name: spec.name.clone(),
                claim: volume.identifier.clone(),
                class: self.settings.snapshot_class.clone(),
                labels: labels.clone(),
            })
            .await?;

        let api = &self.api;
        let name = spec.name.as_str();
        let ready = poll_until(
            &self.budget,
            &format!("volume snapshot {name}"),
            "readyToUse",
            move || async move {
                Ok(match api.get_snapshot(name).await? {
                    None => PollOutcome::Pending(String::from("absent")),
                    Some(snapshot) if snapshot.ready => PollOutcome::Ready(snapshot),
                    Some(snapshot) => match snapshot.error {
                        Some(message) => PollOutcome::Failed(message),
                        None => PollOutcome::Pending(String::from("not ready")),
                    },
                })
            },
        )
        .await?;
        info!(snapshot = %ready.name, claim = %volume.identifier, "volume snapshot ready");

        Ok(SnapshotPatch {
            identifier: if ready.uid.is_empty() {
                ready.name.clone()
            } else {
                ready.uid
            },
            description: ready.name,
            size_bytes: ready.restore_bytes,
            labels,
        })
    }
}

impl<A: ClaimApi> VolumeProvider for ContainerVolumeProvider<A> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ContainerVolume
    }

    fn create_volume<'a>(&'a self, request: CreateRequest<'a>) -> BackendFuture<'a, VolumePatch> {
        let size_gb = kb_to_gb_ceil(request.volume.size_kb).max(1);
        Box::pin(self.allocate(request, size_gb, None))
    }

    fn delete_volume<'a>(&'a self, volume: &'a Volume) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if !volume.is_allocated() {
                return Ok(());
            }
            tolerate_missing(self.api.delete_claim(&volume.identifier).await, "claim")?;
            info!(claim = %volume.identifier, "claim deleted");
            Ok(())
        })
    }

    fn attach<'a>(&'a self, volume: &'a Volume, host: &'a str) -> BackendFuture<'a, VolumePatch> {
        Box::pin(async move {
            match volume.vm_name.as_deref() {
                Some(current) if current != host => Err(LifecycleError::Conflict(format!(
                    "claim {} is bound to {current}; detach it before attaching to {host}",
                    volume.identifier
                ))),
                _ => Ok(VolumePatch::default().with_vm_name(host)),
            }
        })
    }

    fn detach<'a>(&'a self, _volume: &'a Volume) -> BackendFuture<'a, VolumePatch> {
        Box::pin(async { Ok(VolumePatch::detached()) })
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
                debug!(snapshot = %snapshot.id, "snapshot was never created on the cluster");
                return Ok(());
            }
            tolerate_missing(
                self.api.delete_snapshot(&snapshot.description).await,
                "volume snapshot",
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
            if snapshot.description.is_empty() {
                return Err(LifecycleError::Validation(format!(
                    "snapshot {} of volume {} was never confirmed by the cluster",
                    snapshot.id, source.id
                )));
            }
            let snapshot_gb = snapshot
                .size_bytes
                .map_or(0, |bytes| bytes.div_ceil(BYTES_PER_GB));
            let size_kb = request.volume.size_kb.max(gb_to_kb(snapshot_gb));
            let size_gb = kb_to_gb_ceil(size_kb).max(1);
            let mut patch = self
                .allocate(request, size_gb, Some(snapshot.description.clone()))
                .await?;
            patch.size_kb = Some(size_kb);
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
}
