//! Backend adapter abstraction and the registry of supported backends.
//!
//! Every backend family implements [`VolumeProvider`]. Adapters receive
//! immutable views of the current records and hand back patches; the
//! orchestrator applies and persists them. Primitives a backend lacks answer
//! [`LifecycleError::NotSupported`] through the trait's default methods,
//! while primitives that are meaningless for a backend (access control on a
//! block device, attach on an NFS export) are overridden as no-ops.

pub mod block;
pub mod claim;
pub mod disk;
pub mod export;
pub(crate) mod http;
mod registry;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;
use crate::model::{Labels, Snapshot, SnapshotPatch, Volume, VolumePatch};
use crate::script::MountTarget;

pub use registry::{ProviderFactory, ProviderRegistry};

/// Future returned by adapter and control-plane operations.
pub type BackendFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, LifecycleError>> + Send + 'a>>;

/// Closed set of supported backend families.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum ProviderKind {
    /// Block-storage cloud volumes attached to instances.
    #[serde(rename = "block")]
    BlockStorage,
    /// Virtual-machine persistent disks.
    #[serde(rename = "gce")]
    ComputeDisk,
    /// Network file exports mounted over NFS.
    #[serde(rename = "faas")]
    NetworkExport,
    /// Container-orchestrator persistent volume claims.
    #[serde(rename = "k8s")]
    ContainerVolume,
}

impl ProviderKind {
    /// Every supported backend family.
    pub const ALL: [Self; 4] = [
        Self::BlockStorage,
        Self::ComputeDisk,
        Self::NetworkExport,
        Self::ContainerVolume,
    ];

    /// Canonical provider name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BlockStorage => "block",
            Self::ComputeDisk => "gce",
            Self::NetworkExport => "faas",
            Self::ContainerVolume => "k8s",
        }
    }

    /// Credential fields the backend cannot work without.
    #[must_use]
    pub const fn required_credential_fields(self) -> &'static [&'static str] {
        match self {
            Self::BlockStorage => &["secret_key", "project_id", "zone"],
            Self::ComputeDisk => &["project", "zone", "access_token"],
            Self::NetworkExport => &["endpoint", "token", "category_id", "access_type"],
            Self::ContainerVolume => &["api_server", "token"],
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = LifecycleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" | "sbs" | "scaleway" => Ok(Self::BlockStorage),
            "gce" | "disk" => Ok(Self::ComputeDisk),
            "faas" | "export" | "nfs" => Ok(Self::NetworkExport),
            "k8s" | "claim" | "kubernetes" => Ok(Self::ContainerVolume),
            other => Err(LifecycleError::Validation(format!(
                "unknown provider '{other}'"
            ))),
        }
    }
}

/// Inputs for allocating a backend resource.
#[derive(Clone, Copy, Debug)]
pub struct CreateRequest<'a> {
    /// Provisioning record: group, size, placement, labels and the lineage
    /// resource id seeded from the first group member.
    pub volume: &'a Volume,
    /// Allocated members of the same group, used for slot allocation.
    pub siblings: &'a [Volume],
}

impl CreateRequest<'_> {
    /// Slots already taken by siblings.
    pub fn used_slots(&self) -> impl Iterator<Item = u32> + '_ {
        self.siblings.iter().filter_map(|sibling| sibling.device_slot)
    }

    /// Resource id inherited from the group, if any.
    #[must_use]
    pub fn lineage(&self) -> Option<&str> {
        Some(self.volume.resource_id.as_str()).filter(|id| !id.is_empty())
    }
}

/// Name and labels for a new backend snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SnapshotSpec {
    /// Backend-facing snapshot name.
    pub name: String,
    /// Labels to attach.
    pub labels: Labels,
}

/// Lifecycle primitives implemented by each backend adapter.
pub trait VolumeProvider: Send + Sync {
    /// Backend family served by this adapter.
    fn kind(&self) -> ProviderKind;

    /// Allocates a new backend resource for `request.volume`.
    fn create_volume<'a>(&'a self, request: CreateRequest<'a>) -> BackendFuture<'a, VolumePatch> {
        let _ = request;
        unsupported(self.kind(), "create_volume")
    }

    /// Releases the backend resource. A resource that is already gone is a
    /// success.
    fn delete_volume<'a>(&'a self, volume: &'a Volume) -> BackendFuture<'a, ()> {
        let _ = volume;
        unsupported(self.kind(), "delete_volume")
    }

    /// Attaches the volume to `host`.
    fn attach<'a>(&'a self, volume: &'a Volume, host: &'a str) -> BackendFuture<'a, VolumePatch> {
        let _ = (volume, host);
        unsupported(self.kind(), "attach")
    }

    /// Detaches the volume from whichever host holds it.
    fn detach<'a>(&'a self, volume: &'a Volume) -> BackendFuture<'a, VolumePatch> {
        let _ = volume;
        unsupported(self.kind(), "detach")
    }

    /// Grows the volume to `new_size_kb`.
    fn resize<'a>(
        &'a self,
        volume: &'a Volume,
        new_size_kb: u64,
    ) -> BackendFuture<'a, VolumePatch> {
        let _ = (volume, new_size_kb);
        unsupported(self.kind(), "resize")
    }

    /// Takes a point-in-time snapshot.
    fn take_snapshot<'a>(
        &'a self,
        volume: &'a Volume,
        spec: &'a SnapshotSpec,
    ) -> BackendFuture<'a, SnapshotPatch> {
        let _ = (volume, spec);
        unsupported(self.kind(), "take_snapshot")
    }

    /// Deletes a snapshot. A snapshot that is already gone is a success.
    fn remove_snapshot<'a>(
        &'a self,
        volume: &'a Volume,
        snapshot: &'a Snapshot,
    ) -> BackendFuture<'a, ()> {
        let _ = (volume, snapshot);
        unsupported(self.kind(), "remove_snapshot")
    }

    /// Allocates a new backend resource seeded from `snapshot`.
    fn restore_snapshot<'a>(
        &'a self,
        source: &'a Volume,
        snapshot: &'a Snapshot,
        request: CreateRequest<'a>,
    ) -> BackendFuture<'a, VolumePatch> {
        let _ = (source, snapshot, request);
        unsupported(self.kind(), "restore_snapshot")
    }

    /// Moves the volume to another zone.
    fn move_volume<'a>(
        &'a self,
        volume: &'a Volume,
        zone: &'a str,
    ) -> BackendFuture<'a, VolumePatch> {
        let _ = (volume, zone);
        unsupported(self.kind(), "move_volume")
    }

    /// Grants `address` access to the volume.
    fn add_access<'a>(&'a self, volume: &'a Volume, address: &'a str) -> BackendFuture<'a, ()> {
        let _ = (volume, address);
        unsupported(self.kind(), "add_access")
    }

    /// Revokes access previously granted to `address`.
    fn remove_access<'a>(&'a self, volume: &'a Volume, address: &'a str) -> BackendFuture<'a, ()> {
        let _ = (volume, address);
        unsupported(self.kind(), "remove_access")
    }

    /// Describes what a host must mount once the volume is attached.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotSupported`] for backends whose volumes
    /// are not mounted by host scripts.
    fn mount_target(&self, volume: &Volume) -> Result<MountTarget, LifecycleError> {
        let _ = volume;
        Err(LifecycleError::not_supported(self.kind().as_str(), "mount"))
    }
}

fn unsupported<'a, T: Send + 'a>(
    kind: ProviderKind,
    operation: &'static str,
) -> BackendFuture<'a, T> {
    Box::pin(async move { Err(LifecycleError::not_supported(kind.as_str(), operation)) })
}

/// Completed no-op, for primitives that have no meaning on a backend.
pub(crate) fn no_op<'a>() -> BackendFuture<'a, ()> {
    Box::pin(async { Ok(()) })
}

/// Treats a backend not-found answer as success.
pub(crate) fn tolerate_missing(
    result: Result<(), LifecycleError>,
    what: &str,
) -> Result<(), LifecycleError> {
    match result {
        Err(err) if err.is_backend_not_found() => {
            tracing::warn!(resource = what, "already absent on the backend");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("gce", ProviderKind::ComputeDisk)]
    #[case(" K8S ", ProviderKind::ContainerVolume)]
    #[case("faas", ProviderKind::NetworkExport)]
    #[case("block", ProviderKind::BlockStorage)]
    #[case("scaleway", ProviderKind::BlockStorage)]
    fn provider_names_parse(#[case] raw: &str, #[case] expected: ProviderKind) {
        assert_eq!(raw.parse::<ProviderKind>(), Ok(expected));
    }

    #[test]
    fn unknown_provider_is_a_validation_error() {
        let err = "floppy".parse::<ProviderKind>().expect_err("unknown provider");
        assert!(matches!(err, LifecycleError::Validation(ref msg) if msg.contains("floppy")));
    }

    #[test]
    fn canonical_names_round_trip() {
        for kind in ProviderKind::ALL {
            assert_eq!(kind.as_str().parse::<ProviderKind>(), Ok(kind));
        }
    }

    struct Bare;

    impl VolumeProvider for Bare {
        fn kind(&self) -> ProviderKind {
            ProviderKind::NetworkExport
        }
    }

    #[tokio::test]
    async fn missing_primitives_report_not_supported() {
        let volume = Volume::provisioning(ProviderKind::NetworkExport, "dev", "g", 1);
        let err = Bare
            .move_volume(&volume, "zone-b")
            .await
            .expect_err("move is not implemented");
        assert_eq!(
            err,
            LifecycleError::NotSupported {
                provider: String::from("faas"),
                operation: String::from("move_volume"),
            }
        );
    }

    #[test]
    fn tolerate_missing_only_swallows_not_found() {
        let gone = LifecycleError::Backend {
            provider: String::from("gce"),
            status: 404,
            message: String::new(),
        };
        assert_eq!(tolerate_missing(Err(gone), "disk"), Ok(()));

        let denied = LifecycleError::Backend {
            provider: String::from("gce"),
            status: 403,
            message: String::new(),
        };
        assert!(tolerate_missing(Err(denied), "disk").is_err());
    }
}
