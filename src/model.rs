//! Volume and snapshot records persisted by the document store, plus the
//! patches adapters return to mutate them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::ProviderKind;

/// Free-form key-value metadata mirrored to backends that support labels.
pub type Labels = BTreeMap<String, String>;

const KB_PER_GB: u64 = 1024 * 1024;

macro_rules! record_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generates a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().simple().to_string())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.trim().to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value.trim().to_owned())
            }
        }
    };
}

record_id!(VolumeId, "Opaque primary key of a [`Volume`] record.");
record_id!(SnapshotId, "Opaque primary key of a [`Snapshot`] record.");

/// One provisioned storage unit tracked by the engine.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    /// Primary key.
    pub id: VolumeId,
    /// Backend family that owns the underlying resource.
    pub provider: ProviderKind,
    /// Environment used to resolve credentials for this volume.
    pub environment: String,
    /// Provisioned size in kilobytes. Never decreases.
    pub size_kb: u64,
    /// Sibling group used for naming and lineage.
    pub group: String,
    /// Backend-assigned name.
    #[serde(default)]
    pub resource_id: String,
    /// Backend-assigned opaque identifier.
    #[serde(default)]
    pub identifier: String,
    /// Device path or mount source.
    #[serde(default)]
    pub path: String,
    /// Address of the client currently granted access.
    #[serde(default)]
    pub owner_address: String,
    /// Placement zone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Host the volume is attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
    /// Labels mirrored to the backend.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    /// Optional performance class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_offering_type: Option<String>,
    /// Device slot allocated within the group or host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_slot: Option<u32>,
}

impl Volume {
    /// Starts a record in the provisioning state. Backend fields stay empty
    /// until an adapter confirms allocation.
    #[must_use]
    pub fn provisioning(
        provider: ProviderKind,
        environment: impl Into<String>,
        group: impl Into<String>,
        size_kb: u64,
    ) -> Self {
        Self {
            id: VolumeId::generate(),
            provider,
            environment: environment.into().trim().to_owned(),
            size_kb,
            group: group.into().trim().to_owned(),
            resource_id: String::new(),
            identifier: String::new(),
            path: String::new(),
            owner_address: String::new(),
            zone: None,
            vm_name: None,
            labels: Labels::new(),
            disk_offering_type: None,
            device_slot: None,
        }
    }

    /// Size rounded to the nearest gigabyte.
    #[must_use]
    pub const fn size_gb(&self) -> u64 {
        kb_to_gb(self.size_kb)
    }

    /// Whether the backend has confirmed allocation.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        !self.identifier.is_empty()
    }

    /// Whether the volume already lives in `zone`.
    #[must_use]
    pub fn is_in_zone(&self, zone: &str) -> bool {
        self.zone.as_deref() == Some(zone)
    }
}

/// Converts kilobytes to gigabytes, rounding half up.
#[must_use]
pub const fn kb_to_gb(size_kb: u64) -> u64 {
    size_kb.saturating_add(KB_PER_GB >> 1).div_euclid(KB_PER_GB)
}

/// Converts kilobytes to whole gigabytes, rounding up. Backends that allocate
/// in gigabytes use this so no volume is smaller than requested.
#[must_use]
pub const fn kb_to_gb_ceil(size_kb: u64) -> u64 {
    size_kb.div_ceil(KB_PER_GB)
}

/// Converts gigabytes to kilobytes.
#[must_use]
pub const fn gb_to_kb(size_gb: u64) -> u64 {
    size_gb.saturating_mul(KB_PER_GB)
}

/// A point-in-time copy of a [`Volume`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Primary key.
    pub id: SnapshotId,
    /// Owning volume; deleting it cascades here.
    pub volume_id: VolumeId,
    /// Backend-assigned identifier.
    #[serde(default)]
    pub identifier: String,
    /// Backend-facing snapshot name.
    #[serde(default)]
    pub description: String,
    /// Labels attached to the snapshot.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    /// Size reported by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Starts a snapshot record for `volume`, stamped with `created_at`.
    #[must_use]
    pub fn pending(volume: &Volume, created_at: DateTime<Utc>) -> Self {
        Self {
            id: SnapshotId::generate(),
            volume_id: volume.id.clone(),
            identifier: String::new(),
            description: String::new(),
            labels: Labels::new(),
            size_bytes: None,
            created_at,
        }
    }
}

/// Fields an adapter changed on a volume. Unset fields are left alone.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumePatch {
    /// New size in kilobytes.
    pub size_kb: Option<u64>,
    /// New backend name.
    pub resource_id: Option<String>,
    /// New backend identifier.
    pub identifier: Option<String>,
    /// New device path or mount source.
    pub path: Option<String>,
    /// New owner address.
    pub owner_address: Option<String>,
    /// New placement zone.
    pub zone: Option<String>,
    /// New attachment host.
    pub vm_name: Option<String>,
    /// New device slot.
    pub device_slot: Option<u32>,
    /// Replacement labels.
    pub labels: Option<Labels>,
    /// Clears the attachment host.
    pub detached: bool,
}

impl VolumePatch {
    /// Patch recording that the volume left its host.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            detached: true,
            ..Self::default()
        }
    }

    /// Patch describing a freshly allocated backend resource.
    #[must_use]
    pub fn allocated(
        resource_id: impl Into<String>,
        identifier: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: Some(resource_id.into()),
            identifier: Some(identifier.into()),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Sets the device slot.
    #[must_use]
    pub const fn with_slot(mut self, slot: u32) -> Self {
        self.device_slot = Some(slot);
        self
    }

    /// Sets the zone.
    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// Sets the attachment host.
    #[must_use]
    pub fn with_vm_name(mut self, vm_name: impl Into<String>) -> Self {
        self.vm_name = Some(vm_name.into());
        self
    }

    /// Sets the labels.
    #[must_use]
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Whether the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Writes every set field onto `volume`.
    pub fn apply_to(self, volume: &mut Volume) {
        if let Some(size_kb) = self.size_kb {
            volume.size_kb = size_kb;
        }
        if let Some(resource_id) = self.resource_id {
            volume.resource_id = resource_id;
        }
        if let Some(identifier) = self.identifier {
            volume.identifier = identifier;
        }
        if let Some(path) = self.path {
            volume.path = path;
        }
        if let Some(owner_address) = self.owner_address {
            volume.owner_address = owner_address;
        }
        if self.zone.is_some() {
            volume.zone = self.zone;
        }
        if self.vm_name.is_some() {
            volume.vm_name = self.vm_name;
        }
        if self.device_slot.is_some() {
            volume.device_slot = self.device_slot;
        }
        if let Some(labels) = self.labels {
            volume.labels = labels;
        }
        if self.detached {
            volume.vm_name = None;
        }
    }
}

/// Fields an adapter reports after taking a snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SnapshotPatch {
    /// Backend identifier.
    pub identifier: String,
    /// Backend-facing name.
    pub description: String,
    /// Size reported by the backend, when known.
    pub size_bytes: Option<u64>,
    /// Labels as stored by the backend.
    pub labels: Labels,
}

impl SnapshotPatch {
    /// Writes the patch onto `snapshot`.
    pub fn apply_to(self, snapshot: &mut Snapshot) {
        snapshot.identifier = self.identifier;
        snapshot.description = self.description;
        snapshot.size_bytes = self.size_bytes;
        snapshot.labels = self.labels;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn volume() -> Volume {
        Volume::provisioning(ProviderKind::ComputeDisk, " dev ", " db-1 ", gb_to_kb(10))
    }

    #[test]
    fn provisioning_trims_and_leaves_backend_fields_empty() {
        let vol = volume();
        assert_eq!(vol.group, "db-1");
        assert_eq!(vol.environment, "dev");
        assert!(!vol.is_allocated());
        assert!(vol.resource_id.is_empty());
        assert!(vol.path.is_empty());
    }

    #[rstest]
    #[case(0, 0)]
    #[case(524_287, 0)]
    #[case(524_288, 1)]
    #[case(1_048_576, 1)]
    #[case(5_242_880, 5)]
    fn kb_to_gb_rounds_to_nearest(#[case] kb: u64, #[case] gb: u64) {
        assert_eq!(kb_to_gb(kb), gb);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(1_048_576, 1)]
    #[case(10_485_760, 10)]
    #[case(10_895_360, 11)]
    fn kb_to_gb_ceil_never_undershoots(#[case] kb: u64, #[case] gb: u64) {
        assert_eq!(kb_to_gb_ceil(kb), gb);
    }

    #[test]
    fn patch_only_overwrites_set_fields() {
        let mut vol = volume();
        vol.owner_address = String::from("10.0.0.1");
        VolumePatch::allocated("db-1-data1", "123", "/dev/sdb")
            .with_slot(1)
            .apply_to(&mut vol);

        assert_eq!(vol.resource_id, "db-1-data1");
        assert_eq!(vol.identifier, "123");
        assert_eq!(vol.path, "/dev/sdb");
        assert_eq!(vol.device_slot, Some(1));
        assert_eq!(vol.owner_address, "10.0.0.1");
        assert_eq!(vol.size_kb, gb_to_kb(10));
    }

    #[test]
    fn detached_patch_clears_the_host() {
        let mut vol = volume();
        vol.vm_name = Some(String::from("db-1-vm"));
        VolumePatch::detached().apply_to(&mut vol);
        assert_eq!(vol.vm_name, None);
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(VolumePatch::default().is_empty());
        assert!(!VolumePatch::default().with_zone("z").is_empty());
    }

    #[test]
    fn volume_serialises_without_unset_optionals() {
        let json = serde_json::to_string(&volume()).expect("serialise");
        assert!(!json.contains("vm_name"));
        assert!(!json.contains("labels"));
        assert!(json.contains(r#""provider":"gce""#));
    }
}
