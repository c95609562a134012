//! Control-plane surface the persistent-disk adapter depends on.

use crate::model::Labels;
use crate::provider::BackendFuture;

/// Persistent disk as reported by the control plane.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Disk {
    /// Numeric identifier, rendered as a string.
    pub id: String,
    /// Disk name, unique per zone.
    pub name: String,
    /// Size in gigabytes.
    pub size_gb: u64,
    /// Lifecycle status, for example `CREATING` or `READY`.
    pub status: String,
    /// Names of the instances the disk is attached to.
    pub users: Vec<String>,
}

/// Parameters for inserting a disk.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NewDisk {
    /// Disk name.
    pub name: String,
    /// Size in gigabytes.
    pub size_gb: u64,
    /// Disk type such as `pd-ssd`.
    pub disk_type: Option<String>,
    /// Labels, already sanitised.
    pub labels: Labels,
    /// Snapshot to seed the disk from.
    pub source_snapshot: Option<String>,
}

/// Disk snapshot as reported by the control plane.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DiskSnapshot {
    /// Numeric identifier, rendered as a string.
    pub id: String,
    /// Snapshot name, unique per project.
    pub name: String,
    /// Lifecycle status, for example `CREATING`, `UPLOADING` or `READY`.
    pub status: String,
    /// Stored size in bytes.
    pub storage_bytes: Option<u64>,
}

/// Where an operation lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OperationScope {
    /// Zonal operation.
    Zone(String),
    /// Project-global operation.
    Global,
}

/// Handle on an asynchronous control-plane operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Operation {
    /// Operation name.
    pub name: String,
    /// `PENDING`, `RUNNING` or `DONE`.
    pub status: String,
    /// Error message reported on completion.
    pub error: Option<String>,
    /// Zone or global scope, used to poll the operation.
    pub scope: OperationScope,
}

impl Operation {
    /// Whether the operation has finished, successfully or not.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status == "DONE"
    }
}

/// Compute calls used by the adapter.
pub trait DiskApi: Send + Sync {
    /// Reads a disk; `None` when it does not exist.
    fn get_disk<'a>(&'a self, zone: &'a str, name: &'a str) -> BackendFuture<'a, Option<Disk>>;

    /// Starts inserting a disk.
    fn insert_disk<'a>(&'a self, zone: &'a str, disk: &'a NewDisk) -> BackendFuture<'a, Operation>;

    /// Starts deleting a disk.
    fn delete_disk<'a>(&'a self, zone: &'a str, name: &'a str) -> BackendFuture<'a, Operation>;

    /// Starts attaching `disk` to `instance`.
    fn attach_disk<'a>(
        &'a self,
        zone: &'a str,
        instance: &'a str,
        disk: &'a str,
    ) -> BackendFuture<'a, Operation>;

    /// Starts detaching `disk` from `instance`.
    fn detach_disk<'a>(
        &'a self,
        zone: &'a str,
        instance: &'a str,
        disk: &'a str,
    ) -> BackendFuture<'a, Operation>;

    /// Starts growing a disk.
    fn resize_disk<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
        size_gb: u64,
    ) -> BackendFuture<'a, Operation>;

    /// Starts snapshotting a disk.
    fn create_snapshot<'a>(
        &'a self,
        zone: &'a str,
        disk: &'a str,
        name: &'a str,
        labels: &'a Labels,
    ) -> BackendFuture<'a, Operation>;

    /// Reads a snapshot; `None` when it does not exist.
    fn get_snapshot<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<DiskSnapshot>>;

    /// Starts deleting a snapshot.
    fn delete_snapshot<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Operation>;

    /// Starts moving a disk between zones.
    fn move_disk<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
        target_zone: &'a str,
    ) -> BackendFuture<'a, Operation>;

    /// Re-reads an operation.
    fn get_operation<'a>(&'a self, operation: &'a Operation) -> BackendFuture<'a, Operation>;
}
