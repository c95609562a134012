//! Control-plane surface the block-storage adapter depends on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::provider::BackendFuture;

/// Block volume as reported by the control plane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockVolume {
    /// Volume identifier.
    pub id: String,
    /// Volume name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Lifecycle status, for example `creating`, `available` or `in_use`.
    pub status: String,
    /// Server currently holding the volume.
    pub attached_to: Option<String>,
}

/// Where a new volume's contents come from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VolumeSource {
    /// Blank volume.
    Empty,
    /// Copy of an existing snapshot.
    Snapshot(String),
}

/// Parameters for creating a block volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewBlockVolume {
    /// Volume name.
    pub name: String,
    /// Owning project.
    pub project_id: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Initial contents.
    pub source: VolumeSource,
    /// Provisioned IOPS class, when the credential pins one.
    pub perf_iops: Option<u32>,
    /// `key=value` tags.
    pub tags: Vec<String>,
}

/// Block snapshot as reported by the control plane.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct BlockSnapshot {
    /// Snapshot identifier.
    pub id: String,
    /// Snapshot name.
    pub name: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Lifecycle status, for example `creating` or `available`.
    pub status: String,
}

/// Parameters for snapshotting a block volume.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NewBlockSnapshot {
    /// Snapshot name.
    pub name: String,
    /// Volume to copy.
    pub volume_id: String,
    /// Owning project.
    pub project_id: String,
    /// `key=value` tags.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Block storage and instance calls used by the adapter.
///
/// Server volume maps are keyed by attachment index; index `"0"` is the boot
/// volume.
pub trait BlockApi: Send + Sync {
    /// Reads a volume; `None` when it does not exist.
    fn get_volume<'a>(&'a self, zone: &'a str, id: &'a str)
    -> BackendFuture<'a, Option<BlockVolume>>;

    /// Creates a volume.
    fn create_volume<'a>(
        &'a self,
        zone: &'a str,
        request: &'a NewBlockVolume,
    ) -> BackendFuture<'a, BlockVolume>;

    /// Deletes a volume.
    fn delete_volume<'a>(&'a self, zone: &'a str, id: &'a str) -> BackendFuture<'a, ()>;

    /// Grows a volume to `size_bytes`.
    fn resize_volume<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
        size_bytes: u64,
    ) -> BackendFuture<'a, ()>;

    /// Reads the volume map of a server.
    fn server_volumes<'a>(
        &'a self,
        zone: &'a str,
        server_id: &'a str,
    ) -> BackendFuture<'a, BTreeMap<String, String>>;

    /// Replaces the volume map of a server.
    fn set_server_volumes<'a>(
        &'a self,
        zone: &'a str,
        server_id: &'a str,
        volumes: &'a BTreeMap<String, String>,
    ) -> BackendFuture<'a, ()>;

    /// Creates a snapshot.
    fn create_snapshot<'a>(
        &'a self,
        zone: &'a str,
        request: &'a NewBlockSnapshot,
    ) -> BackendFuture<'a, BlockSnapshot>;

    /// Reads a snapshot; `None` when it does not exist.
    fn get_snapshot<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
    ) -> BackendFuture<'a, Option<BlockSnapshot>>;

    /// Deletes a snapshot.
    fn delete_snapshot<'a>(&'a self, zone: &'a str, id: &'a str) -> BackendFuture<'a, ()>;
}
