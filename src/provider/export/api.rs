//! Control-plane surface the network-export adapter depends on.

use serde::{Deserialize, Deserializer};

use crate::provider::BackendFuture;

/// Identifiers arrive as numbers or strings depending on the endpoint.
fn flexible_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}

/// NFS export as reported by the control plane.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
pub struct Export {
    /// Export identifier.
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    /// Lineage resource shared by exports of the same group.
    #[serde(default)]
    pub resource_id: String,
    /// Mount source, `host:/path`.
    #[serde(default)]
    pub full_path: String,
}

/// Parameters for creating an export.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewExport {
    /// Quota in kilobytes.
    pub size_kb: u64,
    /// Service category.
    pub category_id: String,
    /// Lineage resource to join, when the group already has one.
    pub resource_id: Option<String>,
}

/// Access rule granting one host access to an export.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
pub struct Access {
    /// Rule identifier.
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    /// Client address.
    pub host: String,
}

/// Export snapshot as reported by the control plane.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
pub struct ExportSnapshot {
    /// Snapshot identifier.
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    /// Snapshot name.
    #[serde(default)]
    pub name: String,
}

/// Output of a finished job.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
pub struct JobResult {
    /// Export created by the job.
    #[serde(default, deserialize_with = "flexible_id")]
    pub id: String,
}

/// Background job as reported by the control plane.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
pub struct Job {
    /// `pending`, `running`, `finished`, `failed` or `error`.
    pub status: String,
    /// Result once finished.
    #[serde(default)]
    pub result: Option<JobResult>,
    /// Error message on failure.
    #[serde(default)]
    pub error: Option<String>,
}

/// Export service calls used by the adapter.
pub trait ExportApi: Send + Sync {
    /// Creates an export.
    fn create_export<'a>(&'a self, request: &'a NewExport) -> BackendFuture<'a, Export>;

    /// Reads an export; `None` when it does not exist.
    fn get_export<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Option<Export>>;

    /// Deletes an export.
    fn delete_export<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()>;

    /// Lists the access rules of an export.
    fn list_access<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Vec<Access>>;

    /// Grants `host` access of `access_type`.
    fn create_access<'a>(
        &'a self,
        id: &'a str,
        host: &'a str,
        access_type: &'a str,
    ) -> BackendFuture<'a, Access>;

    /// Removes an access rule.
    fn delete_access<'a>(&'a self, id: &'a str, access_id: &'a str) -> BackendFuture<'a, ()>;

    /// Sets the export quota.
    fn set_quota<'a>(&'a self, id: &'a str, size_kb: u64) -> BackendFuture<'a, ()>;

    /// Snapshots an export.
    fn create_snapshot<'a>(&'a self, id: &'a str, name: &'a str)
    -> BackendFuture<'a, ExportSnapshot>;

    /// Deletes a snapshot.
    fn delete_snapshot<'a>(&'a self, id: &'a str, snapshot_id: &'a str) -> BackendFuture<'a, ()>;

    /// Starts restoring a snapshot into a new export; returns the job id.
    fn restore_snapshot<'a>(
        &'a self,
        id: &'a str,
        snapshot_id: &'a str,
    ) -> BackendFuture<'a, String>;

    /// Reads a job.
    fn get_job<'a>(&'a self, job_id: &'a str) -> BackendFuture<'a, Job>;
}
