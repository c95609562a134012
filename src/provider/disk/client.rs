//! REST implementation of [`DiskApi`] for the Compute Engine v1 API.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::LifecycleError;
use crate::model::Labels;
use crate::provider::http::{Auth, JsonApi};
use crate::provider::{BackendFuture, ProviderKind};

use super::api::{Disk, DiskApi, DiskSnapshot, NewDisk, Operation, OperationScope};

/// Default Compute Engine endpoint.
pub const DEFAULT_API_BASE: &str = "https://compute.googleapis.com/compute/v1";

fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

fn parse_count(raw: Option<&str>) -> Option<u64> {
    raw.and_then(|value| value.parse().ok())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskBody {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    size_gb: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    users: Vec<String>,
}

impl From<DiskBody> for Disk {
    fn from(body: DiskBody) -> Self {
        Self {
            id: body.id,
            name: body.name,
            size_gb: parse_count(body.size_gb.as_deref()).unwrap_or_default(),
            status: body.status,
            users: body
                .users
                .iter()
                .map(|user| last_segment(user).to_owned())
                .collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotBody {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    storage_bytes: Option<String>,
}

impl From<SnapshotBody> for DiskSnapshot {
    fn from(body: SnapshotBody) -> Self {
        Self {
            id: body.id,
            name: body.name,
            status: body.status,
            storage_bytes: parse_count(body.storage_bytes.as_deref()),
        }
    }
}

#[derive(Deserialize)]
struct OperationErrorItem {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct OperationError {
    #[serde(default)]
    errors: Vec<OperationErrorItem>,
}

#[derive(Deserialize)]
struct OperationBody {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    zone: Option<String>,
    #[serde(default)]
    error: Option<OperationError>,
}

impl From<OperationBody> for Operation {
    fn from(body: OperationBody) -> Self {
        let error = body.error.map(|error| {
            error
                .errors
                .iter()
                .map(|item| format!("{}: {}", item.code, item.message))
                .collect::<Vec<_>>()
                .join("; ")
        });
        Self {
            name: body.name,
            status: body.status,
            error,
            scope: body
                .zone
                .as_deref()
                .map_or(OperationScope::Global, |zone| {
                    OperationScope::Zone(last_segment(zone).to_owned())
                }),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertDiskBody<'a> {
    name: &'a str,
    size_gb: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    disk_type: Option<String>,
    #[serde(skip_serializing_if = "Labels::is_empty")]
    labels: Labels,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_snapshot: Option<String>,
}

impl<'a> InsertDiskBody<'a> {
    fn new(zone: &str, disk: &'a NewDisk) -> Self {
        Self {
            name: &disk.name,
            size_gb: disk.size_gb.to_string(),
            disk_type: disk
                .disk_type
                .as_deref()
                .map(|kind| format!("zones/{zone}/diskTypes/{kind}")),
            labels: disk.labels.clone(),
            source_snapshot: disk
                .source_snapshot
                .as_deref()
                .map(|snapshot| format!("global/snapshots/{snapshot}")),
        }
    }
}

/// Compute Engine client for one project.
#[derive(Clone)]
pub struct ComputeClient {
    api: JsonApi,
    project: String,
}

impl ComputeClient {
    /// Builds a client for `project` rooted at `api_base`.
    #[must_use]
    pub fn new(api_base: &str, project: &str, access_token: &str) -> Self {
        let base = format!("{}/projects/{project}", api_base.trim_end_matches('/'));
        Self {
            api: JsonApi::new(
                ProviderKind::ComputeDisk,
                &base,
                Auth::Bearer(access_token.to_owned()),
            ),
            project: project.to_owned(),
        }
    }

    async fn operation<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Operation, LifecycleError> {
        let mut builder = self.api.request(method, path);
        if let Some(payload) = body {
            builder = builder.json(payload);
        }
        let operation: OperationBody = self.api.send(builder).await?;
        Ok(operation.into())
    }
}

impl DiskApi for ComputeClient {
    fn get_disk<'a>(&'a self, zone: &'a str, name: &'a str) -> BackendFuture<'a, Option<Disk>> {
        Box::pin(async move {
            let body: Option<DiskBody> = self
                .api
                .get_optional(&format!("zones/{zone}/disks/{name}"))
                .await?;
            Ok(body.map(Disk::from))
        })
    }

    fn insert_disk<'a>(&'a self, zone: &'a str, disk: &'a NewDisk) -> BackendFuture<'a, Operation> {
        Box::pin(async move {
            self.operation(
                Method::POST,
                &format!("zones/{zone}/disks"),
                Some(&InsertDiskBody::new(zone, disk)),
            )
            .await
        })
    }

    fn delete_disk<'a>(&'a self, zone: &'a str, name: &'a str) -> BackendFuture<'a, Operation> {
        Box::pin(async move {
            self.operation::<()>(Method::DELETE, &format!("zones/{zone}/disks/{name}"), None)
                .await
        })
    }

    fn attach_disk<'a>(
        &'a self,
        zone: &'a str,
        instance: &'a str,
        disk: &'a str,
    ) -> BackendFuture<'a, Operation> {
        Box::pin(async move {
            let body = json!({
                "source": format!("projects/{}/zones/{zone}/disks/{disk}", self.project),
                "deviceName": disk,
                "autoDelete": false,
            });
            self.operation(
                Method::POST,
                &format!("zones/{zone}/instances/{instance}/attachDisk"),
                Some(&body),
            )
            .await
        })
    }

    fn detach_disk<'a>(
        &'a self,
        zone: &'a str,
        instance: &'a str,
        disk: &'a str,
    ) -> BackendFuture<'a, Operation> {
        Box::pin(async move {
            let builder = self
                .api
                .request(
                    Method::POST,
                    &format!("zones/{zone}/instances/{instance}/detachDisk"),
                )
                .query(&[("deviceName", disk)]);
            let operation: OperationBody = self.api.send(builder).await?;
            Ok(operation.into())
        })
    }

    fn resize_disk<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
        size_gb: u64,
    ) -> BackendFuture<'a, Operation> {
        Box::pin(async move {
            let body = json!({ "sizeGb": size_gb.to_string() });
            self.operation(
                Method::POST,
                &format!("zones/{zone}/disks/{name}/resize"),
                Some(&body),
            )
            .await
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        zone: &'a str,
        disk: &'a str,
        name: &'a str,
        labels: &'a Labels,
    ) -> BackendFuture<'a, Operation> {
        Box::pin(async move {
            let body = json!({ "name": name, "labels": labels });
            self.operation(
                Method::POST,
                &format!("zones/{zone}/disks/{disk}/createSnapshot"),
                Some(&body),
            )
            .await
        })
    }

    fn get_snapshot<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<DiskSnapshot>> {
        Box::pin(async move {
            let body: Option<SnapshotBody> = self
                .api
                .get_optional(&format!("global/snapshots/{name}"))
                .await?;
            Ok(body.map(DiskSnapshot::from))
        })
    }

    fn delete_snapshot<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Operation> {
        Box::pin(async move {
            self.operation::<()>(Method::DELETE, &format!("global/snapshots/{name}"), None)
                .await
        })
    }

    fn move_disk<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
        target_zone: &'a str,
    ) -> BackendFuture<'a, Operation> {
        Box::pin(async move {
            let body = json!({
                "targetDisk": format!("zones/{zone}/disks/{name}"),
                "destinationZone": format!("zones/{target_zone}"),
            });
            self.operation(Method::POST, "moveDisk", Some(&body)).await
        })
    }

    fn get_operation<'a>(&'a self, operation: &'a Operation) -> BackendFuture<'a, Operation> {
        Box::pin(async move {
            let path = match &operation.scope {
                OperationScope::Zone(zone) => format!("zones/{zone}/operations/{}", operation.name),
                OperationScope::Global => format!("global/operations/{}", operation.name),
            };
            let body: OperationBody = self.api.get(&path).await?;
            Ok(body.into())
        })
    }
}
