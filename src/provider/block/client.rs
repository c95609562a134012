//! HTTP implementation of [`BlockApi`] for the Scaleway Block Storage and
//! Instance APIs.

use std::collections::{BTreeMap, HashMap};

use reqwest::Method;
use scaleway_rs::{ScalewayApi, ScalewayError};
use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;
use crate::provider::http::{Auth, JsonApi};
use crate::provider::{BackendFuture, ProviderKind};

use super::api::{
    BlockApi, BlockSnapshot, BlockVolume, NewBlockSnapshot, NewBlockVolume, VolumeSource,
};

const BLOCK_API_BASE: &str = "https://api.scaleway.com/block/v1alpha1";
const INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
const SERVER_REFERENCE: &str = "instance_server";
const BOOT_INDEX: &str = "0";

#[derive(Serialize)]
struct FromEmpty {
    size: u64,
}

#[derive(Serialize)]
struct FromSnapshot<'a> {
    snapshot_id: &'a str,
    size: u64,
}

#[derive(Serialize)]
struct CreateVolumeBody<'a> {
    name: &'a str,
    project_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    perf_iops: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_empty: Option<FromEmpty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_snapshot: Option<FromSnapshot<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
}

impl<'a> CreateVolumeBody<'a> {
    fn new(request: &'a NewBlockVolume) -> Self {
        let (from_empty, from_snapshot) = match &request.source {
            VolumeSource::Empty => (
                Some(FromEmpty {
                    size: request.size_bytes,
                }),
                None,
            ),
            VolumeSource::Snapshot(snapshot_id) => (
                None,
                Some(FromSnapshot {
                    snapshot_id,
                    size: request.size_bytes,
                }),
            ),
        };
        Self {
            name: &request.name,
            project_id: &request.project_id,
            perf_iops: request.perf_iops,
            from_empty,
            from_snapshot,
            tags: request.tags.clone(),
        }
    }
}

#[derive(Deserialize)]
struct Reference {
    product_resource_type: String,
    product_resource_id: String,
}

#[derive(Deserialize)]
struct VolumeBody {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
    status: String,
    #[serde(default)]
    references: Vec<Reference>,
}

impl From<VolumeBody> for BlockVolume {
    fn from(body: VolumeBody) -> Self {
        let attached_to = body
            .references
            .into_iter()
            .find(|reference| reference.product_resource_type == SERVER_REFERENCE)
            .map(|reference| reference.product_resource_id);
        Self {
            id: body.id,
            name: body.name,
            size: body.size,
            status: body.status,
            attached_to,
        }
    }
}

#[derive(Serialize)]
struct ResizeBody {
    size: u64,
}

/// Volume reference in an instance volume map.
#[derive(Clone, Debug, Serialize)]
struct VolumeAttachment<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    boot: bool,
}

/// Body for `PATCH /servers/{id}` replacing the volume map.
#[derive(Clone, Debug, Serialize)]
struct UpdateServerVolumes<'a> {
    volumes: HashMap<&'a str, VolumeAttachment<'a>>,
}

impl<'a> UpdateServerVolumes<'a> {
    fn new(volumes: &'a BTreeMap<String, String>) -> Self {
        Self {
            volumes: volumes
                .iter()
                .map(|(index, id)| {
                    (
                        index.as_str(),
                        VolumeAttachment {
                            id,
                            boot: index == BOOT_INDEX,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Block Storage client authenticated with a secret key.
#[derive(Clone)]
pub struct ScalewayBlockClient {
    api: ScalewayApi,
    block: JsonApi,
    instance: JsonApi,
}

impl ScalewayBlockClient {
    /// Builds a client for the given secret key.
    #[must_use]
    pub fn new(secret_key: &str) -> Self {
        let auth = Auth::AuthToken(secret_key.to_owned());
        Self {
            api: ScalewayApi::new(secret_key),
            block: JsonApi::new(ProviderKind::BlockStorage, BLOCK_API_BASE, auth.clone()),
            instance: JsonApi::new(ProviderKind::BlockStorage, INSTANCE_API_BASE, auth),
        }
    }
}

fn map_scaleway_error(err: ScalewayError) -> LifecycleError {
    let provider = ProviderKind::BlockStorage.as_str().to_owned();
    match err {
        ScalewayError::Api(api_err) if api_err.etype == "not_found" => LifecycleError::Backend {
            provider,
            status: 404,
            message: api_err.message,
        },
        ScalewayError::Api(api_err) => LifecycleError::Backend {
            provider,
            status: 400,
            message: format!("{}: {}", api_err.etype, api_err.message),
        },
        other => LifecycleError::Transport {
            provider,
            message: other.to_string(),
        },
    }
}

impl BlockApi for ScalewayBlockClient {
    fn get_volume<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
    ) -> BackendFuture<'a, Option<BlockVolume>> {
        Box::pin(async move {
            let body: Option<VolumeBody> = self
                .block
                .get_optional(&format!("zones/{zone}/volumes/{id}"))
                .await?;
            Ok(body.map(BlockVolume::from))
        })
    }

    fn create_volume<'a>(
        &'a self,
        zone: &'a str,
        request: &'a NewBlockVolume,
    ) -> BackendFuture<'a, BlockVolume> {
        Box::pin(async move {
            let body: VolumeBody = self
                .block
                .post(
                    &format!("zones/{zone}/volumes"),
                    &CreateVolumeBody::new(request),
                )
                .await?;
            Ok(body.into())
        })
    }

    fn delete_volume<'a>(&'a self, zone: &'a str, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.block
                .delete(&format!("zones/{zone}/volumes/{id}"))
                .await
        })
    }

    fn resize_volume<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
        size_bytes: u64,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let builder = self
                .block
                .request(Method::PATCH, &format!("zones/{zone}/volumes/{id}"))
                .json(&ResizeBody { size: size_bytes });
            self.block.send_unit(builder).await
        })
    }

    fn server_volumes<'a>(
        &'a self,
        zone: &'a str,
        server_id: &'a str,
    ) -> BackendFuture<'a, BTreeMap<String, String>> {
        Box::pin(async move {
            let instance = self
                .api
                .get_instance_async(zone, server_id)
                .await
                .map_err(map_scaleway_error)?;
            Ok(instance
                .volumes
                .volumes
                .into_iter()
                .map(|(index, volume)| (index, volume.id))
                .collect())
        })
    }

    fn set_server_volumes<'a>(
        &'a self,
        zone: &'a str,
        server_id: &'a str,
        volumes: &'a BTreeMap<String, String>,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let builder = self
                .instance
                .request(Method::PATCH, &format!("zones/{zone}/servers/{server_id}"))
                .json(&UpdateServerVolumes::new(volumes));
            self.instance.send_unit(builder).await
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        zone: &'a str,
        request: &'a NewBlockSnapshot,
    ) -> BackendFuture<'a, BlockSnapshot> {
        Box::pin(async move {
            self.block
                .post(&format!("zones/{zone}/snapshots"), request)
                .await
        })
    }

    fn get_snapshot<'a>(
        &'a self,
        zone: &'a str,
        id: &'a str,
    ) -> BackendFuture<'a, Option<BlockSnapshot>> {
        Box::pin(async move {
            self.block
                .get_optional(&format!("zones/{zone}/snapshots/{id}"))
                .await
        })
    }

    fn delete_snapshot<'a>(&'a self, zone: &'a str, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.block
                .delete(&format!("zones/{zone}/snapshots/{id}"))
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source: VolumeSource) -> NewBlockVolume {
        NewBlockVolume {
            name: String::from("orders-data1"),
            project_id: String::from("proj"),
            size_bytes: 10_737_418_240,
            source,
            perf_iops: None,
            tags: vec![String::from("team=billing")],
        }
    }

    #[test]
    fn empty_volume_body_uses_from_empty() {
        let volume = request(VolumeSource::Empty);
        let json = serde_json::to_value(CreateVolumeBody::new(&volume)).expect("serialise");
        assert_eq!(json["from_empty"]["size"], 10_737_418_240_u64);
        assert!(json.get("from_snapshot").is_none());
        assert!(json.get("perf_iops").is_none());
        assert_eq!(json["tags"][0], "team=billing");
    }

    #[test]
    fn restored_volume_body_uses_from_snapshot() {
        let volume = request(VolumeSource::Snapshot(String::from("snap-1")));
        let json = serde_json::to_value(CreateVolumeBody::new(&volume)).expect("serialise");
        assert_eq!(json["from_snapshot"]["snapshot_id"], "snap-1");
        assert!(json.get("from_empty").is_none());
    }

    #[test]
    fn server_references_become_the_attachment() {
        let body: VolumeBody = serde_json::from_str(
            r#"{"id":"v1","name":"orders-data1","size":1,"status":"in_use",
                "references":[{"product_resource_type":"instance_server","product_resource_id":"srv-9"}]}"#,
        )
        .expect("parse");
        let volume = BlockVolume::from(body);
        assert_eq!(volume.attached_to.as_deref(), Some("srv-9"));
    }

    #[test]
    fn server_patch_marks_only_the_root_as_boot() {
        let mut volumes = BTreeMap::new();
        volumes.insert(String::from("0"), String::from("root-vol"));
        volumes.insert(String::from("1"), String::from("data-vol"));
        let json = serde_json::to_value(UpdateServerVolumes::new(&volumes)).expect("serialise");
        assert_eq!(json["volumes"]["0"]["boot"], true);
        assert!(json["volumes"]["1"].get("boot").is_none());
        assert_eq!(json["volumes"]["1"]["id"], "data-vol");
    }
}
