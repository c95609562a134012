//! [`ClaimApi`] over a `kube` client: typed claims from `k8s-openapi` and
//! volume snapshots as dynamic objects of the snapshot API group.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedLocalObjectReference,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams,
    PostParams,
};
use kube::{Client, Config};
use serde::Deserialize;
use serde_json::json;

use crate::error::LifecycleError;
use crate::model::Labels;
use crate::provider::{BackendFuture, ProviderKind};

use super::api::{
    Claim, ClaimApi, ClaimSnapshot, NewClaim, NewClaimSnapshot, gigabytes, quantity_bytes,
};

const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";
const SNAPSHOT_VERSION: &str = "v1";
const SNAPSHOT_KIND: &str = "VolumeSnapshot";
const ACCESS_MODE: &str = "ReadWriteOnce";

fn backend_error(err: kube::Error) -> LifecycleError {
    let provider = ProviderKind::ContainerVolume.to_string();
    match err {
        kube::Error::Api(response) => LifecycleError::Backend {
            provider,
            status: response.code,
            message: response.message,
        },
        other => LifecycleError::Transport {
            provider,
            message: other.to_string(),
        },
    }
}

fn labels_of(labels: &Labels) -> Option<BTreeMap<String, String>> {
    (!labels.is_empty()).then(|| labels.clone())
}

fn snapshot_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        SNAPSHOT_GROUP,
        SNAPSHOT_VERSION,
        SNAPSHOT_KIND,
    ))
}

impl From<PersistentVolumeClaim> for Claim {
    fn from(claim: PersistentVolumeClaim) -> Self {
        let status = claim.status.unwrap_or_default();
        Self {
            name: claim.metadata.name.unwrap_or_default(),
            uid: claim.metadata.uid.unwrap_or_default(),
            capacity_bytes: status
                .capacity
                .as_ref()
                .and_then(|capacity| capacity.get("storage"))
                .and_then(quantity_bytes),
            phase: status.phase.unwrap_or_default(),
        }
    }
}

fn claim_object(claim: &NewClaim) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim.name.clone()),
            labels: labels_of(&claim.labels),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![String::from(ACCESS_MODE)]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    String::from("storage"),
                    gigabytes(claim.size_gb),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            storage_class_name: claim.storage_class.clone(),
            data_source: claim
                .source_snapshot
                .as_ref()
                .map(|name| TypedLocalObjectReference {
                    api_group: Some(String::from(SNAPSHOT_GROUP)),
                    kind: String::from(SNAPSHOT_KIND),
                    name: name.clone(),
                }),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    }
}

fn snapshot_object(snapshot: &NewClaimSnapshot, resource: &ApiResource) -> DynamicObject {
    let mut spec = json!({
        "source": { "persistentVolumeClaimName": snapshot.claim },
    });
    if let (Some(class), Some(fields)) = (&snapshot.class, spec.as_object_mut()) {
        fields.insert(String::from("volumeSnapshotClassName"), json!(class));
    }
    let mut object = DynamicObject::new(&snapshot.name, resource).data(json!({ "spec": spec }));
    object.metadata.labels = labels_of(&snapshot.labels);
    object
}

#[derive(Deserialize)]
struct SnapshotError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotStatus {
    #[serde(default)]
    ready_to_use: Option<bool>,
    #[serde(default)]
    restore_size: Option<Quantity>,
    #[serde(default)]
    error: Option<SnapshotError>,
}

impl From<DynamicObject> for ClaimSnapshot {
    fn from(object: DynamicObject) -> Self {
        let status = object
            .data
            .get("status")
            .cloned()
            .and_then(|raw| serde_json::from_value::<SnapshotStatus>(raw).ok())
            .unwrap_or_default();
        Self {
            name: object.metadata.name.unwrap_or_default(),
            uid: object.metadata.uid.unwrap_or_default(),
            ready: status.ready_to_use.unwrap_or(false),
            error: status.error.and_then(|error| error.message),
            restore_bytes: status.restore_size.as_ref().and_then(quantity_bytes),
        }
    }
}

/// API server client bound to one namespace.
#[derive(Clone)]
pub struct KubeClient {
    claims: Api<PersistentVolumeClaim>,
    snapshots: Api<DynamicObject>,
    snapshot_resource: ApiResource,
}

impl KubeClient {
    /// Connects to the API server at `api_server` with a bearer `token`,
    /// scoped to `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Credential`] when the server address does not
    /// parse, and a transport error when the client cannot be built.
    pub fn connect(api_server: &str, namespace: &str, token: &str) -> Result<Self, LifecycleError> {
        let url = api_server.trim().parse().map_err(|err| {
            LifecycleError::Credential(format!("invalid k8s api_server '{api_server}': {err}"))
        })?;
        let mut config = Config::new(url);
        config.default_namespace = namespace.to_owned();
        config.auth_info.token = token.parse().ok();
        let client = Client::try_from(config).map_err(backend_error)?;
        Ok(Self::from_client(client, namespace))
    }

    /// Scopes an existing client to `namespace`.
    #[must_use]
    pub fn from_client(client: Client, namespace: &str) -> Self {
        let snapshot_resource = snapshot_resource();
        Self {
            claims: Api::namespaced(client.clone(), namespace),
            snapshots: Api::namespaced_with(client, namespace, &snapshot_resource),
            snapshot_resource,
        }
    }
}

impl ClaimApi for KubeClient {
    fn get_claim<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<Claim>> {
        Box::pin(async move {
            let claim = self.claims.get_opt(name).await.map_err(backend_error)?;
            Ok(claim.map(Claim::from))
        })
    }

    fn create_claim<'a>(&'a self, claim: &'a NewClaim) -> BackendFuture<'a, Claim> {
        Box::pin(async move {
            let created = self
                .claims
                .create(&PostParams::default(), &claim_object(claim))
                .await
                .map_err(backend_error)?;
            Ok(created.into())
        })
    }

    fn delete_claim<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.claims
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(backend_error)
        })
    }

    fn resize_claim<'a>(&'a self, name: &'a str, size_gb: u64) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let patch = json!({
                "spec": { "resources": { "requests": { "storage": gigabytes(size_gb) } } },
            });
            self.claims
                .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map(|_| ())
                .map_err(backend_error)
        })
    }

    fn create_snapshot<'a>(&'a self, snapshot: &'a NewClaimSnapshot) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.snapshots
                .create(
                    &PostParams::default(),
                    &snapshot_object(snapshot, &self.snapshot_resource),
                )
                .await
                .map(|_| ())
                .map_err(backend_error)
        })
    }

    fn get_snapshot<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<ClaimSnapshot>> {
        Box::pin(async move {
            let snapshot = self.snapshots.get_opt(name).await.map_err(backend_error)?;
            Ok(snapshot.map(ClaimSnapshot::from))
        })
    }

    fn delete_snapshot<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.snapshots
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(backend_error)
        })
    }
}
