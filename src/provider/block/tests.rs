//! Behavioural tests for the block-storage adapter against an in-memory
//! control plane.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rstest::{fixture, rstest};

use super::api::BlockSnapshot;
use super::*;

#[derive(Default)]
struct FakeState {
    volumes: HashMap<String, BlockVolume>,
    servers: HashMap<String, BTreeMap<String, String>>,
    snapshots: HashMap<String, BlockSnapshot>,
    created: Vec<NewBlockVolume>,
    deleted: Vec<String>,
    server_patches: u32,
    next_id: u32,
    pending_reads: u32,
}

#[derive(Default)]
struct FakeBlockApi {
    state: Mutex<FakeState>,
}

impl FakeBlockApi {
    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn add_server(&self, server: &str) {
        self.with_state(|state| {
            let mut volumes = BTreeMap::new();
            volumes.insert(String::from("0"), format!("{server}-root"));
            state.servers.insert(server.to_owned(), volumes);
        });
    }
}

fn not_found() -> LifecycleError {
    LifecycleError::Backend {
        provider: String::from("block"),
        status: 404,
        message: String::from("not found"),
    }
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn sync_attachments(&mut self) {
        for volume in self.volumes.values_mut() {
            volume.attached_to = self
                .servers
                .iter()
                .find(|(_, map)| map.values().any(|id| *id == volume.id))
                .map(|(server, _)| server.clone());
            volume.status = String::from(if volume.attached_to.is_some() {
                "in_use"
            } else {
                "available"
            });
        }
    }
}

impl BlockApi for FakeBlockApi {
    fn get_volume<'a>(
        &'a self,
        _zone: &'a str,
        id: &'a str,
    ) -> BackendFuture<'a, Option<BlockVolume>> {
        Box::pin(async move {
            Ok(self.with_state(|state| {
                if state.pending_reads > 0 {
                    state.pending_reads -= 1;
                    return state.volumes.get(id).cloned().map(|mut volume| {
                        volume.status = String::from("creating");
                        volume
                    });
                }
                state.volumes.get(id).cloned()
            }))
        })
    }

    fn create_volume<'a>(
        &'a self,
        _zone: &'a str,
        request: &'a NewBlockVolume,
    ) -> BackendFuture<'a, BlockVolume> {
        Box::pin(async move {
            Ok(self.with_state(|state| {
                let id = state.next_id("vol");
                let volume = BlockVolume {
                    id: id.clone(),
                    name: request.name.clone(),
                    size: request.size_bytes,
                    status: String::from("available"),
                    attached_to: None,
                };
                state.volumes.insert(id, volume.clone());
                state.created.push(request.clone());
                volume
            }))
        })
    }

    fn delete_volume<'a>(&'a self, _zone: &'a str, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_state(|state| {
                state.deleted.push(id.to_owned());
                state.volumes.remove(id).map(|_| ()).ok_or_else(not_found)
            })
        })
    }

    fn resize_volume<'a>(
        &'a self,
        _zone: &'a str,
        id: &'a str,
        size_bytes: u64,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_state(|state| {
                let volume = state.volumes.get_mut(id).ok_or_else(not_found)?;
                volume.size = size_bytes;
                Ok(())
            })
        })
    }

    fn server_volumes<'a>(
        &'a self,
        _zone: &'a str,
        server_id: &'a str,
    ) -> BackendFuture<'a, BTreeMap<String, String>> {
        Box::pin(async move {
            self.with_state(|state| state.servers.get(server_id).cloned().ok_or_else(not_found))
        })
    }

    fn set_server_volumes<'a>(
        &'a self,
        _zone: &'a str,
        server_id: &'a str,
        volumes: &'a BTreeMap<String, String>,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_state(|state| {
                state.server_patches += 1;
                state.servers.insert(server_id.to_owned(), volumes.clone());
                state.sync_attachments();
            });
            Ok(())
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        _zone: &'a str,
        request: &'a NewBlockSnapshot,
    ) -> BackendFuture<'a, BlockSnapshot> {
        Box::pin(async move {
            self.with_state(|state| {
                let size = state
                    .volumes
                    .get(&request.volume_id)
                    .map(|volume| volume.size)
                    .ok_or_else(not_found)?;
                let id = state.next_id("snap");
                let snapshot = BlockSnapshot {
                    id: id.clone(),
                    name: request.name.clone(),
                    size,
                    status: String::from("available"),
                };
                state.snapshots.insert(id, snapshot.clone());
                Ok(snapshot)
            })
        })
    }

    fn get_snapshot<'a>(
        &'a self,
        _zone: &'a str,
        id: &'a str,
    ) -> BackendFuture<'a, Option<BlockSnapshot>> {
        Box::pin(async move { Ok(self.with_state(|state| state.snapshots.get(id).cloned())) })
    }

    fn delete_snapshot<'a>(&'a self, _zone: &'a str, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.with_state(|state| state.snapshots.remove(id).map(|_| ()).ok_or_else(not_found))
        })
    }
}

type Provider = BlockStorageProvider<FakeBlockApi>;

#[fixture]
fn provider() -> Provider {
    BlockStorageProvider::new(
        FakeBlockApi::default(),
        BlockSettings {
            project_id: String::from("proj"),
            zone: String::from("fr-par-1"),
            perf_iops: Some(5000),
        },
        PollBudget::fixed(5, Duration::ZERO),
    )
}

fn record(group: &str) -> Volume {
    Volume::provisioning(ProviderKind::BlockStorage, "dev", group, 10 * 1024 * 1024)
}

async fn created(provider: &Provider, group: &str, siblings: &[Volume]) -> Volume {
    let mut volume = record(group);
    let patch = provider
        .create_volume(CreateRequest {
            volume: &volume,
            siblings,
        })
        .await
        .expect("create succeeds");
    patch.apply_to(&mut volume);
    volume
}

#[rstest]
#[tokio::test]
async fn create_allocates_the_next_group_slot(provider: Provider) {
    provider.api.with_state(|state| state.pending_reads = 2);
    let first = created(&provider, "Orders DB", &[]).await;
    let second = created(&provider, "Orders DB", std::slice::from_ref(&first)).await;

    assert_eq!(first.resource_id, "orders-db-data1");
    assert_eq!(second.resource_id, "orders-db-data2");
    assert_eq!(second.device_slot, Some(2));
    assert_eq!(first.zone.as_deref(), Some("fr-par-1"));
    assert_eq!(first.path, device_path(&first.identifier));

    let requests = provider.api.with_state(|state| state.created.clone());
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|request| request.size_bytes == 10 * 1024 * 1024 * 1024));
    assert!(requests.iter().all(|request| request.perf_iops == Some(5000)));
}

#[rstest]
#[tokio::test]
async fn attach_is_idempotent_and_refuses_other_hosts(provider: Provider) {
    provider.api.add_server("srv-a");
    provider.api.add_server("srv-b");
    let mut volume = created(&provider, "orders", &[]).await;

    provider
        .attach(&volume, "srv-a")
        .await
        .expect("attach")
        .apply_to(&mut volume);
    assert_eq!(volume.vm_name.as_deref(), Some("srv-a"));
    provider.attach(&volume, "srv-a").await.expect("repeat attach");
    assert_eq!(provider.api.with_state(|state| state.server_patches), 1);

    let servers = provider.api.with_state(|state| state.servers.clone());
    assert_eq!(
        servers.get("srv-a").and_then(|map| map.get("1")),
        Some(&volume.identifier)
    );

    let err = provider
        .attach(&volume, "srv-b")
        .await
        .expect_err("held by srv-a");
    assert!(matches!(err, LifecycleError::Conflict(_)));
}

#[rstest]
#[tokio::test]
async fn detach_keeps_the_boot_volume(provider: Provider) {
    provider.api.add_server("srv-a");
    let mut volume = created(&provider, "orders", &[]).await;
    provider
        .attach(&volume, "srv-a")
        .await
        .expect("attach")
        .apply_to(&mut volume);

    provider
        .detach(&volume)
        .await
        .expect("detach")
        .apply_to(&mut volume);
    assert_eq!(volume.vm_name, None);

    let servers = provider.api.with_state(|state| state.servers.clone());
    let map = servers.get("srv-a").expect("server present");
    assert_eq!(map.len(), 1);
    assert_eq!(map.get("0").map(String::as_str), Some("srv-a-root"));
}

#[rstest]
#[tokio::test]
async fn delete_detaches_from_the_recorded_host_first(provider: Provider) {
    provider.api.add_server("srv-a");
    let mut volume = created(&provider, "orders", &[]).await;
    provider
        .attach(&volume, "srv-a")
        .await
        .expect("attach")
        .apply_to(&mut volume);

    provider.delete_volume(&volume).await.expect("delete");
    provider
        .delete_volume(&volume)
        .await
        .expect("repeat delete is a success");

    let deleted = provider.api.with_state(|state| state.deleted.clone());
    assert_eq!(deleted, vec![volume.identifier.clone()]);
}

#[rstest]
#[tokio::test]
async fn delete_refuses_a_volume_held_by_an_unknown_host(provider: Provider) {
    provider.api.add_server("srv-x");
    let mut volume = created(&provider, "orders", &[]).await;
    provider.attach(&volume, "srv-x").await.expect("attach");
    volume.vm_name = Some(String::from("srv-a"));

    let err = provider
        .delete_volume(&volume)
        .await
        .expect_err("held elsewhere");
    assert!(matches!(err, LifecycleError::Conflict(_)));
}

#[rstest]
#[tokio::test]
async fn resize_waits_for_the_new_size(provider: Provider) {
    let volume = created(&provider, "orders", &[]).await;
    let patch = provider
        .resize(&volume, 20 * 1024 * 1024)
        .await
        .expect("resize");
    assert_eq!(patch.size_kb, Some(20 * 1024 * 1024));
}

#[rstest]
#[tokio::test]
async fn snapshot_and_restore_round_trip(provider: Provider) {
    let volume = created(&provider, "orders", &[]).await;
    let spec = SnapshotSpec {
        name: String::from("orders-data1-20240101000000"),
        labels: Labels::from([(String::from("team"), String::from("billing"))]),
    };
    let mut snapshot = Snapshot::pending(&volume, Utc::now());
    provider
        .take_snapshot(&volume, &spec)
        .await
        .expect("snapshot")
        .apply_to(&mut snapshot);
    assert_eq!(snapshot.description, spec.name);
    assert_eq!(snapshot.size_bytes, Some(10 * 1024 * 1024 * 1024));

    let target = record("orders");
    let patch = provider
        .restore_snapshot(
            &volume,
            &snapshot,
            CreateRequest {
                volume: &target,
                siblings: std::slice::from_ref(&volume),
            },
        )
        .await
        .expect("restore");
    assert_eq!(patch.resource_id.as_deref(), Some("orders-data2"));
    let requests = provider.api.with_state(|state| state.created.clone());
    assert_eq!(
        requests.last().map(|request| request.source.clone()),
        Some(VolumeSource::Snapshot(snapshot.identifier.clone()))
    );

    provider
        .remove_snapshot(&volume, &snapshot)
        .await
        .expect("remove");
    provider
        .remove_snapshot(&volume, &snapshot)
        .await
        .expect("repeat remove is a success");
}

#[rstest]
#[tokio::test]
async fn restore_records_the_allocated_size(provider: Provider) {
    let volume = created(&provider, "orders", &[]).await;
    let spec = SnapshotSpec {
        name: String::from("orders-data1-20240101000000"),
        labels: Labels::new(),
    };
    let mut snapshot = Snapshot::pending(&volume, Utc::now());
    provider
        .take_snapshot(&volume, &spec)
        .await
        .expect("snapshot")
        .apply_to(&mut snapshot);

    let mut target = record("orders");
    target.size_kb = 5 * 1024 * 1024;
    let patch = provider
        .restore_snapshot(
            &volume,
            &snapshot,
            CreateRequest {
                volume: &target,
                siblings: std::slice::from_ref(&volume),
            },
        )
        .await
        .expect("restore");
    assert_eq!(patch.size_kb, Some(10 * 1024 * 1024));
    patch.apply_to(&mut target);
    assert_eq!(target.size_kb, 10 * 1024 * 1024);
}

#[rstest]
#[tokio::test]
async fn move_is_not_supported(provider: Provider) {
    let volume = created(&provider, "orders", &[]).await;
    let err = provider
        .move_volume(&volume, "nl-ams-1")
        .await
        .expect_err("unsupported");
    assert!(matches!(err, LifecycleError::NotSupported { .. }));
}

#[rstest]
fn mount_target_is_the_stable_device_path(provider: Provider) {
    let mut volume = record("orders");
    volume.identifier = String::from("abc");
    assert_eq!(
        provider.mount_target(&volume),
        Ok(MountTarget::BlockDevice {
            device: device_path("abc"),
        })
    );
}
