//! Lifecycle properties exercised through the public API against a file
//! backed store, so every step survives a fresh orchestrator.

use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use volume_provider::model::gb_to_kb;
use volume_provider::test_support::{RecordingProvider, TEST_ENVIRONMENT, recording_registry};
use volume_provider::{
    CreateVolumeRequest, EngineConfig, JsonFileStore, LifecycleError, LifecycleOrchestrator,
    ProviderKind, RestoreRequest, TakeSnapshotRequest, VolumeStore,
};

struct Harness {
    _dir: TempDir,
    path: Utf8PathBuf,
    backend: Arc<RecordingProvider>,
}

impl Harness {
    fn engine(&self) -> LifecycleOrchestrator<JsonFileStore> {
        let registry = recording_registry(&self.backend, EngineConfig::standard())
            .expect("registry");
        LifecycleOrchestrator::new(JsonFileStore::new(self.path.clone()), registry)
    }
}

#[fixture]
fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("volumes.json"))
        .expect("utf8 path");
    Harness {
        _dir: dir,
        path,
        backend: Arc::new(RecordingProvider::new(ProviderKind::BlockStorage)),
    }
}

fn request(group: &str, size_gb: u64) -> CreateVolumeRequest {
    CreateVolumeRequest::new(
        ProviderKind::BlockStorage,
        TEST_ENVIRONMENT,
        group,
        gb_to_kb(size_gb),
    )
}

#[rstest]
#[tokio::test]
async fn slots_continue_across_engine_instances(harness: Harness) {
    let first = harness
        .engine()
        .create_volume(&request("orders", 10))
        .await
        .expect("first");
    let second = harness
        .engine()
        .create_volume(&request("orders", 10))
        .await
        .expect("second");
    let third = harness
        .engine()
        .create_volume(&request("orders", 10))
        .await
        .expect("third");

    assert_eq!(
        [first.device_slot, second.device_slot, third.device_slot],
        [Some(1), Some(2), Some(3)]
    );
    let other_group = harness
        .engine()
        .create_volume(&request("billing", 10))
        .await
        .expect("other group");
    assert_eq!(other_group.device_slot, Some(1));
}

#[rstest]
#[tokio::test]
async fn deleting_twice_leaves_nothing_behind(harness: Harness) {
    let volume = harness
        .engine()
        .create_volume(&request("orders", 10))
        .await
        .expect("create");
    harness
        .engine()
        .take_snapshot(&volume.id, &TakeSnapshotRequest::default())
        .await
        .expect("snapshot");

    harness
        .engine()
        .delete_volume(&volume.id)
        .await
        .expect("delete");
    harness
        .engine()
        .delete_volume(&volume.id)
        .await
        .expect("repeat delete");

    let store = JsonFileStore::new(harness.path.clone());
    assert_eq!(store.find_volume(&volume.id), Ok(None));
    assert_eq!(store.snapshots_of(&volume.id), Ok(Vec::new()));
    assert!(harness.backend.state().resources.is_empty());
}

#[rstest]
#[case(5)]
#[case(20)]
#[tokio::test]
async fn resize_is_monotonic(harness: Harness, #[case] target_gb: u64) {
    let volume = harness
        .engine()
        .create_volume(&request("orders", 10))
        .await
        .expect("create");
    let outcome = harness
        .engine()
        .resize(&volume.id, gb_to_kb(target_gb))
        .await;
    let stored = harness.engine().get_volume(&volume.id).expect("stored");

    if target_gb > 10 {
        assert!(outcome.is_ok());
        assert_eq!(stored.size_kb, gb_to_kb(target_gb));
    } else {
        assert!(matches!(outcome, Err(LifecycleError::Validation(_))));
        assert_eq!(stored.size_kb, gb_to_kb(10));
    }
}

#[rstest]
#[tokio::test]
async fn restore_copies_group_and_size(harness: Harness) {
    let source = harness
        .engine()
        .create_volume(&request("orders", 30).zone("fr-par-1"))
        .await
        .expect("create");
    let snapshot = harness
        .engine()
        .take_snapshot(&source.id, &TakeSnapshotRequest::default())
        .await
        .expect("snapshot");

    let restored = harness
        .engine()
        .restore_snapshot(
            &snapshot.id,
            &RestoreRequest {
                vm_name: Some(String::from("db-2")),
                ..RestoreRequest::default()
            },
        )
        .await
        .expect("restore");

    assert_eq!(restored.group, source.group);
    assert_eq!(restored.size_kb, source.size_kb);
    assert_eq!(restored.zone.as_deref(), Some("fr-par-1"));
    assert_eq!(restored.vm_name.as_deref(), Some("db-2"));
    assert_eq!(harness.engine().get_volume(&source.id), Ok(source));
}

#[rstest]
#[tokio::test]
async fn attach_elsewhere_is_a_conflict(harness: Harness) {
    let volume = harness
        .engine()
        .create_volume(&request("orders", 10).vm_name("db-1"))
        .await
        .expect("create attached");
    harness
        .engine()
        .attach_volume(&volume.id, "db-1")
        .await
        .expect("same host");

    let err = harness
        .engine()
        .attach_volume(&volume.id, "db-2")
        .await
        .expect_err("other host");
    assert_eq!(err.kind().as_str(), "conflict");
    assert_eq!(harness.backend.count("attach"), 1);
}
