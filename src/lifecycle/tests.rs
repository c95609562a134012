//! Orchestrator tests against the recording backend and the memory store.

use std::sync::Arc;

use rstest::{fixture, rstest};

use super::*;
use crate::config::EngineConfig;
use crate::model::gb_to_kb;
use crate::script::MountOptions;
use crate::provider::BackendFuture;
use crate::store::MemoryStore;
use crate::team::{SnapshotTagger, Team, TeamDirectory};
use crate::test_support::{RecordingProvider, TEST_ENVIRONMENT, recording_registry};

struct Harness {
    backend: Arc<RecordingProvider>,
    engine: LifecycleOrchestrator<MemoryStore>,
}

#[fixture]
fn harness() -> Harness {
    let backend = Arc::new(RecordingProvider::new(ProviderKind::ComputeDisk));
    let registry = recording_registry(&backend, EngineConfig::standard())
        .expect("registry builds");
    Harness {
        backend,
        engine: LifecycleOrchestrator::new(MemoryStore::new(), registry),
    }
}

fn request(group: &str) -> CreateVolumeRequest {
    CreateVolumeRequest::new(
        ProviderKind::ComputeDisk,
        TEST_ENVIRONMENT,
        group,
        gb_to_kb(10),
    )
}

async fn create(harness: &Harness, group: &str) -> Volume {
    harness
        .engine
        .create_volume(&request(group).owner_address("10.0.0.1"))
        .await
        .expect("create")
}

#[rstest]
#[tokio::test]
async fn create_persists_allocated_volume_with_access(harness: Harness) {
    let volume = create(&harness, "orders").await;

    assert!(volume.is_allocated());
    assert_eq!(volume.owner_address, "10.0.0.1");
    assert_eq!(volume.device_slot, Some(1));
    assert_eq!(harness.engine.get_volume(&volume.id), Ok(volume.clone()));
    assert_eq!(harness.backend.count("grant"), 1);
}

#[rstest]
#[tokio::test]
async fn siblings_get_the_next_slot_and_share_lineage(harness: Harness) {
    let first = create(&harness, "orders").await;
    let second = create(&harness, "orders").await;
    let third = create(&harness, "orders").await;

    assert_eq!(second.device_slot, Some(2));
    assert_eq!(third.device_slot, Some(3));
    assert_eq!(second.resource_id, first.resource_id);
}

#[rstest]
#[tokio::test]
async fn failed_create_saves_nothing(harness: Harness) {
    harness.backend.fail_next(LifecycleError::Backend {
        provider: String::from("gce"),
        status: 403,
        message: String::from("quota"),
    });
    let err = harness
        .engine
        .create_volume(&request("orders"))
        .await
        .expect_err("backend refused");

    assert_eq!(err.kind(), crate::error::ErrorKind::Backend);
    assert!(harness.engine.store().snapshot_state().volumes.is_empty());
}

#[rstest]
#[case("", "orders", 1)]
#[case("test", " ", 1)]
#[case("test", "orders", 0)]
#[tokio::test]
async fn invalid_create_never_reaches_the_backend(
    harness: Harness,
    #[case] environment: &str,
    #[case] group: &str,
    #[case] size_kb: u64,
) {
    let invalid = CreateVolumeRequest::new(ProviderKind::ComputeDisk, environment, group, size_kb);
    let err = harness
        .engine
        .create_volume(&invalid)
        .await
        .expect_err("invalid request");
    assert!(matches!(err, LifecycleError::Validation(_)));
    assert!(harness.backend.state().calls.is_empty());
}

#[rstest]
#[tokio::test]
async fn create_with_host_attaches_after_saving(harness: Harness) {
    let volume = harness
        .engine
        .create_volume(&request("orders").vm_name("db-1"))
        .await
        .expect("create");
    assert_eq!(volume.vm_name.as_deref(), Some("db-1"));
    assert_eq!(harness.backend.count("attach"), 1);
}

#[rstest]
#[tokio::test]
async fn failed_attach_after_create_keeps_the_record(harness: Harness) {
    create(&harness, "billing").await;
    harness.backend.with_state(|state| {
        state
            .attachments
            .insert(String::from("vol-2"), String::from("db-other"))
    });

    let err = harness
        .engine
        .create_volume(&request("orders").vm_name("db-2"))
        .await
        .expect_err("resource held by another host");
    assert!(matches!(err, LifecycleError::Conflict(_)));

    let stored = harness
        .engine
        .store()
        .find_by_group("orders")
        .expect("group lookup");
    assert_eq!(stored.len(), 1);
    assert!(stored.iter().all(|volume| volume.vm_name.is_none()));
}

#[rstest]
#[tokio::test]
async fn failed_grant_after_create_keeps_a_retryable_record(harness: Harness) {
    harness.backend.fail_on(
        "grant",
        LifecycleError::Backend {
            provider: String::from("gce"),
            status: 503,
            message: String::from("acl service unavailable"),
        },
    );
    let err = harness
        .engine
        .create_volume(&request("orders").owner_address("10.0.0.7"))
        .await
        .expect_err("grant refused");
    assert_eq!(err.kind(), crate::error::ErrorKind::Backend);

    let stored = harness
        .engine
        .store()
        .find_by_group("orders")
        .expect("group lookup");
    let [record] = stored.as_slice() else {
        panic!("expected one saved record, got {stored:?}");
    };
    assert!(record.is_allocated());
    assert!(record.owner_address.is_empty());
    assert_eq!(harness.backend.count("create"), 1);

    let granted = harness
        .engine
        .add_access(&record.id, "10.0.0.7")
        .await
        .expect("retry grant");
    assert_eq!(granted.owner_address, "10.0.0.7");
    assert_eq!(harness.backend.count("create"), 1);
    assert_eq!(harness.backend.count("grant"), 1);
}

#[rstest]
#[tokio::test]
async fn delete_is_idempotent(harness: Harness) {
    let volume = create(&harness, "orders").await;
    harness.engine.delete_volume(&volume.id).await.expect("delete");
    harness
        .engine
        .delete_volume(&volume.id)
        .await
        .expect("repeat delete");

    assert_eq!(harness.backend.count("delete"), 1);
    assert!(harness.backend.state().resources.is_empty());
    assert!(matches!(
        harness.engine.get_volume(&volume.id),
        Err(LifecycleError::NotFound { .. })
    ));
}

#[rstest]
#[tokio::test]
async fn delete_cascades_snapshot_records(harness: Harness) {
    let volume = create(&harness, "orders").await;
    harness
        .engine
        .take_snapshot(&volume.id, &TakeSnapshotRequest::default())
        .await
        .expect("snapshot");
    harness.engine.delete_volume(&volume.id).await.expect("delete");
    assert!(harness.engine.store().snapshot_state().snapshots.is_empty());
}

#[rstest]
#[tokio::test]
async fn backend_refusal_keeps_the_record(harness: Harness) {
    let volume = create(&harness, "orders").await;
    harness
        .backend
        .fail_next(LifecycleError::Conflict(String::from("in use")));
    let err = harness
        .engine
        .delete_volume(&volume.id)
        .await
        .expect_err("refused");
    assert!(matches!(err, LifecycleError::Conflict(_)));
    assert!(harness.engine.get_volume(&volume.id).is_ok());
}

#[rstest]
#[case(gb_to_kb(10))]
#[case(gb_to_kb(5))]
#[case(0)]
#[tokio::test]
async fn resize_rejects_non_growth(harness: Harness, #[case] new_size_kb: u64) {
    let volume = create(&harness, "orders").await;
    let err = harness
        .engine
        .resize(&volume.id, new_size_kb)
        .await
        .expect_err("not larger");
    assert!(matches!(err, LifecycleError::Validation(_)));
    assert_eq!(
        harness.engine.get_volume(&volume.id).map(|v| v.size_kb),
        Ok(gb_to_kb(10))
    );
    assert_eq!(harness.backend.count("resize"), 0);
}

#[rstest]
#[tokio::test]
async fn resize_persists_the_new_size(harness: Harness) {
    let volume = create(&harness, "orders").await;
    let resized = harness
        .engine
        .resize(&volume.id, gb_to_kb(20))
        .await
        .expect("grow");
    assert_eq!(resized.size_kb, gb_to_kb(20));
    assert_eq!(
        harness.engine.get_volume(&volume.id).map(|v| v.size_kb),
        Ok(gb_to_kb(20))
    );
}

#[rstest]
#[tokio::test]
async fn back_to_back_snapshots_get_distinct_names(harness: Harness) {
    let source = create(&harness, "orders").await;
    let request = TakeSnapshotRequest::default();
    let first = harness
        .engine
        .take_snapshot(&source.id, &request)
        .await
        .expect("first snapshot");
    let second = harness
        .engine
        .take_snapshot(&source.id, &request)
        .await
        .expect("second snapshot");

    assert_ne!(first.description, second.description);
    assert_eq!(
        harness
            .engine
            .list_snapshots(&source.id)
            .expect("list")
            .len(),
        2
    );
}

struct SingleTeam;

impl TeamDirectory for SingleTeam {
    fn find_team<'a>(&'a self, slug: &'a str) -> BackendFuture<'a, Option<Team>> {
        Box::pin(async move {
            Ok((slug == "dbaas").then(|| Team {
                id: String::from("t-42"),
                business_service: String::from("bs-7"),
                client: String::from("c-3"),
            }))
        })
    }
}

#[rstest]
#[tokio::test]
async fn snapshots_carry_team_billing_and_backup_tags(harness: Harness) {
    let tagger = SnapshotTagger::default()
        .with_directory(Arc::new(SingleTeam))
        .with_backup_tag("backup_dbaas");
    let harness = Harness {
        backend: harness.backend,
        engine: harness.engine.with_snapshot_tagger(tagger),
    };
    let source = create(&harness, "orders").await;
    let snapshot = harness
        .engine
        .take_snapshot(
            &source.id,
            &TakeSnapshotRequest {
                team: Some(String::from("dbaas")),
                engine: Some(String::from("mongodb_4_2")),
                db_name: Some(String::from("orders")),
                persist: false,
            },
        )
        .await
        .expect("snapshot");

    let label = |key: &str| snapshot.labels.get(key).map(String::as_str);
    assert_eq!(label("equipe-id"), Some("t-42"));
    assert_eq!(label("cliente-id"), Some("c-3"));
    assert_eq!(label("backup_dbaas"), Some("true"));
    assert_eq!(label("team"), Some("dbaas"));
    assert_eq!(label("db_name"), Some("orders"));
}

#[rstest]
#[tokio::test]
async fn snapshot_restore_round_trip_leaves_source_untouched(harness: Harness) {
    let source = create(&harness, "orders").await;
    let snapshot = harness
        .engine
        .take_snapshot(
            &source.id,
            &TakeSnapshotRequest {
                team: Some(String::from("dbaas")),
                engine: Some(String::from("mysql")),
                db_name: None,
                persist: true,
            },
        )
        .await
        .expect("snapshot");

    assert!(snapshot.description.starts_with(&source.resource_id));
    assert_eq!(snapshot.labels.get("team").map(String::as_str), Some("dbaas"));
    assert!(!snapshot.labels.contains_key("db_name"));
    assert_eq!(
        snapshot.labels.get("is_persisted").map(String::as_str),
        Some("true")
    );

    let restored = harness
        .engine
        .restore_snapshot(&snapshot.id, &RestoreRequest::default())
        .await
        .expect("restore");

    assert_ne!(restored.id, source.id);
    assert_eq!(restored.group, source.group);
    assert_eq!(restored.size_kb, source.size_kb);
    assert_eq!(harness.engine.get_volume(&source.id), Ok(source.clone()));
    assert_eq!(
        harness.engine.list_snapshots(&source.id).map(|s| s.len()),
        Ok(1)
    );
}

#[rstest]
#[tokio::test]
async fn create_from_snapshot_restores(harness: Harness) {
    let source = create(&harness, "orders").await;
    let snapshot = harness
        .engine
        .take_snapshot(&source.id, &TakeSnapshotRequest::default())
        .await
        .expect("snapshot");
    let seeded = harness
        .engine
        .create_volume(
            &CreateVolumeRequest::new(ProviderKind::ComputeDisk, TEST_ENVIRONMENT, "replica", 0)
                .from_snapshot(snapshot.id.clone()),
        )
        .await
        .expect("create from snapshot");
    assert_eq!(seeded.size_kb, source.size_kb);
    assert_eq!(harness.backend.count("restore"), 1);
}

#[rstest]
#[tokio::test]
async fn failed_snapshot_saves_no_record(harness: Harness) {
    let volume = create(&harness, "orders").await;
    harness
        .backend
        .fail_next(LifecycleError::BackendOperation {
            operation: String::from("snapshot"),
            payload: String::from("boom"),
        });
    harness
        .engine
        .take_snapshot(&volume.id, &TakeSnapshotRequest::default())
        .await
        .expect_err("snapshot failed");
    assert_eq!(harness.engine.list_snapshots(&volume.id), Ok(Vec::new()));
}

#[rstest]
#[tokio::test]
async fn remove_snapshot_is_idempotent_and_force_skips_refusals(harness: Harness) {
    let volume = create(&harness, "orders").await;
    let first = harness
        .engine
        .take_snapshot(&volume.id, &TakeSnapshotRequest::default())
        .await
        .expect("snapshot");
    harness
        .engine
        .remove_snapshot(&first.id, false)
        .await
        .expect("remove");
    harness
        .engine
        .remove_snapshot(&first.id, false)
        .await
        .expect("repeat remove");

    let second = harness
        .engine
        .take_snapshot(&volume.id, &TakeSnapshotRequest::default())
        .await
        .expect("snapshot");
    harness
        .backend
        .fail_next(LifecycleError::Conflict(String::from("in use")));
    harness
        .engine
        .remove_snapshot(&second.id, true)
        .await
        .expect("forced remove");
    assert_eq!(harness.engine.list_snapshots(&volume.id), Ok(Vec::new()));
}

#[rstest]
#[tokio::test]
async fn move_skips_the_backend_when_already_in_zone(harness: Harness) {
    let volume = harness
        .engine
        .create_volume(&request("orders").zone("zone-a"))
        .await
        .expect("create");

    let same = harness
        .engine
        .move_volume(&volume.id, "zone-a")
        .await
        .expect("no-op move");
    assert_eq!(same, volume);
    assert_eq!(harness.backend.count("move"), 0);

    let moved = harness
        .engine
        .move_volume(&volume.id, "zone-b")
        .await
        .expect("move");
    assert_eq!(moved.zone.as_deref(), Some("zone-b"));
    assert_eq!(harness.backend.count("move"), 1);
}

#[rstest]
#[tokio::test]
async fn attach_is_idempotent_and_conflicts_elsewhere(harness: Harness) {
    let volume = create(&harness, "orders").await;
    harness
        .engine
        .attach_volume(&volume.id, "db-1")
        .await
        .expect("attach");
    harness
        .engine
        .attach_volume(&volume.id, "db-1")
        .await
        .expect("repeat attach");
    assert_eq!(harness.backend.count("attach"), 1);

    let err = harness
        .engine
        .attach_volume(&volume.id, "db-2")
        .await
        .expect_err("held elsewhere");
    assert!(matches!(err, LifecycleError::Conflict(_)));

    let detached = harness
        .engine
        .detach_volume(&volume.id)
        .await
        .expect("detach");
    assert_eq!(detached.vm_name, None);
}

#[rstest]
#[tokio::test]
async fn mount_script_attaches_and_renders(harness: Harness) {
    let volume = create(&harness, "orders").await;
    let options = MountOptions::from_config(&EngineConfig::standard());
    let script = harness
        .engine
        .mount_script(&volume.id, "db-1", &options)
        .await
        .expect("script");
    assert!(script.contains(&volume.path));
    assert_eq!(
        harness.engine.get_volume(&volume.id).map(|v| v.vm_name),
        Ok(Some(String::from("db-1")))
    );

    let unmount = harness
        .engine
        .umount_script(&volume.id, &options)
        .expect("unmount script");
    assert!(unmount.contains("umount"));
    assert_eq!(harness.backend.count("detach"), 0);
}

#[rstest]
#[tokio::test]
async fn access_changes_track_the_owner(harness: Harness) {
    let volume = create(&harness, "orders").await;
    let granted = harness
        .engine
        .add_access(&volume.id, "10.0.0.9")
        .await
        .expect("grant");
    assert_eq!(granted.owner_address, "10.0.0.9");

    let revoked = harness
        .engine
        .remove_access(&volume.id, "10.0.0.9")
        .await
        .expect("revoke");
    assert!(revoked.owner_address.is_empty());

    let kept = harness
        .engine
        .remove_access(&volume.id, "10.0.0.1")
        .await
        .expect("revoke original owner");
    assert!(kept.owner_address.is_empty());
    assert_eq!(harness.backend.count("revoke"), 2);
}

#[rstest]
#[tokio::test]
async fn unknown_volume_is_not_found(harness: Harness) {
    let missing = VolumeId::from("missing");
    let err = harness
        .engine
        .resize(&missing, gb_to_kb(50))
        .await
        .expect_err("unknown");
    assert_eq!(
        err,
        LifecycleError::NotFound {
            entity: String::from("volume"),
            id: String::from("missing"),
        }
    );
}
