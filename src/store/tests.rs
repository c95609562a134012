//! Unit tests for the document stores.

use camino::Utf8PathBuf;
use chrono::Utc;
use rstest::{fixture, rstest};

use super::*;
use crate::provider::ProviderKind;

fn volume(group: &str) -> Volume {
    let mut volume = Volume::provisioning(ProviderKind::NetworkExport, "dev", group, 1024);
    volume.identifier = format!("id-{}", volume.id);
    volume
}

struct FileFixture {
    _tmp: tempfile::TempDir,
    store: JsonFileStore,
}

#[fixture]
fn file_store() -> FileFixture {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("volumes.json")).expect("utf8 path");
    FileFixture {
        store: JsonFileStore::new(path),
        _tmp: tmp,
    }
}

fn exercise_store(store: &dyn VolumeStore) {
    let first = volume("orders");
    let second = volume("orders");
    let other = volume("billing");
    for record in [&first, &second, &other] {
        store.save_volume(record).expect("save volume");
    }

    let group = store.find_by_group("orders").expect("group lookup");
    assert_eq!(
        group.iter().map(|v| v.id.clone()).collect::<Vec<_>>(),
        vec![first.id.clone(), second.id.clone()],
        "group members keep insertion order"
    );

    let mut resized = first.clone();
    resized.size_kb = 4096;
    store.save_volume(&resized).expect("update volume");
    assert_eq!(
        store.find_volume(&first.id).expect("lookup").map(|v| v.size_kb),
        Some(4096)
    );
    assert_eq!(store.find_by_group("orders").expect("group").len(), 2);

    let snapshot = Snapshot::pending(&first, Utc::now());
    store.save_snapshot(&snapshot).expect("save snapshot");
    assert_eq!(store.snapshots_of(&first.id).expect("snapshots").len(), 1);

    assert!(store.delete_volume(&first.id).expect("delete"));
    assert_eq!(store.find_volume(&first.id).expect("lookup"), None);
    assert_eq!(
        store.find_snapshot(&snapshot.id).expect("lookup"),
        None,
        "snapshots cascade with their volume"
    );
    assert!(!store.delete_volume(&first.id).expect("second delete"));

    let filtered = store
        .filter_volumes(&|v: &Volume| v.group == "billing")
        .expect("filter");
    assert_eq!(filtered.len(), 1);
}

#[test]
fn memory_store_behaves_as_document_store() {
    exercise_store(&MemoryStore::new());
}

#[rstest]
fn json_store_behaves_as_document_store(file_store: FileFixture) {
    exercise_store(&file_store.store);
}

#[rstest]
fn json_store_survives_reopen(file_store: FileFixture) {
    let record = volume("orders");
    file_store.store.save_volume(&record).expect("save");

    let reopened = JsonFileStore::new(file_store.store.path().to_owned());
    assert_eq!(
        reopened.find_volume(&record.id).expect("lookup"),
        Some(record)
    );
}

#[test]
fn snapshot_delete_reports_existence() {
    let store = MemoryStore::new();
    let owner = volume("orders");
    let snapshot = Snapshot::pending(&owner, Utc::now());
    store.save_snapshot(&snapshot).expect("save");
    assert!(store.delete_snapshot(&snapshot.id).expect("delete"));
    assert!(!store.delete_snapshot(&snapshot.id).expect("repeat delete"));
}
