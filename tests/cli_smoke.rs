//! Behavioural smoke tests for the CLI entrypoint. Every run uses a scratch
//! directory for the store and credential documents and never reaches a
//! backend.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use rstest::{fixture, rstest};
use tempfile::TempDir;

const VOLUME_ID: &str = "6f1c0b7e2d9a4c52a1e3b4d5c6f7a8b9";

const STORE: &str = r#"{
  "volumes": [
    {
      "id": "6f1c0b7e2d9a4c52a1e3b4d5c6f7a8b9",
      "provider": "gce",
      "environment": "prod",
      "size_kb": 10485760,
      "group": "orders",
      "resource_id": "orders-data1",
      "identifier": "1234567890",
      "path": "/dev/disk/by-id/google-orders-data1",
      "zone": "europe-west1-b",
      "device_slot": 1
    }
  ],
  "snapshots": []
}"#;

const CREDENTIALS: &str = r#"{"credentials": [
  {"provider": "gce", "environment": "prod", "project": "acme",
   "zone": "europe-west1-b", "access_token": "token"}
]}"#;

#[fixture]
fn workspace() -> TempDir {
    tempfile::tempdir().expect("tempdir")
}

fn command(workspace: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("volume-provider");
    cmd.current_dir(workspace.path())
        .env(
            "VOLUME_PROVIDER_STORE_PATH",
            workspace.path().join("volumes.json"),
        )
        .env(
            "VOLUME_PROVIDER_CREDENTIALS_PATH",
            workspace.path().join("credentials.json"),
        )
        .env("RUST_LOG", "off");
    cmd
}

fn seed(workspace: &TempDir) {
    std::fs::write(workspace.path().join("volumes.json"), STORE).expect("write store");
    std::fs::write(workspace.path().join("credentials.json"), CREDENTIALS)
        .expect("write credentials");
}

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("volume-provider");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[rstest]
fn unknown_volume_reports_not_found(workspace: TempDir) {
    command(&workspace)
        .args(["show", "missing"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not_found: volume missing not found"));
}

#[rstest]
fn unknown_provider_is_a_validation_error(workspace: TempDir) {
    command(&workspace)
        .args([
            "create",
            "--provider",
            "tape",
            "--env",
            "prod",
            "--group",
            "orders",
            "--size-gb",
            "10",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("validation:"))
        .stderr(predicate::str::contains("unknown provider 'tape'"));
}

#[rstest]
fn create_without_credentials_fails_before_any_write(workspace: TempDir) {
    command(&workspace)
        .args([
            "create",
            "--provider",
            "gce",
            "--env",
            "prod",
            "--group",
            "orders",
            "--size-gb",
            "10",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("credential:"));
    assert!(!workspace.path().join("volumes.json").exists());
}

#[rstest]
fn malformed_label_is_rejected(workspace: TempDir) {
    command(&workspace)
        .args([
            "create",
            "--provider",
            "gce",
            "--env",
            "prod",
            "--group",
            "orders",
            "--size-gb",
            "10",
            "--label",
            "orphan",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid label 'orphan'"));
}

#[rstest]
fn show_prints_the_stored_record(workspace: TempDir) {
    seed(&workspace);
    command(&workspace)
        .args(["show", VOLUME_ID])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"resource_id\": \"orders-data1\""))
        .stdout(predicate::str::contains("\"provider\": \"gce\""));
}

#[rstest]
fn snapshots_of_a_fresh_volume_is_empty(workspace: TempDir) {
    seed(&workspace);
    command(&workspace)
        .args(["snapshots", VOLUME_ID])
        .assert()
        .success()
        .stdout("[]\n");
}

#[rstest]
fn umount_renders_a_script_without_backend_calls(workspace: TempDir) {
    seed(&workspace);
    command(&workspace)
        .args([
            "umount",
            VOLUME_ID,
            "--data-directory",
            "/srv/mysql",
            "--no-fstab",
        ])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("#!"))
        .stdout(predicate::str::contains("MOUNT_POINT=/srv/mysql"))
        .stdout(predicate::str::contains("fstab").not());
}

#[rstest]
fn shrinking_is_rejected_before_the_backend(workspace: TempDir) {
    seed(&workspace);
    command(&workspace)
        .args(["resize", VOLUME_ID, "--size-gb", "5"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("validation:"));
}

#[rstest]
fn deleting_an_unknown_volume_succeeds(workspace: TempDir) {
    command(&workspace)
        .args(["delete", "missing"])
        .assert()
        .success()
        .stdout("");
}
