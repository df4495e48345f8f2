use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn datum(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("datum"));
    cmd.current_dir(dir).env("RUST_LOG", "warn").env("NO_COLOR", "1");
    cmd
}

fn init_repo() -> TempDir {
    let tmp = TempDir::new().expect("tempdir");
    datum(tmp.path()).arg("init").assert().success();
    tmp
}

#[test]
fn init_creates_the_repository_once() {
    let tmp = init_repo();
    assert!(tmp.path().join(".datum/config.yaml").is_file());

    datum(tmp.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(contains("already a datum repository"));
    datum(tmp.path()).args(["init", "--force"]).assert().success();
}

#[test]
fn commands_outside_a_repository_point_at_init() {
    let tmp = TempDir::new().expect("tempdir");
    datum(tmp.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(contains("datum init"));
}

#[test]
fn add_then_checkout_restores_deleted_data() {
    let tmp = init_repo();
    fs::write(tmp.path().join("data.csv"), "a,b\n1,2\n").expect("write data");

    datum(tmp.path())
        .args(["add", "data.csv"])
        .assert()
        .success()
        .stdout(contains("data.csv.datum"));
    assert!(tmp.path().join("data.csv.datum").is_file());

    datum(tmp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("up to date"));

    fs::remove_file(tmp.path().join("data.csv")).expect("delete data");
    datum(tmp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("data.csv.datum").and(contains("missing")));

    datum(tmp.path()).arg("checkout").assert().success();
    assert_eq!(
        fs::read_to_string(tmp.path().join("data.csv")).expect("read data"),
        "a,b\n1,2\n"
    );
}

#[test]
fn checkout_conflict_needs_force() {
    let tmp = init_repo();
    let data = tmp.path().join("notes.txt");
    fs::write(&data, "v1").expect("write");
    datum(tmp.path()).args(["add", "notes.txt"]).assert().success();
    datum(tmp.path()).args(["unprotect", "notes.txt"]).assert().success();
    fs::write(&data, "local edit").expect("edit");

    datum(tmp.path())
        .arg("checkout")
        .assert()
        .failure()
        .stdout(contains("differs from the recorded version"));
    assert_eq!(fs::read_to_string(&data).expect("read"), "local edit");

    datum(tmp.path())
        .args(["checkout", "--force"])
        .assert()
        .success();
    assert_eq!(fs::read_to_string(&data).expect("read"), "v1");
}

#[test]
fn repro_runs_stale_stages_then_nothing() {
    let tmp = init_repo();
    fs::write(tmp.path().join("in.txt"), "hello\n").expect("write input");
    fs::write(
        tmp.path().join("datum.yaml"),
        "stages:\n  copy:\n    cmd: cp in.txt out.txt\n    deps: [in.txt]\n    outs: [out.txt]\n",
    )
    .expect("write pipeline");

    datum(tmp.path())
        .arg("repro")
        .assert()
        .success()
        .stdout(contains("ran copy"));
    assert!(tmp.path().join("datum.lock").is_file());

    datum(tmp.path())
        .arg("repro")
        .assert()
        .success()
        .stdout(contains("Pipeline is up to date."));
}

#[test]
fn failing_stage_exits_non_zero() {
    let tmp = init_repo();
    fs::write(
        tmp.path().join("datum.yaml"),
        "stages:\n  broken:\n    cmd: exit 3\n    outs: [never.txt]\n",
    )
    .expect("write pipeline");

    datum(tmp.path())
        .arg("repro")
        .assert()
        .failure()
        .stdout(contains("failed broken"))
        .stderr(contains("1 stage(s) failed: broken"));
}

#[test]
fn push_to_a_directory_remote_and_report_status() {
    let tmp = init_repo();
    let storage = TempDir::new().expect("storage");
    fs::write(tmp.path().join("model.bin"), "weights").expect("write");
    datum(tmp.path()).args(["add", "model.bin"]).assert().success();

    datum(tmp.path())
        .args(["remote", "add", "--default", "storage"])
        .arg(storage.path())
        .assert()
        .success();
    datum(tmp.path())
        .args(["remote", "list"])
        .assert()
        .success()
        .stdout(contains("* storage"));

    datum(tmp.path())
        .args(["status", "--remote", "--json"])
        .assert()
        .success()
        .stdout(contains("\"missing_remote\"").and(contains("\"clean\": false")));

    datum(tmp.path())
        .arg("push")
        .assert()
        .success()
        .stdout(contains("1 transferred"));
    datum(tmp.path())
        .args(["status", "--json", "--remote", "storage"])
        .assert()
        .success()
        .stdout(contains("\"clean\": true"));
}

#[test]
fn remove_untracks_and_gc_drops_the_object() {
    let tmp = init_repo();
    fs::write(tmp.path().join("scratch.txt"), "temp").expect("write");
    datum(tmp.path()).args(["add", "scratch.txt"]).assert().success();

    datum(tmp.path())
        .args(["remove", "scratch.txt.datum"])
        .assert()
        .success()
        .stdout(contains("Untracked scratch.txt"));
    assert!(!tmp.path().join("scratch.txt.datum").exists());
    assert!(tmp.path().join("scratch.txt").exists());

    datum(tmp.path())
        .arg("gc")
        .assert()
        .success()
        .stdout(contains("Removed 1 object(s)"));
}

#[test]
fn gc_refuses_a_malformed_keep_id() {
    let tmp = init_repo();
    datum(tmp.path())
        .args(["gc", "--keep", "../outside"])
        .assert()
        .failure()
        .stderr(contains("is not a content identity"));
}
