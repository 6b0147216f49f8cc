//! CLI argument parsing and end-to-end tests for tpcp.

use assert_cmd::Command;
use predicates::prelude::*;

fn temp_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("tpcp_test_{}_{}", std::process::id(), tag));
    if dir.exists() {
        std::fs::remove_dir_all(&dir).unwrap();
    }
    std::fs::create_dir(&dir).unwrap();
    dir
}

#[test]
fn help_runs() {
    Command::cargo_bin("tpcp")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn version_runs() {
    Command::cargo_bin("tpcp")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn requires_source_and_destination() {
    Command::cargo_bin("tpcp").unwrap().assert().failure();
    Command::cargo_bin("tpcp")
        .unwrap()
        .arg("only-one-path")
        .assert()
        .failure();
}

#[test]
fn on_conflict_values_parse() {
    for value in ["overwrite", "skip", "fail"] {
        Command::cargo_bin("tpcp")
            .unwrap()
            .args(["--on-conflict", value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn on_conflict_rejects_unknown_values() {
    Command::cargo_bin("tpcp")
        .unwrap()
        .args(["--on-conflict", "merge", "a", "b"])
        .assert()
        .failure();
}

#[test]
fn symlink_policy_values_parse() {
    for value in ["target", "no-change", "source"] {
        Command::cargo_bin("tpcp")
            .unwrap()
            .args(["--symlinks", value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn symlink_ask_is_rejected_without_an_interactive_host() {
    let tmp = temp_dir("ask");
    std::fs::write(tmp.join("a"), "x").unwrap();
    Command::cargo_bin("tpcp")
        .unwrap()
        .args(["--symlinks", "ask"])
        .arg(tmp.join("a"))
        .arg(tmp.join("b"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("interactive"));
}

#[test]
fn copies_a_file() {
    let tmp = temp_dir("copy");
    std::fs::write(tmp.join("a.txt"), "hello").unwrap();
    Command::cargo_bin("tpcp")
        .unwrap()
        .arg(tmp.join("a.txt"))
        .arg(tmp.join("b.txt"))
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(tmp.join("b.txt")).unwrap(), "hello");
    assert_eq!(std::fs::read_to_string(tmp.join("a.txt")).unwrap(), "hello");
}

#[test]
fn moves_a_file() {
    let tmp = temp_dir("move");
    std::fs::write(tmp.join("a.txt"), "hello").unwrap();
    Command::cargo_bin("tpcp")
        .unwrap()
        .arg("--move")
        .arg(tmp.join("a.txt"))
        .arg(tmp.join("b.txt"))
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(tmp.join("b.txt")).unwrap(), "hello");
    assert!(!tmp.join("a.txt").exists());
}

#[test]
fn copies_a_tree_into_a_directory() {
    let tmp = temp_dir("tree");
    std::fs::create_dir_all(tmp.join("src").join("sub")).unwrap();
    std::fs::write(tmp.join("src").join("sub").join("f.txt"), "deep").unwrap();
    std::fs::create_dir(tmp.join("dst")).unwrap();
    Command::cargo_bin("tpcp")
        .unwrap()
        .arg(tmp.join("src"))
        .arg(tmp.join("dst"))
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(tmp.join("dst").join("src").join("sub").join("f.txt")).unwrap(),
        "deep"
    );
}

#[test]
fn default_conflict_policy_fails_on_collision() {
    let tmp = temp_dir("collide");
    std::fs::write(tmp.join("a.txt"), "new").unwrap();
    std::fs::write(tmp.join("b.txt"), "old").unwrap();
    Command::cargo_bin("tpcp")
        .unwrap()
        .arg(tmp.join("a.txt"))
        .arg(tmp.join("b.txt"))
        .assert()
        .failure();
    assert_eq!(std::fs::read_to_string(tmp.join("b.txt")).unwrap(), "old");
}

#[test]
fn skip_policy_keeps_the_destination_and_succeeds() {
    let tmp = temp_dir("skip");
    std::fs::write(tmp.join("a.txt"), "new").unwrap();
    std::fs::write(tmp.join("b.txt"), "old").unwrap();
    Command::cargo_bin("tpcp")
        .unwrap()
        .args(["--on-conflict", "skip"])
        .arg(tmp.join("a.txt"))
        .arg(tmp.join("b.txt"))
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(tmp.join("b.txt")).unwrap(), "old");
}

#[test]
fn overwrite_policy_replaces_the_destination() {
    let tmp = temp_dir("overwrite");
    std::fs::write(tmp.join("a.txt"), "new").unwrap();
    std::fs::write(tmp.join("b.txt"), "old").unwrap();
    Command::cargo_bin("tpcp")
        .unwrap()
        .args(["--on-conflict", "overwrite"])
        .arg(tmp.join("a.txt"))
        .arg(tmp.join("b.txt"))
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(tmp.join("b.txt")).unwrap(), "new");
}

#[test]
fn summary_prints_operation_counts() {
    let tmp = temp_dir("summary");
    std::fs::write(tmp.join("a.txt"), "hello").unwrap();
    Command::cargo_bin("tpcp")
        .unwrap()
        .arg("--summary")
        .arg(tmp.join("a.txt"))
        .arg(tmp.join("b.txt"))
        .assert()
        .success()
        .stdout(predicate::str::contains("files copied: 1"));
}

#[test]
fn missing_source_fails_without_fail_early_only_at_exit() {
    let tmp = temp_dir("missing");
    Command::cargo_bin("tpcp")
        .unwrap()
        .arg("--fail-early")
        .arg(tmp.join("no-such-file"))
        .arg(tmp.join("dst"))
        .assert()
        .failure();
}
