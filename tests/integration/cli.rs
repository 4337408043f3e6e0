//! Tests for the `keel` binary

use super::common::{keel_command, Bundle};
use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_inspect_prints_manifest() {
    let temp = TempDir::new().unwrap();
    let jar = Bundle::new("org.example.api")
        .version("1.2.3")
        .exports("org.example.api;version=1.2.3")
        .imports("org.slf4j;version=\"[1.7,2.0)\"")
        .write_jar(temp.path(), "api.jar");

    keel_command()
        .arg("inspect")
        .arg(&jar)
        .assert()
        .success()
        .stdout(predicate::str::contains("org.example.api 1.2.3"))
        .stdout(predicate::str::contains("org.slf4j [1.7.0,2.0.0)"));
}

#[test]
fn test_inspect_json() {
    let temp = TempDir::new().unwrap();
    let jar = Bundle::new("frag")
        .host("host")
        .write_jar(temp.path(), "frag.jar");

    let output = keel_command()
        .args(["inspect", "--json"])
        .arg(&jar)
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["symbolic_name"], "frag");
    assert_eq!(json["fragment_host"], "host 0.0.0");
}

#[test]
fn test_inspect_rejects_bundle_without_manifest() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("broken.jar");
    std::fs::write(&path, b"not a zip").unwrap();

    keel_command()
        .arg("inspect")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn test_resolve_directory() {
    let temp = TempDir::new().unwrap();
    Bundle::new("lib")
        .exports("org.lib;version=1.0")
        .write_jar(temp.path(), "lib.jar");
    Bundle::new("app")
        .imports("org.lib")
        .write_dir(temp.path(), "app");
    std::fs::write(temp.path().join("notes.txt"), "not a bundle").unwrap();

    keel_command()
        .arg("resolve")
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("app 0.0.0 (resolved)"))
        .stdout(predicate::str::contains("import org.lib"));
}

#[test]
fn test_resolve_json_reports_failures() {
    let temp = TempDir::new().unwrap();
    Bundle::new("lonely")
        .imports("org.missing")
        .write_jar(temp.path(), "lonely.jar");

    let output = keel_command()
        .args(["resolve", "--json"])
        .arg(temp.path())
        .output()
        .unwrap();
    assert!(!output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["bundles"][0]["symbolic_name"], "lonely");
    assert_eq!(json["bundles"][0]["state"], "installed");
    assert!(json["failures"][0]["error"]
        .as_str()
        .unwrap()
        .contains("org.missing"));
}

#[test]
fn test_resolve_with_storage_dir_persists_bundles() {
    let temp = TempDir::new().unwrap();
    let storage = TempDir::new().unwrap();
    Bundle::new("lib").write_jar(temp.path(), "lib.jar");

    keel_command()
        .arg("resolve")
        .arg(temp.path())
        .arg("--storage-dir")
        .arg(storage.path())
        .assert()
        .success();

    assert!(storage.path().join("next-id").is_file());
    assert!(storage.path().join("1").join("location").is_file());
}
