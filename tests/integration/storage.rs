//! File-backed storage across framework restarts.

use super::common::Bundle;
use keel::{BundleState, Framework, FrameworkConfig};
use std::fs;
use tempfile::TempDir;

fn open(dir: &TempDir) -> Framework {
    Framework::new(FrameworkConfig::with_storage_dir(dir.path())).unwrap()
}

#[test]
fn test_bundles_survive_restart_with_ids() {
    let dir = TempDir::new().unwrap();
    let (a, b) = {
        let fw = open(&dir);
        let a = fw
            .install("file:a.jar", Bundle::new("a").exports("p").content())
            .unwrap();
        let b = fw
            .install("file:b.jar", Bundle::new("b").imports("p").content())
            .unwrap();
        fw.start(b).unwrap();
        (a, b)
    };

    let fw = open(&dir);
    assert_eq!(fw.bundle(a).unwrap().state, BundleState::Installed);
    assert_eq!(fw.bundle(b).unwrap().state, BundleState::Installed);
    assert_eq!(fw.bundle(b).unwrap().location, "file:b.jar");

    fw.resolve(b).unwrap();
    let c = fw.install("file:c.jar", Bundle::new("c").content()).unwrap();
    assert!(c > b);
}

#[test]
fn test_restart_keeps_committed_revision_only() {
    let dir = TempDir::new().unwrap();
    let e = {
        let fw = open(&dir);
        let e = fw
            .install("file:e.jar", Bundle::new("e").version("1.0").exports("q").content())
            .unwrap();
        let g = fw
            .install("file:g.jar", Bundle::new("g").imports("q").content())
            .unwrap();
        fw.resolve(g).unwrap();
        fw.update(e, Bundle::new("e").version("2.0").exports("q").content())
            .unwrap();
        e
    };
    assert!(dir.path().join(e.to_string()).join("0").exists());

    let fw = open(&dir);
    assert_eq!(fw.bundle(e).unwrap().version, "2.0.0");
    assert_eq!(fw.bundle(e).unwrap().revision, 1);
    assert!(!dir.path().join(e.to_string()).join("0").exists());
}

#[test]
fn test_incomplete_revision_falls_back_to_lowest_complete() {
    let dir = TempDir::new().unwrap();
    let e = {
        let fw = open(&dir);
        let e = fw
            .install("file:e.jar", Bundle::new("e").version("1.0").exports("q").content())
            .unwrap();
        let g = fw
            .install("file:g.jar", Bundle::new("g").imports("q").content())
            .unwrap();
        fw.resolve(g).unwrap();
        fw.update(e, Bundle::new("e").version("2.0").exports("q").content())
            .unwrap();
        e
    };
    fs::remove_file(dir.path().join(e.to_string()).join("1").join("revision.yaml")).unwrap();

    let fw = open(&dir);
    let info = fw.bundle(e).unwrap();
    assert_eq!(info.version, "1.0.0");
    assert_eq!(info.revision, 0);
}

#[test]
fn test_always_unpack_layout() {
    let dir = TempDir::new().unwrap();
    let config = FrameworkConfig {
        always_unpack: true,
        ..FrameworkConfig::with_storage_dir(dir.path())
    };
    let fw = Framework::new(config).unwrap();
    let a = fw
        .install(
            "file:a.jar",
            Bundle::new("a").entry("org/a/A.class", b"bytes").content(),
        )
        .unwrap();

    let revision = dir.path().join(a.to_string()).join("0");
    assert!(revision.join("content").join("org/a/A.class").is_file());
    assert!(!revision.join("bundle.jar").exists());
    assert_eq!(fw.get_entry(a, "org/a/A.class").unwrap(), Some(b"bytes".to_vec()));
}

#[test]
fn test_clean_on_start_discards_bundles() {
    let dir = TempDir::new().unwrap();
    {
        let fw = open(&dir);
        fw.install("file:a.jar", Bundle::new("a").content()).unwrap();
    }

    let config = FrameworkConfig {
        clean_on_start: true,
        ..FrameworkConfig::with_storage_dir(dir.path())
    };
    let fw = Framework::new(config).unwrap();
    assert!(fw.bundles().is_empty());
}

#[test]
fn test_install_from_exploded_directory() {
    let dir = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let path = Bundle::new("exploded")
        .version("3.1")
        .entry("org/x/X.class", b"x")
        .write_dir(source.path(), "exploded");

    let fw = open(&dir);
    let id = fw.install_path(&path).unwrap();
    let info = fw.bundle(id).unwrap();
    assert_eq!(info.symbolic_name, "exploded");
    assert!(info.location.starts_with("file:"));
    assert_eq!(fw.get_entry(id, "org/x/X.class").unwrap(), Some(b"x".to_vec()));
}
