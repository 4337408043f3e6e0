//! Install, resolve, start/stop, update and uninstall through the public API.

use super::common::Bundle;
use keel::core::ResolutionError;
use keel::framework::{BundleEventKind, Event};
use keel::{BundleState, Framework, KeelError};

#[test]
fn test_highest_version_wins_and_out_of_range_is_ignored() {
    let fw = Framework::in_memory();
    let a = fw
        .install("mem:a", Bundle::new("a").imports("p;version=\"[1.0,2.0)\"").content())
        .unwrap();
    let _b = fw
        .install("mem:b", Bundle::new("b").exports("p;version=1.5.0").content())
        .unwrap();
    let c = fw
        .install("mem:c", Bundle::new("c").exports("p;version=1.8.0").content())
        .unwrap();
    fw.resolve(a).unwrap();

    let d = fw
        .install("mem:d", Bundle::new("d").exports("p;version=2.1.0").content())
        .unwrap();
    assert!(fw.resolve_all().is_empty());

    let provider = fw.imported_packages(a).unwrap()[0].provider.clone().unwrap();
    assert_eq!(provider.bundle, c);
    assert_eq!(provider.version, "1.8.0");
    assert_eq!(fw.bundle_state(d), Some(BundleState::Resolved));
    assert!(fw
        .exported_packages(d)
        .unwrap()
        .iter()
        .all(|e| e.importers.is_empty()));
}

#[test]
fn test_resolution_failure_reports_package_and_range() {
    let fw = Framework::in_memory();
    let a = fw
        .install("mem:a", Bundle::new("a").imports("org.missing;version=\"[1.0,2.0)\"").content())
        .unwrap();

    match fw.resolve(a) {
        Err(KeelError::Resolution(ResolutionError::MissingPackage { package, range, .. })) => {
            assert_eq!(package, "org.missing");
            assert_eq!(range, "[1.0.0,2.0.0)");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(fw.bundle_state(a), Some(BundleState::Installed));

    let b = fw
        .install("mem:b", Bundle::new("b").exports("org.missing;version=1.2").content())
        .unwrap();
    fw.resolve(a).unwrap();
    assert_eq!(fw.bundle_state(b), Some(BundleState::Resolved));
}

#[test]
fn test_resolve_all_reports_failures() {
    let fw = Framework::in_memory();
    let ok = fw.install("mem:ok", Bundle::new("ok").content()).unwrap();
    let broken = fw
        .install("mem:broken", Bundle::new("broken").imports("nowhere").content())
        .unwrap();

    let failures = fw.resolve_all();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, broken);
    assert!(failures[0].1.is_resolution());
    assert_eq!(fw.bundle_state(ok), Some(BundleState::Resolved));
}

#[test]
fn test_require_bundle_with_reexport() {
    let fw = Framework::in_memory();
    let base = fw
        .install("mem:base", Bundle::new("base").version("1.0").exports("base.api").content())
        .unwrap();
    let mid = fw
        .install(
            "mem:mid",
            Bundle::new("mid")
                .requires("base;visibility:=reexport")
                .content(),
        )
        .unwrap();
    let top = fw
        .install("mem:top", Bundle::new("top").requires("mid").content())
        .unwrap();

    fw.resolve(top).unwrap();
    let required = fw.required_bundles(top).unwrap();
    assert_eq!(required.len(), 1);
    assert_eq!(required[0].bundle, mid);
    let required = fw.required_bundles(mid).unwrap();
    assert_eq!(required[0].bundle, base);
    assert!(required[0].reexport);
}

#[test]
fn test_lifecycle_events_in_order() {
    let fw = Framework::in_memory();
    let mut events = fw.subscribe();

    let a = fw.install("mem:a", Bundle::new("a").content()).unwrap();
    fw.start(a).unwrap();
    fw.stop(a).unwrap();
    fw.uninstall(a).unwrap();

    let kinds: Vec<BundleEventKind> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|e| match e {
            Event::Bundle(b) if b.bundle == a => Some(b.kind),
            _ => None,
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            BundleEventKind::Installed,
            BundleEventKind::Resolved,
            BundleEventKind::Starting,
            BundleEventKind::Started,
            BundleEventKind::Stopping,
            BundleEventKind::Stopped,
            BundleEventKind::Unresolved,
            BundleEventKind::Uninstalled,
        ]
    );
    assert!(fw.bundle(a).is_none());
}

#[test]
fn test_update_of_active_bundle_restarts_it() {
    let fw = Framework::in_memory();
    let a = fw
        .install("mem:a", Bundle::new("a").version("1.0").content())
        .unwrap();
    fw.start(a).unwrap();

    fw.update(a, Bundle::new("a").version("1.1").content()).unwrap();
    let info = fw.bundle(a).unwrap();
    assert_eq!(info.state, BundleState::Active);
    assert_eq!(info.version, "1.1.0");
    assert_eq!(info.revision, 1);
}

#[test]
fn test_update_to_installed_identity_is_rejected() {
    let fw = Framework::in_memory();
    let a = fw.install("mem:a", Bundle::new("a").content()).unwrap();
    let clash = fw.install("mem:b", Bundle::new("b").version("2.0").content()).unwrap();
    let err = fw
        .update(a, Bundle::new("b").version("2.0").content())
        .unwrap_err();
    assert!(matches!(err, KeelError::Duplicate(_)));
    assert_eq!(fw.bundle(a).unwrap().revision, 0);
    assert_eq!(fw.bundle(clash).unwrap().revision, 0);
}

#[test]
fn test_native_code_rejected_by_memory_store() {
    let fw = Framework::in_memory();
    let err = fw
        .install(
            "mem:native",
            Bundle::new("native")
                .header("Bundle-NativeCode", "lib/libfoo.so")
                .entry("lib/libfoo.so", b"\x7fELF")
                .content(),
        )
        .unwrap_err();
    assert!(matches!(err, KeelError::Unsupported(_)));
    assert!(fw.bundles().is_empty());
}

#[test]
fn test_rejected_update_leaves_active_bundle_running() {
    let fw = Framework::in_memory();
    let a = fw
        .install("mem:a", Bundle::new("a").version("1.0").content())
        .unwrap();
    fw.start(a).unwrap();
    let mut events = fw.subscribe();

    let err = fw
        .update(
            a,
            Bundle::new("a")
                .version("1.1")
                .header("Bundle-NativeCode", "lib/libfoo.so")
                .entry("lib/libfoo.so", b"\x7fELF")
                .content(),
        )
        .unwrap_err();

    assert!(matches!(err, KeelError::Unsupported(_)));
    assert_eq!(fw.bundle_state(a), Some(BundleState::Active));
    assert_eq!(fw.bundle(a).unwrap().revision, 0);
    assert_eq!(fw.store().revisions(a), vec![0]);
    let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|e| e.bundle_kind().map(|(kind, _)| kind))
        .collect();
    assert!(kinds.is_empty());
}
