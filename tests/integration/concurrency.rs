//! Lifecycle operations from several threads at once.

use super::common::Bundle;
use keel::{BundleState, Framework};
use std::sync::{Arc, Barrier};
use std::thread;

const RESOLVERS: usize = 4;
const PER_THREAD: usize = 5;

/// Every mandatory import of a resolved bundle is wired to a current,
/// in-range export.
fn assert_wiring_consistent(fw: &Framework) {
    for info in fw.bundles() {
        if !matches!(info.state, BundleState::Resolved | BundleState::Active) {
            continue;
        }
        for import in fw.imported_packages(info.id).unwrap() {
            if import.optional {
                continue;
            }
            let provider = import
                .provider
                .unwrap_or_else(|| panic!("bundle {} has an unwired import of {}", info.id, import.name));
            assert!(provider.version.starts_with("1."), "{} out of range", provider.version);

            let export = fw
                .exported_packages(provider.bundle)
                .unwrap()
                .into_iter()
                .find(|e| e.name == import.name && e.revision == provider.revision)
                .unwrap();
            assert!(!export.zombie, "bundle {} still wired to a zombie export", info.id);
        }
    }
}

#[test]
fn test_concurrent_resolves_with_updates_and_refreshes() {
    let fw = Framework::in_memory();
    let e = fw
        .install("mem:e", Bundle::new("e").version("1.0.0").exports("q;version=1.0.0").content())
        .unwrap();
    let barrier = Arc::new(Barrier::new(RESOLVERS + 1));

    let mut handles = Vec::new();
    for t in 0..RESOLVERS {
        let fw = fw.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..PER_THREAD {
                let name = format!("c{}-{}", t, i);
                let id = fw
                    .install(
                        &format!("mem:{}", name),
                        Bundle::new(&name).imports("q;version=\"[1.0,2.0)\"").content(),
                    )
                    .unwrap();
                // May lose to a concurrent refresh; settled below.
                let _ = fw.resolve(id);
            }
        }));
    }

    let updater = {
        let fw = fw.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for minor in 1..=4 {
                let version = format!("1.{}.0", minor);
                fw.update(
                    e,
                    Bundle::new("e")
                        .version(&version)
                        .exports(&format!("q;version={}", version))
                        .content(),
                )
                .unwrap();
                fw.refresh_packages(None).unwrap().wait_blocking().unwrap();
            }
        })
    };

    for handle in handles {
        handle.join().unwrap();
    }
    updater.join().unwrap();

    fw.refresh_packages(None).unwrap().wait_blocking().unwrap();
    assert!(fw.resolve_all().is_empty());

    assert_eq!(fw.bundles().len(), 1 + RESOLVERS * PER_THREAD);
    assert_wiring_consistent(&fw);
    assert_eq!(fw.revisions(e).unwrap().len(), 1);
    assert_eq!(fw.store().revisions(e), vec![4]);

    let q = fw.package("q").unwrap();
    assert_eq!(q.providers.len(), 1);
    assert_eq!(q.providers[0].version, "1.4.0");
    assert_eq!(q.providers[0].importers.len(), RESOLVERS * PER_THREAD);
}

#[test]
fn test_same_bundle_resolved_from_many_threads_is_wired_once() {
    let fw = Framework::in_memory();
    let p = fw
        .install("mem:p", Bundle::new("p").exports("org.p").content())
        .unwrap();
    let a = fw
        .install("mem:a", Bundle::new("a").imports("org.p").content())
        .unwrap();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let fw = fw.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                fw.resolve(a)
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(fw.bundle_state(a), Some(BundleState::Resolved));
    assert_eq!(fw.bundle_state(p), Some(BundleState::Resolved));
    let exports = fw.exported_packages(p).unwrap();
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].importers, vec![a]);
}

#[test]
fn test_class_lookups_during_refresh() {
    let fw = Framework::in_memory();
    let e = fw
        .install(
            "mem:e",
            Bundle::new("e")
                .version("1.0.0")
                .exports("org.q")
                .entry("org/q/Api.class", b"v1")
                .content(),
        )
        .unwrap();
    let g = fw
        .install("mem:g", Bundle::new("g").imports("org.q").content())
        .unwrap();
    fw.resolve(g).unwrap();

    fw.update(
        e,
        Bundle::new("e")
            .version("1.1.0")
            .exports("org.q")
            .entry("org/q/Api.class", b"v2")
            .content(),
    )
    .unwrap();
    assert_eq!(fw.get_class_bytes(g, "org.q.Api").unwrap(), Some(b"v1".to_vec()));

    let reader = {
        let fw = fw.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                // Unwired for a moment while refreshing, but never broken.
                let bytes = fw.get_class_bytes(g, "org.q.Api").unwrap();
                assert!(matches!(bytes.as_deref(), None | Some(b"v1") | Some(b"v2")));
            }
        })
    };
    fw.refresh_packages(Some(vec![e])).unwrap().wait_blocking().unwrap();
    reader.join().unwrap();

    assert_eq!(fw.get_class_bytes(g, "org.q.Api").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(fw.store().revisions(e), vec![1]);
}
