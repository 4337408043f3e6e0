//! Zombie exports and package refresh.

use super::common::Bundle;
use keel::core::Liveness;
use keel::framework::{Event, FrameworkEvent};
use keel::{BundleState, Framework, FrameworkConfig};
use tempfile::TempDir;

fn provider_of(fw: &Framework, bundle: u64, package: &str) -> Option<(u64, u32)> {
    fw.imported_packages(bundle)
        .unwrap()
        .into_iter()
        .find(|i| i.name == package)
        .and_then(|i| i.provider)
        .map(|p| (p.bundle, p.revision))
}

#[tokio::test]
async fn test_dependent_stays_on_zombie_until_refresh() {
    let fw = Framework::in_memory();
    let e = fw
        .install("mem:e", Bundle::new("e").version("1.0").exports("q;version=1.0").content())
        .unwrap();
    let g = fw
        .install("mem:g", Bundle::new("g").imports("q").content())
        .unwrap();
    fw.resolve(g).unwrap();
    assert_eq!(provider_of(&fw, g, "q"), Some((e, 0)));

    fw.update(e, Bundle::new("e").version("1.1").exports("q;version=1.1").content())
        .unwrap();
    assert_eq!(provider_of(&fw, g, "q"), Some((e, 0)));
    assert_eq!(fw.store().revisions(e), vec![0, 1]);

    let report = fw.refresh_packages(Some(vec![e])).unwrap().wait().await.unwrap();
    assert!(report.refreshed.contains(&e));
    assert!(report.refreshed.contains(&g));
    assert!(report.failed.is_empty());

    assert_eq!(provider_of(&fw, g, "q"), Some((e, 1)));
    assert_eq!(fw.bundle_state(g), Some(BundleState::Resolved));
    assert_eq!(fw.store().revisions(e), vec![1]);
    assert!(fw.exported_packages(e).unwrap().iter().all(|x| !x.zombie));
}

#[tokio::test]
async fn test_refresh_fails_dependent_when_package_disappears() {
    let fw = Framework::in_memory();
    let e = fw
        .install("mem:e", Bundle::new("e").exports("q").content())
        .unwrap();
    let g = fw
        .install("mem:g", Bundle::new("g").imports("q").content())
        .unwrap();
    fw.resolve(g).unwrap();

    fw.update(e, Bundle::new("e").version("2.0").content()).unwrap();
    let report = fw.refresh_packages(Some(vec![e])).unwrap().wait().await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, g);
    assert_eq!(fw.bundle_state(g), Some(BundleState::Installed));
}

#[tokio::test]
async fn test_uninstalled_provider_serves_until_refresh() {
    let fw = Framework::in_memory();
    let e = fw
        .install("mem:e", Bundle::new("e").exports("q").content())
        .unwrap();
    let g = fw
        .install("mem:g", Bundle::new("g").imports("q").content())
        .unwrap();
    fw.start(g).unwrap();

    fw.uninstall(e).unwrap();
    assert!(fw.bundle(e).is_none());
    assert_eq!(provider_of(&fw, g, "q"), Some((e, 0)));
    assert_eq!(fw.store().revision_state(keel::core::RevisionKey::new(e, 0)), Liveness::Zombie);

    let mut events = fw.subscribe();
    let report = fw.refresh_packages(None).unwrap().wait().await.unwrap();
    assert_eq!(report.refreshed, vec![e, g]);
    assert_eq!(report.failed.len(), 1);

    assert_eq!(fw.bundle_state(g), Some(BundleState::Installed));
    assert!(fw.store().revisions(e).is_empty());
    assert!(fw.package("q").map_or(true, |p| p.providers.is_empty()));

    let refreshed = std::iter::from_fn(|| events.try_recv().ok()).any(|ev| {
        matches!(ev, Event::Framework(FrameworkEvent::PackagesRefreshed { ref bundles }) if bundles == &vec![e, g])
    });
    assert!(refreshed);
}

#[tokio::test]
async fn test_refresh_restarts_active_dependents() {
    let fw = Framework::in_memory();
    let e = fw
        .install("mem:e", Bundle::new("e").version("1.0").exports("q;version=1.0").content())
        .unwrap();
    let g = fw
        .install("mem:g", Bundle::new("g").imports("q").content())
        .unwrap();
    fw.start(g).unwrap();

    fw.update(e, Bundle::new("e").version("1.1").exports("q;version=1.1").content())
        .unwrap();
    fw.refresh_packages(None).unwrap().wait().await.unwrap();

    assert_eq!(fw.bundle_state(g), Some(BundleState::Active));
    assert_eq!(provider_of(&fw, g, "q"), Some((e, 1)));
}

#[tokio::test]
async fn test_refresh_with_nothing_to_do() {
    let fw = Framework::in_memory();
    fw.install("mem:a", Bundle::new("a").content()).unwrap();
    let report = fw.refresh_packages(None).unwrap().wait().await.unwrap();
    assert!(report.refreshed.is_empty());
}

#[test]
fn test_refresh_reclaims_file_storage() {
    let dir = TempDir::new().unwrap();
    let fw = Framework::new(FrameworkConfig::with_storage_dir(dir.path())).unwrap();
    let e = fw
        .install("file:e.jar", Bundle::new("e").version("1.0").exports("q;version=1.0").content())
        .unwrap();
    let g = fw
        .install("file:g.jar", Bundle::new("g").imports("q").content())
        .unwrap();
    fw.resolve(g).unwrap();
    fw.update(e, Bundle::new("e").version("1.1").exports("q;version=1.1").content())
        .unwrap();

    let old = dir.path().join(e.to_string()).join("0");
    assert!(old.exists());

    fw.refresh_packages(Some(vec![e])).unwrap().wait_blocking().unwrap();
    assert!(!old.exists());
    assert!(dir.path().join(e.to_string()).join("1").exists());
}
