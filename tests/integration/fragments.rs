//! Fragment attachment through the framework.

use super::common::Bundle;
use keel::core::ResolutionError;
use keel::framework::{Event, FrameworkEvent};
use keel::{BundleState, Framework, KeelError};

fn export_names(fw: &Framework, id: u64) -> Vec<String> {
    fw.exported_packages(id)
        .unwrap()
        .into_iter()
        .filter(|e| !e.zombie)
        .map(|e| e.name)
        .collect()
}

#[test]
fn test_fragment_installed_first_attaches_when_host_resolves() {
    let fw = Framework::in_memory();
    let f = fw
        .install(
            "mem:f",
            Bundle::new("f")
                .host("h;bundle-version=\"[1.0,1.0]\"")
                .exports("h.extra")
                .content(),
        )
        .unwrap();
    let h = fw
        .install("mem:h", Bundle::new("h").version("1.0").exports("h.api").content())
        .unwrap();

    fw.resolve(h).unwrap();
    assert_eq!(fw.fragments(h).unwrap(), vec![f]);
    assert_eq!(fw.hosts(f).unwrap(), vec![h]);
    assert_eq!(fw.bundle_state(f), Some(BundleState::Resolved));
    assert_eq!(export_names(&fw, h), vec!["h.api", "h.extra"]);

    let extra = fw.package("h.extra").unwrap();
    assert_eq!(extra.providers[0].bundle, h);
    assert_eq!(extra.providers[0].fragment, Some(f));
}

#[test]
fn test_importer_of_fragment_package_wires_to_host() {
    let fw = Framework::in_memory();
    fw.install("mem:f", Bundle::new("f").host("h").exports("h.extra").content())
        .unwrap();
    let h = fw.install("mem:h", Bundle::new("h").content()).unwrap();
    let user = fw
        .install("mem:user", Bundle::new("user").imports("h.extra").content())
        .unwrap();

    fw.resolve(h).unwrap();
    fw.resolve(user).unwrap();
    let provider = fw.imported_packages(user).unwrap()[0].provider.clone().unwrap();
    assert_eq!(provider.bundle, h);
}

#[test]
fn test_fragment_without_host_fails_to_resolve() {
    let fw = Framework::in_memory();
    let f = fw
        .install("mem:f", Bundle::new("f").host("absent").content())
        .unwrap();
    assert!(matches!(
        fw.resolve(f),
        Err(KeelError::Resolution(ResolutionError::MissingHost { .. }))
    ));
    assert_eq!(fw.bundle_state(f), Some(BundleState::Installed));
}

#[test]
fn test_broken_fragment_does_not_block_host() {
    let fw = Framework::in_memory();
    let mut events = fw.subscribe();
    let f = fw
        .install("mem:f", Bundle::new("f").host("h").imports("nowhere").content())
        .unwrap();
    let h = fw.install("mem:h", Bundle::new("h").content()).unwrap();

    fw.resolve(h).unwrap();
    assert_eq!(fw.bundle_state(h), Some(BundleState::Resolved));
    assert_eq!(fw.bundle_state(f), Some(BundleState::Installed));
    assert!(fw.fragments(h).unwrap().is_empty());

    let warned = std::iter::from_fn(|| events.try_recv().ok()).any(|e| {
        matches!(e, Event::Framework(FrameworkEvent::Warning { bundle: Some(b), .. }) if b == f)
    });
    assert!(warned);
}

#[test]
fn test_fragment_attaches_dynamically_to_resolved_host() {
    let fw = Framework::in_memory();
    let h = fw.install("mem:h", Bundle::new("h").content()).unwrap();
    fw.start(h).unwrap();

    let f = fw
        .install("mem:f", Bundle::new("f").host("h").exports("h.more").content())
        .unwrap();
    fw.resolve(f).unwrap();
    assert_eq!(fw.fragments(h).unwrap(), vec![f]);
    assert_eq!(fw.bundle_state(h), Some(BundleState::Active));

    let wiring = fw
        .install("mem:w", Bundle::new("w").host("h").imports("h.more").content())
        .unwrap();
    assert!(matches!(
        fw.resolve(wiring),
        Err(KeelError::Resolution(ResolutionError::FragmentAttach { .. }))
    ));
}

#[tokio::test]
async fn test_uninstalled_fragment_leaves_host_after_refresh() {
    let fw = Framework::in_memory();
    let f = fw
        .install("mem:f", Bundle::new("f").host("h").exports("h.extra").content())
        .unwrap();
    let h = fw
        .install("mem:h", Bundle::new("h").exports("h.api").content())
        .unwrap();
    fw.resolve(h).unwrap();

    fw.uninstall(f).unwrap();
    let zombie: Vec<_> = fw
        .exported_packages(h)
        .unwrap()
        .into_iter()
        .filter(|e| e.zombie)
        .map(|e| e.name)
        .collect();
    assert_eq!(zombie, vec!["h.extra"]);

    fw.refresh_packages(Some(vec![h])).unwrap().wait().await.unwrap();
    assert_eq!(fw.bundle_state(h), Some(BundleState::Resolved));
    assert!(fw.fragments(h).unwrap().is_empty());
    let names: Vec<String> = fw.exported_packages(h).unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["h.api"]);
    assert!(fw.store().revisions(f).is_empty());
}
