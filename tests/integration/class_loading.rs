//! Class and resource lookup through imports, required bundles, the
//! bundle classpath and attached fragments.

use super::common::Bundle;
use keel::Framework;

#[test]
fn test_imported_package_loads_from_provider() {
    let fw = Framework::in_memory();
    let lib = fw
        .install(
            "mem:lib",
            Bundle::new("lib")
                .exports("org.lib;exclude:=\"*Impl\"")
                .entry("org/lib/Api.class", b"lib-api")
                .entry("org/lib/ApiImpl.class", b"lib-impl")
                .content(),
        )
        .unwrap();
    let app = fw
        .install(
            "mem:app",
            Bundle::new("app")
                .imports("org.lib")
                .entry("org/lib/Api.class", b"app-copy")
                .entry("org/app/Main.class", b"app-main")
                .content(),
        )
        .unwrap();
    fw.resolve(app).unwrap();

    assert_eq!(fw.get_class_bytes(app, "org.lib.Api").unwrap(), Some(b"lib-api".to_vec()));
    assert_eq!(fw.get_class_bytes(app, "org.lib.ApiImpl").unwrap(), None);
    assert_eq!(fw.get_class_bytes(app, "org.app.Main").unwrap(), Some(b"app-main".to_vec()));
    assert_eq!(
        fw.get_class_bytes(lib, "org.lib.ApiImpl").unwrap(),
        Some(b"lib-impl".to_vec())
    );
}

#[test]
fn test_unresolved_bundle_sees_only_its_own_content() {
    let fw = Framework::in_memory();
    fw.install(
        "mem:lib",
        Bundle::new("lib")
            .exports("org.lib")
            .entry("org/lib/Api.class", b"lib-api")
            .content(),
    )
    .unwrap();
    let app = fw
        .install(
            "mem:app",
            Bundle::new("app")
                .imports("org.lib;version=\"[9.0,10.0)\"")
                .entry("org/lib/Api.class", b"app-copy")
                .content(),
        )
        .unwrap();
    assert!(fw.resolve(app).is_err());
    assert_eq!(fw.get_class_bytes(app, "org.lib.Api").unwrap(), Some(b"app-copy".to_vec()));
}

#[test]
fn test_required_bundle_exports_are_visible() {
    let fw = Framework::in_memory();
    fw.install(
        "mem:base",
        Bundle::new("base")
            .exports("org.base")
            .entry("org/base/Base.class", b"base")
            .entry("org/base/readme.txt", b"hello")
            .content(),
    )
    .unwrap();
    fw.install(
        "mem:mid",
        Bundle::new("mid").requires("base;visibility:=reexport").content(),
    )
    .unwrap();
    let top = fw
        .install("mem:top", Bundle::new("top").requires("mid").content())
        .unwrap();
    fw.resolve(top).unwrap();

    assert_eq!(fw.get_class_bytes(top, "org.base.Base").unwrap(), Some(b"base".to_vec()));
    assert_eq!(
        fw.get_resource(top, "org/base/readme.txt").unwrap(),
        Some(b"hello".to_vec())
    );
}

#[test]
fn test_bundle_classpath_and_nested_archive() {
    let nested = Bundle::new("ignored")
        .entry("org/dep/Dep.class", b"nested-dep")
        .zip();
    let fw = Framework::in_memory();
    let a = fw
        .install(
            "mem:a",
            Bundle::new("a")
                .header("Bundle-ClassPath", "classes,lib/dep.jar,.")
                .entry("classes/org/a/A.class", b"from-classes")
                .entry("org/a/A.class", b"from-root")
                .entry("lib/dep.jar", &nested)
                .content(),
        )
        .unwrap();

    assert_eq!(fw.get_class_bytes(a, "org.a.A").unwrap(), Some(b"from-classes".to_vec()));
    assert_eq!(fw.get_class_bytes(a, "org.dep.Dep").unwrap(), Some(b"nested-dep".to_vec()));
    assert_eq!(fw.get_entry(a, "org/a/A.class").unwrap(), Some(b"from-root".to_vec()));
    assert_eq!(fw.get_entry(a, "org/dep/Dep.class").unwrap(), None);
}

#[test]
fn test_fragment_content_is_visible_through_host() {
    let fw = Framework::in_memory();
    let h = fw
        .install("mem:h", Bundle::new("h").entry("org/h/H.class", b"host").content())
        .unwrap();
    fw.install(
        "mem:f",
        Bundle::new("f")
            .host("h")
            .entry("org/h/messages.properties", b"greeting=hi")
            .content(),
    )
    .unwrap();

    assert_eq!(fw.get_resource(h, "org/h/messages.properties").unwrap(), None);
    fw.resolve(h).unwrap();
    assert_eq!(
        fw.get_resource(h, "org/h/messages.properties").unwrap(),
        Some(b"greeting=hi".to_vec())
    );
}
