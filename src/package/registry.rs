use super::export::{ExportId, ExportPkg, ImportId, ImportPkg, Pkg};
use crate::core::{KeelError, KeelResult, Liveness, RevisionKey};
use crate::storage::RevisionRef;
use keel_core::manifest::BundleManifest;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// A resolved `Require-Bundle` clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequireWire {
    pub requirer: RevisionKey,
    pub target: RevisionKey,
    pub name: String,
    pub reexport: bool,
    /// Fragment that contributed the clause to its host.
    pub fragment: Option<RevisionKey>,
}

#[derive(Debug, Default)]
struct RevisionEntry {
    exports: Vec<ExportId>,
    imports: Vec<ImportId>,
    requires: Vec<RequireWire>,
    fragments: Vec<RevisionKey>,
    hosts: Vec<RevisionKey>,
    resolved: bool,
    liveness: Liveness,
}

/// Global package namespace and the live wiring between revisions.
///
/// Exports and imports live in id-keyed arenas; `Pkg` buckets and revision
/// entries refer to them by id. Every wire holds a storage reference on the
/// providing revision, handed back to the caller when the wire is torn down.
#[derive(Default)]
pub struct PackageRegistry {
    next_id: u64,
    exports: BTreeMap<ExportId, ExportPkg>,
    imports: BTreeMap<ImportId, ImportPkg>,
    packages: BTreeMap<String, Pkg>,
    revisions: BTreeMap<RevisionKey, RevisionEntry>,
    import_leases: HashMap<ImportId, RevisionRef>,
    require_leases: HashMap<(RevisionKey, Option<RevisionKey>), Vec<RevisionRef>>,
}

impl PackageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn entry_mut(&mut self, key: RevisionKey) -> &mut RevisionEntry {
        self.revisions.entry(key).or_default()
    }

    /// Register a revision's own exports and imports, unwired. Fragments
    /// get an empty entry; their declarations are added per host on attach.
    pub fn register_revision(&mut self, key: RevisionKey, manifest: &BundleManifest) -> KeelResult<()> {
        if self.revisions.contains_key(&key) {
            return Err(KeelError::InvalidState(format!(
                "revision {} is already registered",
                key
            )));
        }
        self.revisions.insert(key, RevisionEntry::default());
        if manifest.is_fragment() {
            return Ok(());
        }

        for spec in &manifest.exports {
            let export = ExportPkg::new(spec, key, &manifest.symbolic_name, &manifest.version, None)?;
            self.insert_export(export);
        }
        for spec in &manifest.imports {
            self.insert_import(ImportPkg::new(spec, key, None));
        }
        debug!(
            revision = %key,
            exports = manifest.exports.len(),
            imports = manifest.imports.len(),
            "registered revision"
        );
        Ok(())
    }

    pub fn insert_export(&mut self, mut export: ExportPkg) -> ExportId {
        let id = ExportId(self.allocate());
        export.id = id;
        self.packages
            .entry(export.name.clone())
            .or_insert_with(|| Pkg::new(&export.name))
            .providers
            .insert(id);
        self.entry_mut(export.owner).exports.push(id);
        self.exports.insert(id, export);
        id
    }

    pub fn insert_import(&mut self, mut import: ImportPkg) -> ImportId {
        let id = ImportId(self.allocate());
        import.id = id;
        self.packages
            .entry(import.name.clone())
            .or_insert_with(|| Pkg::new(&import.name))
            .importers
            .insert(id);
        self.entry_mut(import.owner).imports.push(id);
        self.imports.insert(id, import);
        id
    }

    pub fn wire(&mut self, import: ImportId, export: ExportId, lease: RevisionRef) -> KeelResult<()> {
        if !self.exports.contains_key(&export) {
            return Err(KeelError::InvalidState(format!("unknown export {}", export)));
        }
        let slot = self
            .imports
            .get_mut(&import)
            .ok_or_else(|| KeelError::InvalidState(format!("unknown import {}", import)))?;
        slot.provider = Some(export);
        self.import_leases.insert(import, lease);
        Ok(())
    }

    pub fn add_require(&mut self, wire: RequireWire, lease: RevisionRef) {
        self.require_leases
            .entry((wire.requirer, wire.fragment))
            .or_default()
            .push(lease);
        self.entry_mut(wire.requirer).requires.push(wire);
    }

    /// Record that `fragment` is attached to `host`.
    pub fn attach(&mut self, host: RevisionKey, fragment: RevisionKey) {
        let host_entry = self.entry_mut(host);
        if !host_entry.fragments.contains(&fragment) {
            host_entry.fragments.push(fragment);
        }
        let fragment_entry = self.entry_mut(fragment);
        if !fragment_entry.hosts.contains(&host) {
            fragment_entry.hosts.push(host);
        }
        fragment_entry.resolved = true;
    }

    /// Remove exactly the contributions `fragment` made to `host`.
    pub fn detach(&mut self, host: RevisionKey, fragment: RevisionKey) -> Vec<RevisionRef> {
        let mut leases = Vec::new();

        let exports: Vec<ExportId> = self
            .exports_of(host)
            .filter(|e| e.fragment == Some(fragment))
            .map(|e| e.id)
            .collect();
        for id in exports {
            leases.extend(self.remove_export(id));
        }

        let imports: Vec<ImportId> = self
            .imports_of(host)
            .filter(|i| i.fragment == Some(fragment))
            .map(|i| i.id)
            .collect();
        for id in imports {
            leases.extend(self.remove_import(id));
        }

        if let Some(entry) = self.revisions.get_mut(&host) {
            entry.requires.retain(|w| w.fragment != Some(fragment));
            entry.fragments.retain(|f| *f != fragment);
        }
        leases.extend(
            self.require_leases
                .remove(&(host, Some(fragment)))
                .unwrap_or_default(),
        );

        if let Some(entry) = self.revisions.get_mut(&fragment) {
            entry.hosts.retain(|h| *h != host);
            if entry.hosts.is_empty() {
                entry.resolved = false;
            }
        }
        debug!(host = %host, fragment = %fragment, "detached fragment");
        leases
    }

    fn remove_export(&mut self, id: ExportId) -> Vec<RevisionRef> {
        let mut leases = Vec::new();
        let Some(export) = self.exports.remove(&id) else {
            return leases;
        };

        let wired: Vec<ImportId> = self
            .imports
            .values()
            .filter(|i| i.provider == Some(id))
            .map(|i| i.id)
            .collect();
        for import in wired {
            if let Some(slot) = self.imports.get_mut(&import) {
                slot.provider = None;
            }
            leases.extend(self.import_leases.remove(&import));
        }

        if let Some(pkg) = self.packages.get_mut(&export.name) {
            pkg.providers.remove(&id);
            if pkg.is_empty() {
                self.packages.remove(&export.name);
            }
        }
        if let Some(entry) = self.revisions.get_mut(&export.owner) {
            entry.exports.retain(|e| *e != id);
        }
        leases
    }

    fn remove_import(&mut self, id: ImportId) -> Option<RevisionRef> {
        let import = self.imports.remove(&id)?;
        if let Some(pkg) = self.packages.get_mut(&import.name) {
            pkg.importers.remove(&id);
            if pkg.is_empty() {
                self.packages.remove(&import.name);
            }
        }
        if let Some(entry) = self.revisions.get_mut(&import.owner) {
            entry.imports.retain(|i| *i != id);
        }
        self.import_leases.remove(&id)
    }

    /// Tear down every wire the revision holds: its import providers, its
    /// required bundles and its fragment attachments. The revision goes
    /// back to unresolved; its own exports stay registered.
    pub fn unwire_revision(&mut self, key: RevisionKey) -> Vec<RevisionRef> {
        let mut leases = Vec::new();

        let (fragments, hosts) = match self.revisions.get(&key) {
            Some(entry) => (entry.fragments.clone(), entry.hosts.clone()),
            None => return leases,
        };
        for fragment in fragments {
            leases.extend(self.detach(key, fragment));
        }
        for host in hosts {
            leases.extend(self.detach(host, key));
        }

        let imports: Vec<ImportId> = self.imports_of(key).map(|i| i.id).collect();
        for id in imports {
            if let Some(slot) = self.imports.get_mut(&id) {
                slot.provider = None;
            }
            leases.extend(self.import_leases.remove(&id));
        }

        let require_keys: Vec<_> = self
            .require_leases
            .keys()
            .filter(|(requirer, _)| *requirer == key)
            .copied()
            .collect();
        for k in require_keys {
            leases.extend(self.require_leases.remove(&k).unwrap_or_default());
        }

        if let Some(entry) = self.revisions.get_mut(&key) {
            entry.requires.clear();
            entry.resolved = false;
        }
        leases
    }

    /// Remove a revision and everything it owns. Imports elsewhere that
    /// were wired to its exports lose their provider.
    pub fn unregister_revision(&mut self, key: RevisionKey) -> Vec<RevisionRef> {
        let mut leases = self.unwire_revision(key);

        let exports: Vec<ExportId> = self.exports_of(key).map(|e| e.id).collect();
        for id in exports {
            leases.extend(self.remove_export(id));
        }
        let imports: Vec<ImportId> = self.imports_of(key).map(|i| i.id).collect();
        for id in imports {
            leases.extend(self.remove_import(id));
        }

        self.revisions.remove(&key);
        debug!(revision = %key, "unregistered revision");
        leases
    }

    pub fn set_resolved(&mut self, key: RevisionKey, resolved: bool) {
        self.entry_mut(key).resolved = resolved;
    }

    /// Mark a superseded revision and every export it owns or contributed
    /// as zombie. Existing wires are kept.
    pub fn mark_zombie(&mut self, key: RevisionKey) {
        if let Some(entry) = self.revisions.get_mut(&key) {
            entry.liveness = Liveness::Zombie;
        }
        for export in self.exports.values_mut() {
            if export.owner == key || export.fragment == Some(key) {
                export.liveness = Liveness::Zombie;
            }
        }
    }

    pub fn is_registered(&self, key: RevisionKey) -> bool {
        self.revisions.contains_key(&key)
    }

    pub fn is_resolved(&self, key: RevisionKey) -> bool {
        self.revisions.get(&key).is_some_and(|e| e.resolved)
    }

    pub fn is_zombie(&self, key: RevisionKey) -> bool {
        self.revisions
            .get(&key)
            .is_some_and(|e| e.liveness.is_zombie())
    }

    pub fn export(&self, id: ExportId) -> Option<&ExportPkg> {
        self.exports.get(&id)
    }

    pub fn import(&self, id: ImportId) -> Option<&ImportPkg> {
        self.imports.get(&id)
    }

    /// Exports in the revision's package space, fragment contributions
    /// included, in registration order.
    pub fn exports_of(&self, key: RevisionKey) -> impl Iterator<Item = &ExportPkg> {
        self.revisions
            .get(&key)
            .map(|e| e.exports.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.exports.get(id))
    }

    pub fn imports_of(&self, key: RevisionKey) -> impl Iterator<Item = &ImportPkg> {
        self.revisions
            .get(&key)
            .map(|e| e.imports.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.imports.get(id))
    }

    pub fn requires_of(&self, key: RevisionKey) -> &[RequireWire] {
        self.revisions
            .get(&key)
            .map(|e| e.requires.as_slice())
            .unwrap_or_default()
    }

    /// Fragments attached to a host, in attachment order.
    pub fn fragments_of(&self, key: RevisionKey) -> &[RevisionKey] {
        self.revisions
            .get(&key)
            .map(|e| e.fragments.as_slice())
            .unwrap_or_default()
    }

    pub fn hosts_of(&self, key: RevisionKey) -> &[RevisionKey] {
        self.revisions
            .get(&key)
            .map(|e| e.hosts.as_slice())
            .unwrap_or_default()
    }

    pub fn package(&self, name: &str) -> Option<&Pkg> {
        self.packages.get(name)
    }

    pub fn package_names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    pub fn providers(&self, name: &str) -> Vec<&ExportPkg> {
        self.packages
            .get(name)
            .map(|pkg| pkg.providers.iter().filter_map(|id| self.exports.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn importers(&self, name: &str) -> Vec<&ImportPkg> {
        self.packages
            .get(name)
            .map(|pkg| pkg.importers.iter().filter_map(|id| self.imports.get(id)).collect())
            .unwrap_or_default()
    }

    /// Imports currently wired to an export.
    pub fn importers_of(&self, export: ExportId) -> Vec<&ImportPkg> {
        let Some(name) = self.exports.get(&export).map(|e| e.name.as_str()) else {
            return Vec::new();
        };
        self.importers(name)
            .into_iter()
            .filter(|i| i.provider == Some(export))
            .collect()
    }

    pub fn is_serving(&self, export: ExportId) -> bool {
        !self.importers_of(export).is_empty()
    }

    /// Other revisions wired to `key` by an import or a required bundle.
    pub fn dependents_of(&self, key: RevisionKey) -> BTreeSet<RevisionKey> {
        let mut dependents = BTreeSet::new();
        for import in self.imports.values() {
            let Some(provider) = import.provider.and_then(|id| self.exports.get(&id)) else {
                continue;
            };
            if provider.owner == key || provider.fragment == Some(key) {
                dependents.insert(import.owner);
            }
        }
        for (owner, entry) in &self.revisions {
            if entry.requires.iter().any(|w| w.target == key) {
                dependents.insert(*owner);
            }
        }
        dependents.remove(&key);
        dependents
    }

    /// Whether anything outside the revision still relies on it: a wire from
    /// another revision, or a host it is attached to.
    pub fn has_external_dependents(&self, key: RevisionKey) -> bool {
        !self.dependents_of(key).is_empty() || !self.hosts_of(key).is_empty()
    }

    /// Where the revision's view of `package` comes from: the provider of a
    /// wired import, otherwise its own export.
    pub fn package_source(&self, key: RevisionKey, package: &str) -> Option<&ExportPkg> {
        if let Some(import) = self.imports_of(key).find(|i| i.name == package) {
            return import.provider.and_then(|id| self.exports.get(&id));
        }
        self.exports_of(key).find(|e| e.name == package)
    }

    pub fn revisions(&self) -> impl Iterator<Item = RevisionKey> + '_ {
        self.revisions.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ArchiveStore;
    use crate::test_fixtures::TestBundle;

    struct Fixture {
        store: ArchiveStore,
        registry: PackageRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: ArchiveStore::in_memory(),
                registry: PackageRegistry::new(),
            }
        }

        fn add(&mut self, bundle: TestBundle) -> RevisionKey {
            let content = bundle.content();
            let key = self.store.insert("mem", &content).unwrap().key;
            self.registry.register_revision(key, content.manifest()).unwrap();
            key
        }

        fn wire_all(&mut self, importer: RevisionKey, exporter: RevisionKey) {
            let pairs: Vec<(ImportId, ExportId)> = self
                .registry
                .imports_of(importer)
                .filter_map(|i| {
                    self.registry
                        .exports_of(exporter)
                        .find(|e| e.matches(i))
                        .map(|e| (i.id, e.id))
                })
                .collect();
            for (import, export) in pairs {
                let lease = self.store.acquire(exporter).unwrap();
                self.registry.wire(import, export, lease).unwrap();
            }
            self.registry.set_resolved(importer, true);
        }
    }

    #[test]
    fn test_register_populates_packages() {
        let mut f = Fixture::new();
        let a = f.add(TestBundle::new("a").exports("p;version=1.0,q"));
        let b = f.add(TestBundle::new("b").imports("p"));

        assert_eq!(f.registry.providers("p").len(), 1);
        assert_eq!(f.registry.importers("p").len(), 1);
        assert_eq!(f.registry.exports_of(a).count(), 2);
        assert_eq!(f.registry.imports_of(b).count(), 1);
        assert!(!f.registry.is_resolved(b));
    }

    #[test]
    fn test_wire_and_dependents() {
        let mut f = Fixture::new();
        let a = f.add(TestBundle::new("a").exports("p"));
        let b = f.add(TestBundle::new("b").imports("p"));
        f.wire_all(b, a);

        assert_eq!(f.registry.dependents_of(a), BTreeSet::from([b]));
        assert!(f.registry.has_external_dependents(a));
        assert_eq!(f.registry.package_source(b, "p").map(|e| e.owner), Some(a));
        assert_eq!(f.store.ref_count(a), 1);

        let leases = f.registry.unwire_revision(b);
        assert_eq!(leases.len(), 1);
        drop(leases);
        assert_eq!(f.store.ref_count(a), 0);
        assert!(f.registry.dependents_of(a).is_empty());
    }

    #[test]
    fn test_unregister_clears_importers() {
        let mut f = Fixture::new();
        let a = f.add(TestBundle::new("a").exports("p"));
        let b = f.add(TestBundle::new("b").imports("p"));
        f.wire_all(b, a);

        let leases = f.registry.unregister_revision(a);
        assert_eq!(leases.len(), 1);
        assert!(f.registry.providers("p").is_empty());
        assert!(f.registry.imports_of(b).all(|i| i.provider.is_none()));
        assert!(!f.registry.is_registered(a));
    }

    #[test]
    fn test_mark_zombie_keeps_wires() {
        let mut f = Fixture::new();
        let a = f.add(TestBundle::new("a").exports("p"));
        let b = f.add(TestBundle::new("b").imports("p"));
        f.wire_all(b, a);

        f.registry.mark_zombie(a);
        assert!(f.registry.is_zombie(a));
        let export = f.registry.exports_of(a).next().unwrap();
        assert!(export.is_zombie());
        assert!(f.registry.is_serving(export.id));
    }

    #[test]
    fn test_fragment_contributions_detach_exactly() {
        let mut f = Fixture::new();
        let host = f.add(TestBundle::new("host").exports("h"));
        let frag = f.add(TestBundle::new("frag").host("host").exports("extra"));
        assert_eq!(f.registry.exports_of(frag).count(), 0);

        let spec = keel_core::manifest::ExportSpec::new("extra", crate::core::Version::zero());
        let export = ExportPkg::new(&spec, host, "host", &crate::core::Version::zero(), Some(frag)).unwrap();
        f.registry.insert_export(export);
        f.registry.attach(host, frag);

        assert_eq!(f.registry.exports_of(host).count(), 2);
        assert_eq!(f.registry.fragments_of(host), &[frag]);
        assert!(f.registry.is_resolved(frag));
        assert!(f.registry.has_external_dependents(frag));

        f.registry.detach(host, frag);
        let names: Vec<&str> = f.registry.exports_of(host).map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["h"]);
        assert!(f.registry.hosts_of(frag).is_empty());
        assert!(!f.registry.is_resolved(frag));
    }
}
