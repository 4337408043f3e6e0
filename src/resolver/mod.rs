//! Wiring algorithm.
//!
//! A [`Resolver`] computes a [`ResolutionPlan`] against a read-only view of
//! the framework: which imports get which provider, which bundles become
//! required, which fragments attach. Nothing is mutated here; the framework
//! commits the plan in one step. Failed branches (a provider whose own
//! resolution fails, a candidate that violates `uses`, a fragment that does
//! not wire) are rolled back by restoring a snapshot of the transaction.

mod fragments;
mod space;

use crate::core::{BundleId, ResolutionError, RevisionKey, Version};
use crate::package::{ExportId, ExportPkg, ImportId, ImportPkg, PackageRegistry, RequireWire};
use keel_core::manifest::{BundleManifest, RequireSpec};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// What the resolver needs to know about installed revisions beyond the
/// registry.
pub trait ResolveView {
    fn manifest(&self, key: RevisionKey) -> Option<&BundleManifest>;

    /// Current revisions of installed bundles, ascending by bundle id.
    fn live_revisions(&self) -> Vec<RevisionKey>;

    /// Whether `key` is the current revision of an installed bundle.
    fn is_live(&self, key: RevisionKey) -> bool;

    /// Whether the bundle owning `key` is starting or active.
    fn is_active(&self, key: RevisionKey) -> bool;
}

/// An export that is either registered or planned in this transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExportRef {
    Registered(ExportId),
    Planned(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImportRef {
    Registered(ImportId),
    Planned(usize),
}

/// Everything a successful resolution adds to the framework.
#[derive(Debug, Clone, Default)]
pub struct ResolutionPlan {
    /// Non-fragment revisions that become resolved, in resolution order.
    pub resolved: Vec<RevisionKey>,
    /// `(host, fragment)` pairs, in attachment order.
    pub attachments: Vec<(RevisionKey, RevisionKey)>,
    /// Fragment exports to register under their host.
    pub exports: Vec<ExportPkg>,
    /// Fragment imports to register under their host.
    pub imports: Vec<ImportPkg>,
    pub wires: BTreeMap<ImportRef, ExportRef>,
    pub requires: Vec<RequireWire>,
    /// Fragments skipped because their declarations did not wire.
    pub warnings: Vec<ResolutionError>,
}

impl ResolutionPlan {
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.attachments.is_empty()
    }

    /// Bundles that end up resolved, fragments included.
    pub fn bundles(&self) -> BTreeSet<BundleId> {
        self.resolved
            .iter()
            .map(|k| k.bundle)
            .chain(self.attachments.iter().map(|(_, f)| f.bundle))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
struct Txn {
    plan: ResolutionPlan,
    resolving: BTreeSet<RevisionKey>,
    /// Package sources fixed for a revision's space by `uses` implications
    /// of the providers chosen so far.
    constraints: HashMap<RevisionKey, BTreeMap<String, ExportRef>>,
}

pub struct Resolver<'a, V: ResolveView> {
    registry: &'a PackageRegistry,
    view: &'a V,
    txn: Txn,
}

impl<'a, V: ResolveView> Resolver<'a, V> {
    pub fn new(registry: &'a PackageRegistry, view: &'a V) -> Self {
        Self {
            registry,
            view,
            txn: Txn::default(),
        }
    }

    /// Resolve one revision and whatever it needs. An already resolved
    /// revision yields an empty plan.
    pub fn resolve(mut self, key: RevisionKey) -> Result<ResolutionPlan, ResolutionError> {
        self.resolve_bundle(key)?;
        Ok(self.txn.plan)
    }

    fn is_resolved(&self, key: RevisionKey) -> bool {
        self.registry.is_resolved(key) || self.txn.resolving.contains(&key)
    }

    fn export(&self, export: ExportRef) -> Option<&ExportPkg> {
        match export {
            ExportRef::Registered(id) => self.registry.export(id),
            ExportRef::Planned(i) => self.txn.plan.exports.get(i),
        }
    }

    fn import(&self, import: ImportRef) -> Option<&ImportPkg> {
        match import {
            ImportRef::Registered(id) => self.registry.import(id),
            ImportRef::Planned(i) => self.txn.plan.imports.get(i),
        }
    }

    fn owner(&self, export: ExportRef) -> Option<RevisionKey> {
        self.export(export).map(|e| e.owner)
    }

    fn provider_of(&self, import: ImportRef) -> Option<ExportRef> {
        if let Some(planned) = self.txn.plan.wires.get(&import) {
            return Some(*planned);
        }
        match import {
            ImportRef::Registered(id) => self
                .registry
                .import(id)
                .and_then(|i| i.provider)
                .map(ExportRef::Registered),
            ImportRef::Planned(_) => None,
        }
    }

    fn exports_in(&self, key: RevisionKey) -> Vec<ExportRef> {
        let registered = self
            .registry
            .exports_of(key)
            .map(|e| ExportRef::Registered(e.id));
        let planned = self
            .txn
            .plan
            .exports
            .iter()
            .enumerate()
            .filter(|(_, e)| e.owner == key)
            .map(|(i, _)| ExportRef::Planned(i));
        registered.chain(planned).collect()
    }

    fn imports_in(&self, key: RevisionKey) -> Vec<ImportRef> {
        let registered = self
            .registry
            .imports_of(key)
            .map(|i| ImportRef::Registered(i.id));
        let planned = self
            .txn
            .plan
            .imports
            .iter()
            .enumerate()
            .filter(|(_, i)| i.owner == key)
            .map(|(i, _)| ImportRef::Planned(i));
        registered.chain(planned).collect()
    }

    fn requires_in(&self, key: RevisionKey) -> Vec<RequireWire> {
        self.registry
            .requires_of(key)
            .iter()
            .chain(self.txn.plan.requires.iter().filter(|w| w.requirer == key))
            .cloned()
            .collect()
    }

    fn resolve_bundle(&mut self, key: RevisionKey) -> Result<(), ResolutionError> {
        if self.is_resolved(key) {
            return Ok(());
        }
        let view = self.view;
        let registry = self.registry;
        let Some(manifest) = view.manifest(key) else {
            return Err(ResolutionError::MissingRequiredBundle {
                bundle: key.bundle,
                name: key.to_string(),
                range: String::new(),
            });
        };
        if manifest.is_fragment() {
            return self.resolve_fragment(key, manifest);
        }

        self.txn.resolving.insert(key);
        self.txn.plan.resolved.push(key);

        let imports: Vec<ImportPkg> = registry.imports_of(key).cloned().collect();
        for import in &imports {
            if let Some(provider) = self.choose_provider(key, import, key.bundle)? {
                self.txn
                    .plan
                    .wires
                    .insert(ImportRef::Registered(import.id), provider);
            }
        }

        for spec in &manifest.requires {
            self.resolve_require(key, spec, None, key.bundle)?;
        }

        self.attach_fragments(key, manifest);
        debug!(bundle = key.bundle, revision = key.revision, "planned resolution");
        Ok(())
    }

    /// Ranking key shared by exports and required bundles: highest version,
    /// then an already resolved owner, then lowest bundle id and revision.
    fn rank(&self, version: &Version, owner: RevisionKey) -> (Reverse<Version>, bool, BundleId, u32) {
        (
            Reverse(version.clone()),
            !self.is_resolved(owner),
            owner.bundle,
            owner.revision,
        )
    }

    fn is_candidate_owner(&self, owner: RevisionKey) -> bool {
        self.is_resolved(owner) || (self.view.is_live(owner) && !self.registry.is_zombie(owner))
    }

    /// Pick the provider for `import` in the space of `space_owner`.
    /// `Ok(None)` leaves an optional import unwired.
    fn choose_provider(
        &mut self,
        space_owner: RevisionKey,
        import: &ImportPkg,
        bundle: BundleId,
    ) -> Result<Option<ExportRef>, ResolutionError> {
        let registry = self.registry;

        let planned = self
            .txn
            .plan
            .exports
            .iter()
            .enumerate()
            .filter(|(_, e)| e.name == import.name)
            .map(|(i, _)| ExportRef::Planned(i));
        let matching: Vec<ExportRef> = registry
            .providers(&import.name)
            .into_iter()
            .map(|e| ExportRef::Registered(e.id))
            .chain(planned)
            .filter(|e| self.export(*e).is_some_and(|e| e.matches(import)))
            .collect();

        let live: Vec<ExportRef> = matching
            .iter()
            .copied()
            .filter(|e| self.export(*e).is_some_and(|e| !e.is_zombie()))
            .collect();
        let mut pool = if live.is_empty() {
            matching
                .into_iter()
                .filter(|e| matches!(e, ExportRef::Registered(id) if registry.is_serving(*id)))
                .collect()
        } else {
            live
        };
        pool.retain(|e| self.owner(*e).is_some_and(|o| self.is_candidate_owner(o)));
        pool.sort_by_key(|e| {
            let export = self.export(*e);
            let version = export.map(|e| e.version.clone()).unwrap_or_else(Version::zero);
            let owner = export.map(|e| e.owner).unwrap_or(space_owner);
            self.rank(&version, owner)
        });

        let mut conflicts = BTreeSet::new();
        if let Some(fixed) = self
            .txn
            .constraints
            .get(&space_owner)
            .and_then(|c| c.get(&import.name))
            .copied()
        {
            let fixed_owner = self.owner(fixed);
            pool.retain(|e| self.owner(*e) == fixed_owner);
            if pool.is_empty() {
                if let Some(owner) = fixed_owner {
                    conflicts.insert(owner.bundle);
                }
            }
        }

        for candidate in pool {
            let Some(owner) = self.owner(candidate) else {
                continue;
            };
            let snapshot = self.txn.clone();
            if !self.is_resolved(owner) && self.resolve_bundle(owner).is_err() {
                self.txn = snapshot;
                continue;
            }
            match self.check_consistent(space_owner, candidate) {
                Ok(implied) => {
                    self.txn
                        .constraints
                        .entry(space_owner)
                        .or_default()
                        .extend(implied);
                    debug!(
                        bundle = space_owner.bundle,
                        package = %import.name,
                        provider = %owner,
                        "chose provider"
                    );
                    return Ok(Some(candidate));
                }
                Err(conflicting) => {
                    debug!(
                        bundle = space_owner.bundle,
                        package = %import.name,
                        provider = %owner,
                        "provider violates uses constraints"
                    );
                    conflicts.extend(conflicting);
                    self.txn = snapshot;
                }
            }
        }

        if import.optional {
            return Ok(None);
        }
        if !conflicts.is_empty() {
            return Err(ResolutionError::UsesConflict {
                bundle,
                package: import.name.clone(),
                conflicting: conflicts.into_iter().collect(),
            });
        }
        Err(ResolutionError::MissingPackage {
            bundle,
            package: import.name.clone(),
            range: import.range.to_string(),
        })
    }

    fn resolve_require(
        &mut self,
        requirer: RevisionKey,
        spec: &RequireSpec,
        fragment: Option<RevisionKey>,
        bundle: BundleId,
    ) -> Result<(), ResolutionError> {
        let view = self.view;
        let mut candidates: Vec<(RevisionKey, &BundleManifest)> = view
            .live_revisions()
            .into_iter()
            .filter_map(|k| view.manifest(k).map(|m| (k, m)))
            .filter(|(_, m)| {
                !m.is_fragment() && m.symbolic_name == spec.name && spec.range.includes(&m.version)
            })
            .collect();
        candidates.sort_by_key(|(k, m)| self.rank(&m.version, *k));

        for (target, _) in candidates {
            let snapshot = self.txn.clone();
            if !self.is_resolved(target) && self.resolve_bundle(target).is_err() {
                self.txn = snapshot;
                continue;
            }
            self.txn.plan.requires.push(RequireWire {
                requirer,
                target,
                name: spec.name.clone(),
                reexport: spec.reexport,
                fragment,
            });
            return Ok(());
        }

        if spec.optional {
            return Ok(());
        }
        Err(ResolutionError::MissingRequiredBundle {
            bundle,
            name: spec.name.clone(),
            range: spec.range.to_string(),
        })
    }
}
