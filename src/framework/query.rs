//! Read-only views of the framework: bundles, revisions, packages and wires.
//! Everything here is a snapshot taken under the state read lock.

use super::state::FrameworkState;
use super::{BundleState, Framework};
use crate::core::{BundleId, KeelResult, Liveness, RevisionNumber};
use crate::package::{ExportPkg, ImportPkg};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleInfo {
    pub id: BundleId,
    pub symbolic_name: String,
    pub version: String,
    pub location: String,
    pub state: BundleState,
    pub revision: RevisionNumber,
    pub fragment: bool,
    pub activator: Option<String>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedPackage {
    pub name: String,
    pub version: String,
    pub bundle: BundleId,
    pub revision: RevisionNumber,
    /// Fragment bundle that contributed the export to its host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<BundleId>,
    pub zombie: bool,
    pub importers: Vec<BundleId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderRef {
    pub bundle: BundleId,
    pub revision: RevisionNumber,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedPackage {
    pub name: String,
    pub range: String,
    pub optional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<BundleId>,
    pub provider: Option<ProviderRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequiredBundle {
    pub name: String,
    pub bundle: BundleId,
    pub revision: RevisionNumber,
    pub reexport: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<BundleId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageInfo {
    pub name: String,
    pub providers: Vec<ExportedPackage>,
    /// Bundles importing the package, wired or not.
    pub importers: Vec<BundleId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevisionInfo {
    pub revision: RevisionNumber,
    pub liveness: Liveness,
    pub current: bool,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

fn exported(state: &FrameworkState, export: &ExportPkg) -> ExportedPackage {
    let mut importers: Vec<BundleId> = state
        .registry
        .importers_of(export.id)
        .into_iter()
        .map(|i| i.owner.bundle)
        .collect();
    importers.sort_unstable();
    importers.dedup();

    ExportedPackage {
        name: export.name.clone(),
        version: export.version.to_string(),
        bundle: export.owner.bundle,
        revision: export.owner.revision,
        fragment: export.fragment.map(|f| f.bundle),
        zombie: export.is_zombie(),
        importers,
    }
}

fn imported(state: &FrameworkState, import: &ImportPkg) -> ImportedPackage {
    let provider = import
        .provider
        .and_then(|id| state.registry.export(id))
        .map(|e| ProviderRef {
            bundle: e.owner.bundle,
            revision: e.owner.revision,
            version: e.version.to_string(),
        });
    ImportedPackage {
        name: import.name.clone(),
        range: import.range.to_string(),
        optional: import.optional,
        fragment: import.fragment.map(|f| f.bundle),
        provider,
    }
}

impl Framework {
    pub fn bundles(&self) -> Vec<BundleInfo> {
        let Ok(state) = self.read_state() else {
            return Vec::new();
        };
        state
            .bundles
            .keys()
            .filter_map(|id| bundle_info(&state, *id))
            .collect()
    }

    pub fn bundle(&self, id: BundleId) -> Option<BundleInfo> {
        let state = self.read_state().ok()?;
        bundle_info(&state, id)
    }

    pub fn bundle_state(&self, id: BundleId) -> Option<BundleState> {
        let state = self.read_state().ok()?;
        state.bundles.get(&id).map(|r| r.state)
    }

    /// Packages exported by any revision of the bundle, zombie revisions and
    /// fragment contributions included.
    pub fn exported_packages(&self, id: BundleId) -> KeelResult<Vec<ExportedPackage>> {
        let state = self.read_state()?;
        let mut keys = state.revisions_of(id);
        if keys.is_empty() {
            state.record(id)?;
        }
        keys.retain(|k| state.registry.is_registered(*k));
        Ok(keys
            .into_iter()
            .flat_map(|key| state.registry.exports_of(key).map(|e| exported(&state, e)).collect::<Vec<_>>())
            .collect())
    }

    /// Imports of the bundle's current revision with their providers.
    pub fn imported_packages(&self, id: BundleId) -> KeelResult<Vec<ImportedPackage>> {
        let state = self.read_state()?;
        let key = state.record(id)?.current;
        Ok(state
            .registry
            .imports_of(key)
            .map(|i| imported(&state, i))
            .collect())
    }

    pub fn required_bundles(&self, id: BundleId) -> KeelResult<Vec<RequiredBundle>> {
        let state = self.read_state()?;
        let key = state.record(id)?.current;
        Ok(state
            .registry
            .requires_of(key)
            .iter()
            .map(|w| RequiredBundle {
                name: w.name.clone(),
                bundle: w.target.bundle,
                revision: w.target.revision,
                reexport: w.reexport,
                fragment: w.fragment.map(|f| f.bundle),
            })
            .collect())
    }

    /// Fragments attached to the bundle's current revision.
    pub fn fragments(&self, id: BundleId) -> KeelResult<Vec<BundleId>> {
        let state = self.read_state()?;
        let key = state.record(id)?.current;
        Ok(state.registry.fragments_of(key).iter().map(|k| k.bundle).collect())
    }

    /// Hosts the fragment's current revision is attached to.
    pub fn hosts(&self, id: BundleId) -> KeelResult<Vec<BundleId>> {
        let state = self.read_state()?;
        let key = state.record(id)?.current;
        Ok(state.registry.hosts_of(key).iter().map(|k| k.bundle).collect())
    }

    pub fn package(&self, name: &str) -> Option<PackageInfo> {
        let state = self.read_state().ok()?;
        let pkg = state.registry.package(name)?;
        let providers = pkg
            .providers
            .iter()
            .filter_map(|id| state.registry.export(*id))
            .map(|e| exported(&state, e))
            .collect();
        let mut importers: Vec<BundleId> = pkg
            .importers
            .iter()
            .filter_map(|id| state.registry.import(*id))
            .map(|i| i.owner.bundle)
            .collect();
        importers.sort_unstable();
        importers.dedup();

        Some(PackageInfo {
            name: name.to_string(),
            providers,
            importers,
        })
    }

    pub fn packages(&self) -> Vec<String> {
        self.read_state()
            .map(|state| state.registry.package_names().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Revisions the framework holds for a bundle, oldest first.
    pub fn revisions(&self, id: BundleId) -> KeelResult<Vec<RevisionInfo>> {
        let state = self.read_state()?;
        let current = state.bundles.get(&id).map(|r| r.current);
        let keys = state.revisions_of(id);
        if keys.is_empty() {
            state.record(id)?;
        }
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                let slot = state.revisions.get(&key)?;
                Some(RevisionInfo {
                    revision: key.revision,
                    liveness: slot.liveness,
                    current: current == Some(key),
                    resolved: state.registry.is_resolved(key),
                    created_at: slot.revision.created_at(),
                })
            })
            .collect())
    }
}

fn bundle_info(state: &FrameworkState, id: BundleId) -> Option<BundleInfo> {
    let record = state.bundles.get(&id)?;
    let revision = state.revision(record.current)?;
    Some(BundleInfo {
        id,
        symbolic_name: revision.symbolic_name().to_string(),
        version: revision.version().to_string(),
        location: record.location.clone(),
        state: record.state,
        revision: record.current.revision,
        fragment: revision.is_fragment(),
        activator: revision.manifest().activator.clone(),
        last_modified: record.last_modified,
    })
}
