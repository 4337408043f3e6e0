//! Class and resource lookup through a bundle's wiring.
//!
//! The search path is computed under the state read lock as a list of
//! archives; the reads themselves happen after the lock is released. The
//! archives hold storage references, so a concurrent refresh cannot pull the
//! bytes out from under a lookup in progress.

use super::state::FrameworkState;
use super::Framework;
use crate::archive::{class_to_path, package_of_class, package_of_path, simple_name, BundleArchive};
use crate::core::{BundleId, KeelResult, RevisionKey};
use crate::package::PackageFilter;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

/// Archives to search, with the export filter that applies to them.
struct Step {
    archives: Vec<Arc<BundleArchive>>,
    filter: Option<PackageFilter>,
}

/// A revision's own archive followed by its attached fragments.
fn effective_archives(state: &FrameworkState, key: RevisionKey) -> Vec<Arc<BundleArchive>> {
    std::iter::once(key)
        .chain(state.registry.fragments_of(key).iter().copied())
        .filter_map(|k| state.revision(k).map(|rev| Arc::clone(rev.archive())))
        .collect()
}

/// Exports of `package` visible through the bundles `key` requires,
/// following reexported requirements.
fn through_requires(state: &FrameworkState, key: RevisionKey, package: &str, steps: &mut Vec<Step>) {
    let mut seen = BTreeSet::new();
    let mut queue: Vec<RevisionKey> = state
        .registry
        .requires_of(key)
        .iter()
        .map(|w| w.target)
        .collect();
    queue.reverse();

    while let Some(target) = queue.pop() {
        if !seen.insert(target) {
            continue;
        }
        for export in state.registry.exports_of(target).filter(|e| e.name == package) {
            steps.push(Step {
                archives: effective_archives(state, export.owner),
                filter: Some(export.filter.clone()),
            });
        }
        let mut reexported: Vec<RevisionKey> = state
            .registry
            .requires_of(target)
            .iter()
            .filter(|w| w.reexport)
            .map(|w| w.target)
            .collect();
        reexported.reverse();
        queue.extend(reexported);
    }
}

fn search_path(state: &FrameworkState, id: BundleId, package: &str) -> KeelResult<Vec<Step>> {
    let key = state.record(id)?.current;
    let own = Step {
        archives: effective_archives(state, key),
        filter: None,
    };
    if !state.registry.is_resolved(key) || package.is_empty() {
        return Ok(vec![own]);
    }

    if let Some(import) = state.registry.imports_of(key).find(|i| i.name == package) {
        let steps = import
            .provider
            .and_then(|p| state.registry.export(p))
            .map(|export| Step {
                archives: effective_archives(state, export.owner),
                filter: Some(export.filter.clone()),
            })
            .into_iter()
            .collect();
        return Ok(steps);
    }

    let mut steps = Vec::new();
    through_requires(state, key, package, &mut steps);
    steps.push(own);
    Ok(steps)
}

fn first_match(
    steps: Vec<Step>,
    path: &str,
    class_simple_name: Option<&str>,
) -> KeelResult<Option<Vec<u8>>> {
    for step in steps {
        if let (Some(filter), Some(name)) = (&step.filter, class_simple_name) {
            if !filter.allows(name) {
                trace!(class = name, "filtered by export");
                continue;
            }
        }
        for archive in &step.archives {
            if let Some(bytes) = archive.get_resource(path)? {
                return Ok(Some(bytes));
            }
        }
    }
    Ok(None)
}

impl Framework {
    /// Bytes of a class as seen by the bundle: through its imports, then
    /// its required bundles, then its own classpath and fragments.
    pub fn get_class_bytes(&self, id: BundleId, class_name: &str) -> KeelResult<Option<Vec<u8>>> {
        let path = class_to_path(class_name);
        let steps = {
            let state = self.read_state()?;
            search_path(&state, id, package_of_class(class_name))?
        };
        let simple = simple_name(&path).trim_end_matches(".class");
        first_match(steps, &path, Some(simple))
    }

    /// A resource as seen by the bundle. Follows the same delegation as
    /// classes; export filters do not apply.
    pub fn get_resource(&self, id: BundleId, path: &str) -> KeelResult<Option<Vec<u8>>> {
        let steps = {
            let state = self.read_state()?;
            search_path(&state, id, &package_of_path(path))?
        };
        first_match(steps, path, None)
    }

    /// A raw entry of the bundle's current revision.
    pub fn get_entry(&self, id: BundleId, path: &str) -> KeelResult<Option<Vec<u8>>> {
        let archive = {
            let state = self.read_state()?;
            Arc::clone(state.current(id)?.archive())
        };
        archive.get_entry(path)
    }
}
