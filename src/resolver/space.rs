//! Package spaces and `uses` consistency.

use super::{ExportRef, ResolveView, Resolver};
use crate::core::{BundleId, RevisionKey};
use std::collections::{BTreeMap, BTreeSet};

impl<'a, V: ResolveView> Resolver<'a, V> {
    /// Where `package` comes from in the space of `key`, as wired so far:
    /// an import's provider, else its own export, else a required bundle.
    pub(super) fn space_source(&self, key: RevisionKey, package: &str) -> Option<ExportRef> {
        let imports = self.imports_in(key);
        if let Some(import) = imports
            .into_iter()
            .find(|i| self.import(*i).is_some_and(|i| i.name == package))
        {
            return self.provider_of(import);
        }

        if let Some(own) = self
            .exports_in(key)
            .into_iter()
            .find(|e| self.export(*e).is_some_and(|e| e.name == package))
        {
            return Some(own);
        }

        let mut visited = BTreeSet::new();
        self.requires_in(key)
            .into_iter()
            .find_map(|w| self.visible_through(w.target, package, &mut visited))
    }

    /// Exports of a required bundle, following its reexported requires.
    pub(super) fn visible_through(
        &self,
        target: RevisionKey,
        package: &str,
        visited: &mut BTreeSet<RevisionKey>,
    ) -> Option<ExportRef> {
        if !visited.insert(target) {
            return None;
        }
        if let Some(own) = self
            .exports_in(target)
            .into_iter()
            .find(|e| self.export(*e).is_some_and(|e| e.name == package))
        {
            return Some(own);
        }
        self.requires_in(target)
            .into_iter()
            .filter(|w| w.reexport)
            .find_map(|w| self.visible_through(w.target, package, visited))
    }

    /// The export itself plus the sources its `uses` list implies, followed
    /// transitively through each source owner's space.
    pub(super) fn implied_sources(&self, start: ExportRef) -> BTreeMap<String, ExportRef> {
        let mut implied = BTreeMap::new();
        let Some(first) = self.export(start) else {
            return implied;
        };
        implied.insert(first.name.clone(), start);

        let mut pending = vec![start];
        while let Some(current) = pending.pop() {
            let Some(export) = self.export(current) else {
                continue;
            };
            for used in &export.uses {
                if implied.contains_key(used) {
                    continue;
                }
                if let Some(source) = self.space_source(export.owner, used) {
                    implied.insert(used.clone(), source);
                    pending.push(source);
                }
            }
        }
        implied
    }

    /// Source already fixed for `package` in the space of `key`.
    fn fixed_source(&self, key: RevisionKey, package: &str) -> Option<ExportRef> {
        self.txn
            .constraints
            .get(&key)
            .and_then(|c| c.get(package))
            .copied()
            .or_else(|| self.space_source(key, package))
    }

    /// Check a candidate against the space of `key`. On success returns the
    /// implications to record; on conflict the bundles involved.
    pub(super) fn check_consistent(
        &self,
        key: RevisionKey,
        candidate: ExportRef,
    ) -> Result<BTreeMap<String, ExportRef>, Vec<BundleId>> {
        let implied = self.implied_sources(candidate);
        let mut conflicting = BTreeSet::new();

        for (package, source) in &implied {
            let Some(existing) = self.fixed_source(key, package) else {
                continue;
            };
            let (Some(existing_owner), Some(source_owner)) = (self.owner(existing), self.owner(*source))
            else {
                continue;
            };
            if existing_owner != source_owner {
                conflicting.insert(source_owner.bundle);
                conflicting.insert(existing_owner.bundle);
            }
        }

        if conflicting.is_empty() {
            Ok(implied)
        } else {
            if let Some(owner) = self.owner(candidate) {
                conflicting.insert(owner.bundle);
            }
            Err(conflicting.into_iter().collect())
        }
    }
}
