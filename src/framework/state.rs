//! Bundle table, revision table and registry, guarded together by the
//! framework's state lock.

use super::revision::BundleRevision;
use crate::core::{BundleId, KeelError, KeelResult, Liveness, RevisionKey, Version};
use crate::package::PackageRegistry;
use crate::resolver::ResolveView;
use crate::storage::RevisionRef;
use chrono::{DateTime, Utc};
use keel_core::manifest::BundleManifest;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleState {
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

impl BundleState {
    /// Resolved, or further along the lifecycle.
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            BundleState::Resolved | BundleState::Starting | BundleState::Active | BundleState::Stopping
        )
    }
}

impl fmt::Display for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BundleState::Installed => "installed",
            BundleState::Resolved => "resolved",
            BundleState::Starting => "starting",
            BundleState::Active => "active",
            BundleState::Stopping => "stopping",
            BundleState::Uninstalled => "uninstalled",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub(crate) struct BundleRecord {
    pub location: String,
    pub state: BundleState,
    pub current: RevisionKey,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct RevisionSlot {
    pub revision: Arc<BundleRevision>,
    pub liveness: Liveness,
}

/// What is left to release after a revision was retired.
#[derive(Default)]
pub(crate) struct Retired {
    pub leases: Vec<RevisionRef>,
    pub revision: Option<Arc<BundleRevision>>,
    /// Storage can go now; otherwise the revision lives on as a zombie.
    pub purge: bool,
}

#[derive(Default)]
pub(crate) struct FrameworkState {
    pub bundles: BTreeMap<BundleId, BundleRecord>,
    pub revisions: BTreeMap<RevisionKey, RevisionSlot>,
    pub registry: PackageRegistry,
    /// Bumped by every change that can invalidate a computed resolution.
    pub generation: u64,
}

impl FrameworkState {
    pub fn record(&self, id: BundleId) -> KeelResult<&BundleRecord> {
        self.bundles.get(&id).ok_or(KeelError::UnknownBundle(id))
    }

    pub fn record_mut(&mut self, id: BundleId) -> KeelResult<&mut BundleRecord> {
        self.bundles.get_mut(&id).ok_or(KeelError::UnknownBundle(id))
    }

    pub fn revision(&self, key: RevisionKey) -> Option<&Arc<BundleRevision>> {
        self.revisions.get(&key).map(|slot| &slot.revision)
    }

    pub fn current(&self, id: BundleId) -> KeelResult<&Arc<BundleRevision>> {
        let key = self.record(id)?.current;
        self.revision(key)
            .ok_or_else(|| KeelError::InvalidState(format!("revision {} is missing", key)))
    }

    pub fn find_location(&self, location: &str) -> Option<BundleId> {
        self.bundles
            .iter()
            .find(|(_, r)| r.location == location)
            .map(|(id, _)| *id)
    }

    /// Installed bundle other than `except` with this name and version.
    pub fn find_duplicate(&self, name: &str, version: &Version, except: Option<BundleId>) -> Option<BundleId> {
        self.bundles
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .find(|(_, r)| {
                self.revision(r.current)
                    .is_some_and(|rev| rev.symbolic_name() == name && rev.version() == version)
            })
            .map(|(id, _)| *id)
    }

    /// Every revision held for a bundle, current and zombie.
    pub fn revisions_of(&self, id: BundleId) -> Vec<RevisionKey> {
        self.revisions
            .range(RevisionKey::new(id, 0)..=RevisionKey::new(id, u32::MAX))
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn zombie_bundles(&self) -> BTreeSet<BundleId> {
        self.revisions
            .iter()
            .filter(|(_, slot)| slot.liveness.is_zombie())
            .map(|(k, _)| k.bundle)
            .collect()
    }

    /// Take a superseded revision out of service. If anything still wires
    /// to it, it stays as a zombie until a refresh; otherwise it is dropped
    /// from the registry at once.
    pub fn retire_revision(&mut self, key: RevisionKey) -> Retired {
        if self.registry.has_external_dependents(key) {
            self.registry.mark_zombie(key);
            if let Some(slot) = self.revisions.get_mut(&key) {
                slot.liveness = Liveness::Zombie;
            }
            return Retired::default();
        }

        let leases = self.registry.unregister_revision(key);
        let revision = self.revisions.remove(&key).map(|slot| slot.revision);
        Retired {
            leases,
            revision,
            purge: true,
        }
    }

    /// Align fragment bundle states with whether they are attached anywhere.
    /// Returns the fragments whose state changed.
    pub fn sync_fragment_states(&mut self) -> Vec<(BundleId, BundleState)> {
        let mut changed = Vec::new();
        for (id, record) in self.bundles.iter_mut() {
            let Some(slot) = self.revisions.get(&record.current) else {
                continue;
            };
            if !slot.revision.is_fragment() {
                continue;
            }
            let attached = self.registry.is_resolved(record.current);
            let next = match (record.state, attached) {
                (BundleState::Installed, true) => BundleState::Resolved,
                (BundleState::Resolved, false) => BundleState::Installed,
                _ => continue,
            };
            record.state = next;
            changed.push((*id, next));
        }
        changed
    }
}

impl ResolveView for FrameworkState {
    fn manifest(&self, key: RevisionKey) -> Option<&BundleManifest> {
        self.revision(key).map(|rev| rev.manifest())
    }

    fn live_revisions(&self) -> Vec<RevisionKey> {
        self.bundles.values().map(|r| r.current).collect()
    }

    fn is_live(&self, key: RevisionKey) -> bool {
        self.bundles
            .get(&key.bundle)
            .is_some_and(|r| r.current == key)
    }

    fn is_active(&self, key: RevisionKey) -> bool {
        self.bundles
            .get(&key.bundle)
            .is_some_and(|r| r.current == key && matches!(r.state, BundleState::Starting | BundleState::Active))
    }
}
