//! Package refresh: drop zombie revisions and rewire whatever depended on
//! them.
//!
//! A refresh runs on its own thread and reports through a ticket. Affected
//! bundles are stopped, unwired and brought back to `Installed`; zombie
//! revisions are removed from the registry and their storage purged once
//! the last reference is gone; then every affected bundle that still exists
//! is resolved again and restarted if it was active.

use super::{BundleEventKind, BundleState, Framework, FrameworkEvent};
use crate::core::{BundleId, KeelError, KeelResult, RevisionKey};
use crate::storage::{PurgeTarget, RevisionRef};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Every bundle touched by the refresh, including removed ones.
    pub refreshed: Vec<BundleId>,
    /// Bundles that could not be resolved or restarted afterwards.
    pub failed: Vec<(BundleId, String)>,
}

/// Completion handle of a running refresh.
#[must_use = "a refresh ticket reports completion and errors"]
pub struct RefreshTicket {
    rx: oneshot::Receiver<KeelResult<RefreshReport>>,
}

impl RefreshTicket {
    pub async fn wait(self) -> KeelResult<RefreshReport> {
        self.rx
            .await
            .map_err(|_| KeelError::InvalidState("refresh thread exited without a report".to_string()))?
    }

    /// Block the current thread until the refresh is done. Must not be
    /// called from inside an async runtime.
    pub fn wait_blocking(self) -> KeelResult<RefreshReport> {
        self.rx
            .blocking_recv()
            .map_err(|_| KeelError::InvalidState("refresh thread exited without a report".to_string()))?
    }
}

impl Framework {
    /// Refresh the given bundles, or every bundle with zombie revisions when
    /// `bundles` is `None`. Returns at once; the work happens on a
    /// background thread.
    pub fn refresh_packages(&self, bundles: Option<Vec<BundleId>>) -> KeelResult<RefreshTicket> {
        let (tx, rx) = oneshot::channel();
        let framework = self.clone();
        thread::Builder::new()
            .name("keel-refresh".to_string())
            .spawn(move || {
                let outcome = framework.run_refresh(bundles);
                if let Err(e) = &outcome {
                    warn!(error = %e, "refresh failed");
                    framework.events().framework(FrameworkEvent::Error {
                        bundle: None,
                        message: e.to_string(),
                    });
                }
                // The caller may have dropped the ticket.
                let _ = tx.send(outcome);
            })?;
        Ok(RefreshTicket { rx })
    }

    fn run_refresh(&self, targets: Option<Vec<BundleId>>) -> KeelResult<RefreshReport> {
        let _guard = Self::lock(&self.inner.refresh_lock)?;

        let (affected, active) = {
            let state = self.read_state()?;
            let roots: BTreeSet<BundleId> = match targets {
                Some(ids) => ids.into_iter().collect(),
                None => state.zombie_bundles(),
            };
            let affected = closure(&state, &roots);
            let active: Vec<BundleId> = affected
                .iter()
                .copied()
                .filter(|id| state.bundles.get(id).is_some_and(|r| r.state == BundleState::Active))
                .collect();
            (affected, active)
        };

        if affected.is_empty() {
            debug!("nothing to refresh");
            self.events()
                .framework(FrameworkEvent::PackagesRefreshed { bundles: Vec::new() });
            return Ok(RefreshReport::default());
        }
        info!(bundles = ?affected, "refreshing packages");

        let mut failed = Vec::new();
        for id in &active {
            if let Err(e) = self.stop(*id) {
                warn!(bundle = id, error = %e, "stop during refresh failed");
                failed.push((*id, e.to_string()));
            }
        }

        let (leases, dropped, unresolved) = self.unwire(&affected)?;
        drop(leases);
        for (key, revision) in dropped {
            drop(revision);
            let target = if self.read_state()?.bundles.contains_key(&key.bundle) {
                PurgeTarget::Revision(key)
            } else {
                PurgeTarget::Bundle(key.bundle)
            };
            self.purge_quietly(target);
        }
        for id in unresolved {
            self.events().bundle(BundleEventKind::Unresolved, id);
        }

        // Hosts before fragments, so fragments attach during host resolution.
        let (hosts, fragments): (Vec<BundleId>, Vec<BundleId>) = {
            let state = self.read_state()?;
            affected
                .iter()
                .copied()
                .filter(|id| state.bundles.contains_key(id))
                .partition(|id| state.current(*id).map_or(true, |rev| !rev.is_fragment()))
        };
        for id in hosts.iter().chain(fragments.iter()) {
            if self.bundle_state(*id) != Some(BundleState::Installed) {
                continue;
            }
            if let Err(e) = self.resolve(*id) {
                debug!(bundle = id, error = %e, "bundle did not resolve after refresh");
                failed.push((*id, e.to_string()));
            }
        }
        for id in active {
            if self.bundle_state(id) != Some(BundleState::Resolved) {
                continue;
            }
            if let Err(e) = self.start(id) {
                warn!(bundle = id, error = %e, "restart after refresh failed");
                failed.push((id, e.to_string()));
            }
        }

        let refreshed: Vec<BundleId> = affected.into_iter().collect();
        info!(bundles = ?refreshed, failures = failed.len(), "packages refreshed");
        self.events().framework(FrameworkEvent::PackagesRefreshed {
            bundles: refreshed.clone(),
        });
        Ok(RefreshReport { refreshed, failed })
    }

    /// Unwire every revision of the affected bundles and drop zombie
    /// revisions. Returns the released leases, the dropped revisions and the
    /// bundles that went back to `Installed`.
    #[allow(clippy::type_complexity)]
    fn unwire(
        &self,
        affected: &BTreeSet<BundleId>,
    ) -> KeelResult<(
        Vec<RevisionRef>,
        Vec<(RevisionKey, Arc<super::BundleRevision>)>,
        Vec<BundleId>,
    )> {
        let mut state = self.write_state()?;
        let mut leases = Vec::new();
        let mut dropped = Vec::new();
        let mut unresolved = Vec::new();

        let keys: Vec<RevisionKey> = affected
            .iter()
            .flat_map(|id| state.revisions_of(*id))
            .collect();
        for key in &keys {
            leases.extend(state.registry.unwire_revision(*key));
        }
        for key in keys {
            let live = state.bundles.get(&key.bundle).is_some_and(|r| r.current == key);
            if live {
                continue;
            }
            leases.extend(state.registry.unregister_revision(key));
            if let Some(slot) = state.revisions.remove(&key) {
                debug!(bundle = key.bundle, revision = key.revision, "dropped zombie revision");
                dropped.push((key, slot.revision));
            }
        }

        for id in affected {
            if let Some(record) = state.bundles.get_mut(id) {
                if record.state == BundleState::Resolved {
                    record.state = BundleState::Installed;
                    unresolved.push(*id);
                }
            }
        }
        state.generation += 1;
        Ok((leases, dropped, unresolved))
    }
}

/// The refresh set: the roots plus everything wired to any of their
/// revisions, fragments and hosts included, to a fixpoint.
fn closure(state: &super::state::FrameworkState, roots: &BTreeSet<BundleId>) -> BTreeSet<BundleId> {
    let mut affected = BTreeSet::new();
    let mut queue: Vec<BundleId> = roots
        .iter()
        .copied()
        .filter(|id| state.bundles.contains_key(id) || !state.revisions_of(*id).is_empty())
        .collect();

    while let Some(id) = queue.pop() {
        if !affected.insert(id) {
            continue;
        }
        for key in state.revisions_of(id) {
            let registry = &state.registry;
            let related = registry
                .dependents_of(key)
                .into_iter()
                .chain(registry.fragments_of(key).iter().copied())
                .chain(registry.hosts_of(key).iter().copied());
            for other in related {
                if !affected.contains(&other.bundle) {
                    queue.push(other.bundle);
                }
            }
        }
    }
    affected
}
