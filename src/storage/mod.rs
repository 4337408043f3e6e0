//! Revisioned bundle storage.
//!
//! [`ArchiveStore`] owns the revision bookkeeping (active pointer, pending
//! updates, zombie revisions, reference counts) and delegates the bytes to a
//! [`StorageBackend`]. Both backends share one contract; which one is used is
//! a deployment decision invisible to the resolver and the framework.

pub mod content;
pub mod file;
pub mod memory;

pub use content::BundleContent;
pub use file::FileBackend;
pub use memory::MemoryBackend;

use crate::core::{BundleId, KeelError, KeelResult, Liveness, RevisionKey, RevisionNumber};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// A bundle found in persistent storage at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredBundle {
    pub id: BundleId,
    pub location: String,
    pub revision: RevisionNumber,
    pub stored_at: DateTime<Utc>,
}

/// Byte-level storage of bundle revisions.
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Reject content this backend cannot hold. Called before an id or a
    /// revision number is allocated.
    fn check_content(&self, content: &BundleContent) -> KeelResult<()>;

    /// Allocate a fresh bundle id. Ids are never reused.
    fn allocate_id(&self) -> KeelResult<BundleId>;

    fn write_revision(
        &self,
        key: RevisionKey,
        location: &str,
        content: &BundleContent,
    ) -> KeelResult<()>;

    /// Atomically make `key` the committed revision of its bundle.
    fn set_active(&self, key: RevisionKey) -> KeelResult<()>;

    fn read_entry(&self, key: RevisionKey, path: &str) -> KeelResult<Option<Vec<u8>>>;

    fn entry_names(&self, key: RevisionKey) -> KeelResult<Vec<String>>;

    fn delete_revision(&self, key: RevisionKey) -> KeelResult<()>;

    fn delete_bundle(&self, id: BundleId) -> KeelResult<()>;

    /// Bundles that survived a previous run, with their committed revision.
    /// Stale revisions are removed as part of recovery.
    fn recover(&self) -> KeelResult<Vec<RecoveredBundle>>;
}

/// Result of an `insert` or a `commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRevision {
    pub key: RevisionKey,
    pub location: String,
    /// Revision that was active before a commit.
    pub previous: Option<RevisionNumber>,
}

/// A written but not yet committed revision.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a pending revision must be committed or discarded"]
pub struct PendingRevision {
    key: RevisionKey,
}

impl PendingRevision {
    pub fn key(&self) -> RevisionKey {
        self.key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeTarget {
    Bundle(BundleId),
    Revision(RevisionKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeStatus {
    Purged,
    /// Still referenced; storage goes away when the last reference drops.
    Deferred,
}

#[derive(Debug)]
struct SlotRevision {
    liveness: Liveness,
    refs: usize,
    purge_requested: bool,
}

impl SlotRevision {
    fn new() -> Self {
        Self {
            liveness: Liveness::Active,
            refs: 0,
            purge_requested: false,
        }
    }
}

#[derive(Debug)]
struct BundleSlot {
    location: String,
    active: RevisionNumber,
    next_revision: RevisionNumber,
    pending: Option<RevisionNumber>,
    revisions: BTreeMap<RevisionNumber, SlotRevision>,
    removed: bool,
}

struct StoreInner {
    backend: Box<dyn StorageBackend>,
    bundles: Mutex<HashMap<BundleId, BundleSlot>>,
}

impl StoreInner {
    fn slots(&self) -> KeelResult<MutexGuard<'_, HashMap<BundleId, BundleSlot>>> {
        self.bundles
            .lock()
            .map_err(|_| KeelError::Storage("archive store lock poisoned".to_string()))
    }

    /// Delete the backend data of revisions whose purge is due. Runs
    /// without the slot lock held.
    fn reclaim(&self, revisions: Vec<RevisionKey>, bundles: Vec<BundleId>) {
        for key in revisions {
            match self.backend.delete_revision(key) {
                Ok(()) => debug!(bundle = key.bundle, revision = key.revision, "purged revision"),
                Err(e) => warn!(bundle = key.bundle, revision = key.revision, error = %e, "failed to purge revision"),
            }
        }
        for id in bundles {
            match self.backend.delete_bundle(id) {
                Ok(()) => debug!(bundle = id, "purged bundle storage"),
                Err(e) => warn!(bundle = id, error = %e, "failed to purge bundle storage"),
            }
        }
    }

    fn release(&self, key: RevisionKey) {
        let mut due_revisions = Vec::new();
        let mut due_bundles = Vec::new();
        {
            let Ok(mut slots) = self.slots() else {
                return;
            };
            let Some(slot) = slots.get_mut(&key.bundle) else {
                return;
            };
            if let Some(rev) = slot.revisions.get_mut(&key.revision) {
                rev.refs = rev.refs.saturating_sub(1);
                if rev.refs == 0 && rev.purge_requested {
                    slot.revisions.remove(&key.revision);
                    due_revisions.push(key);
                }
            }
            if slot.removed && slot.revisions.is_empty() {
                slots.remove(&key.bundle);
                due_bundles.push(key.bundle);
            }
        }
        self.reclaim(due_revisions, due_bundles);
    }
}

/// Reference to a stored revision. While any reference exists the
/// revision's storage is kept, even after it was purged.
pub struct RevisionRef {
    inner: Arc<StoreInner>,
    key: RevisionKey,
}

impl RevisionRef {
    pub fn key(&self) -> RevisionKey {
        self.key
    }
}

impl Clone for RevisionRef {
    fn clone(&self) -> Self {
        if let Ok(mut slots) = self.inner.slots() {
            if let Some(rev) = slots
                .get_mut(&self.key.bundle)
                .and_then(|slot| slot.revisions.get_mut(&self.key.revision))
            {
                rev.refs += 1;
            }
        }
        Self {
            inner: Arc::clone(&self.inner),
            key: self.key,
        }
    }
}

impl Drop for RevisionRef {
    fn drop(&mut self) {
        self.inner.release(self.key);
    }
}

impl std::fmt::Debug for RevisionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionRef").field("key", &self.key).finish()
    }
}

/// Shared handle to the revisioned bundle store.
#[derive(Clone)]
pub struct ArchiveStore {
    inner: Arc<StoreInner>,
}

impl ArchiveStore {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                bundles: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    pub fn backend_kind(&self) -> &'static str {
        self.inner.backend.kind()
    }

    /// Load bundles persisted by a previous run.
    pub fn recover(&self) -> KeelResult<Vec<RecoveredBundle>> {
        let recovered = self.inner.backend.recover()?;
        let mut slots = self.inner.slots()?;
        for bundle in &recovered {
            let mut revisions = BTreeMap::new();
            revisions.insert(bundle.revision, SlotRevision::new());
            slots.insert(
                bundle.id,
                BundleSlot {
                    location: bundle.location.clone(),
                    active: bundle.revision,
                    next_revision: bundle.revision + 1,
                    pending: None,
                    revisions,
                    removed: false,
                },
            );
        }
        Ok(recovered)
    }

    /// Store a new bundle. Allocates its id; revision 0 is active at once.
    pub fn insert(&self, location: &str, content: &BundleContent) -> KeelResult<StoredRevision> {
        let backend = &self.inner.backend;
        backend.check_content(content)?;

        let id = backend.allocate_id()?;
        let key = RevisionKey::new(id, 0);
        let written = backend
            .write_revision(key, location, content)
            .and_then(|()| backend.set_active(key));
        if let Err(e) = written {
            if let Err(cleanup) = backend.delete_bundle(id) {
                warn!(bundle = id, error = %cleanup, "failed to clean up after failed insert");
            }
            return Err(e);
        }

        let mut revisions = BTreeMap::new();
        revisions.insert(0, SlotRevision::new());
        self.inner.slots()?.insert(
            id,
            BundleSlot {
                location: location.to_string(),
                active: 0,
                next_revision: 1,
                pending: None,
                revisions,
                removed: false,
            },
        );

        debug!(bundle = id, location, backend = backend.kind(), "stored bundle");
        Ok(StoredRevision {
            key,
            location: location.to_string(),
            previous: None,
        })
    }

    /// Write a new revision next to the active one. The active revision is
    /// untouched until [`ArchiveStore::commit`].
    pub fn update(&self, id: BundleId, content: &BundleContent) -> KeelResult<PendingRevision> {
        let backend = &self.inner.backend;
        backend.check_content(content)?;

        let (key, location, stale) = {
            let mut slots = self.inner.slots()?;
            let slot = slots
                .get_mut(&id)
                .filter(|s| !s.removed)
                .ok_or(KeelError::UnknownBundle(id))?;
            let stale = slot.pending.take();
            if let Some(rev) = stale {
                slot.revisions.remove(&rev);
            }
            let revision = slot.next_revision;
            slot.next_revision += 1;
            slot.pending = Some(revision);
            slot.revisions.insert(revision, SlotRevision::new());
            (RevisionKey::new(id, revision), slot.location.clone(), stale)
        };

        if let Some(rev) = stale {
            self.inner.reclaim(vec![RevisionKey::new(id, rev)], Vec::new());
        }

        if let Err(e) = backend.write_revision(key, &location, content) {
            self.forget_pending(key);
            if let Err(cleanup) = backend.delete_revision(key) {
                warn!(bundle = id, revision = key.revision, error = %cleanup, "failed to clean up after failed update");
            }
            return Err(e);
        }

        debug!(bundle = id, revision = key.revision, "wrote pending revision");
        Ok(PendingRevision { key })
    }

    /// Swap the active pointer to the pending revision. The previously
    /// active revision becomes a zombie and stays readable.
    pub fn commit(&self, pending: PendingRevision) -> KeelResult<StoredRevision> {
        let key = pending.key;
        {
            let slots = self.inner.slots()?;
            let slot = slots.get(&key.bundle).ok_or(KeelError::UnknownBundle(key.bundle))?;
            if slot.pending != Some(key.revision) {
                return Err(KeelError::Storage(format!(
                    "revision {} is no longer pending",
                    key
                )));
            }
        }

        self.inner.backend.set_active(key)?;

        let mut slots = self.inner.slots()?;
        let slot = slots
            .get_mut(&key.bundle)
            .ok_or(KeelError::UnknownBundle(key.bundle))?;
        let previous = slot.active;
        slot.active = key.revision;
        slot.pending = None;
        if let Some(old) = slot.revisions.get_mut(&previous) {
            old.liveness = Liveness::Zombie;
        }

        debug!(bundle = key.bundle, revision = key.revision, previous, "committed revision");
        Ok(StoredRevision {
            key,
            location: slot.location.clone(),
            previous: Some(previous),
        })
    }

    /// Reject content this store cannot hold, without touching anything.
    pub fn check_content(&self, content: &BundleContent) -> KeelResult<()> {
        self.inner.backend.check_content(content)
    }

    /// Mark every revision of an uninstalled bundle as a zombie. The
    /// revisions stay readable until they are purged.
    pub fn retire(&self, id: BundleId) -> KeelResult<()> {
        let mut slots = self.inner.slots()?;
        let slot = slots.get_mut(&id).ok_or(KeelError::UnknownBundle(id))?;
        for rev in slot.revisions.values_mut() {
            if rev.liveness == Liveness::Active {
                rev.liveness = Liveness::Zombie;
            }
        }
        debug!(bundle = id, "retired bundle storage");
        Ok(())
    }

    /// Throw away a pending revision.
    pub fn discard(&self, pending: PendingRevision) -> KeelResult<()> {
        self.forget_pending(pending.key);
        self.inner.backend.delete_revision(pending.key)
    }

    fn forget_pending(&self, key: RevisionKey) {
        if let Ok(mut slots) = self.inner.slots() {
            if let Some(slot) = slots.get_mut(&key.bundle) {
                if slot.pending == Some(key.revision) {
                    slot.pending = None;
                }
                slot.revisions.remove(&key.revision);
            }
        }
    }

    /// Take a reference on a revision so its storage outlives a purge.
    pub fn acquire(&self, key: RevisionKey) -> KeelResult<RevisionRef> {
        let mut slots = self.inner.slots()?;
        let rev = slots
            .get_mut(&key.bundle)
            .and_then(|slot| slot.revisions.get_mut(&key.revision))
            .filter(|rev| rev.liveness != Liveness::Purged && !rev.purge_requested)
            .ok_or_else(|| KeelError::Storage(format!("revision {} is not available", key)))?;
        rev.refs += 1;
        Ok(RevisionRef {
            inner: Arc::clone(&self.inner),
            key,
        })
    }

    /// Remove storage for a revision or a whole bundle. Referenced revisions
    /// are marked and removed when their last reference drops.
    pub fn purge(&self, target: PurgeTarget) -> KeelResult<PurgeStatus> {
        let mut due_revisions = Vec::new();
        let mut due_bundles = Vec::new();
        let status = {
            let mut slots = self.inner.slots()?;
            let id = match target {
                PurgeTarget::Bundle(id) => id,
                PurgeTarget::Revision(key) => key.bundle,
            };
            let Some(slot) = slots.get_mut(&id) else {
                return Ok(PurgeStatus::Purged);
            };

            let targets: Vec<RevisionNumber> = match target {
                PurgeTarget::Bundle(_) => {
                    slot.removed = true;
                    slot.pending = None;
                    slot.revisions.keys().copied().collect()
                }
                PurgeTarget::Revision(key) => {
                    if !slot.removed && key.revision == slot.active {
                        return Err(KeelError::InvalidState(format!(
                            "revision {} is the active revision of an installed bundle",
                            key
                        )));
                    }
                    vec![key.revision]
                }
            };

            let mut deferred = false;
            for revision in targets {
                let Some(rev) = slot.revisions.get_mut(&revision) else {
                    continue;
                };
                if rev.refs > 0 {
                    rev.liveness = Liveness::Zombie;
                    rev.purge_requested = true;
                    deferred = true;
                } else {
                    slot.revisions.remove(&revision);
                    due_revisions.push(RevisionKey::new(id, revision));
                }
            }

            if slot.removed && slot.revisions.is_empty() {
                slots.remove(&id);
                due_bundles.push(id);
            }

            if deferred {
                PurgeStatus::Deferred
            } else {
                PurgeStatus::Purged
            }
        };

        if status == PurgeStatus::Deferred {
            debug!(?target, "purge deferred until references drop");
        }
        self.inner.reclaim(due_revisions, due_bundles);
        Ok(status)
    }

    pub fn read_entry(&self, key: RevisionKey, path: &str) -> KeelResult<Option<Vec<u8>>> {
        if self.revision_state(key) == Liveness::Purged {
            return Err(KeelError::Storage(format!("revision {} has been purged", key)));
        }
        self.inner.backend.read_entry(key, path)
    }

    pub fn entry_names(&self, key: RevisionKey) -> KeelResult<Vec<String>> {
        if self.revision_state(key) == Liveness::Purged {
            return Err(KeelError::Storage(format!("revision {} has been purged", key)));
        }
        self.inner.backend.entry_names(key)
    }

    /// Purged when the revision is unknown.
    pub fn revision_state(&self, key: RevisionKey) -> Liveness {
        self.inner
            .slots()
            .ok()
            .and_then(|slots| {
                slots
                    .get(&key.bundle)
                    .and_then(|slot| slot.revisions.get(&key.revision))
                    .map(|rev| rev.liveness)
            })
            .unwrap_or(Liveness::Purged)
    }

    /// Number of live references on a revision.
    pub fn ref_count(&self, key: RevisionKey) -> usize {
        self.inner
            .slots()
            .ok()
            .and_then(|slots| {
                slots
                    .get(&key.bundle)
                    .and_then(|slot| slot.revisions.get(&key.revision))
                    .map(|rev| rev.refs)
            })
            .unwrap_or(0)
    }

    pub fn active_revision(&self, id: BundleId) -> Option<RevisionNumber> {
        let slots = self.inner.slots().ok()?;
        slots.get(&id).filter(|s| !s.removed).map(|s| s.active)
    }

    pub fn location(&self, id: BundleId) -> Option<String> {
        let slots = self.inner.slots().ok()?;
        slots.get(&id).map(|s| s.location.clone())
    }

    /// Ids of bundles with storage, including removed bundles whose
    /// revisions are still referenced.
    pub fn bundles(&self) -> Vec<BundleId> {
        let mut ids: Vec<BundleId> = self
            .inner
            .slots()
            .map(|slots| slots.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Revisions currently held for a bundle, in ascending order.
    pub fn revisions(&self, id: BundleId) -> Vec<RevisionNumber> {
        self.inner
            .slots()
            .ok()
            .and_then(|slots| slots.get(&id).map(|s| s.revisions.keys().copied().collect()))
            .unwrap_or_default()
    }
}
