//! Bundle lifecycle.
//!
//! [`Framework`] is a cheap handle around shared state. The bundle table,
//! revision table and package registry sit behind one `RwLock`; the archive
//! store keeps its own lock and is always taken after the state lock.
//! Resolutions are serialized by `resolve_lock`, computed under the read
//! lock and committed under the write lock only if the state generation
//! did not move in between.

pub mod events;
pub mod hook;
mod loader;
pub mod query;
pub mod refresh;
pub mod revision;
pub mod state;

pub use events::{BundleEvent, BundleEventKind, Event, EventBus, FrameworkEvent};
pub use hook::ActivationHook;
pub use query::{BundleInfo, ExportedPackage, ImportedPackage, PackageInfo, ProviderRef, RequiredBundle, RevisionInfo};
pub use refresh::{RefreshReport, RefreshTicket};
pub use revision::BundleRevision;
pub use state::BundleState;

use crate::config::{FrameworkConfig, StorageKind};
use crate::core::{BundleId, KeelError, KeelResult, Liveness, RevisionKey};
use crate::resolver::{ExportRef, ImportRef, ResolutionPlan, Resolver};
use crate::storage::{ArchiveStore, BundleContent, FileBackend, MemoryBackend, PurgeTarget, StorageBackend};
use chrono::Utc;
use state::{BundleRecord, FrameworkState, RevisionSlot};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub(crate) struct FrameworkInner {
    config: FrameworkConfig,
    store: ArchiveStore,
    state: RwLock<FrameworkState>,
    resolve_lock: Mutex<()>,
    refresh_lock: Mutex<()>,
    events: EventBus,
    hook: Option<Arc<dyn ActivationHook>>,
}

/// Handle to a running module framework.
#[derive(Clone)]
pub struct Framework {
    inner: Arc<FrameworkInner>,
}

impl Framework {
    /// Open a framework, recovering bundles from file storage.
    pub fn new(config: FrameworkConfig) -> KeelResult<Self> {
        Self::open(config, None)
    }

    pub fn with_hook(config: FrameworkConfig, hook: Arc<dyn ActivationHook>) -> KeelResult<Self> {
        Self::open(config, Some(hook))
    }

    pub fn in_memory() -> Self {
        let config = FrameworkConfig::in_memory();
        let events = EventBus::new(config.event_capacity);
        Self::assemble(config, ArchiveStore::in_memory(), FrameworkState::default(), events, None)
    }

    fn open(config: FrameworkConfig, hook: Option<Arc<dyn ActivationHook>>) -> KeelResult<Self> {
        let backend: Box<dyn StorageBackend> = match config.storage {
            StorageKind::File => {
                let dir = config.storage_dir()?;
                if config.clean_on_start && dir.exists() {
                    info!(dir = %dir.display(), "cleaning bundle storage");
                    fs::remove_dir_all(&dir)?;
                }
                Box::new(FileBackend::new(dir, config.always_unpack)?)
            }
            StorageKind::Memory => Box::new(MemoryBackend::new()),
        };
        let store = ArchiveStore::new(backend);
        let state = recover_state(&store)?;
        let events = EventBus::new(config.event_capacity);

        info!(
            backend = store.backend_kind(),
            bundles = state.bundles.len(),
            "framework started"
        );
        Ok(Self::assemble(config, store, state, events, hook))
    }

    fn assemble(
        config: FrameworkConfig,
        store: ArchiveStore,
        state: FrameworkState,
        events: EventBus,
        hook: Option<Arc<dyn ActivationHook>>,
    ) -> Self {
        Self {
            inner: Arc::new(FrameworkInner {
                config,
                store,
                state: RwLock::new(state),
                resolve_lock: Mutex::new(()),
                refresh_lock: Mutex::new(()),
                events,
                hook,
            }),
        }
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub(crate) fn read_state(&self) -> KeelResult<RwLockReadGuard<'_, FrameworkState>> {
        self.inner
            .state
            .read()
            .map_err(|_| KeelError::Storage("framework state lock poisoned".to_string()))
    }

    pub(crate) fn write_state(&self) -> KeelResult<RwLockWriteGuard<'_, FrameworkState>> {
        self.inner
            .state
            .write()
            .map_err(|_| KeelError::Storage("framework state lock poisoned".to_string()))
    }

    fn lock(mutex: &Mutex<()>) -> KeelResult<MutexGuard<'_, ()>> {
        mutex
            .lock()
            .map_err(|_| KeelError::Storage("framework lock poisoned".to_string()))
    }

    /// Install a bundle. Installing a location that is already installed
    /// returns the existing bundle.
    pub fn install(&self, location: &str, content: BundleContent) -> KeelResult<BundleId> {
        let manifest = content.manifest();
        {
            let state = self.read_state()?;
            if let Some(id) = state.find_location(location) {
                debug!(bundle = id, location, "location already installed");
                return Ok(id);
            }
            if let Some(existing) = state.find_duplicate(&manifest.symbolic_name, &manifest.version, None) {
                return Err(KeelError::Duplicate(format!(
                    "{} {} is already installed as bundle {}",
                    manifest.symbolic_name, manifest.version, existing
                )));
            }
        }

        let store = &self.inner.store;
        let stored = store.insert(location, &content)?;
        let id = stored.key.bundle;
        let revision = match BundleRevision::open(store, stored.key, location) {
            Ok(revision) => Arc::new(revision),
            Err(e) => {
                self.purge_quietly(PurgeTarget::Bundle(id));
                return Err(e);
            }
        };

        {
            let mut state = self.write_state()?;
            let conflict = state.find_location(location).map(Ok).or_else(|| {
                state
                    .find_duplicate(revision.symbolic_name(), revision.version(), None)
                    .map(|existing| {
                        Err(KeelError::Duplicate(format!(
                            "{} {} is already installed as bundle {}",
                            revision.symbolic_name(),
                            revision.version(),
                            existing
                        )))
                    })
            });
            if let Some(outcome) = conflict {
                drop(state);
                drop(revision);
                self.purge_quietly(PurgeTarget::Bundle(id));
                return outcome;
            }

            state.registry.register_revision(stored.key, revision.manifest())?;
            state.revisions.insert(
                stored.key,
                RevisionSlot {
                    revision: Arc::clone(&revision),
                    liveness: Liveness::Active,
                },
            );
            state.bundles.insert(
                id,
                BundleRecord {
                    location: location.to_string(),
                    state: BundleState::Installed,
                    current: stored.key,
                    last_modified: Utc::now(),
                },
            );
            state.generation += 1;
        }

        info!(
            bundle = id,
            symbolic_name = %revision.symbolic_name(),
            version = %revision.version(),
            location,
            "installed bundle"
        );
        self.inner.events.bundle(BundleEventKind::Installed, id);
        Ok(id)
    }

    /// Install a bundle archive or directory from disk.
    pub fn install_path(&self, path: &Path) -> KeelResult<BundleId> {
        let location = format!("file:{}", path.display());
        let content = BundleContent::from_path(path)?;
        self.install(&location, content)
    }

    /// Replace a bundle's content with a new revision. The old revision
    /// keeps serving bundles wired to it until a refresh.
    pub fn update(&self, id: BundleId, content: BundleContent) -> KeelResult<()> {
        let (location, was_active) = {
            let state = self.read_state()?;
            let record = state.record(id)?;
            let manifest = content.manifest();
            if let Some(existing) = state.find_duplicate(&manifest.symbolic_name, &manifest.version, Some(id)) {
                return Err(KeelError::Duplicate(format!(
                    "{} {} is already installed as bundle {}",
                    manifest.symbolic_name, manifest.version, existing
                )));
            }
            (record.location.clone(), record.state == BundleState::Active)
        };

        self.inner.store.check_content(&content)?;

        if was_active {
            if let Err(e) = self.stop(id) {
                warn!(bundle = id, error = %e, "stop before update failed");
            }
        }

        let (new_key, revision) = match self.stage_revision(id, &content, &location) {
            Ok(staged) => staged,
            Err(e) => {
                if was_active {
                    if let Err(restart) = self.start(id) {
                        warn!(bundle = id, error = %restart, "restart after failed update failed");
                    }
                }
                return Err(e);
            }
        };

        let (retired, old_key, was_resolved, fragments) = {
            let mut state = self.write_state()?;
            let record = state.record_mut(id)?;
            let old_key = record.current;
            let was_resolved = record.state.is_resolved();
            record.current = new_key;
            record.state = BundleState::Installed;
            record.last_modified = Utc::now();

            state.registry.register_revision(new_key, revision.manifest())?;
            state.revisions.insert(
                new_key,
                RevisionSlot {
                    revision: Arc::clone(&revision),
                    liveness: Liveness::Active,
                },
            );
            let retired = state.retire_revision(old_key);
            let fragments = state.sync_fragment_states();
            state.generation += 1;
            (retired, old_key, was_resolved, fragments)
        };

        let purge = retired.purge;
        drop(retired);
        if purge {
            self.purge_quietly(PurgeTarget::Revision(old_key));
        } else {
            debug!(bundle = id, revision = old_key.revision, "old revision kept as zombie");
        }

        info!(bundle = id, revision = new_key.revision, "updated bundle");
        if was_resolved {
            self.inner.events.bundle(BundleEventKind::Unresolved, id);
        }
        self.publish_fragment_changes(fragments);
        self.inner.events.bundle(BundleEventKind::Updated, id);

        if was_active {
            if let Err(e) = self.start(id) {
                warn!(bundle = id, error = %e, "restart after update failed");
                self.inner.events.framework(FrameworkEvent::Error {
                    bundle: Some(id),
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Write, open and commit a new revision of `id`.
    fn stage_revision(
        &self,
        id: BundleId,
        content: &BundleContent,
        location: &str,
    ) -> KeelResult<(RevisionKey, Arc<BundleRevision>)> {
        let store = &self.inner.store;
        let pending = store.update(id, content)?;
        let key = pending.key();
        let revision = match BundleRevision::open(store, key, location) {
            Ok(revision) => Arc::new(revision),
            Err(e) => {
                store.discard(pending)?;
                return Err(e);
            }
        };
        store.commit(pending)?;
        Ok((key, revision))
    }

    /// Remove a bundle. Exports that still serve other bundles stay
    /// available as zombies until a refresh.
    pub fn uninstall(&self, id: BundleId) -> KeelResult<()> {
        let was_active = self.read_state()?.record(id)?.state == BundleState::Active;
        if was_active {
            if let Err(e) = self.stop(id) {
                warn!(bundle = id, error = %e, "stop before uninstall failed");
            }
        }

        let (retired, was_resolved, remaining, fragments) = {
            let mut state = self.write_state()?;
            let record = state
                .bundles
                .remove(&id)
                .ok_or(KeelError::UnknownBundle(id))?;
            let retired = state.retire_revision(record.current);
            let remaining = state.revisions_of(id).len();
            let fragments = state.sync_fragment_states();
            state.generation += 1;
            (retired, record.state.is_resolved(), remaining, fragments)
        };

        drop(retired);
        if remaining == 0 {
            self.purge_quietly(PurgeTarget::Bundle(id));
        } else {
            if let Err(e) = self.inner.store.retire(id) {
                warn!(bundle = id, error = %e, "failed to retire bundle storage");
            }
            debug!(bundle = id, revisions = remaining, "bundle kept as zombie until refresh");
        }

        info!(bundle = id, "uninstalled bundle");
        if was_resolved {
            self.inner.events.bundle(BundleEventKind::Unresolved, id);
        }
        self.publish_fragment_changes(fragments);
        self.inner.events.bundle(BundleEventKind::Uninstalled, id);
        Ok(())
    }

    /// Resolve a bundle and whatever it needs, as one transaction. On
    /// failure nothing changes and the call may be retried later.
    pub fn resolve(&self, id: BundleId) -> KeelResult<()> {
        let _guard = Self::lock(&self.inner.resolve_lock)?;

        for attempt in 0..=self.inner.config.resolve_retry_limit {
            let (plan, generation) = {
                let state = self.read_state()?;
                let key = state.record(id)?.current;
                if state.registry.is_resolved(key) {
                    return Ok(());
                }
                let plan = Resolver::new(&state.registry, &*state).resolve(key)?;
                (plan, state.generation)
            };

            if self.apply(plan, generation)? {
                return Ok(());
            }
            debug!(bundle = id, attempt, "framework changed during resolution; retrying");
        }

        Err(KeelError::InvalidState(format!(
            "resolution of bundle {} kept racing with concurrent changes",
            id
        )))
    }

    /// Try to resolve every installed bundle. Returns the failures.
    pub fn resolve_all(&self) -> Vec<(BundleId, KeelError)> {
        let ids: Vec<(BundleId, bool)> = match self.read_state() {
            Ok(state) => state
                .bundles
                .iter()
                .filter(|(_, r)| r.state == BundleState::Installed)
                .map(|(id, r)| {
                    let fragment = state.revision(r.current).is_some_and(|rev| rev.is_fragment());
                    (*id, fragment)
                })
                .collect(),
            Err(e) => return vec![(0, e)],
        };

        let mut failures = Vec::new();
        let ordered = ids
            .iter()
            .filter(|(_, fragment)| !fragment)
            .chain(ids.iter().filter(|(_, fragment)| *fragment));
        for (id, _) in ordered {
            if let Err(e) = self.resolve(*id) {
                debug!(bundle = id, error = %e, "bundle did not resolve");
                failures.push((*id, e));
            }
        }
        failures
    }

    /// Commit a plan. `Ok(false)` when the state moved since the plan was
    /// computed. Every storage reference is taken before anything changes.
    fn apply(&self, plan: ResolutionPlan, generation: u64) -> KeelResult<bool> {
        let store = &self.inner.store;
        let mut changed = Vec::new();
        {
            let mut state = self.write_state()?;
            if state.generation != generation {
                return Ok(false);
            }

            let owner_of = |export: &ExportRef| -> KeelResult<RevisionKey> {
                match export {
                    ExportRef::Registered(id) => state
                        .registry
                        .export(*id)
                        .map(|e| e.owner)
                        .ok_or_else(|| KeelError::InvalidState(format!("export {} vanished", id))),
                    ExportRef::Planned(i) => plan
                        .exports
                        .get(*i)
                        .map(|e| e.owner)
                        .ok_or_else(|| KeelError::InvalidState(format!("planned export {} missing", i))),
                }
            };
            let mut wire_leases = Vec::with_capacity(plan.wires.len());
            for export in plan.wires.values() {
                wire_leases.push(store.acquire(owner_of(export)?)?);
            }
            let mut require_leases = Vec::with_capacity(plan.requires.len());
            for wire in &plan.requires {
                require_leases.push(store.acquire(wire.target)?);
            }

            let ResolutionPlan {
                resolved,
                attachments,
                exports,
                imports,
                wires,
                requires,
                warnings,
            } = plan;

            let export_ids: Vec<_> = exports
                .into_iter()
                .map(|e| state.registry.insert_export(e))
                .collect();
            let import_ids: Vec<_> = imports
                .into_iter()
                .map(|i| state.registry.insert_import(i))
                .collect();
            for (host, fragment) in &attachments {
                state.registry.attach(*host, *fragment);
            }
            for ((import, export), lease) in wires.into_iter().zip(wire_leases) {
                let import = match import {
                    ImportRef::Registered(id) => id,
                    ImportRef::Planned(i) => import_ids[i],
                };
                let export = match export {
                    ExportRef::Registered(id) => id,
                    ExportRef::Planned(i) => export_ids[i],
                };
                state.registry.wire(import, export, lease)?;
            }
            for (wire, lease) in requires.into_iter().zip(require_leases) {
                state.registry.add_require(wire, lease);
            }

            for key in &resolved {
                state.registry.set_resolved(*key, true);
                if let Some(record) = state.bundles.get_mut(&key.bundle) {
                    if record.current == *key && record.state == BundleState::Installed {
                        record.state = BundleState::Resolved;
                        changed.push((key.bundle, BundleState::Resolved));
                    }
                }
            }
            changed.extend(state.sync_fragment_states());
            state.generation += 1;

            for warning in warnings {
                warn!(bundle = warning.bundle(), error = %warning, "fragment not attached");
                self.inner.events.framework(FrameworkEvent::Warning {
                    bundle: Some(warning.bundle()),
                    message: warning.to_string(),
                });
            }
        }

        for (id, _) in &changed {
            info!(bundle = id, "resolved bundle");
        }
        self.publish_fragment_changes(changed);
        Ok(true)
    }

    fn publish_fragment_changes(&self, changes: Vec<(BundleId, BundleState)>) {
        for (id, state) in changes {
            let kind = match state {
                BundleState::Resolved => BundleEventKind::Resolved,
                _ => BundleEventKind::Unresolved,
            };
            self.inner.events.bundle(kind, id);
        }
    }

    /// Start a bundle, resolving it first if needed.
    pub fn start(&self, id: BundleId) -> KeelResult<()> {
        {
            let state = self.read_state()?;
            let record = state.record(id)?;
            if state.current(id)?.is_fragment() {
                return Err(KeelError::InvalidState(format!(
                    "bundle {} is a fragment and cannot be started",
                    id
                )));
            }
            match record.state {
                BundleState::Active => return Ok(()),
                BundleState::Starting | BundleState::Stopping => {
                    return Err(KeelError::InvalidState(format!(
                        "bundle {} is {}",
                        id, record.state
                    )))
                }
                _ => {}
            }
        }

        self.resolve(id)?;
        self.transition(id, BundleState::Resolved, BundleState::Starting)?;
        self.inner.events.bundle(BundleEventKind::Starting, id);

        let outcome = match (&self.inner.hook, self.bundle(id)) {
            (Some(hook), Some(info)) => hook.start(&info),
            _ => Ok(()),
        };
        match outcome {
            Ok(()) => {
                self.transition(id, BundleState::Starting, BundleState::Active)?;
                info!(bundle = id, "started bundle");
                self.inner.events.bundle(BundleEventKind::Started, id);
                Ok(())
            }
            Err(e) => {
                self.transition(id, BundleState::Starting, BundleState::Resolved)?;
                let message = format!("{:#}", e);
                warn!(bundle = id, error = %message, "activation failed");
                self.inner.events.framework(FrameworkEvent::Error {
                    bundle: Some(id),
                    message: message.clone(),
                });
                Err(KeelError::Activation(message))
            }
        }
    }

    /// Stop an active bundle. A no-op in any other state.
    pub fn stop(&self, id: BundleId) -> KeelResult<()> {
        if self.read_state()?.record(id)?.state != BundleState::Active {
            return Ok(());
        }
        self.transition(id, BundleState::Active, BundleState::Stopping)?;
        self.inner.events.bundle(BundleEventKind::Stopping, id);

        let outcome = match (&self.inner.hook, self.bundle(id)) {
            (Some(hook), Some(info)) => hook.stop(&info),
            _ => Ok(()),
        };
        self.transition(id, BundleState::Stopping, BundleState::Resolved)?;
        info!(bundle = id, "stopped bundle");
        self.inner.events.bundle(BundleEventKind::Stopped, id);

        outcome.map_err(|e| {
            let message = format!("{:#}", e);
            self.inner.events.framework(FrameworkEvent::Error {
                bundle: Some(id),
                message: message.clone(),
            });
            KeelError::Activation(message)
        })
    }

    fn transition(&self, id: BundleId, from: BundleState, to: BundleState) -> KeelResult<()> {
        let mut state = self.write_state()?;
        let record = state.record_mut(id)?;
        if record.state != from {
            return Err(KeelError::InvalidState(format!(
                "bundle {} is {}, expected {}",
                id, record.state, from
            )));
        }
        record.state = to;
        record.last_modified = Utc::now();
        // Fragment attachment depends on whether the host is starting or
        // active, so plans computed before this point are stale.
        state.generation += 1;
        Ok(())
    }

    fn purge_quietly(&self, target: PurgeTarget) {
        if let Err(e) = self.inner.store.purge(target) {
            warn!(?target, error = %e, "failed to purge storage");
        }
    }
}

/// Rebuild the bundle table from storage left by a previous run.
fn recover_state(store: &ArchiveStore) -> KeelResult<FrameworkState> {
    let mut state = FrameworkState::default();
    for bundle in store.recover()? {
        let key = RevisionKey::new(bundle.id, bundle.revision);
        let revision = match BundleRevision::open(store, key, &bundle.location) {
            Ok(revision) => Arc::new(revision),
            Err(e) => {
                warn!(bundle = bundle.id, error = %e, "dropping unreadable bundle");
                store.purge(PurgeTarget::Bundle(bundle.id))?;
                continue;
            }
        };
        if let Some(existing) =
            state.find_duplicate(revision.symbolic_name(), revision.version(), None)
        {
            warn!(bundle = bundle.id, existing, "dropping duplicate bundle");
            drop(revision);
            store.purge(PurgeTarget::Bundle(bundle.id))?;
            continue;
        }

        state.registry.register_revision(key, revision.manifest())?;
        state.revisions.insert(
            key,
            RevisionSlot {
                revision,
                liveness: Liveness::Active,
            },
        );
        state.bundles.insert(
            bundle.id,
            BundleRecord {
                location: bundle.location,
                state: BundleState::Installed,
                current: key,
                last_modified: bundle.stored_at,
            },
        );
        debug!(bundle = bundle.id, revision = bundle.revision, "recovered bundle");
    }
    Ok(state)
}
