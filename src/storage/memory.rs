use super::content::BundleContent;
use super::{RecoveredBundle, StorageBackend};
use crate::core::{BundleId, KeelError, KeelResult, RevisionKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

type Entries = Arc<BTreeMap<String, Vec<u8>>>;

/// Flat name→bytes maps held in process memory. Nothing survives a restart.
pub struct MemoryBackend {
    next_id: AtomicU64,
    revisions: RwLock<HashMap<RevisionKey, Entries>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            revisions: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, key: RevisionKey) -> KeelResult<Entries> {
        let revisions = self
            .revisions
            .read()
            .map_err(|_| KeelError::Storage("memory store poisoned".to_string()))?;
        revisions
            .get(&key)
            .cloned()
            .ok_or_else(|| KeelError::Storage(format!("revision {} not found", key)))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn check_content(&self, content: &BundleContent) -> KeelResult<()> {
        let manifest = content.manifest();
        if manifest.has_native_code() {
            return Err(KeelError::Unsupported(format!(
                "bundle {} declares native code, which the memory store cannot hold",
                manifest.symbolic_name
            )));
        }
        Ok(())
    }

    fn allocate_id(&self) -> KeelResult<BundleId> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn write_revision(
        &self,
        key: RevisionKey,
        _location: &str,
        content: &BundleContent,
    ) -> KeelResult<()> {
        let mut revisions = self
            .revisions
            .write()
            .map_err(|_| KeelError::Storage("memory store poisoned".to_string()))?;
        revisions.insert(key, Arc::new(content.entries().clone()));
        Ok(())
    }

    fn set_active(&self, _key: RevisionKey) -> KeelResult<()> {
        Ok(())
    }

    fn read_entry(&self, key: RevisionKey, path: &str) -> KeelResult<Option<Vec<u8>>> {
        Ok(self.get(key)?.get(path).cloned())
    }

    fn entry_names(&self, key: RevisionKey) -> KeelResult<Vec<String>> {
        Ok(self.get(key)?.keys().cloned().collect())
    }

    fn delete_revision(&self, key: RevisionKey) -> KeelResult<()> {
        if let Ok(mut revisions) = self.revisions.write() {
            revisions.remove(&key);
        }
        Ok(())
    }

    fn delete_bundle(&self, id: BundleId) -> KeelResult<()> {
        if let Ok(mut revisions) = self.revisions.write() {
            revisions.retain(|key, _| key.bundle != id);
        }
        Ok(())
    }

    fn recover(&self) -> KeelResult<Vec<RecoveredBundle>> {
        Ok(Vec::new())
    }
}
