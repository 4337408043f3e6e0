//! Per-revision view of a stored bundle: its manifest and ordered classpath.

use crate::core::path::normalize_entry;
use crate::core::{KeelError, KeelResult, RevisionKey};
use crate::storage::content::read_zip_entries;
use crate::storage::{ArchiveStore, RevisionRef};
use keel_core::manifest::{BundleManifest, MANIFEST_PATH};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// One resolved `Bundle-ClassPath` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClasspathEntry {
    /// `.`, the bundle root.
    Root,
    /// A directory inside the bundle, without trailing slash.
    Directory(String),
    /// A jar or zip stored inside the bundle.
    Nested(String),
}

/// Entries of a nested archive, extracted on first use.
#[derive(Debug)]
pub struct SubArchive {
    path: String,
    entries: BTreeMap<String, Vec<u8>>,
}

impl SubArchive {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// An open bundle revision. Holds a storage reference for as long as it
/// lives, so lookups keep working after the revision is superseded.
pub struct BundleArchive {
    key: RevisionKey,
    store: ArchiveStore,
    _lease: RevisionRef,
    manifest: BundleManifest,
    classpath: Vec<ClasspathEntry>,
    failed_entries: Vec<String>,
    sub_archives: Mutex<HashMap<String, Arc<SubArchive>>>,
}

impl BundleArchive {
    pub fn open(store: &ArchiveStore, key: RevisionKey) -> KeelResult<Self> {
        let lease = store.acquire(key)?;
        let bytes = store
            .read_entry(key, MANIFEST_PATH)?
            .ok_or_else(|| KeelError::Manifest(format!("Revision {} has no {}", key, MANIFEST_PATH)))?;
        let manifest = BundleManifest::parse(&bytes)?;
        let names = store.entry_names(key)?;

        let mut classpath = Vec::new();
        let mut failed_entries = Vec::new();
        for raw in &manifest.classpath {
            match classify(raw, &names) {
                Some(entry) => classpath.push(entry),
                None => {
                    warn!(
                        bundle = key.bundle,
                        revision = key.revision,
                        entry = %raw,
                        "classpath entry not found in bundle"
                    );
                    failed_entries.push(raw.clone());
                }
            }
        }

        debug!(bundle = key.bundle, revision = key.revision, entries = classpath.len(), "opened bundle archive");
        Ok(Self {
            key,
            store: store.clone(),
            _lease: lease,
            manifest,
            classpath,
            failed_entries,
            sub_archives: Mutex::new(HashMap::new()),
        })
    }

    pub fn key(&self) -> RevisionKey {
        self.key
    }

    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    pub fn classpath(&self) -> &[ClasspathEntry] {
        &self.classpath
    }

    /// Classpath elements that matched nothing in the bundle.
    pub fn failed_entries(&self) -> &[String] {
        &self.failed_entries
    }

    /// Raw entry from the bundle root, ignoring the classpath.
    pub fn get_entry(&self, path: &str) -> KeelResult<Option<Vec<u8>>> {
        self.store.read_entry(self.key, &normalize_entry(path))
    }

    pub fn entry_names(&self) -> KeelResult<Vec<String>> {
        self.store.entry_names(self.key)
    }

    /// First match across the classpath, in declaration order.
    pub fn get_resource(&self, path: &str) -> KeelResult<Option<Vec<u8>>> {
        let path = normalize_entry(path);
        for entry in &self.classpath {
            if let Some(bytes) = self.find_in(entry, &path)? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    pub fn get_class_bytes(&self, class_name: &str) -> KeelResult<Option<Vec<u8>>> {
        self.get_resource(&class_to_path(class_name))
    }

    fn find_in(&self, entry: &ClasspathEntry, path: &str) -> KeelResult<Option<Vec<u8>>> {
        match entry {
            ClasspathEntry::Root => self.store.read_entry(self.key, path),
            ClasspathEntry::Directory(prefix) => {
                self.store.read_entry(self.key, &format!("{}/{}", prefix, path))
            }
            ClasspathEntry::Nested(nested) => match self.sub_archive(nested) {
                Ok(sub) => Ok(sub.get(path).map(<[u8]>::to_vec)),
                Err(e) => {
                    warn!(bundle = self.key.bundle, archive = %nested, error = %e, "nested archive unreadable");
                    Ok(None)
                }
            },
        }
    }

    /// Materialise a nested archive. Cached after the first call.
    pub fn sub_archive(&self, path: &str) -> KeelResult<Arc<SubArchive>> {
        let path = normalize_entry(path);
        let mut cache = self
            .sub_archives
            .lock()
            .map_err(|_| KeelError::Storage("sub-archive cache poisoned".to_string()))?;
        if let Some(sub) = cache.get(&path) {
            return Ok(Arc::clone(sub));
        }

        let bytes = self.store.read_entry(self.key, &path)?.ok_or_else(|| {
            KeelError::Storage(format!("Nested archive {} not found in {}", path, self.key))
        })?;
        let sub = Arc::new(SubArchive {
            path: path.clone(),
            entries: read_zip_entries(&bytes)?,
        });
        cache.insert(path, Arc::clone(&sub));
        Ok(sub)
    }
}

impl std::fmt::Debug for BundleArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleArchive")
            .field("key", &self.key)
            .field("symbolic_name", &self.manifest.symbolic_name)
            .field("classpath", &self.classpath)
            .finish()
    }
}

fn classify(raw: &str, names: &[String]) -> Option<ClasspathEntry> {
    let entry = normalize_entry(raw);
    let entry = entry.trim_end_matches('/');
    if entry.is_empty() || entry == "." {
        return Some(ClasspathEntry::Root);
    }
    if names.iter().any(|n| n == entry) {
        return Some(ClasspathEntry::Nested(entry.to_string()));
    }
    let prefix = format!("{}/", entry);
    if names.iter().any(|n| n.starts_with(&prefix)) {
        return Some(ClasspathEntry::Directory(entry.to_string()));
    }
    None
}

/// `a.b.C` → `a/b/C.class`.
pub fn class_to_path(class_name: &str) -> String {
    format!("{}.class", class_name.replace('.', "/"))
}

/// Package of a dotted class name; empty for the default package.
pub fn package_of_class(class_name: &str) -> &str {
    class_name.rsplit_once('.').map(|(pkg, _)| pkg).unwrap_or("")
}

/// Package of a resource path: `a/b/c.txt` → `a.b`.
pub fn package_of_path(path: &str) -> String {
    let path = normalize_entry(path);
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.replace('/', "."),
        None => String::new(),
    }
}

/// Simple file name of a resource path or class: `a/b/C.class` → `C.class`.
pub fn simple_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
