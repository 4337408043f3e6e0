//! File-backed bundle storage.
//!
//! ```text
//! <root>/
//! ├── next-id
//! └── <bundle-id>/
//!     ├── location
//!     ├── active
//!     └── <revision>/
//!         ├── revision.yaml
//!         ├── bundle.jar      (packed)
//!         └── content/...     (unpacked)
//! ```
//!
//! `revision.yaml` is written last, so a revision without it (or whose
//! checksum no longer matches) is incomplete and dropped on recovery.

use super::content::{entries_checksum, read_zip_entries, BundleContent};
use super::{RecoveredBundle, StorageBackend};
use crate::core::path::{ensure_dir, is_safe_entry};
use crate::core::{BundleId, KeelError, KeelResult, RevisionKey, RevisionNumber};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

const NEXT_ID_FILE: &str = "next-id";
const LOCATION_FILE: &str = "location";
const ACTIVE_FILE: &str = "active";
const META_FILE: &str = "revision.yaml";
const PACKED_FILE: &str = "bundle.jar";
const CONTENT_DIR: &str = "content";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// Outer archive kept as `bundle.jar` and read randomly.
    Packed,
    /// Entries extracted under `content/`.
    Unpacked,
}

/// Contents of `revision.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionMeta {
    pub location: String,
    pub revision: RevisionNumber,
    pub layout: Layout,
    pub checksum: String,
    pub stored_at: DateTime<Utc>,
    pub entries: Vec<String>,
}

type OpenArchive = Arc<Mutex<ZipArchive<File>>>;

pub struct FileBackend {
    root: PathBuf,
    always_unpack: bool,
    next_id: Mutex<BundleId>,
    open: Mutex<HashMap<RevisionKey, OpenArchive>>,
}

impl FileBackend {
    pub fn new(root: PathBuf, always_unpack: bool) -> KeelResult<Self> {
        ensure_dir(&root)?;
        let next_id = match fs::read_to_string(root.join(NEXT_ID_FILE)) {
            Ok(text) => text.trim().parse().map_err(|_| {
                KeelError::Storage(format!("Corrupt {} in {}", NEXT_ID_FILE, root.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 1,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            root,
            always_unpack,
            next_id: Mutex::new(next_id),
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bundle_dir(&self, id: BundleId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn revision_dir(&self, key: RevisionKey) -> PathBuf {
        self.bundle_dir(key.bundle).join(key.revision.to_string())
    }

    fn layout_for(&self, content: &BundleContent) -> Layout {
        let manifest = content.manifest();
        if self.always_unpack
            || manifest.has_native_code()
            || manifest.nested_archives().next().is_some()
        {
            Layout::Unpacked
        } else {
            Layout::Packed
        }
    }

    fn read_meta(&self, key: RevisionKey) -> KeelResult<RevisionMeta> {
        read_meta(&self.revision_dir(key))
    }

    fn archive(&self, key: RevisionKey) -> KeelResult<OpenArchive> {
        let mut open = self
            .open
            .lock()
            .map_err(|_| KeelError::Storage("archive handle cache poisoned".to_string()))?;
        if let Some(archive) = open.get(&key) {
            return Ok(Arc::clone(archive));
        }
        let file = File::open(self.revision_dir(key).join(PACKED_FILE))?;
        let archive = Arc::new(Mutex::new(ZipArchive::new(file)?));
        open.insert(key, Arc::clone(&archive));
        Ok(archive)
    }

    fn forget_open(&self, matches: impl Fn(&RevisionKey) -> bool) {
        if let Ok(mut open) = self.open.lock() {
            open.retain(|key, _| !matches(key));
        }
    }

    fn persist_next_id(&self, next: BundleId) -> KeelResult<()> {
        write_atomic(&self.root.join(NEXT_ID_FILE), next.to_string().as_bytes())
    }

    /// Pick the committed revision of one bundle directory and delete the
    /// rest. `None` when the bundle has no complete revision left.
    fn recover_bundle(&self, id: BundleId) -> KeelResult<Option<RecoveredBundle>> {
        let dir = self.bundle_dir(id);
        let location = match fs::read_to_string(dir.join(LOCATION_FILE)) {
            Ok(location) => location,
            Err(_) => {
                warn!(bundle = id, "bundle has no location; removing");
                fs::remove_dir_all(&dir)?;
                return Ok(None);
            }
        };
        let active: Option<RevisionNumber> = fs::read_to_string(dir.join(ACTIVE_FILE))
            .ok()
            .and_then(|text| text.trim().parse().ok());

        let mut complete: BTreeMap<RevisionNumber, RevisionMeta> = BTreeMap::new();
        let mut all = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(revision) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<RevisionNumber>().ok())
            else {
                continue;
            };
            all.push(revision);
            match verify_revision(&entry.path()) {
                Ok(meta) => {
                    complete.insert(revision, meta);
                }
                Err(e) => {
                    debug!(bundle = id, revision, error = %e, "incomplete revision");
                }
            }
        }

        let chosen = match active {
            Some(rev) if complete.contains_key(&rev) => Some(rev),
            _ => complete.keys().next().copied(),
        };

        let Some(chosen) = chosen else {
            warn!(bundle = id, location = %location, "no complete revision; removing bundle");
            fs::remove_dir_all(&dir)?;
            return Ok(None);
        };

        for revision in all.into_iter().filter(|r| *r != chosen) {
            debug!(bundle = id, revision, "removing stale revision");
            fs::remove_dir_all(dir.join(revision.to_string()))?;
        }
        if active != Some(chosen) {
            info!(bundle = id, revision = chosen, "active pointer repaired");
            write_atomic(&dir.join(ACTIVE_FILE), chosen.to_string().as_bytes())?;
        }

        let stored_at = complete
            .get(&chosen)
            .map(|meta| meta.stored_at)
            .unwrap_or_else(Utc::now);
        Ok(Some(RecoveredBundle {
            id,
            location,
            revision: chosen,
            stored_at,
        }))
    }
}

impl StorageBackend for FileBackend {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn check_content(&self, _content: &BundleContent) -> KeelResult<()> {
        Ok(())
    }

    fn allocate_id(&self) -> KeelResult<BundleId> {
        let mut next = self
            .next_id
            .lock()
            .map_err(|_| KeelError::Storage("id allocator poisoned".to_string()))?;
        let id = *next;
        self.persist_next_id(id + 1)?;
        *next = id + 1;
        Ok(id)
    }

    fn write_revision(
        &self,
        key: RevisionKey,
        location: &str,
        content: &BundleContent,
    ) -> KeelResult<()> {
        let bundle_dir = self.bundle_dir(key.bundle);
        let dir = self.revision_dir(key);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        ensure_dir(&dir)?;

        let location_path = bundle_dir.join(LOCATION_FILE);
        if !location_path.exists() {
            write_atomic(&location_path, location.as_bytes())?;
        }

        let layout = self.layout_for(content);
        match layout {
            Layout::Packed => {
                fs::write(dir.join(PACKED_FILE), content.to_zip()?)?;
            }
            Layout::Unpacked => {
                let content_dir = dir.join(CONTENT_DIR);
                for (name, bytes) in content.entries() {
                    let path = content_dir.join(name);
                    if let Some(parent) = path.parent() {
                        ensure_dir(parent)?;
                    }
                    fs::write(path, bytes)?;
                }
            }
        }

        let meta = RevisionMeta {
            location: location.to_string(),
            revision: key.revision,
            layout,
            checksum: content.checksum(),
            stored_at: Utc::now(),
            entries: content.entries().keys().cloned().collect(),
        };
        write_atomic(&dir.join(META_FILE), serde_yaml::to_string(&meta)?.as_bytes())?;

        debug!(
            bundle = key.bundle,
            revision = key.revision,
            layout = ?layout,
            entries = meta.entries.len(),
            "wrote revision"
        );
        Ok(())
    }

    fn set_active(&self, key: RevisionKey) -> KeelResult<()> {
        write_atomic(
            &self.bundle_dir(key.bundle).join(ACTIVE_FILE),
            key.revision.to_string().as_bytes(),
        )
    }

    fn read_entry(&self, key: RevisionKey, path: &str) -> KeelResult<Option<Vec<u8>>> {
        if !is_safe_entry(path) {
            return Ok(None);
        }
        let dir = self.revision_dir(key);
        if dir.join(PACKED_FILE).is_file() {
            let archive = self.archive(key)?;
            let mut archive = archive
                .lock()
                .map_err(|_| KeelError::Storage(format!("archive {} poisoned", key)))?;
            let mut file = match archive.by_name(path) {
                Ok(file) => file,
                Err(zip::result::ZipError::FileNotFound) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if file.is_dir() {
                return Ok(None);
            }
            let mut buf = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut buf)?;
            Ok(Some(buf))
        } else {
            let file = dir.join(CONTENT_DIR).join(path);
            if file.is_file() {
                Ok(Some(fs::read(file)?))
            } else if dir.is_dir() {
                Ok(None)
            } else {
                Err(KeelError::Storage(format!("revision {} not found", key)))
            }
        }
    }

    fn entry_names(&self, key: RevisionKey) -> KeelResult<Vec<String>> {
        Ok(self.read_meta(key)?.entries)
    }

    fn delete_revision(&self, key: RevisionKey) -> KeelResult<()> {
        self.forget_open(|k| *k == key);
        let dir = self.revision_dir(key);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn delete_bundle(&self, id: BundleId) -> KeelResult<()> {
        self.forget_open(|k| k.bundle == id);
        let dir = self.bundle_dir(id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn recover(&self) -> KeelResult<Vec<RecoveredBundle>> {
        let mut recovered = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<BundleId>().ok())
            else {
                continue;
            };
            if let Some(bundle) = self.recover_bundle(id)? {
                recovered.push(bundle);
            }
        }
        recovered.sort_by_key(|b| b.id);

        if let Some(max) = recovered.iter().map(|b| b.id).max() {
            let mut next = self
                .next_id
                .lock()
                .map_err(|_| KeelError::Storage("id allocator poisoned".to_string()))?;
            if *next <= max {
                *next = max + 1;
                self.persist_next_id(*next)?;
            }
        }

        info!(root = %self.root.display(), bundles = recovered.len(), "recovered bundle storage");
        Ok(recovered)
    }
}

/// Write to a temp file beside `path` and rename over it.
fn write_atomic(path: &Path, bytes: &[u8]) -> KeelResult<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    fs::write(&temp, bytes)?;
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

fn read_meta(dir: &Path) -> KeelResult<RevisionMeta> {
    let text = fs::read_to_string(dir.join(META_FILE))?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Parse `revision.yaml` and check the stored content against its checksum.
fn verify_revision(dir: &Path) -> KeelResult<RevisionMeta> {
    let meta = read_meta(dir)?;
    let actual = match meta.layout {
        Layout::Packed => {
            let entries = read_zip_entries(&fs::read(dir.join(PACKED_FILE))?)?;
            entries_checksum(entries.iter().map(|(n, b)| (n.as_str(), b.as_slice())))
        }
        Layout::Unpacked => {
            let root = dir.join(CONTENT_DIR);
            let mut entries = BTreeMap::new();
            for entry in WalkDir::new(&root) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(|e| KeelError::Path(e.to_string()))?
                    .to_string_lossy()
                    .replace('\\', "/");
                entries.insert(name, fs::read(entry.path())?);
            }
            entries_checksum(entries.iter().map(|(n, b)| (n.as_str(), b.as_slice())))
        }
    };
    if actual != meta.checksum {
        return Err(KeelError::Storage(format!(
            "checksum mismatch in {}: expected {}, found {}",
            dir.display(),
            meta.checksum,
            actual
        )));
    }
    Ok(meta)
}
