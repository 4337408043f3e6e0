//! Incoming bundle content: the manifest plus a flat name→bytes tree.

use crate::core::path::{is_safe_entry, normalize_entry};
use crate::core::{KeelError, KeelResult};
use keel_core::manifest::{BundleManifest, MANIFEST_PATH};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use walkdir::WalkDir;

/// Bundle content handed to `install`/`update`.
///
/// The manifest is parsed and validated on construction, so a malformed
/// bundle is rejected before the store allocates anything for it.
#[derive(Debug, Clone)]
pub struct BundleContent {
    manifest: BundleManifest,
    entries: BTreeMap<String, Vec<u8>>,
    packed: Option<Vec<u8>>,
}

impl BundleContent {
    /// Read a jar/zip archive held in memory.
    pub fn from_zip(bytes: Vec<u8>) -> KeelResult<Self> {
        let entries = read_zip_entries(&bytes)?;
        Self::build(entries, Some(bytes))
    }

    /// Read an unpacked bundle directory.
    pub fn from_dir(root: &Path) -> KeelResult<Self> {
        let mut entries = BTreeMap::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| KeelError::Path(format!("{}: {}", entry.path().display(), e)))?;
            let name = normalize_entry(&relative.to_string_lossy());
            entries.insert(name, fs::read(entry.path())?);
        }
        Self::build(entries, None)
    }

    /// Read a bundle from disk: a directory is taken as an unpacked bundle,
    /// anything else as an archive.
    pub fn from_path(path: &Path) -> KeelResult<Self> {
        if path.is_dir() {
            Self::from_dir(path)
        } else {
            Self::from_zip(fs::read(path)?)
        }
    }

    pub fn from_entries<I, N>(entries: I) -> KeelResult<Self>
    where
        I: IntoIterator<Item = (N, Vec<u8>)>,
        N: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|(name, bytes)| (normalize_entry(name.as_ref()), bytes))
            .collect();
        Self::build(entries, None)
    }

    fn build(entries: BTreeMap<String, Vec<u8>>, packed: Option<Vec<u8>>) -> KeelResult<Self> {
        if let Some(bad) = entries.keys().find(|name| !is_safe_entry(name)) {
            return Err(KeelError::Unsupported(format!(
                "Entry name '{}' escapes the bundle root",
                bad
            )));
        }

        let manifest_bytes = entries
            .get(MANIFEST_PATH)
            .ok_or_else(|| KeelError::Manifest(format!("Bundle has no {}", MANIFEST_PATH)))?;
        let manifest = BundleManifest::parse(manifest_bytes)?;

        Ok(Self {
            manifest,
            entries,
            packed,
        })
    }

    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    pub fn entries(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    /// Original archive bytes when the content was read from one.
    pub fn packed(&self) -> Option<&[u8]> {
        self.packed.as_deref()
    }

    /// The content as a zip archive; reuses the original bytes if present.
    pub fn to_zip(&self) -> KeelResult<Vec<u8>> {
        match self.packed {
            Some(ref bytes) => Ok(bytes.clone()),
            None => write_zip(self.entries.iter().map(|(n, b)| (n.as_str(), b.as_slice()))),
        }
    }

    pub fn checksum(&self) -> String {
        entries_checksum(self.entries.iter().map(|(n, b)| (n.as_str(), b.as_slice())))
    }
}

/// BLAKE3 over entry names and bytes, in name order.
pub fn entries_checksum<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut sorted: Vec<(&str, &[u8])> = entries.into_iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = blake3::Hasher::new();
    for (name, bytes) in sorted {
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    format!("blake3:{}", hex::encode(hasher.finalize().as_bytes()))
}

/// Read every file entry of a zip archive. Directory entries are skipped.
pub fn read_zip_entries(bytes: &[u8]) -> KeelResult<BTreeMap<String, Vec<u8>>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut entries = BTreeMap::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let name = normalize_entry(file.name());
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)?;
        entries.insert(name, buf);
    }

    Ok(entries)
}

pub fn write_zip<'a, I>(entries: I) -> KeelResult<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, bytes) in entries {
        writer.start_file(name, options)?;
        writer.write_all(bytes)?;
    }

    Ok(writer.finish()?.into_inner())
}
