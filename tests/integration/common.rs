//! Common utilities for integration tests

use keel::core::manifest::{Manifest, MANIFEST_PATH};
use keel::storage::BundleContent;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

pub fn keel_command() -> Command {
    Command::new(env!("CARGO_BIN_EXE_keel"))
}

/// Builder for bundle archives.
pub struct Bundle {
    headers: Vec<(String, String)>,
    entries: Vec<(String, Vec<u8>)>,
}

impl Bundle {
    pub fn new(symbolic_name: &str) -> Self {
        Self {
            headers: vec![
                ("Manifest-Version".to_string(), "1.0".to_string()),
                ("Bundle-ManifestVersion".to_string(), "2".to_string()),
                ("Bundle-SymbolicName".to_string(), symbolic_name.to_string()),
            ],
            entries: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn version(self, version: &str) -> Self {
        self.header("Bundle-Version", version)
    }

    pub fn exports(self, value: &str) -> Self {
        self.header("Export-Package", value)
    }

    pub fn imports(self, value: &str) -> Self {
        self.header("Import-Package", value)
    }

    pub fn requires(self, value: &str) -> Self {
        self.header("Require-Bundle", value)
    }

    pub fn host(self, value: &str) -> Self {
        self.header("Fragment-Host", value)
    }

    pub fn entry(mut self, name: &str, bytes: &[u8]) -> Self {
        self.entries.push((name.to_string(), bytes.to_vec()));
        self
    }

    fn manifest(&self) -> String {
        Manifest::from_headers(self.headers.iter().cloned()).to_text()
    }

    pub fn zip(&self) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default();
        writer.start_file(MANIFEST_PATH, options).unwrap();
        writer.write_all(self.manifest().as_bytes()).unwrap();
        for (name, bytes) in &self.entries {
            writer.start_file(name.as_str(), options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    pub fn content(&self) -> BundleContent {
        BundleContent::from_zip(self.zip()).unwrap()
    }

    /// Write the bundle as `<dir>/<file_name>`.
    pub fn write_jar(&self, dir: &Path, file_name: &str) -> PathBuf {
        let path = dir.join(file_name);
        fs::write(&path, self.zip()).unwrap();
        path
    }

    /// Write the bundle unpacked under `<dir>/<dir_name>/`.
    pub fn write_dir(&self, dir: &Path, dir_name: &str) -> PathBuf {
        let root = dir.join(dir_name);
        let manifest = root.join(MANIFEST_PATH);
        fs::create_dir_all(manifest.parent().unwrap()).unwrap();
        fs::write(&manifest, self.manifest()).unwrap();
        for (name, bytes) in &self.entries {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, bytes).unwrap();
        }
        root
    }
}
