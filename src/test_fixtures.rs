//! Bundle builders for unit tests.

use crate::storage::content::write_zip;
use crate::storage::BundleContent;
use keel_core::manifest::{Manifest, MANIFEST_PATH};

pub struct TestBundle {
    headers: Vec<(String, String)>,
    entries: Vec<(String, Vec<u8>)>,
}

impl TestBundle {
    pub fn new(symbolic_name: &str) -> Self {
        Self {
            headers: vec![
                ("Bundle-ManifestVersion".to_string(), "2".to_string()),
                ("Bundle-SymbolicName".to_string(), symbolic_name.to_string()),
            ],
            entries: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
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

    fn manifest_text(&self) -> String {
        Manifest::from_headers(self.headers.iter().cloned()).to_text()
    }

    pub fn zip(&self) -> Vec<u8> {
        let manifest = self.manifest_text();
        let mut all: Vec<(&str, &[u8])> = vec![(MANIFEST_PATH, manifest.as_bytes())];
        all.extend(self.entries.iter().map(|(n, b)| (n.as_str(), b.as_slice())));
        write_zip(all).unwrap()
    }

    pub fn content(&self) -> BundleContent {
        BundleContent::from_zip(self.zip()).unwrap()
    }
}
