use crate::archive::BundleArchive;
use crate::core::{BundleId, KeelResult, RevisionKey, Version};
use crate::package::PackageFilter;
use crate::storage::ArchiveStore;
use chrono::{DateTime, Utc};
use keel_core::manifest::BundleManifest;
use std::sync::Arc;

/// One immutable version-in-time of an installed bundle.
#[derive(Debug)]
pub struct BundleRevision {
    key: RevisionKey,
    location: String,
    archive: Arc<BundleArchive>,
    created_at: DateTime<Utc>,
}

impl BundleRevision {
    /// Open a stored revision. Export filters are compiled here so a bad
    /// pattern is rejected before the revision is registered.
    pub fn open(store: &ArchiveStore, key: RevisionKey, location: &str) -> KeelResult<Self> {
        let archive = BundleArchive::open(store, key)?;
        for export in &archive.manifest().exports {
            PackageFilter::new(&export.include, &export.exclude)?;
        }
        Ok(Self {
            key,
            location: location.to_string(),
            archive: Arc::new(archive),
            created_at: Utc::now(),
        })
    }

    pub fn key(&self) -> RevisionKey {
        self.key
    }

    pub fn bundle_id(&self) -> BundleId {
        self.key.bundle
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn manifest(&self) -> &BundleManifest {
        self.archive.manifest()
    }

    pub fn symbolic_name(&self) -> &str {
        &self.manifest().symbolic_name
    }

    pub fn version(&self) -> &Version {
        &self.manifest().version
    }

    pub fn is_fragment(&self) -> bool {
        self.manifest().is_fragment()
    }

    pub fn archive(&self) -> &Arc<BundleArchive> {
        &self.archive
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
