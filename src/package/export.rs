//! Export and import records held by the registry.

use crate::core::{KeelError, KeelResult, Liveness, RevisionKey, Version, VersionRange};
use globset::{Glob, GlobSet, GlobSetBuilder};
use keel_core::manifest::{ExportSpec, ImportSpec};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ExportId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ImportId(pub(crate) u64);

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// `include:=` / `exclude:=` class-name filters of an export.
#[derive(Debug, Clone, Default)]
pub struct PackageFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl PackageFilter {
    pub fn new(include: &[String], exclude: &[String]) -> KeelResult<Self> {
        Ok(Self {
            include: build_globs(include)?,
            exclude: build_globs(exclude)?,
        })
    }

    /// Whether a class with this simple name (no package, no `.class`) may
    /// be loaded through the export.
    pub fn allows(&self, simple_name: &str) -> bool {
        let included = self
            .include
            .as_ref()
            .map_or(true, |set| set.is_match(simple_name));
        let excluded = self
            .exclude
            .as_ref()
            .is_some_and(|set| set.is_match(simple_name));
        included && !excluded
    }
}

fn build_globs(patterns: &[String]) -> KeelResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| KeelError::Manifest(format!("Invalid filter '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| KeelError::Manifest(format!("Invalid filter set: {}", e)))?;
    Ok(Some(set))
}

/// One package offered by a revision.
#[derive(Debug, Clone)]
pub struct ExportPkg {
    pub id: ExportId,
    pub name: String,
    pub version: Version,
    pub uses: Vec<String>,
    pub mandatory: Vec<String>,
    pub attributes: BTreeMap<String, String>,
    pub filter: PackageFilter,
    /// Revision whose package space holds the export. For a fragment
    /// contribution this is the host.
    pub owner: RevisionKey,
    pub owner_name: String,
    pub owner_version: Version,
    /// Fragment that contributed the export, if any.
    pub fragment: Option<RevisionKey>,
    pub liveness: Liveness,
}

impl ExportPkg {
    pub fn new(
        spec: &ExportSpec,
        owner: RevisionKey,
        owner_name: &str,
        owner_version: &Version,
        fragment: Option<RevisionKey>,
    ) -> KeelResult<Self> {
        Ok(Self {
            id: ExportId(0),
            name: spec.name.clone(),
            version: spec.version.clone(),
            uses: spec.uses.clone(),
            mandatory: spec.mandatory.clone(),
            attributes: spec.attributes.clone(),
            filter: PackageFilter::new(&spec.include, &spec.exclude)?,
            owner,
            owner_name: owner_name.to_string(),
            owner_version: owner_version.clone(),
            fragment,
            liveness: Liveness::Active,
        })
    }

    /// Version range, attribute matchers and mandatory attributes.
    pub fn matches(&self, import: &ImportPkg) -> bool {
        if self.name != import.name || !import.range.includes(&self.version) {
            return false;
        }

        for (key, wanted) in &import.attributes {
            let ok = match key.as_str() {
                "bundle-symbolic-name" => *wanted == self.owner_name,
                "bundle-version" => VersionRange::parse(wanted)
                    .map(|range| range.includes(&self.owner_version))
                    .unwrap_or(false),
                _ => self.attributes.get(key) == Some(wanted),
            };
            if !ok {
                return false;
            }
        }

        self.mandatory
            .iter()
            .all(|attr| import.attributes.contains_key(attr))
    }

    pub fn is_visible(&self, simple_name: &str) -> bool {
        self.filter.allows(simple_name)
    }

    pub fn is_zombie(&self) -> bool {
        self.liveness.is_zombie()
    }

    /// Revision whose archive holds the package content.
    pub fn content_revision(&self) -> RevisionKey {
        self.fragment.unwrap_or(self.owner)
    }
}

/// One package required by a revision.
#[derive(Debug, Clone)]
pub struct ImportPkg {
    pub id: ImportId,
    pub name: String,
    pub range: VersionRange,
    pub attributes: BTreeMap<String, String>,
    pub optional: bool,
    pub owner: RevisionKey,
    pub fragment: Option<RevisionKey>,
    pub provider: Option<ExportId>,
}

impl ImportPkg {
    pub fn new(spec: &ImportSpec, owner: RevisionKey, fragment: Option<RevisionKey>) -> Self {
        Self {
            id: ImportId(0),
            name: spec.name.clone(),
            range: spec.range.clone(),
            attributes: spec.attributes.clone(),
            optional: spec.optional,
            owner,
            fragment,
            provider: None,
        }
    }
}

/// All providers and consumers of one package name.
#[derive(Debug, Clone, Default)]
pub struct Pkg {
    pub name: String,
    pub providers: BTreeSet<ExportId>,
    pub importers: BTreeSet<ImportId>,
}

impl Pkg {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.importers.is_empty()
    }
}
