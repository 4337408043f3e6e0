//! Typed view over the headers the runtime acts on.

use crate::core::error::{KeelError, KeelResult};
use crate::core::version::{Version, VersionRange};
use crate::manifest::clause::{parse_clauses, Clause};
use crate::manifest::Manifest;
use std::collections::{BTreeMap, BTreeSet};

pub const BUNDLE_SYMBOLIC_NAME: &str = "Bundle-SymbolicName";
pub const BUNDLE_VERSION: &str = "Bundle-Version";
pub const BUNDLE_NAME: &str = "Bundle-Name";
pub const BUNDLE_MANIFEST_VERSION: &str = "Bundle-ManifestVersion";
pub const BUNDLE_ACTIVATOR: &str = "Bundle-Activator";
pub const BUNDLE_CLASSPATH: &str = "Bundle-ClassPath";
pub const BUNDLE_NATIVE_CODE: &str = "Bundle-NativeCode";
pub const EXPORT_PACKAGE: &str = "Export-Package";
pub const IMPORT_PACKAGE: &str = "Import-Package";
pub const REQUIRE_BUNDLE: &str = "Require-Bundle";
pub const FRAGMENT_HOST: &str = "Fragment-Host";

/// Attributes an exporter may not declare; importers use them to select a
/// provider by owning bundle.
const RESERVED_EXPORT_ATTRIBUTES: &[&str] = &["bundle-symbolic-name", "bundle-version"];

/// One exported package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSpec {
    pub name: String,
    pub version: Version,
    pub uses: Vec<String>,
    pub mandatory: Vec<String>,
    pub attributes: BTreeMap<String, String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl ExportSpec {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            uses: Vec::new(),
            mandatory: Vec::new(),
            attributes: BTreeMap::new(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// One imported package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpec {
    pub name: String,
    pub range: VersionRange,
    pub attributes: BTreeMap<String, String>,
    pub optional: bool,
}

impl ImportSpec {
    pub fn new(name: impl Into<String>, range: VersionRange) -> Self {
        Self {
            name: name.into(),
            range,
            attributes: BTreeMap::new(),
            optional: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequireSpec {
    pub name: String,
    pub range: VersionRange,
    pub reexport: bool,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub name: String,
    pub range: VersionRange,
}

/// Parsed and validated bundle manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleManifest {
    pub manifest_version: u32,
    pub symbolic_name: String,
    pub singleton: bool,
    pub version: Version,
    pub name: Option<String>,
    pub activator: Option<String>,
    pub classpath: Vec<String>,
    pub exports: Vec<ExportSpec>,
    pub imports: Vec<ImportSpec>,
    pub requires: Vec<RequireSpec>,
    pub fragment_host: Option<HostSpec>,
    pub native_code: Vec<String>,
    pub headers: Manifest,
}

impl BundleManifest {
    pub fn parse(bytes: &[u8]) -> KeelResult<Self> {
        Self::from_manifest(Manifest::parse(bytes)?)
    }

    /// Validate the raw headers. Any error here is a content error: the
    /// bundle must be rejected before storage or state is touched.
    pub fn from_manifest(headers: Manifest) -> KeelResult<Self> {
        let manifest_version = match headers.get(BUNDLE_MANIFEST_VERSION) {
            Some(v) => v.parse().map_err(|_| {
                KeelError::Manifest(format!("Invalid {}: '{}'", BUNDLE_MANIFEST_VERSION, v))
            })?,
            None => 1,
        };

        let bsn = headers.get(BUNDLE_SYMBOLIC_NAME).ok_or_else(|| {
            KeelError::Manifest(format!("Missing {} header", BUNDLE_SYMBOLIC_NAME))
        })?;
        let bsn_clauses = parse_clauses(BUNDLE_SYMBOLIC_NAME, bsn)?;
        let bsn_clause = match bsn_clauses.as_slice() {
            [single] if single.names.len() == 1 => single,
            _ => {
                return Err(KeelError::Manifest(format!(
                    "{} must name exactly one bundle",
                    BUNDLE_SYMBOLIC_NAME
                )))
            }
        };
        let symbolic_name = bsn_clause.names[0].clone();
        let singleton = bsn_clause.directive("singleton") == Some("true");

        let version = match headers.get(BUNDLE_VERSION) {
            Some(v) => Version::parse(v).map_err(|e| {
                KeelError::Manifest(format!("Invalid {} '{}': {}", BUNDLE_VERSION, v, e))
            })?,
            None => Version::zero(),
        };

        let classpath = match headers.get(BUNDLE_CLASSPATH) {
            Some(v) => {
                let mut entries = Vec::new();
                for clause in parse_clauses(BUNDLE_CLASSPATH, v)? {
                    entries.extend(clause.names);
                }
                entries
            }
            None => vec![".".to_string()],
        };

        let exports = parse_exports(&headers)?;
        let imports = parse_imports(&headers)?;
        let requires = parse_requires(&headers)?;
        let fragment_host = parse_host(&headers)?;

        let native_code = match headers.get(BUNDLE_NATIVE_CODE) {
            Some(v) => parse_clauses(BUNDLE_NATIVE_CODE, v)?
                .into_iter()
                .flat_map(|c| c.names)
                .filter(|n| n != "*")
                .collect(),
            None => Vec::new(),
        };

        if fragment_host.is_some() && headers.get(BUNDLE_ACTIVATOR).is_some() {
            return Err(KeelError::Manifest(format!(
                "Fragment {} cannot declare {}",
                symbolic_name, BUNDLE_ACTIVATOR
            )));
        }

        Ok(Self {
            manifest_version,
            symbolic_name,
            singleton,
            version,
            name: headers.get(BUNDLE_NAME).map(str::to_string),
            activator: headers.get(BUNDLE_ACTIVATOR).map(str::to_string),
            classpath,
            exports,
            imports,
            requires,
            fragment_host,
            native_code,
            headers,
        })
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_host.is_some()
    }

    pub fn has_native_code(&self) -> bool {
        !self.native_code.is_empty()
    }

    /// Classpath entries that point at nested archives.
    pub fn nested_archives(&self) -> impl Iterator<Item = &str> {
        self.classpath
            .iter()
            .map(String::as_str)
            .filter(|e| e.ends_with(".jar") || e.ends_with(".zip"))
    }
}

/// `version` and the legacy `specification-version` must agree when both
/// are given.
fn clause_version(header: &str, clause: &Clause) -> KeelResult<Option<String>> {
    let version = clause.attribute("version");
    let legacy = clause.attribute("specification-version");
    match (version, legacy) {
        (Some(a), Some(b)) if a != b => Err(KeelError::Manifest(format!(
            "{}: contradictory version '{}' and specification-version '{}' for {}",
            header,
            a,
            b,
            clause.names.join(";")
        ))),
        (Some(v), _) | (None, Some(v)) => Ok(Some(v.to_string())),
        (None, None) => Ok(None),
    }
}

fn matching_attributes(clause: &Clause) -> BTreeMap<String, String> {
    clause
        .attributes
        .iter()
        .filter(|(k, _)| k.as_str() != "version" && k.as_str() != "specification-version")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn check_package_name(header: &str, name: &str) -> KeelResult<()> {
    let valid = !name.is_empty()
        && name
            .split('.')
            .all(|part| !part.is_empty() && !part.contains(char::is_whitespace));
    if !valid {
        return Err(KeelError::Manifest(format!(
            "{}: invalid package name '{}'",
            header, name
        )));
    }
    if name == "java" || name.starts_with("java.") {
        return Err(KeelError::Manifest(format!(
            "{}: package '{}' is reserved",
            header, name
        )));
    }
    Ok(())
}

fn parse_exports(headers: &Manifest) -> KeelResult<Vec<ExportSpec>> {
    let Some(value) = headers.get(EXPORT_PACKAGE) else {
        return Ok(Vec::new());
    };

    let mut exports = Vec::new();
    for clause in parse_clauses(EXPORT_PACKAGE, value)? {
        let version = match clause_version(EXPORT_PACKAGE, &clause)? {
            Some(v) => Version::parse(&v).map_err(|e| {
                KeelError::Manifest(format!("{}: invalid version '{}': {}", EXPORT_PACKAGE, v, e))
            })?,
            None => Version::zero(),
        };

        let attributes = matching_attributes(&clause);
        if let Some(reserved) = RESERVED_EXPORT_ATTRIBUTES
            .iter()
            .find(|r| attributes.contains_key(**r))
        {
            return Err(KeelError::Manifest(format!(
                "{}: attribute '{}' may not be exported",
                EXPORT_PACKAGE, reserved
            )));
        }

        let mandatory = clause.directive_list("mandatory");
        for m in &mandatory {
            if !attributes.contains_key(m) {
                return Err(KeelError::Manifest(format!(
                    "{}: mandatory attribute '{}' is not declared",
                    EXPORT_PACKAGE, m
                )));
            }
        }

        for name in &clause.names {
            check_package_name(EXPORT_PACKAGE, name)?;
            exports.push(ExportSpec {
                name: name.clone(),
                version: version.clone(),
                uses: clause.directive_list("uses"),
                mandatory: mandatory.clone(),
                attributes: attributes.clone(),
                include: clause.directive_list("include"),
                exclude: clause.directive_list("exclude"),
            });
        }
    }
    Ok(exports)
}

fn parse_imports(headers: &Manifest) -> KeelResult<Vec<ImportSpec>> {
    let Some(value) = headers.get(IMPORT_PACKAGE) else {
        return Ok(Vec::new());
    };

    let mut seen = BTreeSet::new();
    let mut imports = Vec::new();
    for clause in parse_clauses(IMPORT_PACKAGE, value)? {
        let range = match clause_version(IMPORT_PACKAGE, &clause)? {
            Some(v) => VersionRange::parse(&v).map_err(|e| {
                KeelError::Manifest(format!("{}: invalid range '{}': {}", IMPORT_PACKAGE, v, e))
            })?,
            None => VersionRange::any(),
        };
        if let Some(bv) = clause.attribute("bundle-version") {
            VersionRange::parse(bv).map_err(|e| {
                KeelError::Manifest(format!(
                    "{}: invalid bundle-version '{}': {}",
                    IMPORT_PACKAGE, bv, e
                ))
            })?;
        }
        let optional = parse_resolution(IMPORT_PACKAGE, &clause)?;

        for name in &clause.names {
            check_package_name(IMPORT_PACKAGE, name)?;
            if !seen.insert(name.clone()) {
                return Err(KeelError::Manifest(format!(
                    "{}: package '{}' imported more than once",
                    IMPORT_PACKAGE, name
                )));
            }
            imports.push(ImportSpec {
                name: name.clone(),
                range: range.clone(),
                attributes: matching_attributes(&clause),
                optional,
            });
        }
    }
    Ok(imports)
}

fn parse_resolution(header: &str, clause: &Clause) -> KeelResult<bool> {
    match clause.directive("resolution") {
        None | Some("mandatory") => Ok(false),
        Some("optional") => Ok(true),
        Some(other) => Err(KeelError::Manifest(format!(
            "{}: unknown resolution '{}'",
            header, other
        ))),
    }
}

fn parse_requires(headers: &Manifest) -> KeelResult<Vec<RequireSpec>> {
    let Some(value) = headers.get(REQUIRE_BUNDLE) else {
        return Ok(Vec::new());
    };

    let mut requires = Vec::new();
    for clause in parse_clauses(REQUIRE_BUNDLE, value)? {
        let range = match clause.attribute("bundle-version") {
            Some(v) => VersionRange::parse(v)?,
            None => VersionRange::any(),
        };
        let reexport = match clause.directive("visibility") {
            None | Some("private") => false,
            Some("reexport") => true,
            Some(other) => {
                return Err(KeelError::Manifest(format!(
                    "{}: unknown visibility '{}'",
                    REQUIRE_BUNDLE, other
                )))
            }
        };
        let optional = parse_resolution(REQUIRE_BUNDLE, &clause)?;
        for name in &clause.names {
            requires.push(RequireSpec {
                name: name.clone(),
                range: range.clone(),
                reexport,
                optional,
            });
        }
    }
    Ok(requires)
}

fn parse_host(headers: &Manifest) -> KeelResult<Option<HostSpec>> {
    let Some(value) = headers.get(FRAGMENT_HOST) else {
        return Ok(None);
    };

    let clauses = parse_clauses(FRAGMENT_HOST, value)?;
    let clause = match clauses.as_slice() {
        [single] if single.names.len() == 1 => single,
        _ => {
            return Err(KeelError::Manifest(format!(
                "{} must name exactly one host",
                FRAGMENT_HOST
            )))
        }
    };
    let range = match clause.attribute("bundle-version") {
        Some(v) => VersionRange::parse(v)?,
        None => VersionRange::any(),
    };
    Ok(Some(HostSpec {
        name: clause.names[0].clone(),
        range,
    }))
}
