use anyhow::Context;
use keel::framework::{BundleInfo, ImportedPackage, RequiredBundle};
use keel::{Framework, FrameworkConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub struct ResolveOptions {
    pub dir: PathBuf,
    pub json: bool,
    pub storage_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Serialize)]
struct BundleReport {
    #[serde(flatten)]
    info: BundleInfo,
    imports: Vec<ImportedPackage>,
    requires: Vec<RequiredBundle>,
    fragments: Vec<u64>,
    hosts: Vec<u64>,
}

#[derive(Serialize)]
struct Failure {
    bundle: u64,
    error: String,
}

#[derive(Serialize)]
struct Report {
    bundles: Vec<BundleReport>,
    failures: Vec<Failure>,
}

fn framework_config(options: &ResolveOptions) -> anyhow::Result<FrameworkConfig> {
    let mut config = match &options.config {
        Some(path) => FrameworkConfig::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => FrameworkConfig::in_memory(),
    };
    if let Some(dir) = &options.storage_dir {
        config = FrameworkConfig {
            clean_on_start: config.clean_on_start,
            always_unpack: config.always_unpack,
            ..FrameworkConfig::with_storage_dir(dir)
        };
    }
    Ok(config)
}

/// Bundle archives and exploded bundle directories directly under `dir`.
fn bundle_paths(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to scan {}", dir.display()))?;
        let path = entry.path();
        let is_archive = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("jar") || e.eq_ignore_ascii_case("zip"));
        let is_exploded = path.is_dir() && path.join("META-INF").join("MANIFEST.MF").is_file();
        if is_archive || is_exploded {
            paths.push(path.to_path_buf());
        } else {
            debug!(path = %path.display(), "skipping non-bundle entry");
        }
    }
    Ok(paths)
}

/// Returns whether every bundle resolved.
pub fn run(options: ResolveOptions) -> anyhow::Result<bool> {
    let framework = Framework::new(framework_config(&options)?)?;

    for path in bundle_paths(&options.dir)? {
        framework
            .install_path(&path)
            .with_context(|| format!("failed to install {}", path.display()))?;
    }

    let failures: Vec<Failure> = framework
        .resolve_all()
        .into_iter()
        .map(|(bundle, e)| Failure {
            bundle,
            error: e.to_string(),
        })
        .collect();

    let mut bundles = Vec::new();
    for info in framework.bundles() {
        let id = info.id;
        bundles.push(BundleReport {
            imports: framework.imported_packages(id)?,
            requires: framework.required_bundles(id)?,
            fragments: framework.fragments(id)?,
            hosts: framework.hosts(id)?,
            info,
        });
    }
    let report = Report { bundles, failures };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report.failures.is_empty())
}

fn print_report(report: &Report) {
    if report.bundles.is_empty() {
        println!("No bundles found.");
        return;
    }

    for bundle in &report.bundles {
        let info = &bundle.info;
        println!(
            "[{}] {} {} ({})",
            info.id, info.symbolic_name, info.version, info.state
        );
        for import in &bundle.imports {
            match &import.provider {
                Some(p) => println!(
                    "    import {} {} -> [{}] {}",
                    import.name, import.range, p.bundle, p.version
                ),
                None => println!("    import {} {} -> unwired", import.name, import.range),
            }
        }
        for require in &bundle.requires {
            println!("    require {} -> [{}]", require.name, require.bundle);
        }
        for fragment in &bundle.fragments {
            println!("    fragment [{}]", fragment);
        }
        for host in &bundle.hosts {
            println!("    attached to [{}]", host);
        }
    }

    if !report.failures.is_empty() {
        println!();
        println!("Unresolved:");
        for failure in &report.failures {
            println!("  [{}] {}", failure.bundle, failure.error);
        }
    }
}
