use anyhow::Context;
use keel::storage::BundleContent;
use keel::BundleManifest;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct ManifestSummary {
    symbolic_name: String,
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    activator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fragment_host: Option<String>,
    classpath: Vec<String>,
    exports: Vec<String>,
    imports: Vec<String>,
    requires: Vec<String>,
    native_code: Vec<String>,
    entries: usize,
}

impl ManifestSummary {
    fn new(manifest: &BundleManifest, entries: usize) -> Self {
        Self {
            symbolic_name: manifest.symbolic_name.clone(),
            version: manifest.version.to_string(),
            name: manifest.name.clone(),
            activator: manifest.activator.clone(),
            fragment_host: manifest
                .fragment_host
                .as_ref()
                .map(|h| format!("{} {}", h.name, h.range)),
            classpath: manifest.classpath.clone(),
            exports: manifest
                .exports
                .iter()
                .map(|e| {
                    let mut line = format!("{} {}", e.name, e.version);
                    if !e.uses.is_empty() {
                        line.push_str(&format!(" uses {}", e.uses.join(",")));
                    }
                    line
                })
                .collect(),
            imports: manifest
                .imports
                .iter()
                .map(|i| {
                    let optional = if i.optional { " (optional)" } else { "" };
                    format!("{} {}{}", i.name, i.range, optional)
                })
                .collect(),
            requires: manifest
                .requires
                .iter()
                .map(|r| {
                    let reexport = if r.reexport { " (reexport)" } else { "" };
                    format!("{} {}{}", r.name, r.range, reexport)
                })
                .collect(),
            native_code: manifest.native_code.clone(),
            entries,
        }
    }
}

pub fn run(path: &Path, json: bool) -> anyhow::Result<()> {
    let content = BundleContent::from_path(path)
        .with_context(|| format!("failed to read bundle {}", path.display()))?;
    let summary = ManifestSummary::new(content.manifest(), content.entries().len());

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{} {}", summary.symbolic_name, summary.version);
    if let Some(name) = &summary.name {
        println!("  name: {}", name);
    }
    if let Some(activator) = &summary.activator {
        println!("  activator: {}", activator);
    }
    if let Some(host) = &summary.fragment_host {
        println!("  fragment of: {}", host);
    }
    println!("  classpath: {}", summary.classpath.join(", "));
    print_section("exports", &summary.exports);
    print_section("imports", &summary.imports);
    print_section("requires", &summary.requires);
    print_section("native code", &summary.native_code);
    println!("  entries: {}", summary.entries);
    Ok(())
}

fn print_section(title: &str, lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    println!("  {}:", title);
    for line in lines {
        println!("    {}", line);
    }
}
