use crate::core::error::{KeelError, KeelResult};
use std::path::{Path, PathBuf};

/// Get the Keel configuration directory
///
/// Platform-specific locations:
/// - Windows: %APPDATA%\keel
/// - Linux: ~/.config/keel
/// - macOS: ~/Library/Application Support/keel
pub fn keel_home() -> KeelResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| KeelError::Path("Could not determine config directory".to_string()))?;
    Ok(config_dir.join("keel"))
}

/// Get the config file path (`<keel home>/config.yaml`)
pub fn config_file() -> KeelResult<PathBuf> {
    Ok(keel_home()?.join("config.yaml"))
}

/// Get the default bundle storage directory
///
/// Platform-specific locations:
/// - Windows: %LOCALAPPDATA%\keel\bundles
/// - Linux: ~/.local/share/keel/bundles
/// - macOS: ~/Library/Application Support/keel/bundles
pub fn default_storage_dir() -> KeelResult<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .ok_or_else(|| KeelError::Path("Could not determine data directory".to_string()))?;
    Ok(data_dir.join("keel").join("bundles"))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> KeelResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Normalize a bundle entry name: forward slashes, no leading `/` or `./`.
pub fn normalize_entry(name: &str) -> String {
    let replaced = name.replace('\\', "/");
    let mut trimmed = replaced.as_str();
    loop {
        if let Some(rest) = trimmed.strip_prefix("./") {
            trimmed = rest;
        } else if let Some(rest) = trimmed.strip_prefix('/') {
            trimmed = rest;
        } else {
            break;
        }
    }
    trimmed.to_string()
}

/// Reject entry names that would escape a storage directory.
pub fn is_safe_entry(name: &str) -> bool {
    !name.is_empty() && !name.split('/').any(|part| part == "..")
}
