use crate::core::path::{config_file, default_storage_dir, ensure_dir};
use crate::core::{KeelError, KeelResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Which storage backend holds bundle content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkConfig {
    /// Storage backend
    /// - "file": revisions persisted under `storage_dir` (default)
    /// - "memory": content kept in process memory, lost on exit
    #[serde(default)]
    pub storage: StorageKind,

    /// Bundle storage directory (defaults to platform-specific data directory)
    ///
    /// Default locations:
    /// - Windows: %LOCALAPPDATA%\keel\bundles
    /// - Linux: ~/.local/share/keel/bundles
    /// - macOS: ~/Library/Application Support/keel/bundles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<String>,

    /// Always extract bundle content instead of keeping the archive
    #[serde(default)]
    pub always_unpack: bool,

    /// Delete everything in the storage directory on startup
    #[serde(default)]
    pub clean_on_start: bool,

    /// How many times a resolution is recomputed when the framework state
    /// changed underneath it
    #[serde(default = "default_resolve_retry_limit")]
    pub resolve_retry_limit: u32,

    /// Buffered events per subscriber before the slowest one lags
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_resolve_retry_limit() -> u32 {
    8
}

fn default_event_capacity() -> usize {
    256
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::default(),
            storage_dir: None,
            always_unpack: false,
            clean_on_start: false,
            resolve_retry_limit: default_resolve_retry_limit(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl FrameworkConfig {
    /// Configuration for a throwaway in-memory framework.
    pub fn in_memory() -> Self {
        Self {
            storage: StorageKind::Memory,
            ..Default::default()
        }
    }

    /// File-backed configuration rooted at `dir`.
    pub fn with_storage_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            storage: StorageKind::File,
            storage_dir: Some(dir.as_ref().to_string_lossy().into_owned()),
            ..Default::default()
        }
    }

    /// Load config from the platform-specific config directory. A missing
    /// file yields the defaults.
    ///
    /// Config locations:
    /// - Windows: %APPDATA%\keel\config.yaml
    /// - Linux: ~/.config/keel/config.yaml
    /// - macOS: ~/Library/Application Support/keel/config.yaml
    pub fn load() -> KeelResult<Self> {
        Self::load_from(&config_file()?)
    }

    pub fn load_from(path: &Path) -> KeelResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: FrameworkConfig = serde_yaml::from_str(&content)
            .map_err(|e| KeelError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> KeelResult<()> {
        let dir = path
            .parent()
            .ok_or_else(|| KeelError::Path("Invalid config path".to_string()))?;
        ensure_dir(dir)?;

        let content = serde_yaml::to_string(self)
            .map_err(|e| KeelError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> KeelResult<()> {
        if self.event_capacity == 0 {
            return Err(KeelError::Config(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the storage directory path
    pub fn storage_dir(&self) -> KeelResult<PathBuf> {
        match self.storage_dir {
            Some(ref dir) => Ok(PathBuf::from(dir)),
            None => default_storage_dir(),
        }
    }
}
