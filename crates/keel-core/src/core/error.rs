use crate::core::ids::BundleId;
use thiserror::Error;

pub type KeelResult<T> = Result<T, KeelError>;

#[derive(Error, Debug)]
pub enum KeelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("WalkDir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Path error: {0}")]
    Path(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or contradictory manifest. Rejected before any id or
    /// state change.
    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Version error: {0}")]
    Version(String),

    /// Content the selected storage backend cannot hold.
    #[error("Unsupported content: {0}")]
    Unsupported(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Operation is not valid for the bundle's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown bundle: {0}")]
    UnknownBundle(BundleId),

    #[error("Duplicate bundle: {0}")]
    Duplicate(String),

    /// The activation hook failed to start or stop a bundle.
    #[error("Activation failed: {0}")]
    Activation(String),
}

impl KeelError {
    /// Whether this error came out of the resolver and may succeed once the
    /// set of installed bundles changes.
    pub fn is_resolution(&self) -> bool {
        matches!(self, KeelError::Resolution(_))
    }
}

/// Why a bundle could not be wired. Carries enough detail to tell which
/// package, range or bundles were involved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("bundle {bundle}: missing package {package} {range}")]
    MissingPackage {
        bundle: BundleId,
        package: String,
        range: String,
    },

    #[error("bundle {bundle}: uses constraint violation on package {package} (conflicting bundles {conflicting:?})")]
    UsesConflict {
        bundle: BundleId,
        package: String,
        conflicting: Vec<BundleId>,
    },

    #[error("bundle {bundle}: no fragment host {host} {range}")]
    MissingHost {
        bundle: BundleId,
        host: String,
        range: String,
    },

    #[error("bundle {bundle}: missing required bundle {name} {range}")]
    MissingRequiredBundle {
        bundle: BundleId,
        name: String,
        range: String,
    },

    #[error("fragment {fragment} cannot attach to host {host}: {reason}")]
    FragmentAttach {
        fragment: BundleId,
        host: BundleId,
        reason: String,
    },
}

impl ResolutionError {
    /// The bundle whose resolution failed.
    pub fn bundle(&self) -> BundleId {
        match self {
            ResolutionError::MissingPackage { bundle, .. }
            | ResolutionError::UsesConflict { bundle, .. }
            | ResolutionError::MissingHost { bundle, .. }
            | ResolutionError::MissingRequiredBundle { bundle, .. } => *bundle,
            ResolutionError::FragmentAttach { fragment, .. } => *fragment,
        }
    }
}
