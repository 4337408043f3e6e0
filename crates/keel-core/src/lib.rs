//! Core types for Keel
//!
//! Error taxonomy, version model, manifest parsing and the identifiers shared
//! between the storage layer, the package registry and the framework.

pub mod core {
    pub mod error;
    pub mod ids;
    pub mod path;
    pub mod version;

    pub use error::{KeelError, KeelResult, ResolutionError};
    pub use ids::{BundleId, Liveness, RevisionKey, RevisionNumber};
    pub use version::{Version, VersionRange};
}

pub mod manifest;

pub use crate::core::{
    BundleId, KeelError, KeelResult, Liveness, ResolutionError, RevisionKey, RevisionNumber,
    Version, VersionRange,
};
