//! Keel: a dynamic module runtime
//!
//! This crate provides the framework proper, re-exporting core types from
//! `keel-core` and organizing revisioned bundle storage, the package
//! registry, the resolver and the bundle lifecycle.

pub use keel_core::manifest::BundleManifest;
pub use keel_core::{KeelError, KeelResult, ResolutionError};

/// Core module re-exported from keel-core.
pub mod core {
    pub use keel_core::core::*;
    pub use keel_core::*;

    /// Path module re-exported from keel-core.
    pub mod path {
        pub use keel_core::core::path::*;
    }
}

/// Configuration management.
pub mod config;

/// Revisioned bundle storage.
pub mod storage;

/// Bundle manifest, classpath and entry lookup.
pub mod archive;

/// Package registry and wiring.
pub mod package;

/// Wiring algorithm.
pub mod resolver;

/// Bundle lifecycle, events, refresh and queries.
pub mod framework;

#[cfg(test)]
mod test_fixtures;

pub use config::{FrameworkConfig, StorageKind};
pub use framework::{ActivationHook, BundleState, Event, Framework};
