//! Identifiers shared by the storage layer, the registry and the framework.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric bundle id, allocated monotonically by the archive store.
pub type BundleId = u64;

/// Revision number, monotonic per bundle id. The first revision is 0.
pub type RevisionNumber = u32;

/// Identifies one revision of one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevisionKey {
    pub bundle: BundleId,
    pub revision: RevisionNumber,
}

impl RevisionKey {
    pub fn new(bundle: BundleId, revision: RevisionNumber) -> Self {
        Self { bundle, revision }
    }
}

impl fmt::Display for RevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.r{}", self.bundle, self.revision)
    }
}

/// Lifecycle of anything that can be superseded while still referenced:
/// stored revisions and registered exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    #[default]
    Active,
    /// Logically removed but still referenced by a live wiring or reader.
    Zombie,
    Purged,
}

impl Liveness {
    pub fn is_zombie(self) -> bool {
        self == Liveness::Zombie
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Liveness::Active => "active",
            Liveness::Zombie => "zombie",
            Liveness::Purged => "purged",
        };
        f.write_str(s)
    }
}
