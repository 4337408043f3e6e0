//! Package namespace: who exports what, who imports what, and which export
//! each import is wired to.

pub mod export;
pub mod registry;

pub use export::{ExportId, ExportPkg, ImportId, ImportPkg, PackageFilter, Pkg};
pub use registry::{PackageRegistry, RequireWire};
