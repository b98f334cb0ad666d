#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Domain types for CPAN-in-git archives: the version grammar, the package
//! index wire format, branch configuration, dist metadata, and the
//! core-perl baseline. Nothing in this crate touches the object store or
//! the network.

pub mod config;
pub mod corelist;
pub mod index;
pub mod version;

pub use config::{BranchConfig, DistMeta, PhaseReqs, Prereqs, DEFAULT_PACKAGE_DETAILS_MAX_AGE};
pub use corelist::CoreList;
pub use index::{scan_last_updated, IndexError, PackageIndex, PackageRow};
pub use version::{combine, compare, parse_requirement, Op, VersionError, VersionReq};
