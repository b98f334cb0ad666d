#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! The archive-tree engine: CPAN mirrors and DarkPANs stored as file trees
//! inside branches of a git object store.
//!
//! A [`Repository`] vends one [`ArchiveTree`] per branch. Archive trees
//! stage writes in an in-memory overlay over an immutable snapshot; mirror
//! branches lazily fetch missing files from their upstream and batch the
//! results into debounced commits via the [`DelayedCommitter`]. The
//! resolver imports distributions between peer branches while walking
//! version requirements breadth-first.

pub mod committer;
pub mod gitstore;
pub mod overlay;
pub mod repository;
pub mod resolver;
pub mod tree;
pub mod upstream;

pub use committer::{Clock, CommitOutcome, DelayedCommitter, SystemClock, DEFAULT_COMMIT_DELAY};
pub use gitstore::{GitStore, FILEMODE_BLOB, FILEMODE_TREE};
pub use overlay::{ChangeNode, ChangeSet, Lookup, PathCollision};
pub use repository::{RepoError, Repository, RepositoryOptions, DEFAULT_CACHE_BRANCH};
pub use resolver::{ImportOptions, ResolveError};
pub use tree::archive::{ArchiveError, ArchiveTree, AUTHORS_PREFIX, CONFIG_PATH, PACKAGE_DETAILS_PATH};
pub use tree::{CommitOptions, MutableTree, TreeError};
pub use upstream::{HttpAgent, HttpResponse, UpstreamError, UserAgent};
