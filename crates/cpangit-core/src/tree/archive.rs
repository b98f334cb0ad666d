//! Archive trees: mutable trees that know the CPAN layout.
//!
//! An archive tree owns lazily parsed views of its configuration blob and
//! package index, both invalidated when the backing path is rewritten, and
//! implements `import_dist`: copying a distribution from a peer branch and
//! transferring ownership of the modules it provides.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use anyhow::Result;
use git2::Oid;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use cpangit_domain::{BranchConfig, DistMeta, PackageIndex, PackageRow, VersionReq};

use crate::committer::DelayedCommitter;
use crate::gitstore::{FILEMODE_BLOB, FILEMODE_TREE};
use crate::tree::MutableTree;
use crate::upstream::UserAgent;

pub const CONFIG_PATH: &str = "cpan_ingit.json";
pub const PACKAGE_DETAILS_PATH: &str = "modules/02packages.details.txt";
pub const AUTHORS_PREFIX: &str = "authors/id/";

/// Archive extensions recognized when deriving a dist's metadata path.
const DIST_EXTENSIONS: [&str; 5] = [".tar.gz", ".tgz", ".zip", ".tar.bz2", ".tbz2"];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("branch carries no {CONFIG_PATH}")]
    MissingConfig,
    #[error("dist `{0}` is not present in the peer branch")]
    NotInPeer(String),
    #[error("dist `{path}` already present with different content (have {have}, want {want})")]
    DistCollision { path: String, have: Oid, want: Oid },
}

pub struct ArchiveTree {
    tree: MutableTree,
    config: Option<BranchConfig>,
    index: Option<PackageIndex>,
    committer: Option<Rc<DelayedCommitter>>,
    agent: Option<Rc<dyn UserAgent>>,
    dist_cache: Option<Rc<RefCell<ArchiveTree>>>,
    /// Fetch times for staged package-details blobs, so a freshly fetched
    /// index is not immediately re-judged stale by its own header.
    fetched_at: HashMap<Oid, OffsetDateTime>,
}

impl ArchiveTree {
    #[must_use]
    pub fn new(tree: MutableTree) -> Self {
        Self {
            tree,
            config: None,
            index: None,
            committer: None,
            agent: None,
            dist_cache: None,
            fetched_at: HashMap::new(),
        }
    }

    pub(crate) fn attach_committer(&mut self, committer: Rc<DelayedCommitter>) {
        self.committer = Some(committer);
    }

    pub(crate) fn attach_agent(&mut self, agent: Rc<dyn UserAgent>) {
        self.agent = Some(agent);
    }

    pub(crate) fn attach_dist_cache(&mut self, cache: Rc<RefCell<ArchiveTree>>) {
        self.dist_cache = Some(cache);
    }

    #[must_use]
    pub fn tree(&self) -> &MutableTree {
        &self.tree
    }

    #[must_use]
    pub fn tree_mut(&mut self) -> &mut MutableTree {
        &mut self.tree
    }

    #[must_use]
    pub fn branch(&self) -> Option<&str> {
        self.tree.branch()
    }

    /// Path lookup with the mirror refinement: see `mirror.rs`.
    pub fn get_path(&mut self, path: &str) -> Result<Option<(Oid, i32)>> {
        self.get_path_autofetch(path)
    }

    /// Read the blob at `path`, fetching it from upstream when this tree
    /// mirrors one.
    pub fn get_blob(&mut self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.get_path(path)? {
            Some((oid, mode)) if mode != FILEMODE_TREE => {
                Ok(Some(self.tree.store().read_blob(oid)?))
            }
            _ => Ok(None),
        }
    }

    /// Stage `content` at `path`, invalidating any cached view it backs.
    pub fn set_path(&mut self, path: &str, content: Option<&[u8]>, mode: i32) -> Result<Option<Oid>> {
        let oid = self.tree.set_path(path, content, mode)?;
        self.invalidate(path);
        Ok(oid)
    }

    pub(crate) fn invalidate(&mut self, path: &str) {
        if path == CONFIG_PATH {
            self.config = None;
        }
        if path == PACKAGE_DETAILS_PATH {
            self.index = None;
        }
    }

    pub(crate) fn read_raw(&mut self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.get_path(path)? {
            Some((oid, mode)) if mode != FILEMODE_TREE => {
                Ok(Some(self.tree.store().read_blob(oid)?))
            }
            _ => Ok(None),
        }
    }

    /// The config blob entry, or `None` when absent or not a blob.
    pub fn config_blob(&mut self) -> Result<Option<(Oid, i32)>> {
        Ok(self
            .get_path(CONFIG_PATH)?
            .filter(|(_, mode)| *mode != FILEMODE_TREE))
    }

    /// The package-details blob entry, or `None` when absent or not a blob.
    pub fn package_details_blob(&mut self) -> Result<Option<(Oid, i32)>> {
        Ok(self
            .get_path(PACKAGE_DETAILS_PATH)?
            .filter(|(_, mode)| *mode != FILEMODE_TREE))
    }

    /// The branch configuration; fails with `MissingConfig` when the branch
    /// carries none.
    pub fn config(&mut self) -> Result<&BranchConfig> {
        if self.config_opt()?.is_none() {
            return Err(ArchiveError::MissingConfig.into());
        }
        Ok(self
            .config
            .as_ref()
            .expect("config cache populated by config_opt"))
    }

    /// The branch configuration, or `None` when the branch carries none.
    pub fn config_opt(&mut self) -> Result<Option<&BranchConfig>> {
        if self.config.is_none() {
            let Some(bytes) = self.read_raw(CONFIG_PATH)? else {
                return Ok(None);
            };
            self.config = Some(BranchConfig::from_bytes(&bytes)?);
        }
        Ok(self.config.as_ref())
    }

    /// Rewrite the configuration blob, skipping the write when the encoded
    /// content already matches (configuration rewrites must not produce
    /// spurious diffs). Returns whether anything was staged.
    pub fn write_config(&mut self, config: &BranchConfig) -> Result<bool> {
        let bytes = config.to_canonical_bytes()?;
        if let Some(current) = self.read_raw(CONFIG_PATH)? {
            if current == bytes {
                self.config = Some(config.clone());
                return Ok(false);
            }
        }
        self.tree.set_path(CONFIG_PATH, Some(&bytes), FILEMODE_BLOB)?;
        self.config = Some(config.clone());
        Ok(true)
    }

    /// The parsed package index. An absent blob yields a fresh empty index;
    /// curated branches start from nothing.
    pub fn package_details(&mut self) -> Result<&mut PackageIndex> {
        if self.index.is_none() {
            let parsed = match self.package_details_blob()? {
                Some((oid, _)) => PackageIndex::parse(&self.tree.store().read_blob(oid)?)?,
                None => PackageIndex::default(),
            };
            self.index = Some(parsed);
        }
        Ok(self
            .index
            .as_mut()
            .expect("package index cache populated above"))
    }

    /// Serialize the in-memory package index and stage it.
    pub fn write_package_details(&mut self) -> Result<Oid> {
        let canonical_url = match self.config_opt()? {
            Some(config) => config.canonical_url.clone(),
            None => None,
        };
        let index = self.package_details()?;
        let bytes = index.serialize(canonical_url.as_deref());
        // Bypass the invalidating wrapper: the cache is the content we are
        // writing.
        self.tree.write(PACKAGE_DETAILS_PATH, &bytes)
    }

    /// The metadata path for a dist: archive extension swapped for `.meta`.
    #[must_use]
    pub fn meta_path_for_dist(author_path: &str) -> String {
        for extension in DIST_EXTENSIONS {
            if let Some(stem) = author_path.strip_suffix(extension) {
                return format!("{stem}.meta");
            }
        }
        format!("{author_path}.meta")
    }

    /// Prereqs recorded for a dist, unioned across phases. Missing metadata
    /// means unknown: the resolver proceeds without walking further.
    pub fn dist_prereqs(&mut self, author_path: &str) -> Result<BTreeMap<String, VersionReq>> {
        let meta_path = format!("{AUTHORS_PREFIX}{}", Self::meta_path_for_dist(author_path));
        let Some(bytes) = self.read_raw(&meta_path)? else {
            warn!(dist = author_path, "no dist metadata; prereqs unknown");
            return Ok(BTreeMap::new());
        };
        DistMeta::from_bytes(&bytes)?.merged_requires()
    }

    /// Copy `author_path` from `peer` into this tree and take over the
    /// modules it provides. Ownership transfer is last-writer-wins: the
    /// imported dist becomes authoritative for every module it carries in
    /// the peer's index. Importing the same dist twice is a no-op.
    pub fn import_dist(&mut self, peer: &mut ArchiveTree, author_path: &str) -> Result<()> {
        let dist_path = format!("{AUTHORS_PREFIX}{author_path}");
        let Some((blob, mode)) = peer.get_path(&dist_path)? else {
            return Err(ArchiveError::NotInPeer(author_path.to_string()).into());
        };
        match self.get_path(&dist_path)? {
            Some((existing, _)) if existing != blob => {
                return Err(ArchiveError::DistCollision {
                    path: author_path.to_string(),
                    have: existing,
                    want: blob,
                }
                .into());
            }
            // Identical content is already here; re-staging it would only
            // manufacture a spurious commit.
            Some(_) => {}
            None => self.tree.stage_blob(&dist_path, blob, mode)?,
        }

        let provided: Vec<PackageRow> = peer
            .package_details()?
            .rows_for_dist(author_path)
            .into_iter()
            .cloned()
            .collect();
        let index = self.package_details()?;
        let changed = provided
            .iter()
            .any(|row| index.row(&row.module) != Some(row));
        if changed {
            for row in provided {
                index.assign(row);
            }
            self.write_package_details()?;
        }

        let meta_path = format!("{AUTHORS_PREFIX}{}", Self::meta_path_for_dist(author_path));
        if let Some((meta_blob, meta_mode)) = peer.get_path(&meta_path)? {
            if self.get_path(&meta_path)?.map(|(oid, _)| oid) != Some(meta_blob) {
                self.tree.stage_blob(&meta_path, meta_blob, meta_mode)?;
            }
        } else {
            debug!(dist = author_path, "peer carries no dist metadata");
        }

        debug!(
            dist = author_path,
            branch = self.branch().unwrap_or("<detached>"),
            "imported dist"
        );
        Ok(())
    }

    /// Adopt a commit the delayed committer flushed for this tree's branch.
    pub(crate) fn absorb_commit(&mut self, tree: Oid, paths: &[String]) {
        self.tree.absorb_commit(tree, paths);
        for path in paths {
            self.invalidate(path);
        }
    }

    pub(crate) fn committer(&self) -> Option<&Rc<DelayedCommitter>> {
        self.committer.as_ref()
    }

    pub(crate) fn agent(&self) -> Option<&Rc<dyn UserAgent>> {
        self.agent.as_ref()
    }

    pub(crate) fn dist_cache(&self) -> Option<&Rc<RefCell<ArchiveTree>>> {
        self.dist_cache.as_ref()
    }

    pub(crate) fn note_fetched(&mut self, oid: Oid, at: OffsetDateTime) {
        self.fetched_at.insert(oid, at);
    }

    pub(crate) fn fetched_at(&self, oid: Oid) -> Option<OffsetDateTime> {
        self.fetched_at.get(&oid).copied()
    }
}
