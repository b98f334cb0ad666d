//! The repository facade: one handle per object store, vending archive
//! trees by branch name.
//!
//! Trees are cached weakly by branch name so every caller shares one
//! in-memory overlay per branch, without the repository keeping dead trees
//! alive. Trees never own the repository back; the resolver takes it as an
//! explicit argument.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::debug;

use cpangit_domain::{BranchConfig, CoreList};

use crate::committer::{Clock, CommitOutcome, DelayedCommitter, SystemClock, DEFAULT_COMMIT_DELAY};
use crate::gitstore::GitStore;
use crate::tree::archive::{ArchiveTree, CONFIG_PATH};
use crate::tree::{CommitOptions, MutableTree};
use crate::upstream::{HttpAgent, UserAgent};

pub const DEFAULT_CACHE_BRANCH: &str = "package-cache";

type TreeCache = RefCell<HashMap<String, Weak<RefCell<ArchiveTree>>>>;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("branch `{0}` has no upstream_url configured")]
    NotAMirror(String),
    #[error("branch `{0}` already exists")]
    BranchExists(String),
}

pub struct RepositoryOptions {
    pub agent: Option<Rc<dyn UserAgent>>,
    pub clock: Option<Box<dyn Clock>>,
    pub commit_delay: Duration,
    pub corelist: CoreList,
    pub cache_branch: String,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            agent: None,
            clock: None,
            commit_delay: DEFAULT_COMMIT_DELAY,
            corelist: CoreList::default(),
            cache_branch: DEFAULT_CACHE_BRANCH.to_string(),
        }
    }
}

pub struct Repository {
    store: Rc<GitStore>,
    committer: Rc<DelayedCommitter>,
    agent: Rc<dyn UserAgent>,
    corelist: CoreList,
    cache_branch: String,
    trees: TreeCache,
}

impl Repository {
    /// Open (or initialize) the store at `path` with default wiring.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, RepositoryOptions::default())
    }

    pub fn open_with(path: &Path, options: RepositoryOptions) -> Result<Self> {
        let store = Rc::new(GitStore::open(path)?);
        let agent: Rc<dyn UserAgent> = match options.agent {
            Some(agent) => agent,
            None => Rc::new(HttpAgent::new()?),
        };
        let clock = options.clock.unwrap_or_else(|| Box::new(SystemClock));
        let committer = Rc::new(DelayedCommitter::new(options.commit_delay, clock));
        Ok(Self {
            store,
            committer,
            agent,
            corelist: options.corelist,
            cache_branch: options.cache_branch,
            trees: RefCell::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn store(&self) -> &Rc<GitStore> {
        &self.store
    }

    #[must_use]
    pub fn corelist(&self) -> &CoreList {
        &self.corelist
    }

    /// The archive tree for an existing branch. Branches configured with an
    /// upstream come back autofetch-capable.
    pub fn archive_tree(&self, name: &str) -> Result<Rc<RefCell<ArchiveTree>>> {
        if let Some(cached) = self.cached(name) {
            return Ok(cached);
        }
        self.open_tree(name)
    }

    /// The archive tree for `name`, which must mirror an upstream.
    pub fn mirror(&self, name: &str) -> Result<Rc<RefCell<ArchiveTree>>> {
        let tree = self.archive_tree(name)?;
        let mirrors_upstream = {
            let mut tree = tree.borrow_mut();
            matches!(tree.config_opt()?, Some(config) if config.upstream_url.is_some())
        };
        if !mirrors_upstream {
            return Err(RepoError::NotAMirror(name.to_string()).into());
        }
        Ok(tree)
    }

    /// Create a new mirror branch of `upstream_url` and return its tree.
    pub fn create_mirror(&self, name: &str, upstream_url: &str) -> Result<Rc<RefCell<ArchiveTree>>> {
        if self.store.lookup_branch(name)?.is_some() {
            return Err(RepoError::BranchExists(name.to_string()).into());
        }
        let config = BranchConfig {
            upstream_url: Some(upstream_url.to_string()),
            autofetch: Some(true),
            ..Default::default()
        };
        let mut tree = MutableTree::unborn(Rc::clone(&self.store), name);
        tree.write(CONFIG_PATH, &config.to_canonical_bytes()?)?;
        tree.commit(
            &format!("Created mirror of {upstream_url}"),
            CommitOptions {
                create_branch: true,
                ..Default::default()
            },
        )?;
        debug!(branch = name, upstream_url, "created mirror branch");
        self.mirror(name)
    }

    /// The shared dist-cache branch, created with an initial empty-tree
    /// commit on first use.
    pub fn package_cache(&self) -> Result<Rc<RefCell<ArchiveTree>>> {
        let name = self.cache_branch.clone();
        if let Some(cached) = self.cached(&name) {
            return Ok(cached);
        }
        if self.store.lookup_branch(&name)?.is_none() {
            let tree = self.store.assemble_tree(None, &Default::default())?;
            let signature = self.store.signature_now()?;
            let commit =
                self.store
                    .create_commit("Created package cache", &signature, &signature, &[], tree)?;
            self.store.create_branch(&name, commit)?;
            debug!(branch = %name, "created package cache branch");
        }
        self.open_tree(&name)
    }

    /// Read one blob out of a branch, autofetching when the branch mirrors
    /// an upstream. This is the whole surface an HTTP front-end needs.
    pub fn get_blob(&self, branch: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let tree = self.archive_tree(branch)?;
        let bytes = tree.borrow_mut().get_blob(path)?;
        Ok(bytes)
    }

    /// Fire every due delayed commit and fold the results back into live
    /// trees. Hosts call this from their event loop.
    pub fn poll_pending(&self) -> Result<usize> {
        let outcomes = self.committer.poll(&self.store)?;
        self.apply_outcomes(&outcomes);
        Ok(outcomes.len())
    }

    /// Flush every outstanding delayed commit synchronously. Call at
    /// process teardown; skipping it loses staged fetches.
    pub fn flush_pending(&self) -> usize {
        let outcomes = self.committer.flush(&self.store);
        self.apply_outcomes(&outcomes);
        outcomes.len()
    }

    fn apply_outcomes(&self, outcomes: &[CommitOutcome]) {
        for outcome in outcomes {
            if let Some(tree) = self.cached(&outcome.branch) {
                tree.borrow_mut().absorb_commit(outcome.tree, &outcome.paths);
            }
        }
    }

    fn open_tree(&self, name: &str) -> Result<Rc<RefCell<ArchiveTree>>> {
        let tree = MutableTree::from_branch(Rc::clone(&self.store), name)?;
        let mut archive = ArchiveTree::new(tree);
        archive.attach_committer(Rc::clone(&self.committer));
        let is_cache = name == self.cache_branch;
        let mirrors_upstream = !is_cache
            && matches!(archive.config_opt()?, Some(config) if config.upstream_url.is_some());
        if mirrors_upstream {
            archive.attach_agent(Rc::clone(&self.agent));
        }
        let archive = Rc::new(RefCell::new(archive));
        if mirrors_upstream {
            let cache = self.package_cache()?;
            archive.borrow_mut().attach_dist_cache(cache);
        }
        self.trees
            .borrow_mut()
            .insert(name.to_string(), Rc::downgrade(&archive));
        Ok(archive)
    }

    fn cached(&self, name: &str) -> Option<Rc<RefCell<ArchiveTree>>> {
        let mut trees = self.trees.borrow_mut();
        match trees.get(name).and_then(Weak::upgrade) {
            Some(tree) => Some(tree),
            None => {
                trees.remove(name);
                None
            }
        }
    }
}
