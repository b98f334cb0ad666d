//! Mutable trees: an immutable snapshot plus a staged overlay.
//!
//! `MutableTree` is the base layer every archive consumes: path lookups
//! merge the overlay with the snapshot (and, in working-tree mode, the
//! working index between them), writes accumulate in the overlay, and
//! materialization folds the overlay into a new tree object that a commit
//! advances a branch to.

pub mod archive;
pub mod mirror;

#[cfg(test)]
mod tests;

use std::rc::Rc;

use anyhow::{Context, Result};
use git2::{Oid, Signature};
use thiserror::Error;
use tracing::debug;

use crate::gitstore::{GitStore, FILEMODE_BLOB};
use crate::overlay::{ChangeNode, ChangeSet, Lookup};

pub use crate::overlay::PathCollision;
pub use archive::ArchiveTree;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("missing branch `{0}`")]
    MissingBranch(String),
    #[error("cannot commit: no branch, no working tree, and create_branch not set")]
    NoCommitTarget,
    #[error("tree has no staged changes to commit")]
    NothingToCommit,
}

#[derive(Default)]
pub struct CommitOptions {
    /// Create the tree's branch instead of requiring it to exist. The tree
    /// must have been constructed with a branch name.
    pub create_branch: bool,
    pub author: Option<Signature<'static>>,
    pub committer: Option<Signature<'static>>,
}

pub struct MutableTree {
    store: Rc<GitStore>,
    snapshot: Option<Oid>,
    overlay: ChangeSet,
    has_changes: bool,
    branch: Option<String>,
    use_workdir: bool,
}

impl std::fmt::Debug for MutableTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableTree")
            .field("snapshot", &self.snapshot)
            .field("has_changes", &self.has_changes)
            .field("branch", &self.branch)
            .field("use_workdir", &self.use_workdir)
            .finish_non_exhaustive()
    }
}

impl MutableTree {
    /// A tree positioned at the tip of `branch`.
    pub fn from_branch(store: Rc<GitStore>, branch: &str) -> Result<Self> {
        let Some((_, tree)) = store.branch_tip(branch)? else {
            return Err(TreeError::MissingBranch(branch.to_string()).into());
        };
        Ok(Self {
            store,
            snapshot: Some(tree),
            overlay: ChangeSet::default(),
            has_changes: false,
            branch: Some(branch.to_string()),
            use_workdir: false,
        })
    }

    /// A tree over an explicit snapshot, attached to no branch.
    #[must_use]
    pub fn from_tree(store: Rc<GitStore>, snapshot: Option<Oid>) -> Self {
        Self {
            store,
            snapshot,
            overlay: ChangeSet::default(),
            has_changes: false,
            branch: None,
            use_workdir: false,
        }
    }

    /// A tree for a branch that does not exist yet; committing it with
    /// `create_branch` set brings the branch into being.
    #[must_use]
    pub fn unborn(store: Rc<GitStore>, branch: &str) -> Self {
        Self {
            store,
            snapshot: None,
            overlay: ChangeSet::default(),
            has_changes: false,
            branch: Some(branch.to_string()),
            use_workdir: false,
        }
    }

    /// A tree over HEAD that also maintains the working index.
    pub fn for_workdir(store: Rc<GitStore>) -> Result<Self> {
        let snapshot = match store.head_target()? {
            Some(commit) => Some(store.commit_tree(commit)?),
            None => None,
        };
        Ok(Self {
            store,
            snapshot,
            overlay: ChangeSet::default(),
            has_changes: false,
            branch: None,
            use_workdir: true,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Rc<GitStore> {
        &self.store
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<Oid> {
        self.snapshot
    }

    #[must_use]
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.has_changes
    }

    /// Look `path` up across the overlay, the working index (when enabled),
    /// and the snapshot, in that order. A staged deletion hides snapshot
    /// content; an untouched path falls through.
    pub fn get_path(&self, path: &str) -> Result<Option<(Oid, i32)>> {
        match self.overlay.lookup(path) {
            Lookup::Hit { oid, mode } => return Ok(Some((oid, mode))),
            Lookup::Absent => return Ok(None),
            Lookup::Unknown => {}
        }
        if self.use_workdir {
            if let Some(found) = self.store.index_find(path) {
                return Ok(Some(found));
            }
        }
        match self.snapshot {
            Some(snapshot) => self.store.tree_entry(snapshot, path),
            None => Ok(None),
        }
    }

    /// Read the blob at `path`, if any.
    pub fn get_blob(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.get_path(path)? {
            Some((oid, mode)) if mode != crate::gitstore::FILEMODE_TREE => {
                Ok(Some(self.store.read_blob(oid)?))
            }
            _ => Ok(None),
        }
    }

    /// Stage `content` at `path` (`None` deletes). Returns the staged blob
    /// id for writes. Intermediate overlay subtrees are created on demand;
    /// staging through a non-directory entry fails with `PathCollision`.
    pub fn set_path(&mut self, path: &str, content: Option<&[u8]>, mode: i32) -> Result<Option<Oid>> {
        match content {
            Some(bytes) => {
                let oid = if self.use_workdir {
                    self.store.index_add_frombuffer(path, bytes, mode)?
                } else {
                    self.store.create_blob(bytes)?
                };
                self.overlay.stage(path, ChangeNode::Leaf { oid, mode })?;
                self.has_changes = true;
                Ok(Some(oid))
            }
            None => {
                if self.use_workdir {
                    self.store.index_remove(path)?;
                    if let Some(root) = self.store.workdir() {
                        // Best effort; the path may only exist in the index.
                        let _ = std::fs::remove_file(root.join(path));
                    }
                }
                self.overlay.stage(path, ChangeNode::Deleted)?;
                self.has_changes = true;
                Ok(None)
            }
        }
    }

    /// Stage an existing blob without copying its content.
    pub fn stage_blob(&mut self, path: &str, oid: Oid, mode: i32) -> Result<()> {
        self.overlay.stage(path, ChangeNode::Leaf { oid, mode })?;
        self.has_changes = true;
        Ok(())
    }

    /// Write a regular file.
    pub fn write(&mut self, path: &str, bytes: &[u8]) -> Result<Oid> {
        self.set_path(path, Some(bytes), FILEMODE_BLOB)?
            .with_context(|| format!("staging bytes at {path} produced no blob id"))
    }

    /// Fold the overlay onto the snapshot, producing (and advancing to) a
    /// new tree object. Pending-commit state (`has_changes`) survives until
    /// an actual commit.
    pub fn update_tree(&mut self) -> Result<Oid> {
        let tree = self.store.assemble_tree(self.snapshot, &self.overlay)?;
        self.overlay.clear();
        self.snapshot = Some(tree);
        Ok(tree)
    }

    /// Commit the staged changes. Parent selection: working-tree mode uses
    /// HEAD (or none, for the first commit); an attached branch uses its
    /// tip; otherwise `create_branch` starts an orphan history.
    pub fn commit(&mut self, message: &str, options: CommitOptions) -> Result<Oid> {
        if !self.has_changes {
            return Err(TreeError::NothingToCommit.into());
        }
        let tree = self.update_tree()?;

        enum Target {
            Workdir,
            Advance(String),
            Create(String),
        }
        let (parents, target) = if self.use_workdir {
            (
                self.store.head_target()?.into_iter().collect::<Vec<_>>(),
                Target::Workdir,
            )
        } else if let Some(branch) = self.branch.clone() {
            match self.store.branch_tip(&branch)? {
                Some((tip, _)) => (vec![tip], Target::Advance(branch)),
                None if options.create_branch => (Vec::new(), Target::Create(branch)),
                None => return Err(TreeError::MissingBranch(branch).into()),
            }
        } else {
            return Err(TreeError::NoCommitTarget.into());
        };

        let author = match options.author {
            Some(author) => author,
            None => self.store.signature_now()?,
        };
        let committer = match options.committer {
            Some(committer) => committer,
            None => author.clone(),
        };
        let commit = self
            .store
            .create_commit(message, &author, &committer, &parents, tree)?;

        match target {
            Target::Workdir => {
                self.store.advance_head(commit)?;
                self.store.index_write()?;
            }
            Target::Advance(branch) => self.store.set_branch_target(&branch, commit)?,
            Target::Create(branch) => self.store.create_branch(&branch, commit)?,
        }

        self.has_changes = false;
        debug!(branch = self.branch.as_deref().unwrap_or("<workdir>"), %commit, "committed tree");
        Ok(commit)
    }

    /// Adopt a commit the delayed committer flushed on this tree's behalf:
    /// advance the snapshot and retire exactly the staged paths it carried.
    pub(crate) fn absorb_commit(&mut self, tree: Oid, paths: &[String]) {
        self.snapshot = Some(tree);
        for path in paths {
            self.overlay.remove_path(path);
        }
        self.has_changes = !self.overlay.is_empty();
    }
}

