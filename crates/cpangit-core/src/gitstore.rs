//! Thin adapter over the libgit2 object store.
//!
//! Upper layers (trees, the committer, the resolver) never touch `git2`
//! directly; everything they need from the store goes through this
//! capability set: object lookup, tree-entry lookup by path, blob IO,
//! recursive tree assembly from a change set, commits, branch refs, HEAD,
//! and the working index.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use git2::{
    Branch, BranchType, ErrorCode, Object, ObjectType, Oid, Repository as GitRepository, Signature,
};
use tracing::debug;

use crate::overlay::{ChangeNode, ChangeSet};

pub const FILEMODE_BLOB: i32 = 0o100_644;
pub const FILEMODE_TREE: i32 = 0o040_000;

const DEFAULT_AUTHOR_NAME: &str = "cpangit";
const DEFAULT_AUTHOR_EMAIL: &str = "cpangit@localhost";

/// Handle on the underlying git object database. Not `Send`: libgit2
/// handles stay on the thread that opened them.
pub struct GitStore {
    repo: GitRepository,
    index: RefCell<git2::Index>,
    author_name: String,
    author_email: String,
}

impl GitStore {
    /// Open an existing repository at `path`, or initialize a bare one.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = match GitRepository::open(path) {
            Ok(repo) => repo,
            Err(err) if err.code() == ErrorCode::NotFound => GitRepository::init_bare(path)
                .with_context(|| format!("failed to initialize store at {}", path.display()))?,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to open store at {}", path.display()));
            }
        };
        let index = repo.index().context("failed to load working index")?;
        Ok(Self {
            repo,
            index: RefCell::new(index),
            author_name: DEFAULT_AUTHOR_NAME.to_string(),
            author_email: DEFAULT_AUTHOR_EMAIL.to_string(),
        })
    }

    pub fn set_author(&mut self, name: &str, email: &str) {
        self.author_name = name.to_string();
        self.author_email = email.to_string();
    }

    pub fn signature_now(&self) -> Result<Signature<'static>> {
        Signature::now(&self.author_name, &self.author_email)
            .context("failed to create signature")
    }

    pub fn lookup_branch(&self, name: &str) -> Result<Option<Branch<'_>>> {
        match self.repo.find_branch(name, BranchType::Local) {
            Ok(branch) => Ok(Some(branch)),
            Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to look up branch {name}")),
        }
    }

    /// Resolve a branch name, a tag name, or a 40-hex object id, in that
    /// order, to the underlying object.
    pub fn resolve(&self, spec: &str) -> Result<Option<Object<'_>>> {
        if let Some(branch) = self.lookup_branch(spec)? {
            let object = branch
                .get()
                .peel(ObjectType::Any)
                .with_context(|| format!("failed to peel branch {spec}"))?;
            return Ok(Some(object));
        }
        match self.repo.find_reference(&format!("refs/tags/{spec}")) {
            Ok(reference) => {
                let object = reference
                    .peel(ObjectType::Any)
                    .with_context(|| format!("failed to peel tag {spec}"))?;
                return Ok(Some(object));
            }
            Err(err) if err.code() == ErrorCode::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to look up tag {spec}"));
            }
        }
        if spec.len() == 40 {
            if let Ok(oid) = Oid::from_str(spec) {
                match self.repo.find_object(oid, None) {
                    Ok(object) => return Ok(Some(object)),
                    Err(err) if err.code() == ErrorCode::NotFound => {}
                    Err(err) => {
                        return Err(err).with_context(|| format!("failed to look up {spec}"));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Tip of a branch as `(commit, tree)`, or `None` when the branch does
    /// not exist.
    pub fn branch_tip(&self, name: &str) -> Result<Option<(Oid, Oid)>> {
        let Some(branch) = self.lookup_branch(name)? else {
            return Ok(None);
        };
        let commit = branch
            .get()
            .peel_to_commit()
            .with_context(|| format!("failed to peel branch {name} to a commit"))?;
        Ok(Some((commit.id(), commit.tree_id())))
    }

    /// Entry at `path` inside the tree `tree`, as `(object, filemode)`.
    pub fn tree_entry(&self, tree: Oid, path: &str) -> Result<Option<(Oid, i32)>> {
        let tree = self
            .repo
            .find_tree(tree)
            .with_context(|| format!("failed to read tree {tree}"))?;
        match tree.get_path(Path::new(path)) {
            Ok(entry) => Ok(Some((entry.id(), entry.filemode()))),
            Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to look up {path}")),
        }
    }

    /// The tree a commit points at.
    pub fn commit_tree(&self, commit: Oid) -> Result<Oid> {
        let commit = self
            .repo
            .find_commit(commit)
            .with_context(|| format!("failed to read commit {commit}"))?;
        Ok(commit.tree_id())
    }

    pub fn read_blob(&self, oid: Oid) -> Result<Vec<u8>> {
        let blob = self
            .repo
            .find_blob(oid)
            .with_context(|| format!("failed to read blob {oid}"))?;
        Ok(blob.content().to_vec())
    }

    pub fn create_blob(&self, bytes: &[u8]) -> Result<Oid> {
        self.repo.blob(bytes).context("failed to create blob")
    }

    /// Fold a change set onto `base`, producing a new tree object. Two
    /// identical fold inputs produce identical tree ids.
    pub fn assemble_tree(&self, base: Option<Oid>, changes: &ChangeSet) -> Result<Oid> {
        self.assemble_node(base, changes.entries())
    }

    fn assemble_node(&self, base: Option<Oid>, entries: &BTreeMap<String, ChangeNode>) -> Result<Oid> {
        let base_tree = match base {
            Some(oid) => Some(
                self.repo
                    .find_tree(oid)
                    .with_context(|| format!("failed to read tree {oid}"))?,
            ),
            None => None,
        };
        let mut builder = self
            .repo
            .treebuilder(base_tree.as_ref())
            .context("failed to create tree builder")?;
        for (name, node) in entries {
            match node {
                ChangeNode::Deleted => {
                    if builder
                        .get(name)
                        .with_context(|| format!("failed to inspect tree entry {name}"))?
                        .is_some()
                    {
                        builder
                            .remove(name)
                            .with_context(|| format!("failed to remove tree entry {name}"))?;
                    }
                }
                ChangeNode::Leaf { oid, mode } => {
                    builder
                        .insert(name, *oid, *mode)
                        .with_context(|| format!("failed to insert tree entry {name}"))?;
                }
                ChangeNode::Subtree(children) => {
                    let existing = builder
                        .get(name)
                        .with_context(|| format!("failed to inspect tree entry {name}"))?
                        .filter(|entry| entry.filemode() == FILEMODE_TREE)
                        .map(|entry| entry.id());
                    let subtree = self.assemble_node(existing, children)?;
                    builder
                        .insert(name, subtree, FILEMODE_TREE)
                        .with_context(|| format!("failed to insert subtree {name}"))?;
                }
            }
        }
        builder.write().context("failed to write tree")
    }

    pub fn create_commit(
        &self,
        message: &str,
        author: &Signature<'_>,
        committer: &Signature<'_>,
        parents: &[Oid],
        tree: Oid,
    ) -> Result<Oid> {
        let tree = self
            .repo
            .find_tree(tree)
            .with_context(|| format!("failed to read tree {tree}"))?;
        let parent_commits = parents
            .iter()
            .map(|oid| self.repo.find_commit(*oid))
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read parent commits")?;
        let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();
        let commit = self
            .repo
            .commit(None, author, committer, message, &tree, &parent_refs)
            .context("failed to create commit")?;
        debug!(%commit, parents = parents.len(), "created commit");
        Ok(commit)
    }

    pub fn create_branch(&self, name: &str, commit: Oid) -> Result<()> {
        let commit = self
            .repo
            .find_commit(commit)
            .with_context(|| format!("failed to read commit {commit}"))?;
        self.repo
            .branch(name, &commit, false)
            .with_context(|| format!("failed to create branch {name}"))?;
        Ok(())
    }

    pub fn set_branch_target(&self, name: &str, commit: Oid) -> Result<()> {
        self.repo
            .reference(
                &format!("refs/heads/{name}"),
                commit,
                true,
                "cpangit: advance branch",
            )
            .with_context(|| format!("failed to advance branch {name}"))?;
        Ok(())
    }

    pub fn head_target(&self) -> Result<Option<Oid>> {
        match self.repo.head() {
            Ok(head) => Ok(head.target()),
            Err(err)
                if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) =>
            {
                Ok(None)
            }
            Err(err) => Err(err).context("failed to read HEAD"),
        }
    }

    pub fn set_head(&self, branch: &str) -> Result<()> {
        self.repo
            .set_head(&format!("refs/heads/{branch}"))
            .with_context(|| format!("failed to point HEAD at {branch}"))
    }

    /// Move HEAD's branch to `commit`, creating it for an unborn HEAD.
    pub fn advance_head(&self, commit: Oid) -> Result<()> {
        match self.repo.head() {
            Ok(head) if head.is_branch() => {
                let name = head
                    .name()
                    .context("HEAD reference name is not valid utf-8")?
                    .to_string();
                self.repo
                    .reference(&name, commit, true, "cpangit: commit")
                    .with_context(|| format!("failed to advance {name}"))?;
            }
            Ok(_) => {
                self.repo
                    .set_head_detached(commit)
                    .context("failed to update detached HEAD")?;
            }
            Err(err)
                if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) =>
            {
                let target = self
                    .repo
                    .find_reference("HEAD")
                    .context("failed to read HEAD")?
                    .symbolic_target()
                    .unwrap_or("refs/heads/master")
                    .to_string();
                self.repo
                    .reference(&target, commit, true, "cpangit: initial commit")
                    .with_context(|| format!("failed to create {target}"))?;
            }
            Err(err) => return Err(err).context("failed to read HEAD"),
        }
        Ok(())
    }

    /// Stage `bytes` at `path` in the working index, returning the blob id.
    pub fn index_add_frombuffer(&self, path: &str, bytes: &[u8], mode: i32) -> Result<Oid> {
        let mut index = self.index.borrow_mut();
        index
            .add_frombuffer(&bare_index_entry(path, mode), bytes)
            .with_context(|| format!("failed to stage {path} in the index"))?;
        let entry = index
            .get_path(Path::new(path), 0)
            .with_context(|| format!("index entry for {path} vanished after staging"))?;
        Ok(entry.id)
    }

    pub fn index_find(&self, path: &str) -> Option<(Oid, i32)> {
        self.index
            .borrow()
            .get_path(Path::new(path), 0)
            .map(|entry| (entry.id, entry.mode as i32))
    }

    pub fn index_remove(&self, path: &str) -> Result<()> {
        self.index
            .borrow_mut()
            .remove_path(Path::new(path))
            .with_context(|| format!("failed to remove {path} from the index"))
    }

    pub fn index_write_tree(&self) -> Result<Oid> {
        self.index
            .borrow_mut()
            .write_tree()
            .context("failed to write the index as a tree")
    }

    pub fn index_write(&self) -> Result<()> {
        self.index
            .borrow_mut()
            .write()
            .context("failed to write the index")
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.repo.workdir()
    }
}

fn bare_index_entry(path: &str, mode: i32) -> git2::IndexEntry {
    git2::IndexEntry {
        ctime: git2::IndexTime::new(0, 0),
        mtime: git2::IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode: mode as u32,
        uid: 0,
        gid: 0,
        file_size: 0,
        id: Oid::zero(),
        flags: 0,
        flags_extended: 0,
        path: path.as_bytes().to_vec(),
    }
}
