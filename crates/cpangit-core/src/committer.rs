//! Debounced batching of staged fetches into single commits.
//!
//! Every autofetched blob staged into a branch-attached tree is mirrored
//! into a per-branch `PendingCommit`; a debounce timer coalesces a burst of
//! fetches into one commit. The timer is a `Clock` collaborator driven by
//! the host's event loop (`poll`), with a synchronous `flush` for process
//! teardown. Only the most recently armed token may fire.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use git2::Oid;
use tracing::{debug, warn};

use crate::gitstore::GitStore;
use crate::overlay::{ChangeNode, ChangeSet};
use crate::tree::archive::AUTHORS_PREFIX;

pub const DEFAULT_COMMIT_DELAY: Duration = Duration::from_secs(10);

pub trait Clock {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A flushed pending commit, reported back so the repository can advance
/// the live tree it was staged against.
#[derive(Clone, Debug)]
pub struct CommitOutcome {
    pub branch: String,
    pub commit: Oid,
    pub tree: Oid,
    pub paths: Vec<String>,
}

struct PendingCommit {
    branch: String,
    snapshot: Option<Oid>,
    changes: ChangeSet,
    dists_added: usize,
    distfile_paths: Vec<String>,
    deadline: Instant,
    token: u64,
}

pub struct DelayedCommitter {
    delay: Duration,
    clock: Box<dyn Clock>,
    pending: RefCell<HashMap<String, PendingCommit>>,
    next_token: Cell<u64>,
}

impl DelayedCommitter {
    #[must_use]
    pub fn new(delay: Duration, clock: Box<dyn Clock>) -> Self {
        Self {
            delay,
            clock,
            pending: RefCell::new(HashMap::new()),
            next_token: Cell::new(1),
        }
    }

    /// Merge a staged blob into the branch's pending commit and re-arm the
    /// debounce timer. Returns the fresh timer token; earlier tokens for
    /// the branch are stale from here on.
    pub fn schedule(
        &self,
        branch: &str,
        snapshot: Option<Oid>,
        path: &str,
        oid: Oid,
        mode: i32,
    ) -> Result<u64> {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        let deadline = self.clock.now() + self.delay;

        let mut pending = self.pending.borrow_mut();
        let entry = pending
            .entry(branch.to_string())
            .or_insert_with(|| PendingCommit {
                branch: branch.to_string(),
                snapshot,
                changes: ChangeSet::default(),
                dists_added: 0,
                distfile_paths: Vec::new(),
                deadline,
                token,
            });
        entry.changes.stage(path, ChangeNode::Leaf { oid, mode })?;
        entry.dists_added += 1;
        if let Some(rest) = path.strip_prefix(AUTHORS_PREFIX) {
            entry.distfile_paths.push(rest.to_string());
        }
        entry.snapshot = snapshot;
        entry.deadline = deadline;
        entry.token = token;
        debug!(branch, path, token, "scheduled delayed commit");
        Ok(token)
    }

    /// Discard the branch's pending commit if `token` is still current.
    /// Staged changes remain in the tree, uncommitted.
    pub fn cancel(&self, branch: &str, token: u64) -> bool {
        let mut pending = self.pending.borrow_mut();
        match pending.get(branch) {
            Some(entry) if entry.token == token => {
                pending.remove(branch);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn has_pending(&self, branch: &str) -> bool {
        self.pending.borrow().contains_key(branch)
    }

    /// Fire every pending commit whose deadline has passed.
    pub fn poll(&self, store: &GitStore) -> Result<Vec<CommitOutcome>> {
        let now = self.clock.now();
        let due: Vec<(String, u64)> = self
            .pending
            .borrow()
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(branch, entry)| (branch.clone(), entry.token))
            .collect();
        let mut outcomes = Vec::new();
        for (branch, token) in due {
            if let Some(outcome) = self.resolve(store, &branch, token)? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    /// Fire the branch's pending commit now. A stale `token` means a newer
    /// schedule superseded this timer; the callback is dropped.
    pub fn resolve(&self, store: &GitStore, branch: &str, token: u64) -> Result<Option<CommitOutcome>> {
        let entry = {
            let mut pending = self.pending.borrow_mut();
            match pending.get(branch) {
                Some(current) if current.token == token => pending.remove(branch),
                _ => {
                    debug!(branch, token, "dropping stale commit timer");
                    return Ok(None);
                }
            }
        };
        let Some(entry) = entry else {
            return Ok(None);
        };
        // The entry is already removed: a failing flush drops the pending
        // set rather than retrying it.
        commit_pending(store, entry).map(Some)
    }

    /// Drain every pending commit synchronously. Failures are logged and
    /// skipped; shutdown must not wedge on one bad branch.
    pub fn flush(&self, store: &GitStore) -> Vec<CommitOutcome> {
        let drained: Vec<PendingCommit> = {
            let mut pending = self.pending.borrow_mut();
            let mut entries: Vec<PendingCommit> = pending.drain().map(|(_, entry)| entry).collect();
            entries.sort_by(|a, b| a.branch.cmp(&b.branch));
            entries
        };
        let mut outcomes = Vec::new();
        for entry in drained {
            let branch = entry.branch.clone();
            match commit_pending(store, entry) {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => warn!(branch, error = %err, "failed to flush pending commit"),
            }
        }
        outcomes
    }
}

fn commit_pending(store: &GitStore, entry: PendingCommit) -> Result<CommitOutcome> {
    let paths = entry.changes.leaf_paths();
    let tree = store.assemble_tree(entry.snapshot, &entry.changes)?;
    let message = commit_message(entry.dists_added, &entry.distfile_paths);
    let parents: Vec<Oid> = store
        .branch_tip(&entry.branch)?
        .map(|(commit, _)| commit)
        .into_iter()
        .collect();
    let signature = store.signature_now()?;
    let commit = store.create_commit(&message, &signature, &signature, &parents, tree)?;
    if parents.is_empty() {
        store.create_branch(&entry.branch, commit)?;
    } else {
        store.set_branch_target(&entry.branch, commit)?;
    }
    debug!(
        branch = %entry.branch,
        %commit,
        dists = entry.dists_added,
        "flushed pending commit"
    );
    Ok(CommitOutcome {
        branch: entry.branch,
        commit,
        tree,
        paths,
    })
}

fn commit_message(dists_added: usize, distfile_paths: &[String]) -> String {
    let mut message = format!("Added {dists_added} dists\n");
    if !distfile_paths.is_empty() {
        message.push('\n');
        for path in distfile_paths {
            message.push_str("  * ");
            message.push_str(path);
            message.push('\n');
        }
    }
    message
}
