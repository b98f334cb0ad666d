//! Staged changes layered over an immutable tree snapshot.
//!
//! The overlay is a tree of named nodes: subtrees of further changes, blob
//! leaves, and deletion tombstones. Everything that consumes it pattern
//! matches on the node kind.

use std::collections::BTreeMap;

use git2::Oid;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("path `{0}` passes through a staged non-directory entry")]
pub struct PathCollision(pub String);

/// One staged entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeNode {
    Subtree(BTreeMap<String, ChangeNode>),
    Leaf { oid: Oid, mode: i32 },
    Deleted,
}

/// What the overlay knows about a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// A staged blob.
    Hit { oid: Oid, mode: i32 },
    /// Deleted or shadowed; do not consult lower layers.
    Absent,
    /// The overlay says nothing; fall through to lower layers.
    Unknown,
}

/// Root of the overlay.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    root: BTreeMap<String, ChangeNode>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &BTreeMap<String, ChangeNode> {
        &self.root
    }

    pub fn clear(&mut self) {
        self.root.clear();
    }

    #[must_use]
    pub fn lookup(&self, path: &str) -> Lookup {
        let mut current = &self.root;
        let mut segments = segments_of(path).peekable();
        while let Some(segment) = segments.next() {
            match current.get(segment) {
                None => return Lookup::Unknown,
                Some(ChangeNode::Deleted) => return Lookup::Absent,
                Some(ChangeNode::Leaf { oid, mode }) => {
                    return if segments.peek().is_none() {
                        Lookup::Hit {
                            oid: *oid,
                            mode: *mode,
                        }
                    } else {
                        // The staged blob shadows anything below it.
                        Lookup::Absent
                    };
                }
                Some(ChangeNode::Subtree(children)) => {
                    if segments.peek().is_none() {
                        // A staged subtree is not itself a fetchable entry;
                        // directory lookups resolve against the snapshot.
                        return Lookup::Unknown;
                    }
                    current = children;
                }
            }
        }
        Lookup::Unknown
    }

    /// Stage `node` at `path`, creating intermediate subtrees on demand.
    pub fn stage(&mut self, path: &str, node: ChangeNode) -> Result<(), PathCollision> {
        let mut parts: Vec<&str> = segments_of(path).collect();
        let Some(leaf) = parts.pop() else {
            return Err(PathCollision(path.to_string()));
        };
        let mut current = &mut self.root;
        for segment in parts {
            current = match current
                .entry(segment.to_string())
                .or_insert_with(|| ChangeNode::Subtree(BTreeMap::new()))
            {
                ChangeNode::Subtree(children) => children,
                ChangeNode::Leaf { .. } | ChangeNode::Deleted => {
                    return Err(PathCollision(path.to_string()));
                }
            };
        }
        current.insert(leaf.to_string(), node);
        Ok(())
    }

    /// Drop the staged entry at `path`, pruning subtrees it empties.
    pub fn remove_path(&mut self, path: &str) {
        fn walk(map: &mut BTreeMap<String, ChangeNode>, segments: &[&str]) {
            let Some((first, rest)) = segments.split_first() else {
                return;
            };
            if rest.is_empty() {
                map.remove(*first);
                return;
            }
            if let Some(ChangeNode::Subtree(children)) = map.get_mut(*first) {
                walk(children, rest);
                if children.is_empty() {
                    map.remove(*first);
                }
            }
        }
        let segments: Vec<&str> = segments_of(path).collect();
        walk(&mut self.root, &segments);
    }

    /// Full slash-joined paths of every staged leaf and tombstone.
    #[must_use]
    pub fn leaf_paths(&self) -> Vec<String> {
        fn walk(map: &BTreeMap<String, ChangeNode>, prefix: &str, out: &mut Vec<String>) {
            for (name, node) in map {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                match node {
                    ChangeNode::Subtree(children) => walk(children, &path, out),
                    ChangeNode::Leaf { .. } | ChangeNode::Deleted => out.push(path),
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.root, "", &mut out);
        out
    }
}

fn segments_of(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}
