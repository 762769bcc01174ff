// Copyright 2024 The CPAN-InGit Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![allow(missing_docs)]

//! A mutable overlay over an immutable tree snapshot. Writes accumulate in
//! an in-memory change tree; `update_tree` folds them onto the snapshot as
//! new tree objects and `commit` records the result on a branch, the
//! working index, or a freshly created branch.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::object_store::BlobId;
use crate::object_store::CommitId;
use crate::object_store::CommitSignature;
use crate::object_store::ObjectStore;
use crate::object_store::ObjectStoreError;
use crate::object_store::ResolvedObject;
use crate::object_store::TreeId;
use crate::object_store::TreeValue;
use crate::object_store::MODE_FILE;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Branch {0} does not exist")]
    MissingBranch(String),
    #[error("Cannot resolve {0} to a tree")]
    UnresolvedRef(String),
    #[error("Invalid path {0:?}")]
    InvalidPath(String),
    #[error("Path {0} passes through a staged non-directory entry")]
    PathCollision(String),
    #[error("Tree has no branch or working copy to commit to")]
    NoCommitTarget,
    #[error("No staged changes to commit")]
    NothingToCommit,
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
}

pub type TreeResult<T> = Result<T, TreeError>;

/// One node of the staged change tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNode {
    Subtree(BTreeMap<String, ChangeNode>),
    Blob { id: BlobId, mode: i32 },
    Deleted,
}

/// The root of a staged change tree.
pub type Overlay = BTreeMap<String, ChangeNode>;

#[derive(Debug)]
enum OverlayLookup<'a> {
    /// The path names this staged node.
    Hit(&'a ChangeNode),
    /// An ancestor was deleted or replaced by a file; the path cannot
    /// exist, regardless of the snapshot.
    Shadowed,
    /// The overlay says nothing about this path.
    Miss,
}

fn overlay_lookup<'a>(overlay: &'a Overlay, segments: &[&str]) -> OverlayLookup<'a> {
    let (first, rest) = match segments.split_first() {
        Some(split) => split,
        None => return OverlayLookup::Miss,
    };
    match overlay.get(*first) {
        None => OverlayLookup::Miss,
        Some(node) if rest.is_empty() => OverlayLookup::Hit(node),
        Some(ChangeNode::Subtree(children)) => overlay_lookup(children, rest),
        Some(ChangeNode::Blob { .. }) | Some(ChangeNode::Deleted) => OverlayLookup::Shadowed,
    }
}

fn overlay_stage(
    overlay: &mut Overlay,
    path: &str,
    segments: &[&str],
    node: ChangeNode,
) -> TreeResult<()> {
    let (first, rest) = segments
        .split_first()
        .ok_or_else(|| TreeError::InvalidPath(path.to_owned()))?;
    if rest.is_empty() {
        overlay.insert((*first).to_owned(), node);
        return Ok(());
    }
    let entry = overlay
        .entry((*first).to_owned())
        .or_insert_with(|| ChangeNode::Subtree(BTreeMap::new()));
    match entry {
        ChangeNode::Subtree(children) => overlay_stage(children, path, rest, node),
        ChangeNode::Deleted => {
            // Writing below a deleted directory revives it as a fresh
            // subtree containing only the new entry.
            *entry = ChangeNode::Subtree(BTreeMap::new());
            let ChangeNode::Subtree(children) = entry else {
                unreachable!();
            };
            overlay_stage(children, path, rest, node)
        }
        ChangeNode::Blob { .. } => Err(TreeError::PathCollision(path.to_owned())),
    }
}

/// Merges a single staged leaf into an overlay, overwriting any earlier
/// leaf at the same path. Shared by `MutableTree` staging and the pending
/// sets of the delayed committer.
pub(crate) fn overlay_set(
    overlay: &mut Overlay,
    path: &str,
    node: ChangeNode,
) -> TreeResult<()> {
    let segments = split_path(path)?;
    overlay_stage(overlay, path, &segments, node)
}

/// Folds a change tree onto `base`, writing new tree objects bottom-up.
/// Subtrees that end up empty are pruned from their parent, as are
/// removals of entries the base never had. Returns the new tree id and its
/// entry count.
pub(crate) fn write_onto(
    store: &ObjectStore,
    base: Option<&TreeId>,
    overlay: &Overlay,
) -> TreeResult<(TreeId, usize)> {
    let mut edits: BTreeMap<String, Option<TreeValue>> = BTreeMap::new();
    for (name, node) in overlay {
        let edit = match node {
            ChangeNode::Blob { id, mode } => Some(TreeValue::Blob {
                id: id.clone(),
                mode: *mode,
            }),
            ChangeNode::Deleted => None,
            ChangeNode::Subtree(children) => {
                let sub_base = match base {
                    Some(base) => match store.tree_entry(base, name)? {
                        Some(TreeValue::Tree(id)) => Some(id),
                        // A staged directory replaces a base file wholesale.
                        Some(TreeValue::Blob { .. }) | None => None,
                    },
                    None => None,
                };
                let (sub_id, len) = write_onto(store, sub_base.as_ref(), children)?;
                if len == 0 {
                    None
                } else {
                    Some(TreeValue::Tree(sub_id))
                }
            }
        };
        edits.insert(name.clone(), edit);
    }
    Ok(store.write_tree(base, &edits)?)
}

fn split_path(path: &str) -> TreeResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').collect();
    if path.is_empty() || segments.iter().any(|segment| segment.is_empty()) {
        return Err(TreeError::InvalidPath(path.to_owned()));
    }
    Ok(segments)
}

#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub author: Option<CommitSignature>,
    pub committer: Option<CommitSignature>,
    /// Create this branch at the new commit and attach the tree to it.
    /// Allows committing a tree that has no branch yet.
    pub create_branch: Option<String>,
}

/// An immutable snapshot plus staged changes, optionally attached to a
/// branch or the working copy.
#[derive(Debug)]
pub struct MutableTree {
    store: Arc<ObjectStore>,
    snapshot: Option<TreeId>,
    overlay: Overlay,
    has_changes: bool,
    branch: Option<String>,
    use_workdir: bool,
    default_signature: CommitSignature,
}

impl MutableTree {
    pub fn from_branch(
        store: Arc<ObjectStore>,
        signature: CommitSignature,
        branch: &str,
    ) -> TreeResult<Self> {
        let snapshot = store
            .branch_tree(branch)?
            .ok_or_else(|| TreeError::MissingBranch(branch.to_owned()))?;
        Ok(MutableTree {
            store,
            snapshot: Some(snapshot),
            overlay: BTreeMap::new(),
            has_changes: false,
            branch: Some(branch.to_owned()),
            use_workdir: false,
            default_signature: signature,
        })
    }

    /// Builds a detached tree from anything `resolve` accepts: a branch
    /// name, a tag name, or a 40-hex commit/tree hash.
    pub fn from_ref(
        store: Arc<ObjectStore>,
        signature: CommitSignature,
        refstr: &str,
    ) -> TreeResult<Self> {
        let snapshot = match store.resolve(refstr)? {
            Some(ResolvedObject::Commit(commit)) => store.commit_tree(&commit)?,
            Some(ResolvedObject::Tree(tree)) => tree,
            Some(ResolvedObject::Blob(_)) | None => {
                return Err(TreeError::UnresolvedRef(refstr.to_owned()));
            }
        };
        Ok(MutableTree {
            store,
            snapshot: Some(snapshot),
            overlay: BTreeMap::new(),
            has_changes: false,
            branch: None,
            use_workdir: false,
            default_signature: signature,
        })
    }

    /// An empty detached tree; `commit` with `create_branch` turns it into
    /// a new branch.
    pub fn empty(store: Arc<ObjectStore>, signature: CommitSignature) -> Self {
        MutableTree {
            store,
            snapshot: None,
            overlay: BTreeMap::new(),
            has_changes: false,
            branch: None,
            use_workdir: false,
            default_signature: signature,
        }
    }

    /// A tree over the working copy: reads consult the git index between
    /// the overlay and the HEAD snapshot, and writes go straight to the
    /// index.
    pub fn from_workdir(store: Arc<ObjectStore>, signature: CommitSignature) -> TreeResult<Self> {
        let snapshot = match store.head_target()? {
            Some(head) => Some(store.commit_tree(&head)?),
            None => None,
        };
        Ok(MutableTree {
            store,
            snapshot,
            overlay: BTreeMap::new(),
            has_changes: false,
            branch: None,
            use_workdir: true,
            default_signature: signature,
        })
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn snapshot_id(&self) -> Option<&TreeId> {
        self.snapshot.as_ref()
    }

    pub fn has_changes(&self) -> bool {
        self.has_changes
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    /// Looks `path` up through the overlay, then (in workdir mode) the git
    /// index, then the snapshot. Staged deletions and paths below staged
    /// files resolve to `None` without consulting the snapshot.
    pub fn get_path(&self, path: &str) -> TreeResult<Option<TreeValue>> {
        let segments = split_path(path)?;
        match overlay_lookup(&self.overlay, &segments) {
            OverlayLookup::Hit(ChangeNode::Blob { id, mode }) => {
                return Ok(Some(TreeValue::Blob {
                    id: id.clone(),
                    mode: *mode,
                }));
            }
            // A staged-but-unwritten subtree has no object id yet; it
            // becomes visible once `update_tree` materializes it.
            OverlayLookup::Hit(ChangeNode::Subtree(_)) => return Ok(None),
            OverlayLookup::Hit(ChangeNode::Deleted) | OverlayLookup::Shadowed => return Ok(None),
            OverlayLookup::Miss => {}
        }
        if self.use_workdir {
            if let Some((id, mode)) = self.store.index_entry(path)? {
                return Ok(Some(TreeValue::Blob { id, mode }));
            }
        }
        match &self.snapshot {
            Some(snapshot) => Ok(self.store.tree_entry(snapshot, path)?),
            None => Ok(None),
        }
    }

    /// Reads the blob at `path`, or `None` when absent or a directory.
    pub fn get_blob(&self, path: &str) -> TreeResult<Option<Vec<u8>>> {
        match self.get_path(path)? {
            Some(TreeValue::Blob { id, .. }) => Ok(Some(self.store.read_blob(&id)?)),
            _ => Ok(None),
        }
    }

    /// Stages `data` as a blob at `path`, creating intermediate overlay
    /// subtrees on demand.
    pub fn set_bytes(&mut self, path: &str, data: &[u8], mode: i32) -> TreeResult<BlobId> {
        let id = self.store.write_blob(data)?;
        self.set_id(path, id.clone(), mode)?;
        Ok(id)
    }

    /// Stages an existing blob at `path` without rewriting its content.
    pub fn set_id(&mut self, path: &str, id: BlobId, mode: i32) -> TreeResult<()> {
        if self.use_workdir {
            let data = self.store.read_blob(&id)?;
            self.store.index_add_buffer(path, &data, mode)?;
        } else {
            overlay_set(&mut self.overlay, path, ChangeNode::Blob { id, mode })?;
        }
        self.has_changes = true;
        Ok(())
    }

    /// Stages a deletion of `path`. In workdir mode this unlinks the file
    /// and drops it from the index instead.
    pub fn remove(&mut self, path: &str) -> TreeResult<()> {
        if self.use_workdir {
            self.store.index_remove(path)?;
        } else {
            overlay_set(&mut self.overlay, path, ChangeNode::Deleted)?;
        }
        self.has_changes = true;
        Ok(())
    }

    pub fn set_or_remove(&mut self, path: &str, data: Option<&[u8]>) -> TreeResult<()> {
        match data {
            Some(data) => {
                self.set_bytes(path, data, MODE_FILE)?;
            }
            None => self.remove(path)?,
        }
        Ok(())
    }

    /// Materializes the staged changes into tree objects. The overlay is
    /// reset and the snapshot advances; `has_changes` stays set until a
    /// commit records the new tree somewhere.
    pub fn update_tree(&mut self) -> TreeResult<TreeId> {
        if self.use_workdir {
            let tree_id = self.store.index_write_tree()?;
            self.snapshot = Some(tree_id.clone());
            return Ok(tree_id);
        }
        if self.overlay.is_empty() {
            if let Some(snapshot) = &self.snapshot {
                return Ok(snapshot.clone());
            }
        }
        let (tree_id, _) = write_onto(&self.store, self.snapshot.as_ref(), &self.overlay)?;
        self.overlay.clear();
        self.snapshot = Some(tree_id.clone());
        Ok(tree_id)
    }

    /// Commits the staged changes. Parents: the HEAD commit in workdir
    /// mode, the branch tip when attached, none when `create_branch` is
    /// requested; anything else has nowhere to commit to.
    pub fn commit(&mut self, message: &str, options: &CommitOptions) -> TreeResult<CommitId> {
        if !self.has_changes {
            return Err(TreeError::NothingToCommit);
        }
        let tree_id = self.update_tree()?;
        let parents: Vec<CommitId> = if self.use_workdir {
            self.store.head_target()?.into_iter().collect()
        } else if let Some(branch) = &self.branch {
            let tip = self
                .store
                .lookup_branch(branch)?
                .ok_or_else(|| TreeError::MissingBranch(branch.clone()))?;
            vec![tip]
        } else if options.create_branch.is_some() {
            vec![]
        } else {
            return Err(TreeError::NoCommitTarget);
        };
        let author = options
            .author
            .clone()
            .unwrap_or_else(|| self.default_signature.clone());
        let committer = options.committer.clone().unwrap_or_else(|| author.clone());
        let commit_id =
            self.store
                .create_commit(message, &author, &committer, &parents, &tree_id)?;
        if self.use_workdir {
            self.store.update_head(&commit_id)?;
            self.store.index_write()?;
        } else if let Some(branch) = options.create_branch.clone() {
            self.store.create_branch(&branch, &commit_id)?;
            self.branch = Some(branch);
        } else if let Some(branch) = &self.branch {
            self.store.set_branch_target(branch, &commit_id)?;
        }
        self.has_changes = false;
        tracing::debug!(
            commit = commit_id.hex(),
            branch = self.branch.as_deref().unwrap_or("<detached>"),
            "committed staged changes"
        );
        Ok(commit_id)
    }

    /// Resynchronizes this tree after a delayed commit recorded `committed`
    /// on the branch: the snapshot advances and overlay leaves the commit
    /// already covers are dropped, so they cannot produce a second,
    /// spurious commit.
    pub(crate) fn absorb_committed(&mut self, new_snapshot: TreeId, committed: &Overlay) {
        prune_covered(&mut self.overlay, committed);
        self.snapshot = Some(new_snapshot);
        if self.overlay.is_empty() {
            self.has_changes = false;
        }
    }
}

fn prune_covered(overlay: &mut Overlay, committed: &Overlay) {
    for (name, committed_node) in committed {
        let Some(staged) = overlay.get_mut(name) else {
            continue;
        };
        let drop = match (&mut *staged, committed_node) {
            (ChangeNode::Subtree(staged_children), ChangeNode::Subtree(committed_children)) => {
                prune_covered(staged_children, committed_children);
                staged_children.is_empty()
            }
            (staged, committed_node) => *staged == *committed_node,
        };
        if drop {
            overlay.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn blob(byte: u8) -> ChangeNode {
        ChangeNode::Blob {
            id: BlobId::from_bytes(&[byte; 20]),
            mode: MODE_FILE,
        }
    }

    #[test]
    fn stage_and_lookup() {
        let mut overlay = Overlay::new();
        overlay_set(&mut overlay, "a/b/c", blob(1)).unwrap();
        assert_matches!(
            overlay_lookup(&overlay, &["a", "b", "c"]),
            OverlayLookup::Hit(ChangeNode::Blob { .. })
        );
        assert_matches!(
            overlay_lookup(&overlay, &["a", "b"]),
            OverlayLookup::Hit(ChangeNode::Subtree(_))
        );
        assert_matches!(overlay_lookup(&overlay, &["a", "x"]), OverlayLookup::Miss);
    }

    #[test]
    fn lookup_below_staged_file_is_shadowed() {
        let mut overlay = Overlay::new();
        overlay_set(&mut overlay, "a", blob(1)).unwrap();
        assert_matches!(
            overlay_lookup(&overlay, &["a", "b"]),
            OverlayLookup::Shadowed
        );
    }

    #[test]
    fn lookup_below_deletion_is_shadowed() {
        let mut overlay = Overlay::new();
        overlay_set(&mut overlay, "a", ChangeNode::Deleted).unwrap();
        assert_matches!(
            overlay_lookup(&overlay, &["a", "b"]),
            OverlayLookup::Shadowed
        );
    }

    #[test]
    fn stage_through_staged_file_collides() {
        let mut overlay = Overlay::new();
        overlay_set(&mut overlay, "a", blob(1)).unwrap();
        assert_matches!(
            overlay_set(&mut overlay, "a/b", blob(2)),
            Err(TreeError::PathCollision(_))
        );
    }

    #[test]
    fn stage_below_deleted_directory_revives_it() {
        let mut overlay = Overlay::new();
        overlay_set(&mut overlay, "a", ChangeNode::Deleted).unwrap();
        overlay_set(&mut overlay, "a/b", blob(2)).unwrap();
        assert_matches!(
            overlay_lookup(&overlay, &["a", "b"]),
            OverlayLookup::Hit(ChangeNode::Blob { .. })
        );
    }

    #[test]
    fn split_path_rejects_degenerate_paths() {
        assert_matches!(split_path(""), Err(TreeError::InvalidPath(_)));
        assert_matches!(split_path("/a"), Err(TreeError::InvalidPath(_)));
        assert_matches!(split_path("a//b"), Err(TreeError::InvalidPath(_)));
        assert_eq!(split_path("a/b").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn prune_covered_drops_only_matching_leaves() {
        let mut overlay = Overlay::new();
        overlay_set(&mut overlay, "a/b", blob(1)).unwrap();
        overlay_set(&mut overlay, "a/c", blob(2)).unwrap();

        let mut committed = Overlay::new();
        overlay_set(&mut committed, "a/b", blob(1)).unwrap();
        // A leaf that was re-staged with different content since the
        // delayed commit snapshotted it must survive.
        overlay_set(&mut committed, "a/c", blob(9)).unwrap();

        prune_covered(&mut overlay, &committed);
        assert_matches!(overlay_lookup(&overlay, &["a", "b"]), OverlayLookup::Miss);
        assert_matches!(
            overlay_lookup(&overlay, &["a", "c"]),
            OverlayLookup::Hit(ChangeNode::Blob { .. })
        );
    }
}
