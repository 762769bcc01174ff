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

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fmt::Error;
use std::fmt::Formatter;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use git2::Oid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object not found")]
    NotFound,
    #[error("Git operation {op} failed")]
    Git {
        op: &'static str,
        #[source]
        source: git2::Error,
    },
    #[error("I/O failed on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

fn git_err(op: &'static str) -> impl FnOnce(git2::Error) -> ObjectStoreError {
    move |source| match source.code() {
        git2::ErrorCode::NotFound | git2::ErrorCode::UnbornBranch => ObjectStoreError::NotFound,
        _ => ObjectStoreError::Git { op, source },
    }
}

macro_rules! id_type {
    ($name:ident) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
        pub struct $name(Vec<u8>);

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
                f.debug_tuple(stringify!($name)).field(&self.hex()).finish()
            }
        }

        impl $name {
            pub fn from_bytes(bytes: &[u8]) -> Self {
                Self(bytes.to_vec())
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn from_hex(hex: &str) -> Option<Self> {
                hex::decode(hex).ok().map(Self)
            }

            pub fn hex(&self) -> String {
                hex::encode(&self.0)
            }
        }
    };
}

id_type!(CommitId);
id_type!(TreeId);
id_type!(BlobId);

fn to_oid(bytes: &[u8]) -> ObjectStoreResult<Oid> {
    Oid::from_bytes(bytes).map_err(|_| ObjectStoreError::NotFound)
}

pub const MODE_FILE: i32 = 0o100644;
pub const MODE_EXECUTABLE: i32 = 0o100755;
pub const MODE_TREE: i32 = 0o040000;
pub const MODE_SYMLINK: i32 = 0o120000;

/// An entry as it appears inside a stored tree object. The engine itself
/// only ever writes regular files and directories; symlinks read from
/// foreign branches surface as `Blob` with their original mode.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum TreeValue {
    Blob { id: BlobId, mode: i32 },
    Tree(TreeId),
}

impl TreeValue {
    pub fn as_blob(&self) -> Option<(&BlobId, i32)> {
        match self {
            TreeValue::Blob { id, mode } => Some((id, *mode)),
            TreeValue::Tree(_) => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ResolvedObject {
    Commit(CommitId),
    Tree(TreeId),
    Blob(BlobId),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CommitSignature {
    pub name: String,
    pub email: String,
}

impl CommitSignature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        CommitSignature {
            name: name.into(),
            email: email.into(),
        }
    }

    fn to_git(&self) -> ObjectStoreResult<git2::Signature<'static>> {
        git2::Signature::now(&self.name, &self.email).map_err(git_err("signature_now"))
    }
}

/// Thin adapter over a libgit2 repository. All access is funneled through
/// one mutex because libgit2 handles must not be shared across threads.
pub struct ObjectStore {
    repo: Mutex<git2::Repository>,
    workdir: Option<PathBuf>,
}

impl Debug for ObjectStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("ObjectStore")
            .field("path", &self.repo.lock().unwrap().path())
            .finish()
    }
}

impl ObjectStore {
    pub fn open(path: &Path) -> ObjectStoreResult<Self> {
        let repo = git2::Repository::open(path).map_err(git_err("open"))?;
        Ok(Self::from_git(repo))
    }

    pub fn init_bare(path: &Path) -> ObjectStoreResult<Self> {
        let repo = git2::Repository::init_bare(path).map_err(git_err("init_bare"))?;
        Ok(Self::from_git(repo))
    }

    /// Opens `path` as an existing repository, initializing a new bare one
    /// if there is nothing there yet.
    pub fn open_or_init(path: &Path) -> ObjectStoreResult<Self> {
        match git2::Repository::open(path) {
            Ok(repo) => Ok(Self::from_git(repo)),
            Err(_) => Self::init_bare(path),
        }
    }

    pub fn from_git(repo: git2::Repository) -> Self {
        let workdir = repo.workdir().map(|dir| dir.to_owned());
        ObjectStore {
            repo: Mutex::new(repo),
            workdir,
        }
    }

    /// On-disk location of the store (the `.git` directory for non-bare
    /// repositories).
    pub fn path(&self) -> PathBuf {
        self.repo.lock().unwrap().path().to_owned()
    }

    pub fn read_blob(&self, id: &BlobId) -> ObjectStoreResult<Vec<u8>> {
        let repo = self.repo.lock().unwrap();
        let blob = repo
            .find_blob(to_oid(id.as_bytes())?)
            .map_err(git_err("find_blob"))?;
        Ok(blob.content().to_owned())
    }

    pub fn write_blob(&self, data: &[u8]) -> ObjectStoreResult<BlobId> {
        let repo = self.repo.lock().unwrap();
        let oid = repo.blob(data).map_err(git_err("blob"))?;
        Ok(BlobId::from_bytes(oid.as_bytes()))
    }

    /// Looks up the entry at a slash-separated `path` inside the tree
    /// object `tree`. Returns `None` when no entry exists at that path.
    pub fn tree_entry(&self, tree: &TreeId, path: &str) -> ObjectStoreResult<Option<TreeValue>> {
        let repo = self.repo.lock().unwrap();
        let git_tree = repo
            .find_tree(to_oid(tree.as_bytes())?)
            .map_err(git_err("find_tree"))?;
        let entry = match git_tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(err) if err.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(err) => return Err(git_err("tree_get_path")(err)),
        };
        Ok(tree_value_from_entry(&entry))
    }

    /// Writes a tree object derived from `base` with `edits` applied.
    /// `None` edits remove the entry (a no-op when absent). Returns the new
    /// tree id and its entry count; callers use the count to prune subtrees
    /// that became empty.
    pub fn write_tree(
        &self,
        base: Option<&TreeId>,
        edits: &BTreeMap<String, Option<TreeValue>>,
    ) -> ObjectStoreResult<(TreeId, usize)> {
        let repo = self.repo.lock().unwrap();
        let base_tree = base
            .map(|id| repo.find_tree(to_oid(id.as_bytes())?).map_err(git_err("find_tree")))
            .transpose()?;
        let mut builder = repo
            .treebuilder(base_tree.as_ref())
            .map_err(git_err("treebuilder"))?;
        for (name, edit) in edits {
            match edit {
                Some(TreeValue::Blob { id, mode }) => {
                    builder
                        .insert(name, to_oid(id.as_bytes())?, *mode)
                        .map_err(git_err("treebuilder_insert"))?;
                }
                Some(TreeValue::Tree(id)) => {
                    builder
                        .insert(name, to_oid(id.as_bytes())?, MODE_TREE)
                        .map_err(git_err("treebuilder_insert"))?;
                }
                None => {
                    let present = builder
                        .get(name)
                        .map_err(git_err("treebuilder_get"))?
                        .is_some();
                    if present {
                        builder.remove(name).map_err(git_err("treebuilder_remove"))?;
                    }
                }
            }
        }
        let len = builder.len();
        let oid = builder.write().map_err(git_err("treebuilder_write"))?;
        Ok((TreeId::from_bytes(oid.as_bytes()), len))
    }

    pub fn empty_tree_id(&self) -> ObjectStoreResult<TreeId> {
        let (id, _) = self.write_tree(None, &BTreeMap::new())?;
        Ok(id)
    }

    pub fn create_commit(
        &self,
        message: &str,
        author: &CommitSignature,
        committer: &CommitSignature,
        parents: &[CommitId],
        tree: &TreeId,
    ) -> ObjectStoreResult<CommitId> {
        let repo = self.repo.lock().unwrap();
        let git_tree = repo
            .find_tree(to_oid(tree.as_bytes())?)
            .map_err(git_err("find_tree"))?;
        let mut parent_commits = Vec::new();
        for parent in parents {
            let commit = repo
                .find_commit(to_oid(parent.as_bytes())?)
                .map_err(git_err("find_commit"))?;
            parent_commits.push(commit);
        }
        let parent_refs: Vec<_> = parent_commits.iter().collect();
        let oid = repo
            .commit(
                None,
                &author.to_git()?,
                &committer.to_git()?,
                message,
                &git_tree,
                &parent_refs,
            )
            .map_err(git_err("commit"))?;
        Ok(CommitId::from_bytes(oid.as_bytes()))
    }

    pub fn commit_tree(&self, id: &CommitId) -> ObjectStoreResult<TreeId> {
        let repo = self.repo.lock().unwrap();
        let commit = repo
            .find_commit(to_oid(id.as_bytes())?)
            .map_err(git_err("find_commit"))?;
        Ok(TreeId::from_bytes(commit.tree_id().as_bytes()))
    }

    pub fn lookup_branch(&self, name: &str) -> ObjectStoreResult<Option<CommitId>> {
        let repo = self.repo.lock().unwrap();
        let result = match repo.find_branch(name, git2::BranchType::Local) {
            Ok(branch) => {
                let commit = branch
                    .get()
                    .peel_to_commit()
                    .map_err(git_err("peel_to_commit"))?;
                Ok(Some(CommitId::from_bytes(commit.id().as_bytes())))
            }
            Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(err) => Err(git_err("find_branch")(err)),
        };
        result
    }

    pub fn branch_tree(&self, name: &str) -> ObjectStoreResult<Option<TreeId>> {
        match self.lookup_branch(name)? {
            Some(commit) => Ok(Some(self.commit_tree(&commit)?)),
            None => Ok(None),
        }
    }

    pub fn create_branch(&self, name: &str, target: &CommitId) -> ObjectStoreResult<()> {
        let repo = self.repo.lock().unwrap();
        let commit = repo
            .find_commit(to_oid(target.as_bytes())?)
            .map_err(git_err("find_commit"))?;
        repo.branch(name, &commit, false)
            .map_err(git_err("branch"))?;
        Ok(())
    }

    pub fn set_branch_target(&self, name: &str, target: &CommitId) -> ObjectStoreResult<()> {
        let repo = self.repo.lock().unwrap();
        let mut reference = repo
            .find_reference(&format!("refs/heads/{name}"))
            .map_err(git_err("find_reference"))?;
        reference
            .set_target(to_oid(target.as_bytes())?, "cpan-ingit: advance branch")
            .map_err(git_err("set_target"))?;
        Ok(())
    }

    /// Resolves a branch name, then a tag name, then a 40-hex object hash,
    /// peeling annotated tags down to the object they point at.
    pub fn resolve(&self, refstr: &str) -> ObjectStoreResult<Option<ResolvedObject>> {
        if let Some(tip) = self.lookup_branch(refstr)? {
            return Ok(Some(ResolvedObject::Commit(tip)));
        }
        {
            let repo = self.repo.lock().unwrap();
            match repo.find_reference(&format!("refs/tags/{refstr}")) {
                Ok(reference) => {
                    let object = reference
                        .peel(git2::ObjectType::Any)
                        .map_err(git_err("peel"))?;
                    return Ok(resolved_from_object(&object));
                }
                Err(err) if err.code() == git2::ErrorCode::NotFound => {}
                Err(err) => return Err(git_err("find_reference")(err)),
            }
            if refstr.len() == 40 {
                if let Ok(oid) = Oid::from_str(refstr) {
                    match repo.find_object(oid, None) {
                        Ok(object) => {
                            let object = if object.kind() == Some(git2::ObjectType::Tag) {
                                object.peel(git2::ObjectType::Any).map_err(git_err("peel"))?
                            } else {
                                object
                            };
                            return Ok(resolved_from_object(&object));
                        }
                        Err(err) if err.code() == git2::ErrorCode::NotFound => {}
                        Err(err) => return Err(git_err("find_object")(err)),
                    }
                }
            }
        }
        Ok(None)
    }

    pub fn head_target(&self) -> ObjectStoreResult<Option<CommitId>> {
        let repo = self.repo.lock().unwrap();
        let result = match repo.head() {
            Ok(head) => Ok(head.target().map(|oid| CommitId::from_bytes(oid.as_bytes()))),
            Err(err)
                if matches!(
                    err.code(),
                    git2::ErrorCode::NotFound | git2::ErrorCode::UnbornBranch
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(git_err("head")(err)),
        };
        result
    }

    /// Moves HEAD to `target` after a workdir commit: advances the checked
    /// out branch when HEAD is symbolic (creating it when unborn), detaches
    /// otherwise.
    pub fn update_head(&self, target: &CommitId) -> ObjectStoreResult<()> {
        let repo = self.repo.lock().unwrap();
        let oid = to_oid(target.as_bytes())?;
        let symbolic = repo
            .find_reference("HEAD")
            .ok()
            .and_then(|head| head.symbolic_target().map(|name| name.to_owned()));
        match symbolic {
            Some(refname) => {
                repo.reference(&refname, oid, true, "cpan-ingit: commit")
                    .map_err(git_err("reference"))?;
            }
            None => {
                repo.set_head_detached(oid).map_err(git_err("set_head"))?;
            }
        }
        Ok(())
    }

    pub fn index_entry(&self, path: &str) -> ObjectStoreResult<Option<(BlobId, i32)>> {
        let repo = self.repo.lock().unwrap();
        let index = repo.index().map_err(git_err("index"))?;
        Ok(index
            .get_path(Path::new(path), 0)
            .map(|entry| (BlobId::from_bytes(entry.id.as_bytes()), entry.mode as i32)))
    }

    pub fn index_add_buffer(&self, path: &str, data: &[u8], mode: i32) -> ObjectStoreResult<()> {
        let repo = self.repo.lock().unwrap();
        let mut index = repo.index().map_err(git_err("index"))?;
        let entry = git2::IndexEntry {
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
        };
        index
            .add_frombuffer(&entry, data)
            .map_err(git_err("index_add_frombuffer"))?;
        index.write().map_err(git_err("index_write"))?;
        Ok(())
    }

    /// Removes `path` from the index and unlinks the corresponding workdir
    /// file if one exists.
    pub fn index_remove(&self, path: &str) -> ObjectStoreResult<()> {
        let repo = self.repo.lock().unwrap();
        let mut index = repo.index().map_err(git_err("index"))?;
        if index.get_path(Path::new(path), 0).is_some() {
            index
                .remove_path(Path::new(path))
                .map_err(git_err("index_remove_path"))?;
            index.write().map_err(git_err("index_write"))?;
        }
        drop(repo);
        if let Some(workdir) = &self.workdir {
            let file = workdir.join(path);
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(ObjectStoreError::Io {
                        path: file,
                        source: err,
                    })
                }
            }
        }
        Ok(())
    }

    pub fn index_write_tree(&self) -> ObjectStoreResult<TreeId> {
        let repo = self.repo.lock().unwrap();
        let mut index = repo.index().map_err(git_err("index"))?;
        let oid = index.write_tree().map_err(git_err("index_write_tree"))?;
        Ok(TreeId::from_bytes(oid.as_bytes()))
    }

    pub fn index_write(&self) -> ObjectStoreResult<()> {
        let repo = self.repo.lock().unwrap();
        let mut index = repo.index().map_err(git_err("index"))?;
        index.write().map_err(git_err("index_write"))?;
        Ok(())
    }
}

fn tree_value_from_entry(entry: &git2::TreeEntry) -> Option<TreeValue> {
    match entry.kind() {
        Some(git2::ObjectType::Tree) => {
            Some(TreeValue::Tree(TreeId::from_bytes(entry.id().as_bytes())))
        }
        Some(git2::ObjectType::Blob) => Some(TreeValue::Blob {
            id: BlobId::from_bytes(entry.id().as_bytes()),
            mode: entry.filemode(),
        }),
        _ => None,
    }
}

fn resolved_from_object(object: &git2::Object) -> Option<ResolvedObject> {
    match object.kind() {
        Some(git2::ObjectType::Commit) => Some(ResolvedObject::Commit(CommitId::from_bytes(
            object.id().as_bytes(),
        ))),
        Some(git2::ObjectType::Tree) => Some(ResolvedObject::Tree(TreeId::from_bytes(
            object.id().as_bytes(),
        ))),
        Some(git2::ObjectType::Blob) => Some(ResolvedObject::Blob(BlobId::from_bytes(
            object.id().as_bytes(),
        ))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn test_store() -> (tempfile::TempDir, ObjectStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::init_bare(temp_dir.path()).unwrap();
        (temp_dir, store)
    }

    fn signature() -> CommitSignature {
        CommitSignature::new("Someone", "someone@example.com")
    }

    #[test]
    fn blob_round_trip() {
        let (_temp_dir, store) = test_store();
        let id = store.write_blob(b"content").unwrap();
        assert_eq!(store.read_blob(&id).unwrap(), b"content");
        // Content addressing: identical bytes share one id.
        assert_eq!(store.write_blob(b"content").unwrap(), id);
    }

    #[test]
    fn read_missing_blob_is_not_found() {
        let (_temp_dir, store) = test_store();
        let bogus = BlobId::from_hex("4b825dc642cb6eb9a060e54bf8d69288fbee4904").unwrap();
        assert_matches!(store.read_blob(&bogus), Err(ObjectStoreError::NotFound));
    }

    #[test]
    fn write_tree_applies_edits() {
        let (_temp_dir, store) = test_store();
        let blob = store.write_blob(b"data").unwrap();
        let mut edits = BTreeMap::new();
        edits.insert(
            "a.txt".to_string(),
            Some(TreeValue::Blob {
                id: blob.clone(),
                mode: MODE_FILE,
            }),
        );
        let (tree_id, len) = store.write_tree(None, &edits).unwrap();
        assert_eq!(len, 1);
        assert_eq!(
            store.tree_entry(&tree_id, "a.txt").unwrap(),
            Some(TreeValue::Blob {
                id: blob,
                mode: MODE_FILE
            })
        );

        // Removing the only entry produces the empty tree.
        let mut edits = BTreeMap::new();
        edits.insert("a.txt".to_string(), None);
        let (empty_id, len) = store.write_tree(Some(&tree_id), &edits).unwrap();
        assert_eq!(len, 0);
        assert_eq!(empty_id, store.empty_tree_id().unwrap());
        // Removing an absent entry is a no-op rather than an error.
        let mut edits = BTreeMap::new();
        edits.insert("missing".to_string(), None);
        store.write_tree(Some(&empty_id), &edits).unwrap();
    }

    #[test]
    fn resolve_prefers_branch_then_tag_then_hash() {
        let (_temp_dir, store) = test_store();
        let tree_id = store.empty_tree_id().unwrap();
        let commit = store
            .create_commit("initial", &signature(), &signature(), &[], &tree_id)
            .unwrap();
        store.create_branch("trunk", &commit).unwrap();

        assert_eq!(
            store.resolve("trunk").unwrap(),
            Some(ResolvedObject::Commit(commit.clone()))
        );
        assert_eq!(
            store.resolve(&commit.hex()).unwrap(),
            Some(ResolvedObject::Commit(commit.clone()))
        );
        assert_eq!(
            store.resolve(&tree_id.hex()).unwrap(),
            Some(ResolvedObject::Tree(tree_id))
        );
        assert_eq!(store.resolve("no-such-ref").unwrap(), None);
    }

    #[test]
    fn branch_advances() {
        let (_temp_dir, store) = test_store();
        let tree_id = store.empty_tree_id().unwrap();
        let first = store
            .create_commit("first", &signature(), &signature(), &[], &tree_id)
            .unwrap();
        store.create_branch("trunk", &first).unwrap();
        let second = store
            .create_commit("second", &signature(), &signature(), &[first.clone()], &tree_id)
            .unwrap();
        store.set_branch_target("trunk", &second).unwrap();
        assert_eq!(store.lookup_branch("trunk").unwrap(), Some(second));
        assert_eq!(store.lookup_branch("other").unwrap(), None);
    }
}
