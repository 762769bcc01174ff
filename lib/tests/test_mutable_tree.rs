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

use assert_matches::assert_matches;
use cpan_ingit_lib::object_store::ObjectStore;
use cpan_ingit_lib::object_store::TreeValue;
use cpan_ingit_lib::object_store::MODE_FILE;
use cpan_ingit_lib::tree::CommitOptions;
use cpan_ingit_lib::tree::MutableTree;
use cpan_ingit_lib::tree::TreeError;
use testutils::new_temp_dir;
use testutils::seed_branch;
use testutils::test_signature;
use testutils::TestRepo;

#[test]
fn staged_write_is_visible_before_update_tree() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_branch(repo, "trunk", &[("a.txt", b"base")]);

    let mut tree =
        MutableTree::from_branch(repo.store().clone(), test_signature(), "trunk").unwrap();
    let id = tree.set_bytes("dir/new.txt", b"data", MODE_FILE).unwrap();
    assert_eq!(
        tree.get_path("dir/new.txt").unwrap(),
        Some(TreeValue::Blob {
            id,
            mode: MODE_FILE
        })
    );
    assert_eq!(tree.get_blob("dir/new.txt").unwrap().unwrap(), b"data");
    // The snapshot file is still visible through the overlay.
    assert_eq!(tree.get_blob("a.txt").unwrap().unwrap(), b"base");
    assert!(tree.has_changes());
}

#[test]
fn staged_deletion_hides_snapshot_file() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_branch(repo, "trunk", &[("a.txt", b"base")]);

    let mut tree =
        MutableTree::from_branch(repo.store().clone(), test_signature(), "trunk").unwrap();
    tree.remove("a.txt").unwrap();
    assert_eq!(tree.get_path("a.txt").unwrap(), None);
    assert_eq!(tree.get_blob("a.txt").unwrap(), None);
}

#[test]
fn update_tree_is_deterministic() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_branch(repo, "trunk", &[("a.txt", b"base"), ("dir/b.txt", b"bee")]);

    let stage = |tree: &mut MutableTree| {
        tree.set_bytes("dir/c.txt", b"sea", MODE_FILE).unwrap();
        tree.remove("a.txt").unwrap();
        tree.set_bytes("other/d.txt", b"dee", MODE_FILE).unwrap();
    };
    let mut tree1 =
        MutableTree::from_branch(repo.store().clone(), test_signature(), "trunk").unwrap();
    let mut tree2 =
        MutableTree::from_branch(repo.store().clone(), test_signature(), "trunk").unwrap();
    stage(&mut tree1);
    stage(&mut tree2);
    let id1 = tree1.update_tree().unwrap();
    let id2 = tree2.update_tree().unwrap();
    assert_eq!(id1, id2);

    // The overlay is gone, the snapshot advanced, and the changes stay
    // uncommitted.
    assert!(tree1.overlay().is_empty());
    assert_eq!(tree1.snapshot_id(), Some(&id1));
    assert!(tree1.has_changes());
}

#[test]
fn commit_advances_branch_with_exactly_the_staged_changes() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_branch(repo, "trunk", &[("a.txt", b"base"), ("dir/b.txt", b"bee")]);
    let old_tip = repo.store().lookup_branch("trunk").unwrap().unwrap();

    let mut tree =
        MutableTree::from_branch(repo.store().clone(), test_signature(), "trunk").unwrap();
    tree.set_bytes("dir/c.txt", b"sea", MODE_FILE).unwrap();
    tree.remove("a.txt").unwrap();
    let commit_id = tree
        .commit("add c, drop a", &CommitOptions::default())
        .unwrap();
    assert!(!tree.has_changes());

    let store = repo.store();
    assert_eq!(store.lookup_branch("trunk").unwrap(), Some(commit_id));
    let new_tree = store.branch_tree("trunk").unwrap().unwrap();
    assert_eq!(store.tree_entry(&new_tree, "a.txt").unwrap(), None);
    assert_matches!(
        store.tree_entry(&new_tree, "dir/b.txt").unwrap(),
        Some(TreeValue::Blob { .. })
    );
    assert_matches!(
        store.tree_entry(&new_tree, "dir/c.txt").unwrap(),
        Some(TreeValue::Blob { .. })
    );
    let old_tree = store.commit_tree(&old_tip).unwrap();
    assert_ne!(old_tree, new_tree);
}

#[test]
fn removing_last_file_prunes_empty_subtree() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_branch(repo, "trunk", &[("dir/only.txt", b"x"), ("top.txt", b"y")]);

    let mut tree =
        MutableTree::from_branch(repo.store().clone(), test_signature(), "trunk").unwrap();
    tree.remove("dir/only.txt").unwrap();
    let new_tree = tree.update_tree().unwrap();
    assert_eq!(repo.store().tree_entry(&new_tree, "dir").unwrap(), None);
}

#[test]
fn detached_tree_has_no_commit_target() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_branch(repo, "trunk", &[("a.txt", b"base")]);

    let mut tree = MutableTree::from_ref(repo.store().clone(), test_signature(), "trunk").unwrap();
    assert!(tree.branch().is_none());
    tree.set_bytes("b.txt", b"bee", MODE_FILE).unwrap();
    assert_matches!(
        tree.commit("nowhere to go", &CommitOptions::default()),
        Err(TreeError::NoCommitTarget)
    );
}

#[test]
fn commit_with_create_branch_attaches() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;

    let mut tree = MutableTree::empty(repo.store().clone(), test_signature());
    tree.set_bytes("a.txt", b"first", MODE_FILE).unwrap();
    let first = tree
        .commit(
            "initial",
            &CommitOptions {
                create_branch: Some("fresh".to_owned()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(tree.branch(), Some("fresh"));
    assert_eq!(repo.store().lookup_branch("fresh").unwrap(), Some(first));

    // Attached now: further commits advance the branch.
    tree.set_bytes("b.txt", b"second", MODE_FILE).unwrap();
    let second = tree.commit("more", &CommitOptions::default()).unwrap();
    assert_eq!(repo.store().lookup_branch("fresh").unwrap(), Some(second));
}

#[test]
fn commit_without_changes_is_refused() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_branch(repo, "trunk", &[("a.txt", b"base")]);

    let mut tree =
        MutableTree::from_branch(repo.store().clone(), test_signature(), "trunk").unwrap();
    assert_matches!(
        tree.commit("empty", &CommitOptions::default()),
        Err(TreeError::NothingToCommit)
    );
}

#[test]
fn from_branch_requires_existing_branch() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    assert_matches!(
        MutableTree::from_branch(repo.store().clone(), test_signature(), "nope"),
        Err(TreeError::MissingBranch(_))
    );
}

#[test]
fn resolve_accepts_hashes_and_branches() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_branch(repo, "trunk", &[("a.txt", b"base")]);
    let tip = repo.store().lookup_branch("trunk").unwrap().unwrap();

    let by_branch =
        MutableTree::from_ref(repo.store().clone(), test_signature(), "trunk").unwrap();
    let by_hash =
        MutableTree::from_ref(repo.store().clone(), test_signature(), &tip.hex()).unwrap();
    assert_eq!(by_branch.snapshot_id(), by_hash.snapshot_id());

    assert_matches!(
        MutableTree::from_ref(repo.store().clone(), test_signature(), "no-such-ref"),
        Err(TreeError::UnresolvedRef(_))
    );
}

#[test]
fn repository_snapshot_serves_blobs_read_only() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_branch(repo, "trunk", &[("dir/a.txt", b"served")]);

    let snapshot = repo.snapshot("trunk").unwrap();
    assert_eq!(snapshot.get_blob("dir/a.txt").unwrap().unwrap(), b"served");
    assert_eq!(snapshot.get_blob("dir/missing.txt").unwrap(), None);
}

#[test]
fn workdir_tree_stages_through_the_index() {
    let temp_dir = new_temp_dir();
    git2::Repository::init(temp_dir.path()).unwrap();
    let store = std::sync::Arc::new(ObjectStore::open(temp_dir.path()).unwrap());

    let mut tree = MutableTree::from_workdir(store.clone(), test_signature()).unwrap();
    tree.set_bytes("hello.txt", b"hello", MODE_FILE).unwrap();
    assert_matches!(
        tree.get_path("hello.txt").unwrap(),
        Some(TreeValue::Blob { .. })
    );

    let commit_id = tree.commit("from workdir", &CommitOptions::default()).unwrap();
    // The checked out (previously unborn) branch now points at the commit.
    assert_eq!(store.head_target().unwrap(), Some(commit_id.clone()));
    let committed_tree = store.commit_tree(&commit_id).unwrap();
    assert_matches!(
        store.tree_entry(&committed_tree, "hello.txt").unwrap(),
        Some(TreeValue::Blob { .. })
    );

    // Deletion goes straight through the index.
    tree.remove("hello.txt").unwrap();
    assert_eq!(store.index_entry("hello.txt").unwrap(), None);
}
