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

use std::sync::Arc;
use std::sync::Mutex;

use assert_matches::assert_matches;
use cpan_ingit_lib::archive_tree::ArchiveConfig;
use cpan_ingit_lib::archive_tree::ArchiveError;
use cpan_ingit_lib::archive_tree::ArchiveTree;
use cpan_ingit_lib::archive_tree::PACKAGE_DETAILS_PATH;
use cpan_ingit_lib::object_store::TreeValue;
use cpan_ingit_lib::repo::Repository;
use cpan_ingit_lib::tree::CommitOptions;
use testutils::packages_file;
use testutils::seed_branch;
use testutils::TestRepo;

const FASTFORWARD: &str = "J/JW/JWACH/Apache-FastForward-1.1.tar.gz";
const FASTFORWARD_META: &str = "J/JW/JWACH/Apache-FastForward-1.1.meta";

fn sample_rows() -> Vec<(&'static str, &'static str, &'static str)> {
    vec![
        ("A1z::Html", "0.04", "C/CE/CEEJAY/A1z-Html-0.04.tar.gz"),
        ("AAA::Demo", "undef", FASTFORWARD),
        ("AAA::eBay", "undef", FASTFORWARD),
        (
            "AAAA::Crypt::DH",
            "0.06",
            "B/BI/BINGOS/AAAA-Crypt-DH-0.06.tar.gz",
        ),
    ]
}

/// Branch `A`: the sample index plus the archives it refers to.
fn seed_source(repo: &Repository) {
    let packages = packages_file(&sample_rows());
    seed_branch(
        repo,
        "A",
        &[
            (PACKAGE_DETAILS_PATH, packages.as_slice()),
            (
                "authors/id/C/CE/CEEJAY/A1z-Html-0.04.tar.gz",
                b"a1z html archive",
            ),
            (&format!("authors/id/{FASTFORWARD}"), b"fastforward archive"),
            (
                "authors/id/B/BI/BINGOS/AAAA-Crypt-DH-0.06.tar.gz",
                b"crypt dh archive",
            ),
        ],
    );
}

/// Branch `B`: an empty curated archive importing from `A`.
fn create_target(repo: &Repository) -> Arc<Mutex<ArchiveTree>> {
    let config = ArchiveConfig {
        default_import_sources: Some(vec!["A".to_owned()]),
        ..Default::default()
    };
    repo.create_archive_tree("B", &config).unwrap()
}

#[test]
fn import_dist_copies_blob_and_takes_module_ownership() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_source(repo);
    let target = create_target(repo);
    let source = repo.archive_tree("A").unwrap();

    let mut target = target.lock().unwrap();
    let mut source = source.lock().unwrap();
    target.import_dist(&mut source, FASTFORWARD).unwrap();

    // The staged blob is the peer's blob, not a copy.
    let path = format!("authors/id/{FASTFORWARD}");
    let Some(TreeValue::Blob { id: imported, .. }) = target.get_path(&path).unwrap() else {
        panic!("imported dist not staged");
    };
    let Some(TreeValue::Blob { id: original, .. }) = source.get_path(&path).unwrap() else {
        panic!("source dist missing");
    };
    assert_eq!(imported, original);

    // Both modules of the shared dist moved over, nothing else did.
    let details = target.package_details().unwrap();
    assert_eq!(details.len(), 2);
    assert_eq!(
        details.module("AAA::Demo").unwrap().dist_path,
        FASTFORWARD
    );
    assert_eq!(
        details.module("AAA::eBay").unwrap().dist_path,
        FASTFORWARD
    );
    assert_eq!(details.module("A1z::Html"), None);
    assert_eq!(details.header("Line-Count"), Some("11"));
}

#[test]
fn import_dist_twice_is_a_no_op() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_source(repo);
    let target = create_target(repo);
    let source = repo.archive_tree("A").unwrap();

    let mut target = target.lock().unwrap();
    let mut source = source.lock().unwrap();
    target.import_dist(&mut source, FASTFORWARD).unwrap();
    target.commit("import", &CommitOptions::default()).unwrap();

    target.import_dist(&mut source, FASTFORWARD).unwrap();
    assert!(!target.has_changes(), "second import staged changes");
}

#[test]
fn import_dist_unknown_in_peer_fails() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_source(repo);
    let target = create_target(repo);
    let source = repo.archive_tree("A").unwrap();

    let mut target = target.lock().unwrap();
    let mut source = source.lock().unwrap();
    assert_matches!(
        target.import_dist(&mut source, "X/XY/XYZZY/Missing-1.0.tar.gz"),
        Err(ArchiveError::NotInPeer(_))
    );
}

#[test]
fn import_dist_refuses_divergent_content() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_source(repo);
    let target = create_target(repo);
    let source = repo.archive_tree("A").unwrap();

    {
        let mut target = target.lock().unwrap();
        let path = format!("authors/id/{FASTFORWARD}");
        target
            .set_bytes(&path, b"locally patched archive", 0o100644)
            .unwrap();
        target.commit("local variant", &CommitOptions::default()).unwrap();
    }
    let mut target = target.lock().unwrap();
    let mut source = source.lock().unwrap();
    assert_matches!(
        target.import_dist(&mut source, FASTFORWARD),
        Err(ArchiveError::DistCollision { .. })
    );
}

#[test]
fn import_dist_copies_meta_and_prereqs_parse() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let packages = packages_file(&sample_rows());
    let meta = br#"{
        "prereqs": {
            "configure": { "requires": { "ExtUtils::MakeMaker": "6.58" } },
            "runtime": { "requires": { "AAAA::Crypt::DH": "0.05" } },
            "test": { "requires": { "AAAA::Crypt::DH": "0.06" } }
        }
    }"#;
    seed_branch(
        repo,
        "A",
        &[
            (PACKAGE_DETAILS_PATH, packages.as_slice()),
            (&format!("authors/id/{FASTFORWARD}"), b"fastforward archive"),
            (&format!("authors/id/{FASTFORWARD_META}"), meta.as_slice()),
        ],
    );
    let target = create_target(repo);
    let source = repo.archive_tree("A").unwrap();

    let mut target = target.lock().unwrap();
    let mut source = source.lock().unwrap();
    target.import_dist(&mut source, FASTFORWARD).unwrap();

    let meta_path = format!("authors/id/{FASTFORWARD_META}");
    assert_matches!(
        target.get_path(&meta_path).unwrap(),
        Some(TreeValue::Blob { .. })
    );
    let prereqs = target.get_dist_prereqs(FASTFORWARD).unwrap();
    assert_eq!(
        prereqs.get("ExtUtils::MakeMaker"),
        Some(&"6.58".to_owned())
    );
    // Phases are unioned; the runtime and test bounds combine.
    assert_eq!(prereqs.get("AAAA::Crypt::DH"), Some(&">=0.06".to_owned()));
}

#[test]
fn import_without_meta_still_succeeds() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_source(repo);
    let target = create_target(repo);
    let source = repo.archive_tree("A").unwrap();

    let mut target = target.lock().unwrap();
    let mut source = source.lock().unwrap();
    target.import_dist(&mut source, FASTFORWARD).unwrap();
    assert_eq!(
        target.get_dist_prereqs(FASTFORWARD).unwrap(),
        std::collections::BTreeMap::new()
    );
}

#[test]
fn write_config_skips_identical_content() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let target = create_target(repo);

    let mut target = target.lock().unwrap();
    let config = target.config().unwrap().clone();
    target.write_config(&config).unwrap();
    assert!(!target.has_changes());

    let mut changed = config.clone();
    changed.canonical_url = Some("http://b.example/".to_owned());
    target.write_config(&changed).unwrap();
    assert!(target.has_changes());
    assert_eq!(target.config().unwrap(), &changed);
}

#[test]
fn config_is_required_but_lazily_loaded() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_branch(repo, "bare-files", &[("readme.txt", b"no config here")]);

    let tree = repo.archive_tree("bare-files").unwrap();
    let mut tree = tree.lock().unwrap();
    assert!(tree.try_config().unwrap().is_none());
    assert_matches!(tree.config(), Err(ArchiveError::MissingConfig(_)));
}

#[test]
fn package_details_write_invalidates_and_reparses() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_source(repo);
    let source = repo.archive_tree("A").unwrap();

    let mut source = source.lock().unwrap();
    assert_eq!(source.package_details().unwrap().len(), 4);
    // Overwriting the blob through the staging API drops the cached parse.
    let replacement = packages_file(&[("Only::One", "1.0", "O/ON/ONE/Only-One-1.0.tar.gz")]);
    source
        .set_bytes(PACKAGE_DETAILS_PATH, &replacement, 0o100644)
        .unwrap();
    let details = source.package_details().unwrap();
    assert_eq!(details.len(), 1);
    assert!(details.module("Only::One").is_some());
}

#[test]
fn dist_paths_lists_index_dists() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    seed_source(repo);
    let source = repo.archive_tree("A").unwrap();

    let mut source = source.lock().unwrap();
    let dists = source.dist_paths().unwrap();
    assert_eq!(
        dists,
        vec![
            "B/BI/BINGOS/AAAA-Crypt-DH-0.06.tar.gz".to_owned(),
            "C/CE/CEEJAY/A1z-Html-0.04.tar.gz".to_owned(),
            FASTFORWARD.to_owned(),
        ]
    );
}
