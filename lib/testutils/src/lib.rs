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

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;
use std::time::Duration;
use std::time::SystemTime;

use chrono::TimeZone;
use chrono::Utc;
use cpan_ingit_lib::committer::Clock;
use cpan_ingit_lib::object_store::CommitSignature;
use cpan_ingit_lib::object_store::MODE_FILE;
use cpan_ingit_lib::repo::Repository;
use cpan_ingit_lib::settings::UserSettings;
use cpan_ingit_lib::tree::CommitOptions;
use cpan_ingit_lib::tree::MutableTree;
use cpan_ingit_lib::upstream::HttpResponse;
use cpan_ingit_lib::upstream::UpstreamError;
use cpan_ingit_lib::upstream::UserAgent;
use itertools::Itertools;
use tempfile::TempDir;

pub fn hermetic_libgit2() {
    // libgit2 respects init.defaultBranch (and possibly other config
    // variables) in the user's config files. Disable access to them to
    // make the tests hermetic.
    //
    // set_search_path is unsafe because it cannot guarantee thread safety
    // (as its documentation states). For the same reason, we wrap these
    // invocations in `call_once`.
    static CONFIGURE_GIT2: Once = Once::new();
    CONFIGURE_GIT2.call_once(|| unsafe {
        git2::opts::set_search_path(git2::ConfigLevel::System, "").unwrap();
        git2::opts::set_search_path(git2::ConfigLevel::Global, "").unwrap();
        git2::opts::set_search_path(git2::ConfigLevel::XDG, "").unwrap();
        git2::opts::set_search_path(git2::ConfigLevel::ProgramData, "").unwrap();
    });
}

pub fn new_temp_dir() -> TempDir {
    hermetic_libgit2();
    tempfile::Builder::new()
        .prefix("cpan-ingit-test-")
        .tempdir()
        .unwrap()
}

pub fn user_settings() -> UserSettings {
    UserSettings::default()
        .with_user("Test User", "test.user@example.com")
        .with_commit_delay(Duration::from_secs(10))
}

pub fn test_signature() -> CommitSignature {
    user_settings().signature()
}

/// A controllable time source. The default start is an arbitrary but
/// fixed instant so timestamps in test output are reproducible.
#[derive(Debug)]
pub struct VirtualClock {
    now: Mutex<SystemTime>,
}

impl VirtualClock {
    pub fn new(start: SystemTime) -> Self {
        VirtualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, delta: Duration) {
        *self.now.lock().unwrap() += delta;
    }

    pub fn set(&self, now: SystemTime) {
        *self.now.lock().unwrap() = now;
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        VirtualClock::new(SystemTime::from(start))
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

/// In-memory user agent: a URL table plus a log of every request made.
/// URLs without a canned response return 404, which conveniently models
/// an upstream that does not carry the file.
#[derive(Debug, Default)]
pub struct FakeUserAgent {
    responses: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    requests: Mutex<Vec<String>>,
    fail_all: Mutex<bool>,
}

impl FakeUserAgent {
    pub fn new() -> Self {
        FakeUserAgent::default()
    }

    pub fn put(&self, url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.into(), (status, body.into()));
    }

    /// Registers a 200 response whose body is the gzipped `body`, the way
    /// upstreams serve `02packages.details.txt.gz`.
    pub fn put_gzipped(&self, url: impl Into<String>, body: &[u8]) {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(body).unwrap();
        self.put(url, 200, encoder.finish().unwrap());
    }

    /// Makes every subsequent request fail at the transport level, the
    /// way a cancelled or unreachable fetch does.
    pub fn fail_all(&self, fail: bool) {
        *self.fail_all.lock().unwrap() = fail;
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl UserAgent for FakeUserAgent {
    fn get(&self, url: &str) -> Result<HttpResponse, UpstreamError> {
        self.requests.lock().unwrap().push(url.to_owned());
        if *self.fail_all.lock().unwrap() {
            return Err(UpstreamError::Request {
                url: url.to_owned(),
                source: "connection refused (test)".into(),
            });
        }
        match self.responses.lock().unwrap().get(url) {
            Some((status, body)) => Ok(HttpResponse {
                status: *status,
                body: body.clone(),
            }),
            None => Ok(HttpResponse {
                status: 404,
                body: Vec::new(),
            }),
        }
    }
}

/// A fresh bare store with injected fake user agent and virtual clock.
/// The repository is declared before the temp dir so its shutdown flush
/// still sees the store on drop.
pub struct TestRepo {
    pub repo: Repository,
    pub user_agent: Arc<FakeUserAgent>,
    pub clock: Arc<VirtualClock>,
    _temp_dir: TempDir,
}

impl TestRepo {
    pub fn init() -> Self {
        let temp_dir = new_temp_dir();
        let user_agent = Arc::new(FakeUserAgent::new());
        let clock = Arc::new(VirtualClock::default());
        let repo = Repository::open_with(
            temp_dir.path(),
            user_settings(),
            Some(user_agent.clone()),
            clock.clone(),
        )
        .unwrap();
        TestRepo {
            repo,
            user_agent,
            clock,
            _temp_dir: temp_dir,
        }
    }
}

/// Creates `branch` containing the given files in one commit.
pub fn seed_branch(repo: &Repository, branch: &str, files: &[(&str, &[u8])]) {
    let mut tree = MutableTree::empty(repo.store().clone(), test_signature());
    for (path, data) in files {
        tree.set_bytes(path, data, MODE_FILE).unwrap();
    }
    tree.commit(
        &format!("Seed {branch}"),
        &CommitOptions {
            create_branch: Some(branch.to_owned()),
            ..Default::default()
        },
    )
    .unwrap();
}

/// Builds a syntactically valid `02packages.details.txt` from
/// `(module, version, dist_path)` rows; version `"undef"` stands for a
/// dist that does not declare one.
pub fn packages_file(rows: &[(&str, &str, &str)]) -> Vec<u8> {
    let header = format!(
        "File:         02packages.details.txt\n\
         URL:          http://cpan.example/modules/02packages.details.txt\n\
         Description:  Package names found in directory $CPAN/authors/id/\n\
         Columns:      package name, version, path\n\
         Intended-For: Automated fetch routines, namespace documentation.\n\
         Written-By:   PAUSE version 1.005\n\
         Line-Count:   {}\n\
         Last-Updated: Sat, 01 Jun 2024 00:00:00 GMT\n\n",
        9 + rows.len()
    );
    let body = rows
        .iter()
        .map(|(module, version, dist_path)| format!("{module} {version}  {dist_path}\n"))
        .join("");
    let mut data = header.into_bytes();
    data.extend_from_slice(body.as_bytes());
    data
}

/// Guards against test files that exist on disk but are not wired into
/// the test runner.
pub fn assert_no_forgotten_test_files(test_dir: &Path) {
    let runner = std::fs::read_to_string(test_dir.join("runner.rs")).unwrap();
    for entry in std::fs::read_dir(test_dir).unwrap() {
        let name = entry.unwrap().file_name();
        let name = name.to_str().unwrap().to_owned();
        if let Some(stem) = name.strip_suffix(".rs") {
            if stem != "runner" {
                assert!(
                    runner.contains(&format!("mod {stem};")),
                    "test file {name} is not declared in runner.rs"
                );
            }
        }
    }
}
