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

//! The process-wide owner of one object store and the archive trees living
//! in its branches. Trees are cached by branch name behind weak handles,
//! so two lookups of the same branch observe the same staged changes while
//! unused instances can be dropped; pending delayed commits outlive the
//! instances in the shared committer and are flushed from here.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use itertools::Itertools;

use crate::archive_tree::ArchiveConfig;
use crate::archive_tree::ArchiveError;
use crate::archive_tree::ArchiveResult;
use crate::archive_tree::ArchiveTree;
use crate::archive_tree::TreeContext;
use crate::archive_tree::CONFIG_PATH;
use crate::committer::Clock;
use crate::committer::DelayedCommitter;
use crate::committer::PendingCommit;
use crate::committer::SystemClock;
use crate::object_store::CommitId;
use crate::object_store::ObjectStore;
use crate::object_store::TreeId;
use crate::object_store::MODE_FILE;
use crate::resolver::CoreList;
use crate::resolver::ResolveOptions;
use crate::resolver::Resolver;
use crate::resolver::ResolverResult;
use crate::settings::UserSettings;
use crate::tree::write_onto;
use crate::tree::CommitOptions;
use crate::tree::MutableTree;
use crate::tree::TreeError;
use crate::upstream::ReqwestUserAgent;
use crate::upstream::UserAgent;

pub struct Repository {
    store: Arc<ObjectStore>,
    settings: UserSettings,
    user_agent: Option<Arc<dyn UserAgent>>,
    clock: Arc<dyn Clock>,
    committer: Arc<DelayedCommitter>,
    trees: Mutex<HashMap<String, Weak<Mutex<ArchiveTree>>>>,
    package_cache: Mutex<Option<Arc<Mutex<ArchiveTree>>>>,
    corelists: Mutex<HashMap<String, Arc<CoreList>>>,
}

impl Repository {
    /// Opens the object store at `path`, initializing a bare one when
    /// nothing exists there, with default settings and a real user agent
    /// and clock.
    pub fn open(path: &Path) -> ArchiveResult<Self> {
        let user_agent: Arc<dyn UserAgent> = Arc::new(ReqwestUserAgent::new()?);
        Self::open_with(
            path,
            UserSettings::default(),
            Some(user_agent),
            Arc::new(SystemClock),
        )
    }

    /// Opens with explicit collaborators; tests inject a fake user agent
    /// and a virtual clock here.
    pub fn open_with(
        path: &Path,
        settings: UserSettings,
        user_agent: Option<Arc<dyn UserAgent>>,
        clock: Arc<dyn Clock>,
    ) -> ArchiveResult<Self> {
        let store = ObjectStore::open_or_init(path)?;
        Ok(Self::with_store(store, settings, user_agent, clock))
    }

    pub fn with_store(
        store: ObjectStore,
        settings: UserSettings,
        user_agent: Option<Arc<dyn UserAgent>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let committer = Arc::new(DelayedCommitter::new(settings.commit_delay()));
        Repository {
            store: Arc::new(store),
            settings,
            user_agent,
            clock,
            committer,
            trees: Mutex::new(HashMap::new()),
            package_cache: Mutex::new(None),
            corelists: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn settings(&self) -> &UserSettings {
        &self.settings
    }

    pub fn committer(&self) -> &Arc<DelayedCommitter> {
        &self.committer
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn context(&self, dist_cache: Option<Weak<Mutex<ArchiveTree>>>) -> TreeContext {
        TreeContext {
            clock: self.clock.clone(),
            user_agent: self.user_agent.clone(),
            committer: Some(self.committer.clone()),
            dist_cache,
            package_details_max_age: self.settings.package_details_max_age(),
        }
    }

    /// The archive tree of `name`, shared with every other caller that
    /// asks for the same branch while the instance is alive.
    pub fn archive_tree(&self, name: &str) -> ArchiveResult<Arc<Mutex<ArchiveTree>>> {
        if name == self.settings.package_cache_branch() {
            return self.package_cache();
        }
        {
            let trees = self.trees.lock().unwrap();
            if let Some(tree) = trees.get(name).and_then(Weak::upgrade) {
                return Ok(tree);
            }
        }
        let tree = MutableTree::from_branch(self.store.clone(), self.settings.signature(), name)?;
        let mut archive = ArchiveTree::new(tree, self.context(None));
        // Only fetching branches need the package-cache handle; wiring it
        // lazily avoids creating the cache branch for read-only use.
        let is_mirror = archive
            .try_config()?
            .is_some_and(|config| config.upstream_url.is_some());
        if is_mirror {
            archive.set_dist_cache(Arc::downgrade(&self.package_cache()?));
        }
        let tree = Arc::new(Mutex::new(archive));
        self.trees
            .lock()
            .unwrap()
            .insert(name.to_owned(), Arc::downgrade(&tree));
        Ok(tree)
    }

    /// Like [`Repository::archive_tree`], but requires the branch to be
    /// configured as an upstream mirror.
    pub fn mirror(&self, name: &str) -> ArchiveResult<Arc<Mutex<ArchiveTree>>> {
        let tree = self.archive_tree(name)?;
        {
            let mut guard = tree.lock().unwrap();
            if guard.config()?.upstream_url.is_none() {
                return Err(ArchiveError::NotAMirror(name.to_owned()));
            }
        }
        Ok(tree)
    }

    /// Creates a branch holding only the given config and returns its
    /// tree. This is how curated DarkPAN branches are minted.
    pub fn create_archive_tree(
        &self,
        name: &str,
        config: &ArchiveConfig,
    ) -> ArchiveResult<Arc<Mutex<ArchiveTree>>> {
        if self.store.lookup_branch(name)?.is_some() {
            return Err(ArchiveError::BranchExists(name.to_owned()));
        }
        let mut tree = MutableTree::empty(self.store.clone(), self.settings.signature());
        tree.set_bytes(CONFIG_PATH, &config.to_bytes(), MODE_FILE)?;
        tree.commit(
            &format!("Initialize {name}"),
            &CommitOptions {
                create_branch: Some(name.to_owned()),
                ..Default::default()
            },
        )?;
        self.archive_tree(name)
    }

    /// Creates a lazily fetching mirror of the given upstream.
    pub fn create_mirror(
        &self,
        name: &str,
        upstream_url: &str,
    ) -> ArchiveResult<Arc<Mutex<ArchiveTree>>> {
        let config = ArchiveConfig {
            autofetch: Some(true),
            upstream_url: Some(upstream_url.to_owned()),
            ..Default::default()
        };
        self.create_archive_tree(name, &config)
    }

    /// The distinguished branch holding one copy of every downloaded dist
    /// blob, created with an initial empty commit on first use. Held
    /// strongly here: mirrors keep only weak handles to it.
    pub fn package_cache(&self) -> ArchiveResult<Arc<Mutex<ArchiveTree>>> {
        let mut cached = self.package_cache.lock().unwrap();
        if let Some(tree) = &*cached {
            return Ok(Arc::clone(tree));
        }
        let name = self.settings.package_cache_branch().to_owned();
        if self.store.lookup_branch(&name)?.is_none() {
            let mut tree = MutableTree::empty(self.store.clone(), self.settings.signature());
            tree.set_bytes(CONFIG_PATH, &ArchiveConfig::default().to_bytes(), MODE_FILE)?;
            tree.commit(
                "Initialize package cache",
                &CommitOptions {
                    create_branch: Some(name.clone()),
                    ..Default::default()
                },
            )?;
            tracing::info!(branch = name, "created package cache branch");
        }
        let tree = MutableTree::from_branch(self.store.clone(), self.settings.signature(), &name)?;
        let tree = Arc::new(Mutex::new(ArchiveTree::new(tree, self.context(None))));
        *cached = Some(Arc::clone(&tree));
        Ok(tree)
    }

    /// Read-only view of any branch, tag, or 40-hex commit/tree hash.
    /// This is the surface an HTTP front-end serves branch files from.
    pub fn snapshot(&self, refstr: &str) -> ArchiveResult<MutableTree> {
        Ok(MutableTree::from_ref(
            self.store.clone(),
            self.settings.signature(),
            refstr,
        )?)
    }

    /// A tree over the working copy of a non-bare store.
    pub fn workdir_tree(&self) -> ArchiveResult<MutableTree> {
        Ok(MutableTree::from_workdir(
            self.store.clone(),
            self.settings.signature(),
        )?)
    }

    pub fn register_corelist(&self, perl_version: impl Into<String>, corelist: CoreList) {
        self.corelists
            .lock()
            .unwrap()
            .insert(perl_version.into(), Arc::new(corelist));
    }

    pub(crate) fn corelist(&self, perl_version: &str) -> Option<Arc<CoreList>> {
        self.corelists.lock().unwrap().get(perl_version).cloned()
    }

    /// Resolves and imports `reqs` (plus transitive prereqs) into
    /// `branch`. Everything stays staged on the returned tree; the caller
    /// commits. Dropping the handle without committing discards the
    /// staged imports.
    pub fn import_modules(
        &self,
        branch: &str,
        reqs: &std::collections::BTreeMap<String, String>,
        options: &ResolveOptions,
    ) -> ResolverResult<Arc<Mutex<ArchiveTree>>> {
        let target = self.archive_tree(branch)?;
        Resolver::new(self, target.clone()).import_modules(reqs, options)?;
        Ok(target)
    }

    /// Flushes every pending delayed commit whose debounce deadline has
    /// passed. Hosts pump this from their event loop; a pending set whose
    /// token went stale in the meantime is skipped and will be picked up
    /// by its newer deadline.
    pub fn flush_delayed(&self) -> ArchiveResult<Vec<CommitId>> {
        let now = self.clock.now();
        let mut commits = Vec::new();
        let due = self
            .committer
            .due(now)
            .into_iter()
            .sorted_by(|(a, _), (b, _)| a.cmp(b));
        for (branch, token) in due {
            let Some(pending) = self.committer.take(&branch, token) else {
                continue;
            };
            if let Some(commit) = self.apply_pending(&branch, &pending)? {
                commits.push(commit);
            }
        }
        Ok(commits)
    }

    /// Drains every pending commit regardless of deadline. Failures are
    /// logged, not retried; this is the shutdown path.
    pub fn flush_all_delayed(&self) -> Vec<CommitId> {
        let mut commits = Vec::new();
        let drained = self
            .committer
            .take_all()
            .into_iter()
            .sorted_by(|(a, _), (b, _)| a.cmp(b));
        for (branch, pending) in drained {
            match self.apply_pending(&branch, &pending) {
                Ok(Some(commit)) => commits.push(commit),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(branch, ?err, "failed to flush pending commit");
                }
            }
        }
        commits
    }

    /// Applies one pending set onto its branch tip. A batch that changes
    /// nothing (every blob already landed identically) produces no commit.
    fn apply_pending(
        &self,
        branch: &str,
        pending: &PendingCommit,
    ) -> ArchiveResult<Option<CommitId>> {
        let tip = self
            .store
            .lookup_branch(branch)?
            .ok_or_else(|| TreeError::MissingBranch(branch.to_owned()))?;
        let base_tree = self.store.commit_tree(&tip)?;
        let (new_tree, _) = write_onto(&self.store, Some(&base_tree), &pending.changes)?;
        if new_tree == base_tree {
            tracing::debug!(branch, "pending commit contains no effective changes");
            self.resync_instance(branch, new_tree, pending);
            return Ok(None);
        }
        let signature = self.settings.signature();
        let commit =
            self.store
                .create_commit(&pending.message(), &signature, &signature, &[tip], &new_tree)?;
        self.store.set_branch_target(branch, &commit)?;
        tracing::info!(
            branch,
            dists = pending.dists_added,
            commit = commit.hex(),
            "flushed delayed commit"
        );
        self.resync_instance(branch, new_tree, pending);
        Ok(Some(commit))
    }

    /// Advances a live tree instance past a delayed commit, if one is
    /// still cached.
    fn resync_instance(&self, branch: &str, new_tree: TreeId, pending: &PendingCommit) {
        let instance = if branch == self.settings.package_cache_branch() {
            self.package_cache.lock().unwrap().clone()
        } else {
            self.trees
                .lock()
                .unwrap()
                .get(branch)
                .and_then(Weak::upgrade)
        };
        if let Some(instance) = instance {
            instance
                .lock()
                .unwrap()
                .absorb_committed(new_tree, &pending.changes);
        }
    }
}

impl Drop for Repository {
    /// Staged fetches must not be lost just because the process exits
    /// before the debounce window elapses.
    fn drop(&mut self) {
        if !self.committer.is_idle() {
            tracing::debug!("flushing pending delayed commits at shutdown");
            self.flush_all_delayed();
        }
    }
}
