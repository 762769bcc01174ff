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

//! A [`MutableTree`] that knows the CPAN directory layout: the per-branch
//! configuration blob, the package index under `modules/`, distribution
//! archives and their metadata under `authors/id/`, and the operations
//! that move dists between branches.
//!
//! One type covers both curated archives and upstream mirrors. A branch
//! whose configuration carries an `upstream_url` gains autofetch behavior
//! in `get_path`: a missing `authors/id/` file is downloaded on demand and
//! a stale package index is refreshed, with every fetched blob scheduled
//! for a batched delayed commit and mirrored into the shared package
//! cache.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;
use std::time::SystemTime;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::committer::Clock;
use crate::committer::DelayedCommitter;
use crate::object_store::BlobId;
use crate::object_store::CommitId;
use crate::object_store::ObjectStore;
use crate::object_store::ObjectStoreError;
use crate::object_store::TreeId;
use crate::object_store::TreeValue;
use crate::object_store::MODE_FILE;
use crate::package_index::PackageIndex;
use crate::package_index::PackageIndexError;
use crate::tree::CommitOptions;
use crate::tree::MutableTree;
use crate::tree::Overlay;
use crate::tree::TreeError;
use crate::upstream::gunzip;
use crate::upstream::join_url;
use crate::upstream::UpstreamError;
use crate::upstream::UserAgent;
use crate::version_req::VersionReq;
use crate::version_req::VersionReqError;

/// Per-branch configuration blob.
pub const CONFIG_PATH: &str = "cpan_ingit.json";
/// The package index, stored uncompressed for diffability.
pub const PACKAGE_DETAILS_PATH: &str = "modules/02packages.details.txt";
/// Prefix of all distribution archives and their metadata.
pub const AUTHORS_PREFIX: &str = "authors/id/";

/// Upstream path of the compressed package index.
const PACKAGE_DETAILS_GZ: &str = "modules/02packages.details.txt.gz";

const DIST_EXTENSIONS: &[&str] = &[".tar.gz", ".tgz", ".zip", ".tar.bz2", ".tbz2"];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Branch {0} has no cpan_ingit.json")]
    MissingConfig(String),
    #[error("Branch {0} already exists")]
    BranchExists(String),
    #[error("Branch {0} is not a mirror: no upstream_url configured")]
    NotAMirror(String),
    #[error("Cannot parse JSON blob {path}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Dist {0} is not present in the peer branch")]
    NotInPeer(String),
    #[error("Dist {path} already present with different content: have {have}, want {want}")]
    DistCollision {
        path: String,
        have: String,
        want: String,
    },
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Index(#[from] PackageIndexError),
    #[error(transparent)]
    Requirement(#[from] VersionReqError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Contents of `cpan_ingit.json`. Fields are declared alphabetically so
/// the pretty serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autofetch: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corelist_perl_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_import_sources: Option<Vec<String>>,
    /// Seconds before a mirror's package index counts as stale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_details_max_age: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_url: Option<String>,
}

impl ArchiveConfig {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serialization of this plain struct cannot fail.
        let mut data = serde_json::to_vec_pretty(self).unwrap_or_default();
        data.push(b'\n');
        data
    }
}

/// Optional per-dist metadata stored next to the archive as `<dist>.meta`,
/// carrying the prereqs extracted from the dist's META.json.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistMeta {
    #[serde(default)]
    pub prereqs: DistPrereqs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistPrereqs {
    #[serde(default)]
    pub configure: PrereqPhase,
    #[serde(default)]
    pub runtime: PrereqPhase,
    #[serde(default)]
    pub test: PrereqPhase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrereqPhase {
    #[serde(default)]
    pub requires: BTreeMap<String, String>,
}

/// Maps a dist path (relative to `authors/id/`) to its metadata path by
/// swapping the archive extension for `.meta`.
pub fn meta_path_for_dist(author_path: &str) -> String {
    for extension in DIST_EXTENSIONS {
        if let Some(stem) = author_path.strip_suffix(extension) {
            return format!("{stem}.meta");
        }
    }
    format!("{author_path}.meta")
}

/// Collaborators a tree needs beyond its own branch: the clock, the
/// upstream user agent, the shared delayed committer, and a non-owning
/// handle on the package-cache tree. The repository wires these in; none
/// of them owns the repository back.
#[derive(Clone, Debug)]
pub struct TreeContext {
    pub clock: Arc<dyn Clock>,
    pub user_agent: Option<Arc<dyn UserAgent>>,
    pub committer: Option<Arc<DelayedCommitter>>,
    pub dist_cache: Option<Weak<Mutex<ArchiveTree>>>,
    pub package_details_max_age: Duration,
}

#[derive(Debug)]
pub struct ArchiveTree {
    tree: MutableTree,
    context: TreeContext,
    config: Option<ArchiveConfig>,
    package_details: Option<PackageIndex>,
    /// When each staged package-details blob was fetched, so a blob staged
    /// moments ago is not re-aged by its own `Last-Updated` header.
    fetched_at: HashMap<BlobId, SystemTime>,
}

impl ArchiveTree {
    pub fn new(tree: MutableTree, context: TreeContext) -> Self {
        ArchiveTree {
            tree,
            context,
            config: None,
            package_details: None,
            fetched_at: HashMap::new(),
        }
    }

    pub fn tree(&self) -> &MutableTree {
        &self.tree
    }

    /// Wires the non-owning handle on the shared package cache. Set by the
    /// repository once it knows this branch fetches from an upstream.
    pub(crate) fn set_dist_cache(&mut self, dist_cache: Weak<Mutex<ArchiveTree>>) {
        self.context.dist_cache = Some(dist_cache);
    }

    pub fn tree_mut(&mut self) -> &mut MutableTree {
        &mut self.tree
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        self.tree.store()
    }

    pub fn branch(&self) -> Option<&str> {
        self.tree.branch()
    }

    pub fn has_changes(&self) -> bool {
        self.tree.has_changes()
    }

    pub fn update_tree(&mut self) -> ArchiveResult<TreeId> {
        Ok(self.tree.update_tree()?)
    }

    pub fn commit(&mut self, message: &str, options: &CommitOptions) -> ArchiveResult<CommitId> {
        Ok(self.tree.commit(message, options)?)
    }

    fn label(&self) -> String {
        self.tree.branch().unwrap_or("<detached>").to_owned()
    }

    // ---- configuration ----------------------------------------------------

    /// The parsed config, or `None` when the branch has no config blob.
    pub fn try_config(&mut self) -> ArchiveResult<Option<&ArchiveConfig>> {
        if self.config.is_none() {
            let Some(bytes) = self.tree.get_blob(CONFIG_PATH)? else {
                return Ok(None);
            };
            let config = serde_json::from_slice(&bytes).map_err(|source| ArchiveError::Json {
                path: CONFIG_PATH.to_owned(),
                source,
            })?;
            self.config = Some(config);
        }
        Ok(self.config.as_ref())
    }

    pub fn config(&mut self) -> ArchiveResult<&ArchiveConfig> {
        let label = self.label();
        self.try_config()?
            .ok_or(ArchiveError::MissingConfig(label))
    }

    /// Stages a new config blob, unless it is byte-identical to the
    /// current one.
    pub fn write_config(&mut self, config: &ArchiveConfig) -> ArchiveResult<()> {
        let data = config.to_bytes();
        if let Some(existing) = self.tree.get_blob(CONFIG_PATH)? {
            if existing == data {
                self.config = Some(config.clone());
                return Ok(());
            }
        }
        self.set_bytes(CONFIG_PATH, &data, MODE_FILE)?;
        self.config = Some(config.clone());
        Ok(())
    }

    pub fn config_blob(&self) -> ArchiveResult<Option<BlobId>> {
        match self.tree.get_path(CONFIG_PATH)? {
            Some(TreeValue::Blob { id, .. }) => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    pub fn package_details_blob(&self) -> ArchiveResult<Option<BlobId>> {
        match self.tree.get_path(PACKAGE_DETAILS_PATH)? {
            Some(TreeValue::Blob { id, .. }) => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    // ---- staging wrappers --------------------------------------------------

    /// Stages bytes at `path`, invalidating the config or package-index
    /// cache when their backing blob is rewritten.
    pub fn set_bytes(&mut self, path: &str, data: &[u8], mode: i32) -> ArchiveResult<BlobId> {
        let id = self.tree.set_bytes(path, data, mode)?;
        self.invalidate(path);
        Ok(id)
    }

    pub fn set_id(&mut self, path: &str, id: BlobId, mode: i32) -> ArchiveResult<()> {
        self.tree.set_id(path, id, mode)?;
        self.invalidate(path);
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> ArchiveResult<()> {
        self.tree.remove(path)?;
        self.invalidate(path);
        Ok(())
    }

    fn invalidate(&mut self, path: &str) {
        match path {
            CONFIG_PATH => self.config = None,
            PACKAGE_DETAILS_PATH => self.package_details = None,
            _ => {}
        }
    }

    // ---- lookup with autofetch --------------------------------------------

    /// Whether this tree lazily fetches from an upstream. Requires an
    /// `upstream_url`, `autofetch` not disabled, and a wired user agent.
    fn autofetch_enabled(&mut self) -> ArchiveResult<bool> {
        if self.context.user_agent.is_none() {
            return Ok(false);
        }
        match self.try_config()? {
            Some(config) => {
                Ok(config.upstream_url.is_some() && config.autofetch.unwrap_or(true))
            }
            None => Ok(false),
        }
    }

    /// Path lookup in CPAN terms. On a mirror this may suspend on an
    /// upstream fetch: a missing `authors/id/` file is downloaded (404
    /// resolves to `None`), and the package index is refreshed when
    /// missing or stale.
    pub fn get_path(&mut self, path: &str) -> ArchiveResult<Option<TreeValue>> {
        if self.autofetch_enabled()? {
            if path == PACKAGE_DETAILS_PATH {
                return self.fresh_package_details_blob().map(Some);
            }
            if let Some(author_path) = path.strip_prefix(AUTHORS_PREFIX) {
                if let Some(value) = self.tree.get_path(path)? {
                    return Ok(Some(value));
                }
                return self.fetch_upstream_dist(author_path);
            }
        }
        Ok(self.tree.get_path(path)?)
    }

    /// Reads the blob at `path`, fetching it on a mirror if needed.
    pub fn get_blob(&mut self, path: &str) -> ArchiveResult<Option<Vec<u8>>> {
        match self.get_path(path)? {
            Some(TreeValue::Blob { id, .. }) => Ok(Some(self.store().read_blob(&id)?)),
            _ => Ok(None),
        }
    }

    // ---- package index -----------------------------------------------------

    /// The parsed package index, refreshed first on a mirror. A branch
    /// without one yields an empty index.
    pub fn package_details(&mut self) -> ArchiveResult<&PackageIndex> {
        if self.autofetch_enabled()? {
            // Triggers a refresh (and cache invalidation) when stale.
            self.get_path(PACKAGE_DETAILS_PATH)?;
        }
        if self.package_details.is_none() {
            self.package_details = Some(self.load_package_details()?);
        }
        Ok(self.package_details.as_ref().unwrap())
    }

    fn load_package_details(&mut self) -> ArchiveResult<PackageIndex> {
        if let Some(index) = self.package_details.take() {
            return Ok(index);
        }
        match self.tree.get_blob(PACKAGE_DETAILS_PATH)? {
            Some(bytes) => Ok(PackageIndex::parse(&bytes)?),
            None => Ok(PackageIndex::default()),
        }
    }

    /// Serializes the in-memory package index and stages it. The `URL`
    /// header follows the branch's `canonical_url` when configured.
    pub fn write_package_details(&mut self) -> ArchiveResult<()> {
        let mut index = self.load_package_details()?;
        if let Some(config) = self.try_config()? {
            if let Some(url) = config.canonical_url.clone() {
                index.set_header("URL", url);
            }
        }
        let now: DateTime<Utc> = self.context.clock.now().into();
        let data = index.serialize(now);
        self.set_bytes(PACKAGE_DETAILS_PATH, &data, MODE_FILE)?;
        // Reparse so cached headers (Line-Count, Last-Updated) match the
        // staged blob exactly.
        self.package_details = Some(PackageIndex::parse(&data)?);
        Ok(())
    }

    /// Dist paths this branch's package index refers to.
    pub fn dist_paths(&mut self) -> ArchiveResult<Vec<String>> {
        Ok(self
            .package_details()?
            .dist_paths()
            .map(str::to_owned)
            .collect())
    }

    // ---- import ------------------------------------------------------------

    /// Copies the dist at `authors/id/<author_path>` from `peer` into this
    /// tree and takes over ownership of every module the peer's package
    /// index assigns to that dist. The peer may itself be a mirror, in
    /// which case the dist is lazily fetched from its upstream first.
    ///
    /// Re-importing an identical dist is a no-op; a path that is already
    /// present with different content is refused.
    pub fn import_dist(&mut self, peer: &mut ArchiveTree, author_path: &str) -> ArchiveResult<()> {
        let dist_path = format!("{AUTHORS_PREFIX}{author_path}");
        let Some(TreeValue::Blob { id: peer_blob, mode }) = peer.get_path(&dist_path)? else {
            return Err(ArchiveError::NotInPeer(author_path.to_owned()));
        };

        // The self-check deliberately bypasses autofetch: a mirror must
        // not download from upstream just to learn it has nothing yet.
        let mut changed = false;
        match self.tree.get_path(&dist_path)? {
            Some(TreeValue::Blob { id: existing, .. }) => {
                if existing != peer_blob {
                    return Err(ArchiveError::DistCollision {
                        path: author_path.to_owned(),
                        have: existing.hex(),
                        want: peer_blob.hex(),
                    });
                }
            }
            _ => {
                self.set_id(&dist_path, peer_blob, mode)?;
                changed = true;
            }
        }

        let rows: Vec<_> = peer
            .package_details()?
            .dist_rows(author_path)
            .map(<[_]>::to_vec)
            .unwrap_or_default();
        if !rows.is_empty() {
            self.package_details()?;
            let mut index = self.load_package_details()?;
            for row in rows {
                changed |= index.assign_module(row);
            }
            self.package_details = Some(index);
        }
        if changed {
            self.write_package_details()?;
        }

        let meta_path = format!("{AUTHORS_PREFIX}{}", meta_path_for_dist(author_path));
        match peer.get_path(&meta_path)? {
            Some(TreeValue::Blob { id, mode }) => {
                if self.tree.get_path(&meta_path)?.is_none() {
                    self.set_id(&meta_path, id, mode)?;
                }
            }
            _ => {
                // Importing without metadata is allowed; the resolver will
                // warn if it needs the prereqs later.
                tracing::debug!(dist = author_path, "peer has no dist metadata");
            }
        }
        tracing::info!(
            dist = author_path,
            from = peer.label(),
            into = self.label(),
            "imported dist"
        );
        Ok(())
    }

    /// Union of the `requires` maps of the configure, runtime, and test
    /// phases from the dist's `.meta` blob. Missing metadata yields an
    /// empty map and a warning.
    pub fn get_dist_prereqs(&mut self, author_path: &str) -> ArchiveResult<BTreeMap<String, String>> {
        let meta_path = format!("{AUTHORS_PREFIX}{}", meta_path_for_dist(author_path));
        let Some(bytes) = self.tree.get_blob(&meta_path)? else {
            tracing::warn!(dist = author_path, "no prerequisite metadata for dist");
            return Ok(BTreeMap::new());
        };
        let meta: DistMeta = serde_json::from_slice(&bytes).map_err(|source| ArchiveError::Json {
            path: meta_path,
            source,
        })?;
        let mut required: BTreeMap<String, String> = BTreeMap::new();
        for phase in [
            &meta.prereqs.configure,
            &meta.prereqs.runtime,
            &meta.prereqs.test,
        ] {
            for (module, spec) in &phase.requires {
                match required.get(module) {
                    Some(existing) => {
                        let combined =
                            VersionReq::combine([existing.as_str(), spec.as_str()])?.to_string();
                        required.insert(module.clone(), combined);
                    }
                    None => {
                        required.insert(module.clone(), spec.clone());
                    }
                }
            }
        }
        Ok(required)
    }

    // ---- upstream fetching -------------------------------------------------

    fn upstream(&mut self) -> ArchiveResult<(Arc<dyn UserAgent>, String)> {
        let label = self.label();
        let user_agent = self
            .context
            .user_agent
            .clone()
            .ok_or_else(|| ArchiveError::NotAMirror(label.clone()))?;
        let url = self
            .config()?
            .upstream_url
            .clone()
            .ok_or(ArchiveError::NotAMirror(label))?;
        Ok((user_agent, url))
    }

    fn max_age(&mut self) -> ArchiveResult<Duration> {
        let default = self.context.package_details_max_age;
        Ok(self
            .try_config()?
            .and_then(|config| config.package_details_max_age)
            .map_or(default, Duration::from_secs))
    }

    /// The package-details blob, fetched from upstream when missing or
    /// older than the configured maximum age.
    fn fresh_package_details_blob(&mut self) -> ArchiveResult<TreeValue> {
        let max_age = self.max_age()?;
        let now = self.context.clock.now();
        if let Some(value) = self.tree.get_path(PACKAGE_DETAILS_PATH)? {
            let fetched_at = match &value {
                TreeValue::Blob { id, .. } => {
                    let staged_at = self.fetched_at.get(id).copied();
                    match staged_at {
                        Some(time) => Some(time),
                        None => self.stored_last_updated()?.map(SystemTime::from),
                    }
                }
                TreeValue::Tree(_) => None,
            };
            if let Some(fetched_at) = fetched_at {
                if now < fetched_at + max_age {
                    return Ok(value);
                }
            }
        }
        self.fetch_upstream_package_details()
    }

    /// `Last-Updated` of the stored index, parsed through the cached view.
    fn stored_last_updated(&mut self) -> ArchiveResult<Option<DateTime<Utc>>> {
        if self.package_details.is_none() {
            self.package_details = Some(self.load_package_details()?);
        }
        Ok(self.package_details.as_ref().unwrap().last_updated())
    }

    /// Downloads and gunzips the upstream package index, staging it
    /// uncompressed.
    #[tracing::instrument(skip(self), fields(branch = %self.label()))]
    pub fn fetch_upstream_package_details(&mut self) -> ArchiveResult<TreeValue> {
        let (user_agent, upstream_url) = self.upstream()?;
        let url = join_url(&upstream_url, PACKAGE_DETAILS_GZ);
        tracing::info!(url, "fetching upstream package details");
        let response = user_agent.get(&url)?;
        if !response.is_success() {
            return Err(UpstreamError::Status {
                status: response.status,
                url,
            }
            .into());
        }
        let body = gunzip(&url, &response.body)?;
        let id = self.set_bytes(PACKAGE_DETAILS_PATH, &body, MODE_FILE)?;
        self.fetched_at.insert(id.clone(), self.context.clock.now());
        self.schedule_delayed(PACKAGE_DETAILS_PATH, &id);
        Ok(TreeValue::Blob {
            id,
            mode: MODE_FILE,
        })
    }

    /// Downloads `authors/id/<author_path>` from upstream. A 404 resolves
    /// to `None`; any other failure is an error. The fetched blob is
    /// staged here, scheduled for a delayed commit, and mirrored into the
    /// shared package cache.
    #[tracing::instrument(skip(self), fields(branch = %self.label()))]
    pub fn fetch_upstream_dist(&mut self, author_path: &str) -> ArchiveResult<Option<TreeValue>> {
        let (user_agent, upstream_url) = self.upstream()?;
        let path = format!("{AUTHORS_PREFIX}{author_path}");
        let url = join_url(&upstream_url, &path);
        tracing::info!(url, "fetching upstream dist");
        let response = user_agent.get(&url)?;
        if response.status == 404 {
            tracing::debug!(url, "upstream has no such file");
            return Ok(None);
        }
        if !response.is_success() {
            return Err(UpstreamError::Status {
                status: response.status,
                url,
            }
            .into());
        }
        let id = self.set_bytes(&path, &response.body, MODE_FILE)?;
        self.schedule_delayed(&path, &id);
        self.stage_into_dist_cache(&path, &id);
        Ok(Some(TreeValue::Blob {
            id,
            mode: MODE_FILE,
        }))
    }

    /// Enqueues a batched commit for a freshly staged fetch. Detached
    /// trees stage only; committing is the caller's business.
    fn schedule_delayed(&self, path: &str, id: &BlobId) {
        let (Some(committer), Some(branch)) = (&self.context.committer, self.tree.branch()) else {
            return;
        };
        let now = self.context.clock.now();
        if let Err(err) = committer.schedule(branch, now, path, id.clone(), MODE_FILE) {
            tracing::warn!(branch, path, ?err, "failed to schedule delayed commit");
        }
    }

    /// Stages the same blob id into the shared package cache so the
    /// download outlives this branch.
    fn stage_into_dist_cache(&self, path: &str, id: &BlobId) {
        let Some(weak) = &self.context.dist_cache else {
            return;
        };
        let Some(cache) = weak.upgrade() else {
            tracing::warn!(path, "package cache instance is gone; not caching blob");
            return;
        };
        let mut cache = cache.lock().unwrap();
        match cache.set_id(path, id.clone(), MODE_FILE) {
            Ok(()) => cache.schedule_delayed(path, id),
            Err(err) => tracing::warn!(path, ?err, "failed to stage blob into package cache"),
        }
    }

    pub(crate) fn absorb_committed(&mut self, new_snapshot: TreeId, committed: &Overlay) {
        self.tree.absorb_committed(new_snapshot, committed);
    }
}
