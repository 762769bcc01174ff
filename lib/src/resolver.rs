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

//! Breadth-first dependency closure: starting from a set of module
//! requirements, import satisfying dists from an ordered list of source
//! branches, fold each dist's prereqs back into the requirement set, and
//! repeat until nothing is left to do. Modules already provided by the
//! configured core-perl baseline or by the target branch itself are
//! skipped. All imports stay staged; committing is the caller's business.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

use crate::archive_tree::ArchiveError;
use crate::archive_tree::ArchiveTree;
use crate::repo::Repository;
use crate::tree::TreeError;
use crate::version_req::Op;
use crate::version_req::Version;
use crate::version_req::VersionReq;
use crate::version_req::VersionReqError;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("Unknown import source {0}")]
    UnknownSource(String),
    #[error("No import source satisfies {module} {req}")]
    Unsatisfiable { module: String, req: String },
    #[error("Cannot parse corelist data")]
    CoreList(#[source] serde_json::Error),
    #[error(transparent)]
    Requirement(#[from] VersionReqError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

pub type ResolverResult<T> = Result<T, ResolverError>;

/// Modules a given perl release ships with. Registered on the
/// [`Repository`] by the host and selected per branch through the
/// `corelist_perl_version` configuration key.
#[derive(Debug, Clone, Default)]
pub struct CoreList {
    modules: BTreeMap<String, Version>,
}

impl CoreList {
    pub fn new() -> Self {
        CoreList::default()
    }

    pub fn insert(&mut self, module: impl Into<String>, version: impl Into<String>) {
        self.modules.insert(module.into(), Version::new(version));
    }

    /// Loads a flat `{ "Module::Name": "version", ... }` table.
    pub fn from_json_slice(data: &[u8]) -> ResolverResult<Self> {
        let table: BTreeMap<String, String> =
            serde_json::from_slice(data).map_err(ResolverError::CoreList)?;
        let mut corelist = CoreList::new();
        for (module, version) in table {
            corelist.insert(module, version);
        }
        Ok(corelist)
    }

    pub fn lookup(&self, module: &str) -> Option<&Version> {
        self.modules.get(module)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Overrides for one resolver run; unset fields default from the target
/// branch's configuration.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub sources: Option<Vec<String>>,
    pub corelist_perl_version: Option<String>,
}

pub struct Resolver<'a> {
    repo: &'a Repository,
    target: Arc<Mutex<ArchiveTree>>,
}

impl<'a> Resolver<'a> {
    pub fn new(repo: &'a Repository, target: Arc<Mutex<ArchiveTree>>) -> Self {
        Resolver { repo, target }
    }

    /// Imports every module in `reqs` (and, transitively, their prereqs)
    /// into the target branch. An empty `reqs` is a no-op that stages
    /// nothing.
    #[tracing::instrument(skip_all, fields(modules = reqs.len()))]
    pub fn import_modules(
        &self,
        reqs: &BTreeMap<String, String>,
        options: &ResolveOptions,
    ) -> ResolverResult<()> {
        if reqs.is_empty() {
            return Ok(());
        }

        let (source_names, corelist_version) = {
            let mut target = self.target.lock().unwrap();
            let config = target.try_config()?.cloned().unwrap_or_default();
            let sources = options
                .sources
                .clone()
                .or(config.default_import_sources)
                .unwrap_or_default();
            let corelist = options
                .corelist_perl_version
                .clone()
                .or(config.corelist_perl_version);
            (sources, corelist)
        };

        let mut sources = Vec::new();
        for name in &source_names {
            let source = match self.repo.archive_tree(name) {
                Ok(source) => source,
                Err(ArchiveError::Tree(TreeError::MissingBranch(_))) => {
                    return Err(ResolverError::UnknownSource(name.clone()));
                }
                Err(err) => return Err(err.into()),
            };
            if Arc::ptr_eq(&source, &self.target) {
                tracing::debug!(source = name, "skipping target branch as its own source");
                continue;
            }
            sources.push((name.clone(), source));
        }

        let corelist = match &corelist_version {
            Some(version) => {
                let corelist = self.repo.corelist(version);
                if corelist.is_none() {
                    tracing::warn!(
                        perl_version = version,
                        "no corelist registered for configured perl version"
                    );
                }
                corelist
            }
            None => None,
        };

        let mut reqs = reqs.clone();
        let mut queue: VecDeque<String> = reqs.keys().cloned().collect();
        while let Some(module) = queue.pop_front() {
            let spec = reqs.get(&module).cloned().unwrap_or_default();
            let req = VersionReq::parse(&spec)?;

            if let Some(corelist) = &corelist {
                if self.satisfied_by_core(corelist, &module, &req) {
                    tracing::debug!(module, "provided by core perl");
                    continue;
                }
            }

            {
                let mut target = self.target.lock().unwrap();
                if let Some(row) = target.package_details()?.module(&module) {
                    if req.satisfied_by(row.version.as_ref()) {
                        continue;
                    }
                }
            }

            let mut prereqs = None;
            for (source_name, source) in &sources {
                let row = {
                    let mut source_tree = source.lock().unwrap();
                    source_tree.package_details()?.module(&module).cloned()
                };
                let Some(row) = row else {
                    continue;
                };
                if !req.satisfied_by(row.version.as_ref()) {
                    continue;
                }
                tracing::info!(module, source = source_name, dist = row.dist_path, "importing");
                let dist_prereqs = {
                    let mut target = self.target.lock().unwrap();
                    let mut source_tree = source.lock().unwrap();
                    target.import_dist(&mut source_tree, &row.dist_path)?;
                    drop(source_tree);
                    target.get_dist_prereqs(&row.dist_path)?
                };
                prereqs = Some(dist_prereqs);
                break;
            }
            let Some(prereqs) = prereqs else {
                return Err(ResolverError::Unsatisfiable {
                    module,
                    req: spec,
                });
            };

            for (dep, dep_spec) in prereqs {
                let existing = reqs.get(&dep).cloned().unwrap_or_default();
                let combined =
                    VersionReq::combine([existing.as_str(), dep_spec.as_str()])?.to_string();
                if reqs.get(&dep) != Some(&combined) {
                    reqs.insert(dep.clone(), combined);
                    queue.push_back(dep);
                }
            }
        }
        Ok(())
    }

    /// The core-perl allowance: only a `>=` first clause (explicit or
    /// defaulted from a bare version) may be satisfied by the baseline.
    /// An unversioned request has no such bound and always imports the
    /// dist.
    fn satisfied_by_core(&self, corelist: &CoreList, module: &str, req: &VersionReq) -> bool {
        let Some((Op::Ge, bound)) = req.first() else {
            return false;
        };
        let Some(core_version) = corelist.lookup(module) else {
            return false;
        };
        core_version.cpan_cmp(bound) != std::cmp::Ordering::Less
    }
}
