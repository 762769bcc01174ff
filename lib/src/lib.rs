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

//! Store CPAN mirrors and curated DarkPAN subsets as file trees inside
//! branches of one git object store. Mirror branches lazily fetch missing
//! files from their upstream and batch the results into debounced commits;
//! curated branches import dists from peer branches while resolving
//! version-constrained module dependencies.

#![warn(missing_docs)]
#![deny(unused_must_use)]

pub mod archive_tree;
pub mod committer;
pub mod object_store;
pub mod package_index;
pub mod repo;
pub mod resolver;
pub mod settings;
pub mod tree;
pub mod upstream;
pub mod version_req;
