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

//! Process-level settings: the identity commits are written with and the
//! tuning knobs that are not per-branch configuration.

use std::time::Duration;

use crate::object_store::CommitSignature;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSettings {
    user_name: String,
    user_email: String,
    commit_delay: Duration,
    package_cache_branch: String,
    package_details_max_age: Duration,
}

impl Default for UserSettings {
    fn default() -> Self {
        UserSettings {
            user_name: "cpan-ingit".to_owned(),
            user_email: "cpan-ingit@localhost".to_owned(),
            commit_delay: Duration::from_secs(10),
            package_cache_branch: "package-cache".to_owned(),
            package_details_max_age: Duration::from_secs(86400),
        }
    }
}

impl UserSettings {
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn user_email(&self) -> &str {
        &self.user_email
    }

    pub fn signature(&self) -> CommitSignature {
        CommitSignature::new(&self.user_name, &self.user_email)
    }

    /// Debounce window for delayed commits.
    pub fn commit_delay(&self) -> Duration {
        self.commit_delay
    }

    /// Branch holding the shared cache of downloaded distribution blobs.
    pub fn package_cache_branch(&self) -> &str {
        &self.package_cache_branch
    }

    /// Default staleness bound for a mirror's package index, used when the
    /// branch config does not set `package_details_max_age`.
    pub fn package_details_max_age(&self) -> Duration {
        self.package_details_max_age
    }

    pub fn with_user(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.user_name = name.into();
        self.user_email = email.into();
        self
    }

    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = delay;
        self
    }

    pub fn with_package_cache_branch(mut self, branch: impl Into<String>) -> Self {
        self.package_cache_branch = branch.into();
        self
    }

    pub fn with_package_details_max_age(mut self, max_age: Duration) -> Self {
        self.package_details_max_age = max_age;
        self
    }
}
