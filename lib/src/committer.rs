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

//! Debounced, coalescing commits. Lazily fetched files are staged one at a
//! time but committed in batches: every staged fetch resets a per-branch
//! deadline, and when the deadline passes without further activity the
//! accumulated changes land as one commit. A token per scheduling round
//! makes superseded deadlines detectable, so only the most recent timer
//! may flush.

use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Write as _;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;

use crate::archive_tree::AUTHORS_PREFIX;
use crate::object_store::BlobId;
use crate::tree::overlay_set;
use crate::tree::ChangeNode;
use crate::tree::Overlay;
use crate::tree::TreeResult;

/// Time source for deadlines and index staleness. Injectable so tests can
/// run against a virtual clock.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Identifies one scheduling round of one pending commit. A flush carrying
/// a stale token (a newer `schedule` has happened since) is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(u64);

#[derive(Debug)]
pub struct PendingCommit {
    pub changes: Overlay,
    pub dists_added: u64,
    pub distfile_paths: Vec<String>,
    pub deadline: SystemTime,
    pub token: TimerToken,
}

impl PendingCommit {
    fn new(deadline: SystemTime, token: TimerToken) -> Self {
        PendingCommit {
            changes: Overlay::new(),
            dists_added: 0,
            distfile_paths: Vec::new(),
            deadline,
            token,
        }
    }

    /// Commit message listing what the batch added.
    pub fn message(&self) -> String {
        let mut message = format!("Added {} dists\n", self.dists_added);
        if !self.distfile_paths.is_empty() {
            message.push('\n');
            for path in &self.distfile_paths {
                let _ = writeln!(message, "  * {path}");
            }
        }
        message
    }
}

/// Per-branch pending-commit table. Owned by the Repository and shared by
/// every tree it hands out; pending changes survive a tree instance being
/// dropped from the weak cache.
#[derive(Debug)]
pub struct DelayedCommitter {
    delay: Duration,
    next_token: AtomicU64,
    pending: Mutex<HashMap<String, PendingCommit>>,
}

impl DelayedCommitter {
    pub fn new(delay: Duration) -> Self {
        DelayedCommitter {
            delay,
            next_token: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Merges one staged blob into the branch's pending commit and resets
    /// its deadline to `now + delay`, superseding any earlier timer.
    pub fn schedule(
        &self,
        branch: &str,
        now: SystemTime,
        path: &str,
        id: BlobId,
        mode: i32,
    ) -> TreeResult<TimerToken> {
        let token = TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let deadline = now + self.delay;
        let mut pending = self.pending.lock().unwrap();
        let entry = pending
            .entry(branch.to_owned())
            .or_insert_with(|| PendingCommit::new(deadline, token));
        overlay_set(&mut entry.changes, path, ChangeNode::Blob { id, mode })?;
        entry.dists_added += 1;
        if let Some(distfile) = path.strip_prefix(AUTHORS_PREFIX) {
            entry.distfile_paths.push(distfile.to_owned());
        }
        entry.deadline = deadline;
        entry.token = token;
        tracing::debug!(
            branch,
            path,
            dists = entry.dists_added,
            "scheduled delayed commit"
        );
        Ok(token)
    }

    /// Branches whose deadline has passed, with the token each flush must
    /// present.
    pub fn due(&self, now: SystemTime) -> Vec<(String, TimerToken)> {
        let pending = self.pending.lock().unwrap();
        pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(branch, entry)| (branch.clone(), entry.token))
            .collect()
    }

    /// Removes and returns the branch's pending commit, unless `token` is
    /// stale (a newer `schedule` superseded this flush).
    pub fn take(&self, branch: &str, token: TimerToken) -> Option<PendingCommit> {
        let mut pending = self.pending.lock().unwrap();
        match pending.get(branch) {
            Some(entry) if entry.token == token => pending.remove(branch),
            _ => None,
        }
    }

    /// Drains every pending commit regardless of deadline; the shutdown
    /// path.
    pub fn take_all(&self) -> Vec<(String, PendingCommit)> {
        let mut pending = self.pending.lock().unwrap();
        pending.drain().collect()
    }

    /// Discards the branch's pending commit. The changes stay staged in
    /// the tree's overlay, they just will not be committed by a timer.
    pub fn cancel(&self, branch: &str) -> Option<PendingCommit> {
        self.pending.lock().unwrap().remove(branch)
    }

    pub fn pending_branches(&self) -> Vec<String> {
        self.pending.lock().unwrap().keys().cloned().collect()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}
