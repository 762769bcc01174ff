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

//! The `modules/02packages.details.txt` manifest: a header block, one blank
//! line, then one row per module mapping it to a version and a dist path
//! relative to `authors/id/`. The reader tolerates arbitrary header order
//! and unknown headers; the writer emits the fixed PAUSE-compatible header
//! set with `Line-Count` and `Last-Updated` recomputed.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;
use indexmap::IndexMap;
use thiserror::Error;

use crate::version_req::Version;

/// Timestamp format of the `Last-Updated` header.
const LAST_UPDATED_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Fixed line count of the serialized header block, including the blank
/// separator line.
const HEADER_LINES: usize = 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackageIndexError {
    #[error("Cannot parse package index at offset {offset}: {reason}")]
    Parse { offset: usize, reason: String },
}

fn parse_err(offset: usize, reason: impl Into<String>) -> PackageIndexError {
    PackageIndexError::Parse {
        offset,
        reason: reason.into(),
    }
}

/// One row of the manifest. `version` is `None` for the literal `undef`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRow {
    pub module: String,
    pub version: Option<Version>,
    pub dist_path: String,
}

impl PackageRow {
    pub fn new(module: impl Into<String>, version: Option<&str>, dist_path: impl Into<String>) -> Self {
        PackageRow {
            module: module.into(),
            version: version.map(Version::new),
            dist_path: dist_path.into(),
        }
    }
}

/// Parsed manifest with three views: source-ordered headers, modules by
/// name, and rows grouped by dist path. Rows are shared between the two
/// maps, so a row observed through `by_dist` is the same row `by_module`
/// serializes.
#[derive(Debug, Clone, Default)]
pub struct PackageIndex {
    headers: IndexMap<String, String>,
    by_module: BTreeMap<String, Arc<PackageRow>>,
    by_dist: BTreeMap<String, Vec<Arc<PackageRow>>>,
    last_updated: Option<DateTime<Utc>>,
}

impl PackageIndex {
    pub fn parse(input: &[u8]) -> Result<PackageIndex, PackageIndexError> {
        let text = std::str::from_utf8(input)
            .map_err(|err| parse_err(err.valid_up_to(), "package index is not UTF-8"))?;
        let mut index = PackageIndex::default();
        let mut pos = 0;

        // Header phase, terminated by exactly one blank line.
        loop {
            let rest = &text[pos..];
            if rest.is_empty() {
                return Err(parse_err(pos, "missing blank line after headers"));
            }
            if rest.starts_with('\n') {
                pos += 1;
                break;
            }
            let line_end = rest
                .find('\n')
                .ok_or_else(|| parse_err(pos, "missing blank line after headers"))?;
            let line = &rest[..line_end];
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| parse_err(pos, format!("malformed header line {line:?}")))?;
            index
                .headers
                .insert(key.to_owned(), value.trim_start().to_owned());
            pos += line_end + 1;
        }
        index.last_updated = index
            .headers
            .get("Last-Updated")
            .and_then(|value| NaiveDateTime::parse_from_str(value, LAST_UPDATED_FORMAT).ok())
            .map(|naive| naive.and_utc());

        // Body phase: `<module> <version> <path>` until end of input.
        while pos < text.len() {
            let rest = &text[pos..];
            let (line, consumed) = match rest.find('\n') {
                Some(line_end) => (&rest[..line_end], line_end + 1),
                None => (rest, rest.len()),
            };
            let mut fields = line.split_whitespace();
            let row = match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(module), Some(version), Some(dist_path), None) => PackageRow {
                    module: module.to_owned(),
                    version: (version != "undef").then(|| Version::new(version)),
                    dist_path: dist_path.to_owned(),
                },
                _ => return Err(parse_err(pos, format!("malformed package row {line:?}"))),
            };
            index.assign_module(Arc::new(row));
            pos += consumed;
        }
        Ok(index)
    }

    /// Serializes the fixed header set followed by the rows sorted by
    /// module name. `now` becomes the new `Last-Updated`.
    pub fn serialize(&self, now: DateTime<Utc>) -> Vec<u8> {
        let header = |key: &str, default: &str| {
            self.headers
                .get(key)
                .cloned()
                .unwrap_or_else(|| default.to_owned())
        };
        let mut out = String::new();
        let fixed = [
            ("File", header("File", "02packages.details.txt")),
            ("URL", header("URL", "unknown")),
            (
                "Description",
                header(
                    "Description",
                    "Package names found in directory $CPAN/authors/id/",
                ),
            ),
            ("Columns", header("Columns", "package name, version, path")),
            (
                "Intended-For",
                header(
                    "Intended-For",
                    "Automated fetch routines, namespace documentation.",
                ),
            ),
            (
                "Written-By",
                header("Written-By", "PAUSE version 1.005"),
            ),
            (
                "Line-Count",
                (HEADER_LINES + self.by_module.len()).to_string(),
            ),
            (
                "Last-Updated",
                now.format(LAST_UPDATED_FORMAT).to_string(),
            ),
        ];
        for (key, value) in fixed {
            let _ = writeln!(out, "{:<13} {value}", format!("{key}:"));
        }
        out.push('\n');
        for (module, row) in &self.by_module {
            let version = row
                .version
                .as_ref()
                .map_or("undef", |version| version.as_str());
            // Two spaces before the path, for downstream CPAN clients.
            let _ = writeln!(out, "{module} {version}  {}", row.dist_path);
        }
        out.into_bytes()
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Parsed `Last-Updated`, `None` when the header was absent or
    /// malformed. Callers treat `None` as infinitely stale.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn module(&self, name: &str) -> Option<&Arc<PackageRow>> {
        self.by_module.get(name)
    }

    pub fn dist_rows(&self, dist_path: &str) -> Option<&[Arc<PackageRow>]> {
        self.by_dist.get(dist_path).map(Vec::as_slice)
    }

    pub fn modules(&self) -> impl Iterator<Item = &Arc<PackageRow>> {
        self.by_module.values()
    }

    pub fn dist_paths(&self) -> impl Iterator<Item = &str> {
        self.by_dist.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_module.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_module.is_empty()
    }

    /// Makes `row` the owner of its module, last writer wins. The previous
    /// owner row (if any) is dropped from its dist group so both views keep
    /// describing the same row set. Returns whether the index changed;
    /// re-assigning an identical row is a no-op.
    pub fn assign_module(&mut self, row: Arc<PackageRow>) -> bool {
        if let Some(previous) = self.by_module.insert(row.module.clone(), row.clone()) {
            if previous == row {
                return false;
            }
            self.drop_dist_row(&previous);
        }
        let rows = self.by_dist.entry(row.dist_path.clone()).or_default();
        if !rows.iter().any(|existing| *existing == row) {
            rows.push(row);
        }
        true
    }

    pub fn remove_module(&mut self, name: &str) -> Option<Arc<PackageRow>> {
        let row = self.by_module.remove(name)?;
        self.drop_dist_row(&row);
        Some(row)
    }

    fn drop_dist_row(&mut self, row: &Arc<PackageRow>) {
        if let Some(rows) = self.by_dist.get_mut(&row.dist_path) {
            rows.retain(|existing| existing.module != row.module);
            if rows.is_empty() {
                self.by_dist.remove(&row.dist_path);
            }
        }
    }
}
