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

//! Version requirements as they appear in CPAN distribution metadata:
//! comma-separated clauses of `<op> <version>` where the operator is one of
//! `<`, `<=`, `>`, `>=`, `==`, `!=` and a bare version means `>=`.
//!
//! Versions are kept as opaque strings for storage and only normalized for
//! comparison, following CPAN `version` semantics: underscores are ignored,
//! a leading `v` (or two or more dots) selects dotted components, and a
//! plain decimal splits its fraction into right-padded three-digit groups,
//! so `5.01_01` orders like `v5.10.100`.

use std::cmp::Ordering;
use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionReqError {
    #[error("Cannot parse version requirement {spec:?}")]
    Parse { spec: String },
    #[error("Conflicting exact version requirement =={version} vs {conflict}")]
    ConflictingEquality { version: String, conflict: String },
}

/// Comparison operator of one requirement clause. The variant order is the
/// canonical clause order used when a requirement is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Op {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    Ne,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "==",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Ne => "!=",
        }
    }

    /// Splits a leading operator off `input`. Two-character operators are
    /// matched first so `>=` does not parse as `>` followed by `=`.
    fn strip(input: &str) -> (Option<Op>, &str) {
        for (token, op) in [
            ("<=", Op::Le),
            (">=", Op::Ge),
            ("==", Op::Eq),
            ("!=", Op::Ne),
            ("<", Op::Lt),
            (">", Op::Gt),
        ] {
            if let Some(rest) = input.strip_prefix(token) {
                return (Some(op), rest);
            }
        }
        (None, input)
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An opaque version string with CPAN ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(String);

impl Version {
    pub fn new(value: impl Into<String>) -> Self {
        Version(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Normalized comparison tuple. Empty for a missing/unparseable-empty
    /// version; such a tuple matches only `!=` clauses.
    pub fn tuple(&self) -> Vec<u64> {
        let cleaned: String = self
            .0
            .trim()
            .chars()
            .filter(|ch| *ch != '_')
            .collect();
        if cleaned.is_empty() {
            return vec![];
        }
        let dotted = cleaned.strip_prefix('v');
        if dotted.is_some() || cleaned.matches('.').count() >= 2 {
            return dotted
                .unwrap_or(&cleaned)
                .split('.')
                .map(component_number)
                .collect();
        }
        let (integer, fraction) = match cleaned.split_once('.') {
            Some((integer, fraction)) => (integer, fraction),
            None => (cleaned.as_str(), ""),
        };
        let mut tuple = vec![component_number(integer)];
        let mut digits: String = fraction.chars().filter(char::is_ascii_digit).collect();
        while !digits.is_empty() && digits.len() % 3 != 0 {
            digits.push('0');
        }
        for group in digits.as_bytes().chunks(3) {
            // The groups are pure ASCII digits by construction.
            let group = std::str::from_utf8(group).unwrap_or("0");
            tuple.push(group.parse().unwrap_or(0));
        }
        tuple
    }

    pub fn cpan_cmp(&self, other: &Version) -> Ordering {
        cmp_tuples(&self.tuple(), &other.tuple())
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn component_number(component: &str) -> u64 {
    let digits: String = component
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(0)
}

fn cmp_tuples(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn clause_holds(version: &Version, op: Op, bound: &Version) -> bool {
    let tuple = version.tuple();
    if tuple.is_empty() {
        return op == Op::Ne;
    }
    let ord = cmp_tuples(&tuple, &bound.tuple());
    match op {
        Op::Eq => ord == Ordering::Equal,
        Op::Ne => ord != Ordering::Equal,
        Op::Gt => ord == Ordering::Greater,
        Op::Ge => ord != Ordering::Less,
        Op::Lt => ord == Ordering::Less,
        Op::Le => ord != Ordering::Greater,
    }
}

/// An ordered list of requirement clauses. The empty requirement is
/// satisfied by any version, present or not.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionReq {
    clauses: Vec<(Op, Version)>,
}

impl VersionReq {
    pub fn parse(spec: &str) -> Result<VersionReq, VersionReqError> {
        if spec.trim().is_empty() {
            return Ok(VersionReq::default());
        }
        let clauses = spec
            .split(',')
            .map(parse_clause)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(VersionReq { clauses })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> &[(Op, Version)] {
        &self.clauses
    }

    pub fn first(&self) -> Option<&(Op, Version)> {
        self.clauses.first()
    }

    /// Whether `version` satisfies every clause. `None` stands for a dist
    /// row whose version column is `undef`.
    pub fn satisfied_by(&self, version: Option<&Version>) -> bool {
        let undef = Version::new("");
        let version = version.unwrap_or(&undef);
        self.clauses
            .iter()
            .all(|(op, bound)| clause_holds(version, *op, bound))
    }

    /// Folds several requirement strings into one canonical requirement,
    /// keeping the strongest clause per operator and unioning `!=` clauses.
    /// Fails when two exact requirements disagree, or when an exact
    /// requirement cannot satisfy one of the other clauses.
    pub fn combine<'a>(
        specs: impl IntoIterator<Item = &'a str>,
    ) -> Result<VersionReq, VersionReqError> {
        let mut eq: Option<Version> = None;
        let mut gt: Option<Version> = None;
        let mut ge: Option<Version> = None;
        let mut lt: Option<Version> = None;
        let mut le: Option<Version> = None;
        let mut ne: Vec<Version> = Vec::new();
        for spec in specs {
            for (op, version) in VersionReq::parse(spec)?.clauses {
                match op {
                    Op::Eq => match &eq {
                        None => eq = Some(version),
                        Some(prev) if prev.cpan_cmp(&version) == Ordering::Equal => {}
                        Some(prev) => {
                            return Err(VersionReqError::ConflictingEquality {
                                version: prev.as_str().to_owned(),
                                conflict: format!("=={version}"),
                            });
                        }
                    },
                    Op::Gt => replace_if(&mut gt, version, Ordering::Greater),
                    Op::Ge => replace_if(&mut ge, version, Ordering::Greater),
                    Op::Lt => replace_if(&mut lt, version, Ordering::Less),
                    Op::Le => replace_if(&mut le, version, Ordering::Less),
                    Op::Ne => {
                        if !ne.iter().any(|v| v.cpan_cmp(&version) == Ordering::Equal) {
                            ne.push(version);
                        }
                    }
                }
            }
        }
        if let Some(exact) = eq {
            let ranges = [
                (Op::Gt, &gt),
                (Op::Ge, &ge),
                (Op::Lt, &lt),
                (Op::Le, &le),
            ];
            for (op, bound) in ranges {
                if let Some(bound) = bound {
                    if !clause_holds(&exact, op, bound) {
                        return Err(VersionReqError::ConflictingEquality {
                            version: exact.as_str().to_owned(),
                            conflict: format!("{op}{bound}"),
                        });
                    }
                }
            }
            if ne.iter().any(|v| v.cpan_cmp(&exact) == Ordering::Equal) {
                return Err(VersionReqError::ConflictingEquality {
                    version: exact.as_str().to_owned(),
                    conflict: format!("!={exact}"),
                });
            }
            return Ok(VersionReq {
                clauses: vec![(Op::Eq, exact)],
            });
        }
        let mut clauses = Vec::new();
        if let Some(version) = gt {
            clauses.push((Op::Gt, version));
        }
        if let Some(version) = ge {
            clauses.push((Op::Ge, version));
        }
        if let Some(version) = lt {
            clauses.push((Op::Lt, version));
        }
        if let Some(version) = le {
            clauses.push((Op::Le, version));
        }
        clauses.extend(ne.into_iter().map(|version| (Op::Ne, version)));
        Ok(VersionReq { clauses })
    }
}

fn replace_if(slot: &mut Option<Version>, version: Version, keep_when: Ordering) {
    match slot {
        Some(current) if version.cpan_cmp(current) != keep_when => {}
        _ => *slot = Some(version),
    }
}

fn parse_clause(segment: &str) -> Result<(Op, Version), VersionReqError> {
    let parse_err = || VersionReqError::Parse {
        spec: segment.to_owned(),
    };
    let trimmed = segment.trim();
    let (op, rest) = Op::strip(trimmed);
    let token = rest.trim();
    let body = token.strip_prefix('v').unwrap_or(token);
    let valid = body
        .chars()
        .next()
        .is_some_and(|ch| ch.is_ascii_digit())
        && body
            .chars()
            .all(|ch| ch.is_ascii_digit() || ch == '.' || ch == '_');
    if !valid {
        return Err(parse_err());
    }
    Ok((op.unwrap_or(Op::Ge), Version::new(token)))
}

impl Display for VersionReq {
    /// Canonical form: explicit operators, `,`-joined, `==`/`>`/`>=`/`<`/
    /// `<=` before the `!=` clauses.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (op, version) in &self.clauses {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{op}{version}")?;
            first = false;
        }
        Ok(())
    }
}
