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

//! The HTTP seam towards upstream CPAN mirrors: a synchronous GET that
//! reports any transport failure (including cancellation by the host) as
//! an error and every HTTP status as a response.

use std::fmt::Debug;
use std::io::Read;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream returned status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("Request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Cannot decompress gzip body from {url}")]
    BadGzip {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait UserAgent: Send + Sync + Debug {
    fn get(&self, url: &str) -> Result<HttpResponse, UpstreamError>;
}

/// Production user agent over a blocking reqwest client. Automatic gzip
/// decoding stays off; `02packages.details.txt.gz` is decompressed
/// explicitly on ingest.
#[derive(Debug)]
pub struct ReqwestUserAgent {
    client: reqwest::blocking::Client,
}

impl ReqwestUserAgent {
    pub fn new() -> Result<Self, UpstreamError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("cpan-ingit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| UpstreamError::Request {
                url: String::new(),
                source: Box::new(source),
            })?;
        Ok(ReqwestUserAgent { client })
    }
}

impl UserAgent for ReqwestUserAgent {
    fn get(&self, url: &str) -> Result<HttpResponse, UpstreamError> {
        let request_err = |source: reqwest::Error| UpstreamError::Request {
            url: url.to_owned(),
            source: Box::new(source),
        };
        let response = self.client.get(url).send().map_err(request_err)?;
        let status = response.status().as_u16();
        let body = response.bytes().map_err(request_err)?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

/// Joins an upstream base URL and a repository-relative path with exactly
/// one slash between them.
pub fn join_url(base: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

pub fn gunzip(url: &str, data: &[u8]) -> Result<Vec<u8>, UpstreamError> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|source| UpstreamError::BadGzip {
            url: url.to_owned(),
            source,
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn join_url_uses_exactly_one_slash() {
        assert_eq!(join_url("http://cpan.example", "a/b"), "http://cpan.example/a/b");
        assert_eq!(join_url("http://cpan.example/", "a/b"), "http://cpan.example/a/b");
        assert_eq!(join_url("http://cpan.example/", "/a/b"), "http://cpan.example/a/b");
    }

    #[test]
    fn gunzip_round_trips() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"package index body").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(
            gunzip("http://cpan.example/x.gz", &compressed).unwrap(),
            b"package index body"
        );
    }

    #[test]
    fn gunzip_rejects_garbage() {
        assert_matches!(
            gunzip("http://cpan.example/x.gz", b"not gzip at all"),
            Err(UpstreamError::BadGzip { .. })
        );
    }
}
