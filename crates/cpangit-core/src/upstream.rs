//! Upstream HTTP access.
//!
//! Mirrors talk to their origin through the `UserAgent` seam so tests can
//! script responses. The real agent is a blocking reqwest client; status
//! codes are surfaced rather than collapsed into errors because autofetch
//! treats 404 as an ordinary miss.

use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use thiserror::Error;

pub const USER_AGENT: &str = concat!("cpangit/", env!("CARGO_PKG_VERSION"));
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream returned status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("upstream fetch for {url} was cancelled")]
    Cancelled { url: String },
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A synchronous GET. The fetch is the engine's only network suspension
/// point; implementations may cancel it, surfacing `UpstreamError::Cancelled`.
pub trait UserAgent {
    fn get(&self, url: &str) -> Result<HttpResponse>;
}

pub struct HttpAgent {
    client: reqwest::blocking::Client,
}

impl HttpAgent {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl UserAgent for HttpAgent {
    fn get(&self, url: &str) -> Result<HttpResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to fetch {url}"))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .with_context(|| format!("stream error for {url}"))?
            .to_vec();
        Ok(HttpResponse { status, body })
    }
}

/// Join an upstream base URL and a relative path with exactly one slash.
#[must_use]
pub fn join_url(base: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

/// Decompress a gzipped payload fully into memory.
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .context("failed to decompress upstream payload")?;
    Ok(out)
}
