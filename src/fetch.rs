//! Artifact transport.
//!
//! - `HttpFetcher`: plain HTTP via the hyper client; other network schemes
//!   fail without sending a request
//! - `FileFetcher`: local paths and `file://` URLs, for development and tests

use anyhow::Result;
use futures::future::BoxFuture;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::io::ErrorKind;
use std::sync::Arc;

/// Response body, consumed frame by frame for streaming instantiation.
pub type ArtifactBody = UnsyncBoxBody<Bytes, anyhow::Error>;

/// A completed request. Non-success statuses are reported, not raised.
pub struct ArtifactResponse {
    pub url: String,
    pub status: u16,
    pub body: ArtifactBody,
}

impl ArtifactResponse {
    pub fn new(url: impl Into<String>, status: u16, body: ArtifactBody) -> Self {
        Self {
            url: url.into(),
            status,
            body,
        }
    }

    /// A fully buffered response
    pub fn from_bytes(url: impl Into<String>, status: u16, bytes: impl Into<Bytes>) -> Self {
        Self::new(url, status, full_body(bytes.into()))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for ArtifactResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactResponse")
            .field("url", &self.url)
            .field("status", &self.status)
            .finish()
    }
}

pub fn full_body(bytes: Bytes) -> ArtifactBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

/// Issues the `GET` for an artifact URL.
///
/// An `Err` means the request did not complete. A response that completed
/// with a non-success status is returned as `Ok`.
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ArtifactResponse>>;
}

/// Choose a fetcher from the manifest's public path. Bare paths and
/// `file://` URLs are read from disk; every other scheme goes over the
/// network, where anything but `http` fails as a transport error.
pub fn for_public_path(public_path: &str) -> Arc<dyn Fetcher> {
    match url_scheme(public_path) {
        None | Some("file") => Arc::new(FileFetcher),
        Some(_) => Arc::new(HttpFetcher::new()),
    }
}

fn url_scheme(url: &str) -> Option<&str> {
    let (scheme, _) = url.split_once("://")?;
    let valid = scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// Fetches artifacts over HTTP/1.
pub struct HttpFetcher {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ArtifactResponse>> {
        Box::pin(async move {
            let uri: hyper::Uri = url.parse()?;
            match uri.scheme_str() {
                Some("http") => {}
                Some(scheme) => anyhow::bail!("Unsupported scheme '{scheme}' in {url}"),
                None => anyhow::bail!("No scheme in {url}"),
            }
            let request = hyper::Request::get(uri).body(Empty::<Bytes>::new())?;
            let response = self.client.request(request).await?;
            let status = response.status().as_u16();
            let body = response
                .into_body()
                .map_err(anyhow::Error::from)
                .boxed_unsync();
            Ok(ArtifactResponse::new(url, status, body))
        })
    }
}

/// Reads artifacts from the local filesystem. A missing file completes
/// with status 404.
pub struct FileFetcher;

impl Fetcher for FileFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ArtifactResponse>> {
        Box::pin(async move {
            let path = url.strip_prefix("file://").unwrap_or(url);
            match tokio::fs::read(path).await {
                Ok(bytes) => Ok(ArtifactResponse::from_bytes(url, 200, bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    Ok(ArtifactResponse::from_bytes(url, 404, Bytes::new()))
                }
                Err(e) => Err(anyhow::anyhow!("Failed to read {path}: {e}")),
            }
        })
    }
}
