//! Network transport collaborator.
//!
//! The engine drives all network traffic through the [`NetworkTransport`]
//! trait: plain fetches (optionally header-only) and chunked, resumable
//! file transfers. [`HttpTransport`] is the reqwest-backed default; tests
//! substitute scripted implementations.

mod http;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use http::HttpTransport;

/// Errors surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level error (DNS resolution, connection refused, TLS, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// File system error while writing transfer data.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },
}

impl TransportError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }
}

/// Ordered multi-map of response headers.
///
/// Repeated headers fold into an ordered list instead of overwriting each
/// other; lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, preserving arrival order.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into().to_ascii_lowercase(), value.into()));
    }

    /// First value for `name`, case-insensitive.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    /// All values for `name` in arrival order.
    #[must_use]
    pub fn all(&self, name: &str) -> Vec<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// True when a header with `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.first(name).is_some()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.push(name, value);
        }
        headers
    }
}

/// A plain fetch: body or headers of a single URL.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    /// Absolute URL to fetch.
    pub url: String,
    /// Query parameters appended to the URL.
    pub query: Vec<(String, String)>,
    /// Form fields; presence switches the request to POST.
    pub form: Option<Vec<(String, String)>>,
    /// Attach the cookie store to this request.
    pub cookies: bool,
    /// Capture status and headers only, without reading the body.
    pub headers_only: bool,
}

impl FetchRequest {
    /// Creates a GET request for `url` with default options.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cookies: true,
            ..Self::default()
        }
    }

    /// Creates a header-only request for `url`.
    pub fn head(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cookies: true,
            headers_only: true,
            ..Self::default()
        }
    }
}

/// Response to a [`FetchRequest`].
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Folded response headers.
    pub headers: Headers,
    /// Response body; empty for header-only fetches.
    pub body: Vec<u8>,
}

/// Progress callback: (bytes transferred so far, expected total if known).
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// A chunked, optionally resumable file transfer.
pub struct ChunkedFetchRequest {
    /// Absolute URL to download.
    pub url: String,
    /// Destination file path.
    pub dest: PathBuf,
    /// Requested number of parallel byte-range chunks (minimum 1).
    pub chunks: u32,
    /// Resume from existing partial data when the server allows it.
    pub resume: bool,
    /// Report a server-supplied Content-Disposition filename.
    pub honor_disposition: bool,
    /// Optional progress callback.
    pub progress: Option<ProgressFn>,
}

impl std::fmt::Debug for ChunkedFetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedFetchRequest")
            .field("url", &self.url)
            .field("dest", &self.dest)
            .field("chunks", &self.chunks)
            .field("resume", &self.resume)
            .field("honor_disposition", &self.honor_disposition)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Outcome of a successful chunked transfer.
#[derive(Debug, Clone)]
pub struct ChunkedTransfer {
    /// Filename the server reported via Content-Disposition, if any and
    /// if the request opted in.
    pub disposition_name: Option<String>,
}

/// Network collaborator contract.
///
/// One transport instance serves one job attempt; the transferred-bytes
/// counter refers to the most recent chunked transfer and stays readable
/// after a failed one.
#[async_trait]
pub trait NetworkTransport: Send + Sync {
    /// Performs a plain fetch.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on network failure, error status or
    /// malformed URL.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError>;

    /// Performs a chunked file transfer to `request.dest`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on failure; [`Self::transferred_bytes`]
    /// still reflects the bytes written before the failure.
    async fn chunked_fetch(
        &self,
        request: ChunkedFetchRequest,
    ) -> Result<ChunkedTransfer, TransportError>;

    /// Bytes moved by the most recent chunked transfer, even a failed one.
    fn transferred_bytes(&self) -> u64;

    /// Drops all session cookies. No-op for cookie-less transports.
    fn clear_cookies(&self) {}
}
