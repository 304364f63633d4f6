//! Reqwest-backed [`NetworkTransport`] implementation.
//!
//! Streams transfers to disk, resumes partial files via `Range` requests,
//! and splits large transfers into parallel byte-range chunks when the
//! server advertises range support.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, RANGE};
use reqwest::redirect::Policy;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    ChunkedFetchRequest, ChunkedTransfer, FetchRequest, FetchResponse, Headers, NetworkTransport,
    TransportError,
};

/// Connect timeout for all requests.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Read timeout; generous because transfers can be large.
const READ_TIMEOUT_SECS: u64 = 300;

/// Transfers below this size are never split into chunks.
const MIN_CHUNK_BYTES: u64 = 1024 * 1024;

/// Cookie-carrying clients sharing one jar: a redirect-following client
/// for body fetches and transfers, and a non-following one for header
/// probes, where the engine interprets Location itself.
struct SessionClients {
    follow: Client,
    probe: Client,
}

/// HTTP transport with a session cookie store and transfer accounting.
///
/// One instance serves one job attempt. Requests with `cookies: false`
/// bypass the cookie store entirely by going through a bare client.
pub struct HttpTransport {
    session: RwLock<SessionClients>,
    plain_client: Client,
    transferred: Arc<AtomicU64>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("transferred", &self.transferred.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn base_builder() -> reqwest::ClientBuilder {
    Client::builder()
        .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(std::time::Duration::from_secs(READ_TIMEOUT_SECS))
}

fn build_session_clients() -> Result<SessionClients, reqwest::Error> {
    let jar = Arc::new(Jar::default());
    Ok(SessionClients {
        follow: base_builder().cookie_provider(Arc::clone(&jar)).build()?,
        probe: base_builder()
            .cookie_provider(jar)
            .redirect(Policy::none())
            .build()?,
    })
}

impl HttpTransport {
    /// Creates a transport with default timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self {
            session: RwLock::new(
                build_session_clients()
                    .expect("failed to build HTTP client with static configuration"),
            ),
            plain_client: base_builder()
                .build()
                .expect("failed to build HTTP client with static configuration"),
            transferred: Arc::new(AtomicU64::new(0)),
        }
    }

    fn client_for(&self, cookies: bool, probe: bool) -> Client {
        if !cookies && !probe {
            return self.plain_client.clone();
        }
        fn pick(clients: &SessionClients, probe: bool) -> Client {
            if probe {
                clients.probe.clone()
            } else {
                clients.follow.clone()
            }
        }
        match self.session.read() {
            Ok(guard) => pick(&guard, probe),
            Err(poisoned) => pick(&poisoned.into_inner(), probe),
        }
    }
}

#[async_trait]
impl NetworkTransport for HttpTransport {
    #[instrument(skip(self, request), fields(url = %request.url, headers_only = request.headers_only))]
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        Url::parse(&request.url).map_err(|_| TransportError::invalid_url(&request.url))?;

        let client = self.client_for(request.cookies, request.headers_only);
        let builder = match (&request.form, request.headers_only) {
            (Some(fields), _) => client.post(&request.url).form(fields),
            (None, true) => client.head(&request.url),
            (None, false) => client.get(&request.url),
        };
        let builder = if request.query.is_empty() {
            builder
        } else {
            builder.query(&request.query)
        };

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::network(&request.url, e))?;

        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = if request.headers_only {
            Vec::new()
        } else {
            if !(200..400).contains(&status) {
                return Err(TransportError::http_status(&request.url, status));
            }
            response
                .bytes()
                .await
                .map_err(|e| TransportError::network(&request.url, e))?
                .to_vec()
        };

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }

    #[instrument(skip(self, request), fields(url = %request.url, dest = %request.dest.display()))]
    async fn chunked_fetch(
        &self,
        request: ChunkedFetchRequest,
    ) -> Result<ChunkedTransfer, TransportError> {
        self.transferred.store(0, Ordering::SeqCst);

        Url::parse(&request.url).map_err(|_| TransportError::invalid_url(&request.url))?;
        let client = self.client_for(true, false);

        // Resume from whatever is already on disk.
        let existing = if request.resume {
            tokio::fs::metadata(&request.dest)
                .await
                .map(|m| m.len())
                .unwrap_or(0)
        } else {
            0
        };

        let mut builder = client.get(&request.url);
        if existing > 0 {
            builder = builder.header(RANGE, format!("bytes={existing}-"));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::network(&request.url, e))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(TransportError::http_status(&request.url, status));
        }
        let resumed = status == 206;

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let supports_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
        let disposition_name = if request.honor_disposition {
            response
                .headers()
                .get(CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_disposition)
        } else {
            None
        };

        let offset = if resumed { existing } else { 0 };
        let total = content_length.map(|len| len + offset);

        let chunks = request.chunks.max(1);
        let split = !resumed
            && chunks > 1
            && supports_ranges
            && content_length.is_some_and(|len| len >= MIN_CHUNK_BYTES * u64::from(chunks));

        if split {
            // Length is present when `split` holds.
            let len = content_length.unwrap_or(0);
            drop(response);
            debug!(chunks, len, "splitting transfer into byte-range chunks");
            self.ranged_download(&client, &request, len, chunks).await?;
        } else {
            debug!(resumed, offset, "streaming single-connection transfer");
            let file = if resumed {
                OpenOptions::new()
                    .append(true)
                    .open(&request.dest)
                    .await
                    .map_err(|e| TransportError::io(&request.dest, e))?
            } else {
                File::create(&request.dest)
                    .await
                    .map_err(|e| TransportError::io(&request.dest, e))?
            };
            let mut writer = BufWriter::new(file);
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let bytes = chunk.map_err(|e| TransportError::network(&request.url, e))?;
                writer
                    .write_all(&bytes)
                    .await
                    .map_err(|e| TransportError::io(&request.dest, e))?;
                let moved = self
                    .transferred
                    .fetch_add(bytes.len() as u64, Ordering::SeqCst)
                    + bytes.len() as u64;
                if let Some(progress) = &request.progress {
                    progress(offset + moved, total);
                }
            }
            writer
                .flush()
                .await
                .map_err(|e| TransportError::io(&request.dest, e))?;
        }

        Ok(ChunkedTransfer { disposition_name })
    }

    fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    fn clear_cookies(&self) {
        match build_session_clients() {
            Ok(clients) => match self.session.write() {
                Ok(mut guard) => *guard = clients,
                Err(poisoned) => *poisoned.into_inner() = clients,
            },
            Err(e) => warn!(error = %e, "failed to rebuild cookie clients"),
        }
    }
}

impl HttpTransport {
    /// Downloads `len` bytes as `chunks` parallel byte-range requests into
    /// a preallocated destination file.
    async fn ranged_download(
        &self,
        client: &Client,
        request: &ChunkedFetchRequest,
        len: u64,
        chunks: u32,
    ) -> Result<(), TransportError> {
        let file = File::create(&request.dest)
            .await
            .map_err(|e| TransportError::io(&request.dest, e))?;
        file.set_len(len)
            .await
            .map_err(|e| TransportError::io(&request.dest, e))?;
        drop(file);

        let chunk_size = len / u64::from(chunks);
        let mut handles = Vec::new();
        for i in 0..u64::from(chunks) {
            let start = i * chunk_size;
            let end = if i + 1 == u64::from(chunks) {
                len - 1
            } else {
                (i + 1) * chunk_size - 1
            };

            let client = client.clone();
            let url = request.url.clone();
            let dest = request.dest.clone();
            let transferred = Arc::clone(&self.transferred);
            let progress = request.progress.clone();

            handles.push(tokio::spawn(async move {
                let response = client
                    .get(&url)
                    .header(RANGE, format!("bytes={start}-{end}"))
                    .send()
                    .await
                    .map_err(|e| TransportError::network(&url, e))?;
                let status = response.status().as_u16();
                if status != 206 {
                    return Err(TransportError::http_status(&url, status));
                }

                let mut file = OpenOptions::new()
                    .write(true)
                    .open(&dest)
                    .await
                    .map_err(|e| TransportError::io(&dest, e))?;
                file.seek(std::io::SeekFrom::Start(start))
                    .await
                    .map_err(|e| TransportError::io(&dest, e))?;

                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let bytes = chunk.map_err(|e| TransportError::network(&url, e))?;
                    file.write_all(&bytes)
                        .await
                        .map_err(|e| TransportError::io(&dest, e))?;
                    let moved =
                        transferred.fetch_add(bytes.len() as u64, Ordering::SeqCst)
                            + bytes.len() as u64;
                    if let Some(progress) = &progress {
                        progress(moved, Some(len));
                    }
                }
                file.flush()
                    .await
                    .map_err(|e| TransportError::io(&dest, e))?;
                Ok::<(), TransportError>(())
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(result) => result?,
                Err(e) => {
                    return Err(TransportError::io(
                        &request.dest,
                        std::io::Error::other(format!("chunk task panicked: {e}")),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Parses a Content-Disposition header to extract the filename.
///
/// Handles:
/// - `attachment; filename="example.pdf"`
/// - `attachment; filename=example.pdf`
/// - `attachment; filename*=UTF-8''example.pdf` (RFC 5987)
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    // filename*= first (RFC 5987 encoded)
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let value = header[pos + 9..].trim();
        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}
