//! Direct link probing.
//!
//! Some hosts hand out URLs that already point at the artifact, possibly
//! behind a short redirect chain. The resolver walks that chain with
//! header-only requests and decides from Content-Disposition, redirect
//! status and media type whether the final URL can be downloaded without
//! running the full extraction flow.

use tracing::{debug, warn};
use url::Url;

use crate::signal::JobSignal;
use crate::transport::FetchRequest;

use super::JobSession;

/// Resolves `location` the way browsers do for a Location header: taken
/// verbatim when absolute, otherwise joined against the current origin.
fn resolve_location(current: &str, location: &str) -> String {
    if Url::parse(location).is_ok() {
        return location.to_string();
    }
    if let Ok(mut base) = Url::parse(current) {
        base.set_path("/");
        base.set_query(None);
        base.set_fragment(None);
        if let Ok(joined) = base.join(location) {
            return joined.to_string();
        }
    }
    location.to_string()
}

/// Lowercased filename extension of the URL path, if any.
fn url_extension(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let (stem, extension) = segment.rsplit_once('.')?;
    if stem.is_empty() || extension.is_empty() {
        return None;
    }
    Some(extension.to_ascii_lowercase())
}

/// Media type guessed from a filename extension.
fn mime_for_extension(extension: &str) -> &'static str {
    match extension {
        "html" | "htm" | "xhtml" => "text/html",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "json" => "application/json",
        "zip" => "application/zip",
        "rar" => "application/vnd.rar",
        "7z" => "application/x-7z-compressed",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        "pdf" => "application/pdf",
        "iso" => "application/x-iso9660-image",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

impl JobSession {
    /// Probes `url` for a directly downloadable artifact.
    ///
    /// Follows up to `follow_redirects` hops (at least one probe always
    /// runs). A Content-Disposition header settles it immediately; a 302
    /// hop records its target as a fallback candidate; a non-redirect
    /// answer decides by media type, taken from Content-Type or guessed
    /// from the URL extension. HTML means an interstitial page, not an
    /// artifact. Probe failures and exhausted hops return the best
    /// candidate seen so far.
    ///
    /// # Errors
    ///
    /// [`JobSignal::Fail`] only when `url` cannot be resolved against
    /// the job URL.
    pub async fn resolve_direct_link(
        &mut self,
        url: &str,
        follow_redirects: u32,
    ) -> Result<Option<String>, JobSignal> {
        let mut url = self.fix_url(url)?;
        let budget = follow_redirects.max(1);
        let mut candidate: Option<String> = None;

        for hop in 0..budget {
            debug!(job = self.job.id(), hop, url = %url, "probing for direct link");
            let response = match self.transport.fetch(FetchRequest::head(&url)).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(job = self.job.id(), url = %url, error = %e, "header probe failed");
                    return Ok(candidate);
                }
            };

            if response.headers.contains("content-disposition") {
                return Ok(Some(url));
            }

            let location = response
                .headers
                .first("location")
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from);
            if let Some(location) = location {
                let resolved = resolve_location(&url, &location);
                if response.status == 302 {
                    candidate = Some(resolved.clone());
                }
                url = resolved;
                continue;
            }

            let mimetype = response
                .headers
                .first("content-type")
                .and_then(|ct| ct.split(';').next())
                .map(|ct| ct.trim().to_string())
                .filter(|ct| !ct.is_empty())
                .or_else(|| url_extension(&url).map(|ext| mime_for_extension(&ext).to_string()));

            return Ok(match mimetype {
                Some(mime) if candidate.is_some() || !mime.contains("html") => Some(url),
                _ => None,
            });
        }

        warn!(job = self.job.id(), "too many redirects while probing for a direct link");
        Ok(candidate)
    }
}
