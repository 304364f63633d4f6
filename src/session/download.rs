//! Chunked downloader: drives one file transfer end to end.
//!
//! Resolves the target URL, runs the duplicate guard, prepares the
//! destination folder, performs the chunked transfer and applies the
//! server-supplied filename afterwards. The job's size counter is
//! updated from the transport after every transfer, failed ones
//! included, so quota accounting sees partial data.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use crate::job::JobStatus;
use crate::signal::JobSignal;
use crate::transport::{ChunkedFetchRequest, ProgressFn};

use super::JobSession;

/// Per-transfer options.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Extra query parameters appended to the download URL.
    pub query: Vec<(String, String)>,
    /// Take the artifact name from the server: the URL path before the
    /// transfer, Content-Disposition after it.
    pub disposition: bool,
}

/// Replaces filesystem-hostile characters and trims dot/space edges.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Last percent-decoded path segment of `url`, if it has a non-empty one.
fn url_path_name(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    if segment.is_empty() {
        return None;
    }
    Some(
        urlencoding::decode(segment)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| segment.to_string()),
    )
}

impl JobSession {
    /// Downloads `url` into the package folder under the download root.
    ///
    /// Runs the duplicate guard first, flips the job to
    /// [`JobStatus::Downloading`], transfers with the effective chunk
    /// count and resume setting, then renames per Content-Disposition
    /// when `options.disposition` is set. Permission and ownership
    /// adjustments are attempted but never fatal. Returns the final path,
    /// which is also recorded for the verifier.
    ///
    /// # Errors
    ///
    /// [`JobSignal::Abort`] when already aborted, [`JobSignal::Skip`]
    /// from the duplicate guard, [`JobSignal::Fail`] on folder creation
    /// or transfer failure.
    pub async fn download(
        &mut self,
        url: &str,
        options: DownloadOptions,
    ) -> Result<PathBuf, JobSignal> {
        self.ensure_not_aborted()?;

        let mut target = self.fix_url(url)?;
        if !options.query.is_empty() {
            let mut parsed = Url::parse(&target)
                .map_err(|_| JobSignal::fail(format!("invalid download URL: {target}")))?;
            parsed
                .query_pairs_mut()
                .extend_pairs(options.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            target = parsed.into();
        }

        // Reaching the transfer means any pending captcha answer worked.
        self.correct_captcha();

        self.check_for_same_files(false)?;

        self.job.set_status(JobStatus::Downloading);

        // Until the server speaks, the URL path is the best name we have.
        if options.disposition {
            if let Some(name) = url_path_name(&target) {
                self.job.set_name(name);
            }
        }

        let location = self
            .ctx
            .config
            .download_root
            .join(&self.job.package().folder);
        if !location.is_dir() {
            tokio::fs::create_dir_all(&location).await.map_err(|e| {
                JobSignal::fail(format!(
                    "cannot create download folder {}: {e}",
                    location.display()
                ))
            })?;
            self.apply_path_attributes(&location, self.ctx.config.folder_mode);
        }

        let filename = sanitize_filename(&self.job.name());
        let filepath = location.join(&filename);

        let dest = filepath.display().to_string();
        self.ctx.events.notify(
            "download-start",
            &self.job,
            &[("url", target.as_str()), ("dest", dest.as_str())],
        );
        info!(
            job = self.job.id(),
            url = %target,
            dest = %filepath.display(),
            chunks = self.chunk_count(),
            resume = self.resume_download,
            "starting transfer"
        );

        let progress: ProgressFn = {
            let job = Arc::clone(&self.job);
            Arc::new(move |done, total| {
                if let Some(total) = total.filter(|t| *t > 0) {
                    let percent = done.saturating_mul(100) / total;
                    job.set_progress(u8::try_from(percent.min(100)).unwrap_or(100));
                }
            })
        };

        let outcome = self
            .transport
            .chunked_fetch(ChunkedFetchRequest {
                url: target.clone(),
                dest: filepath.clone(),
                chunks: self.chunk_count(),
                resume: self.resume_download,
                honor_disposition: options.disposition,
                progress: Some(progress),
            })
            .await;

        // Recorded whatever the outcome: quota accounting counts the bytes
        // a failed transfer already moved.
        self.job.set_size(self.transport.transferred_bytes());

        let transfer = outcome.map_err(|e| JobSignal::fail(e.to_string()))?;

        let mut final_path = filepath;
        if let Some(server_name) = transfer.disposition_name {
            let renamed = sanitize_filename(&server_name);
            if renamed != filename {
                let new_path = location.join(&renamed);
                match tokio::fs::rename(&final_path, &new_path).await {
                    Ok(()) => {
                        info!(
                            job = self.job.id(),
                            from = %filename,
                            to = %renamed,
                            "renamed per content-disposition"
                        );
                        self.job.set_name(renamed);
                        final_path = new_path;
                    }
                    Err(e) => {
                        warn!(
                            job = self.job.id(),
                            to = %renamed,
                            error = %e,
                            "content-disposition rename failed, keeping original name"
                        );
                    }
                }
            }
        }

        self.apply_path_attributes(&final_path, self.ctx.config.file_mode);

        self.last_download = Some(final_path.clone());
        Ok(final_path)
    }

    /// Applies configured permission bits and ownership; warnings only.
    #[cfg(unix)]
    fn apply_path_attributes(&self, path: &Path, mode: Option<u32>) {
        use std::os::unix::fs::PermissionsExt;

        if let Some(mode) = mode {
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
                warn!(path = %path.display(), mode, error = %e, "permission change failed");
            }
        }

        let uid = self.ctx.config.owner_uid;
        let gid = self.ctx.config.owner_gid;
        if uid.is_some() || gid.is_some() {
            if let Err(e) = std::os::unix::fs::chown(path, uid, gid) {
                warn!(path = %path.display(), error = %e, "ownership change failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn apply_path_attributes(&self, _path: &Path, _mode: Option<u32>) {}
}
