//! Post-download verification.
//!
//! Hosts frequently answer a download request with an HTML error page at
//! status 200. The verifier inspects the artifact the downloader just
//! produced: existence, size against the advertised value, and a set of
//! content rules that recognize junk. A matched rule marks the file for
//! deletion, which happens on every exit path out of the match.

use std::path::PathBuf;

use regex::Regex;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::signal::JobSignal;

use super::JobSession;

/// Bytes of the artifact inspected when the caller gives no limit. Error
/// pages fit easily; real artifacts are never read in full.
const DEFAULT_READ_BYTES: u64 = 50_000;

/// One content rule the verifier checks the artifact against.
#[derive(Debug, Clone)]
pub struct VerificationRule {
    /// Name reported when the rule matches.
    pub name: String,
    matcher: RuleMatcher,
}

#[derive(Debug, Clone)]
enum RuleMatcher {
    Literal(String),
    Pattern(Regex),
}

impl VerificationRule {
    /// Rule matching when `needle` occurs anywhere in the inspected text.
    pub fn literal(name: impl Into<String>, needle: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            matcher: RuleMatcher::Literal(needle.into()),
        }
    }

    /// Rule matching when `pattern` finds a match in the inspected text.
    pub fn pattern(name: impl Into<String>, pattern: Regex) -> Self {
        Self {
            name: name.into(),
            matcher: RuleMatcher::Pattern(pattern),
        }
    }
}

/// Removes the artifact on drop once armed.
struct DeletionGuard {
    path: PathBuf,
    armed: bool,
}

impl DeletionGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: false }
    }

    fn arm(&mut self) {
        self.armed = true;
    }
}

impl Drop for DeletionGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "rejected artifact not removed");
            }
        }
    }
}

impl JobSession {
    /// Verifies the most recent download.
    ///
    /// Checks existence and emptiness, then the advertised size when
    /// `expected_size` is given (`tolerance` in bytes, engine default
    /// when `None`), then matches `rules` against the artifact's leading
    /// `read_size` bytes (50 kB when `None`). The first matching
    /// rule wins: its name is returned, the matched text of a pattern
    /// rule is retained for [`last_check`](Self::last_check), and when
    /// `delete` is set the artifact is removed before returning.
    ///
    /// # Errors
    ///
    /// [`JobSignal::Fail`] when no artifact exists ("No file downloaded"
    /// or the job's recorded error), when it is empty ("Empty file"),
    /// when its size is off beyond tolerance ("File size mismatch"), or
    /// when it cannot be read.
    pub async fn check_download(
        &mut self,
        rules: &[VerificationRule],
        delete: bool,
        expected_size: Option<u64>,
        tolerance: Option<u64>,
        read_size: Option<u64>,
    ) -> Result<Option<String>, JobSignal> {
        let Some(path) = self.last_download.clone() else {
            return Err(JobSignal::fail(
                self.job.error().unwrap_or_else(|| "No file downloaded".to_string()),
            ));
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(_) => {
                self.last_download = None;
                return Err(JobSignal::fail(
                    self.job.error().unwrap_or_else(|| "No file downloaded".to_string()),
                ));
            }
        };

        let mut guard = DeletionGuard::new(path.clone());
        let actual_size = metadata.len();

        if actual_size == 0 {
            if delete {
                guard.arm();
            }
            self.last_download = None;
            return Err(JobSignal::fail("Empty file"));
        }

        if let Some(expected) = expected_size.filter(|s| *s > 0) {
            let tolerance = tolerance.unwrap_or(self.ctx.config.size_tolerance);
            let diff = expected.abs_diff(actual_size);
            if diff > tolerance {
                warn!(
                    job = self.job.id(),
                    expected, actual = actual_size, tolerance, "size check failed"
                );
                if delete {
                    guard.arm();
                }
                self.last_download = None;
                return Err(JobSignal::fail("File size mismatch"));
            }
            if diff > 0 {
                warn!(
                    job = self.job.id(),
                    expected, actual = actual_size, "size deviates within tolerance"
                );
            }
        }

        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| JobSignal::fail(format!("cannot open {}: {e}", path.display())))?;
        let mut raw = Vec::new();
        let limit = read_size.unwrap_or(DEFAULT_READ_BYTES);
        (&mut file)
            .take(limit)
            .read_to_end(&mut raw)
            .await
            .map_err(|e| JobSignal::fail(format!("cannot read {}: {e}", path.display())))?;
        let content = String::from_utf8_lossy(&raw);

        for rule in rules {
            let matched = match &rule.matcher {
                RuleMatcher::Literal(needle) => {
                    content.contains(needle.as_str()).then(|| needle.clone())
                }
                RuleMatcher::Pattern(pattern) => {
                    pattern.find(&content).map(|m| m.as_str().to_string())
                }
            };
            let Some(matched) = matched else { continue };

            info!(job = self.job.id(), rule = %rule.name, "content rule matched");
            if matches!(rule.matcher, RuleMatcher::Pattern(_)) {
                self.last_check = Some(matched);
            }
            if delete {
                guard.arm();
                self.last_download = None;
            }
            return Ok(Some(rule.name.clone()));
        }

        debug!(job = self.job.id(), size = actual_size, "artifact passed verification");
        Ok(None)
    }
}
