//! Job and package data model plus the shared tracked-job cache.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Lifecycle status of a job.
///
/// The duplicate guard partitions these into "active transfer" states
/// (another job already owns the artifact) and "pending start" states
/// (another job began earlier and is still about to own it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Freshly created, not yet handed to a worker.
    Created,
    /// Worker assigned, preprocessing in progress.
    Starting,
    /// Sleeping until a scheduled resume time.
    Waiting,
    /// Transfer in progress.
    Downloading,
    /// Terminal: skipped as a duplicate or pre-existing artifact.
    Skipped,
    /// Terminal: unrecoverable failure.
    Failed,
    /// Terminal: cooperatively aborted.
    Aborted,
    /// Terminal: artifact retrieved and verified.
    Finished,
}

impl JobStatus {
    /// Returns the snake_case string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Waiting => "waiting",
            Self::Downloading => "downloading",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Finished => "finished",
        }
    }

    /// True when another job in this state already owns the artifact
    /// (finished or mid-transfer).
    #[must_use]
    pub fn is_active_transfer(&self) -> bool {
        matches!(self, Self::Downloading | Self::Finished)
    }

    /// True when another job in this state began earlier and is still
    /// pending (waiting to start or starting).
    #[must_use]
    pub fn is_pending_start(&self) -> bool {
        matches!(self, Self::Waiting | Self::Starting)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "starting" => Ok(Self::Starting),
            "waiting" => Ok(Self::Waiting),
            "downloading" => Ok(Self::Downloading),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            "finished" => Ok(Self::Finished),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

/// A named group of jobs sharing a destination folder and optional password.
#[derive(Debug, Clone)]
pub struct Package {
    /// Destination folder name under the download root.
    pub folder: String,
    /// Optional extraction password supplied by the user.
    pub password: Option<String>,
}

impl Package {
    /// Creates a package with the given folder and no password.
    #[must_use]
    pub fn new(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            password: None,
        }
    }
}

/// One queued file to retrieve; the unit of work for the engine.
///
/// A job is shared as `Arc<Job>` between its worker and the tracked-job
/// cache. Mutable fields use interior mutability with short critical
/// sections; a job is only ever driven by a single worker, so the locks
/// exist for cross-job readers (the duplicate guard), not for contention.
#[derive(Debug)]
pub struct Job {
    id: u64,
    url: String,
    name: Mutex<String>,
    size: AtomicU64,
    status: Mutex<JobStatus>,
    error: Mutex<Option<String>>,
    wait_until: Mutex<Option<Instant>>,
    abort: AtomicBool,
    progress: AtomicU8,
    source: String,
    package: Arc<Package>,
}

impl Job {
    /// Creates a job in [`JobStatus::Created`].
    ///
    /// `source` identifies the extraction plugin that owns the job and is
    /// reported as the skip reason when another job is deduplicated
    /// against this one.
    pub fn new(
        id: u64,
        url: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        source: impl Into<String>,
        package: Arc<Package>,
    ) -> Self {
        Self {
            id,
            url: url.into(),
            name: Mutex::new(name.into()),
            size: AtomicU64::new(size),
            status: Mutex::new(JobStatus::Created),
            error: Mutex::new(None),
            wait_until: Mutex::new(None),
            abort: AtomicBool::new(false),
            progress: AtomicU8::new(0),
            source: source.into(),
            package,
        }
    }

    /// Unique job identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Originating source URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Identifier of the extraction plugin that owns this job.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Owning package.
    #[must_use]
    pub fn package(&self) -> &Arc<Package> {
        &self.package
    }

    /// Current display name.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.lock().map_or_else(|e| e.into_inner().clone(), |g| g.clone())
    }

    /// Replaces the display name (content-disposition rename).
    pub fn set_name(&self, name: impl Into<String>) {
        match self.name.lock() {
            Ok(mut guard) => *guard = name.into(),
            Err(poisoned) => *poisoned.into_inner() = name.into(),
        }
    }

    /// Expected or recorded byte size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Records the byte size (set from the transfer result, even on failure).
    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::SeqCst);
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status.lock().map_or_else(|e| *e.into_inner(), |g| *g)
    }

    /// Sets the status, returning the previous one.
    pub fn set_status(&self, status: JobStatus) -> JobStatus {
        match self.status.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, status),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), status),
        }
    }

    /// Last recorded error message, if any.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.error
            .lock()
            .map_or_else(|e| e.into_inner().clone(), |g| g.clone())
    }

    /// Records an error message.
    pub fn set_error(&self, message: impl Into<String>) {
        match self.error.lock() {
            Ok(mut guard) => *guard = Some(message.into()),
            Err(poisoned) => *poisoned.into_inner() = Some(message.into()),
        }
    }

    /// Scheduled resume instant; meaningful only while the job is waiting.
    #[must_use]
    pub fn wait_until(&self) -> Option<Instant> {
        self.wait_until.lock().map_or_else(|e| *e.into_inner(), |g| *g)
    }

    /// Sets or clears the scheduled resume instant.
    pub fn set_wait_until(&self, until: Option<Instant>) {
        match self.wait_until.lock() {
            Ok(mut guard) => *guard = until,
            Err(poisoned) => *poisoned.into_inner() = until,
        }
    }

    /// True once the external abort flag has been raised.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Raises the abort flag; observed at the next poll boundary.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Transfer progress in percent (0-100).
    #[must_use]
    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Updates transfer progress, clamped to 100.
    pub fn set_progress(&self, percent: u8) {
        self.progress.store(percent.min(100), Ordering::SeqCst);
    }
}

/// Process-wide cache of currently tracked jobs.
///
/// The duplicate guard is the only engine-side reader; writers are the
/// external scheduler adding and removing jobs as they enter and leave
/// workers. Read-mostly, so a concurrent map is enough.
#[derive(Debug, Default)]
pub struct JobCache {
    jobs: DashMap<u64, Arc<Job>>,
}

impl JobCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a job.
    pub fn insert(&self, job: Arc<Job>) {
        self.jobs.insert(job.id(), job);
    }

    /// Stops tracking a job.
    pub fn remove(&self, id: u64) {
        self.jobs.remove(&id);
    }

    /// Number of tracked jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// True when no jobs are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Snapshot of all tracked jobs.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Job>> {
        self.jobs.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}
