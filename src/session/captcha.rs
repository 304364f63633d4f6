//! Captcha arbitration: automatic solver vs. human-solving queue.
//!
//! The arbiter fetches the challenge image, persists it to a temporary
//! file for inspection and solver handoff, then either invokes a
//! registered automatic solver or parks a task on the human-solving
//! queue. Queue membership and the temporary image are both released by
//! RAII guards, so no exit path can leak them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::signal::JobSignal;
use crate::transport::FetchRequest;

use super::JobSession;

/// Poll interval while a task sits on the human queue.
const HUMAN_POLL: Duration = Duration::from_secs(1);

/// What kind of answer the captcha expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaResultKind {
    /// Text written on the image.
    Textual,
    /// A position the user must click.
    Positional,
}

/// A resolved captcha answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptchaResult {
    /// Transcribed text.
    Text(String),
    /// Click coordinates on the image.
    Position {
        /// Horizontal pixel offset.
        x: u32,
        /// Vertical pixel offset.
        y: u32,
    },
}

impl CaptchaResult {
    /// The text answer, if this is a textual result.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Position { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
enum TaskState {
    Waiting,
    Resolved(CaptchaResult),
    Errored(String),
    Expired,
}

/// Verdict the session reports back on a delivered answer, so the solver
/// side can learn from rejected transcriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaFeedback {
    /// The answer got the session past the challenge.
    Correct,
    /// The host rejected the answer.
    Invalid,
}

/// One challenge parked on the human-solving queue.
///
/// Created when a captcha must be solved, removed from the queue exactly
/// once regardless of outcome.
#[derive(Debug)]
pub struct CaptchaTask {
    image: Vec<u8>,
    format: String,
    path: PathBuf,
    kind: CaptchaResultKind,
    state: Mutex<TaskState>,
    feedback: Mutex<Option<CaptchaFeedback>>,
}

impl CaptchaTask {
    /// Creates a waiting task.
    #[must_use]
    pub fn new(
        image: Vec<u8>,
        format: impl Into<String>,
        path: PathBuf,
        kind: CaptchaResultKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            image,
            format: format.into(),
            path,
            kind,
            state: Mutex::new(TaskState::Waiting),
            feedback: Mutex::new(None),
        })
    }

    /// Raw image bytes.
    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Image format (file extension).
    #[must_use]
    pub fn format(&self) -> &str {
        &self.format
    }

    /// On-disk path of the persisted image.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Expected answer kind.
    #[must_use]
    pub fn kind(&self) -> CaptchaResultKind {
        self.kind
    }

    fn state(&self) -> TaskState {
        self.state
            .lock()
            .map_or_else(|e| e.into_inner().clone(), |g| g.clone())
    }

    fn set_state(&self, state: TaskState) {
        match self.state.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    /// True while no answer, error or expiry has been recorded.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(self.state(), TaskState::Waiting)
    }

    /// Records a successful answer.
    pub fn resolve(&self, result: CaptchaResult) {
        self.set_state(TaskState::Resolved(result));
    }

    /// Records a resolution error.
    pub fn fail_with(&self, message: impl Into<String>) {
        self.set_state(TaskState::Errored(message.into()));
    }

    /// Marks the task expired without an answer.
    pub fn expire(&self) {
        self.set_state(TaskState::Expired);
    }

    /// The recorded answer, if resolved.
    #[must_use]
    pub fn result(&self) -> Option<CaptchaResult> {
        match self.state() {
            TaskState::Resolved(result) => Some(result),
            _ => None,
        }
    }

    /// The recorded error message, if errored.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        match self.state() {
            TaskState::Errored(message) => Some(message),
            _ => None,
        }
    }

    /// Marks the delivered answer as accepted by the host.
    pub fn report_correct(&self) {
        self.set_feedback(CaptchaFeedback::Correct);
    }

    /// Marks the delivered answer as rejected by the host.
    pub fn report_invalid(&self) {
        self.set_feedback(CaptchaFeedback::Invalid);
    }

    /// The session's verdict on the delivered answer, once reported.
    #[must_use]
    pub fn feedback(&self) -> Option<CaptchaFeedback> {
        self.feedback
            .lock()
            .map_or_else(|e| *e.into_inner(), |g| *g)
    }

    fn set_feedback(&self, verdict: CaptchaFeedback) {
        match self.feedback.lock() {
            Ok(mut guard) => *guard = Some(verdict),
            Err(poisoned) => *poisoned.into_inner() = Some(verdict),
        }
    }
}

/// Human-solving queue collaborator.
pub trait CaptchaHub: Send + Sync {
    /// Parks a task for human resolution.
    fn enqueue(&self, task: &Arc<CaptchaTask>);

    /// Removes a task, whatever its state. Idempotent.
    fn dequeue(&self, task: &Arc<CaptchaTask>);
}

/// In-memory hub; the queue an operator UI would poll.
#[derive(Debug, Default)]
pub struct MemoryCaptchaHub {
    tasks: Mutex<Vec<Arc<CaptchaTask>>>,
}

impl MemoryCaptchaHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of parked tasks.
    #[must_use]
    pub fn pending(&self) -> Vec<Arc<CaptchaTask>> {
        self.tasks
            .lock()
            .map_or_else(|e| e.into_inner().clone(), |g| g.clone())
    }

    /// Number of parked tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    /// True when no tasks are parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when `task` is currently parked.
    #[must_use]
    pub fn contains(&self, task: &Arc<CaptchaTask>) -> bool {
        self.pending().iter().any(|t| Arc::ptr_eq(t, task))
    }
}

impl CaptchaHub for MemoryCaptchaHub {
    fn enqueue(&self, task: &Arc<CaptchaTask>) {
        match self.tasks.lock() {
            Ok(mut guard) => guard.push(Arc::clone(task)),
            Err(poisoned) => poisoned.into_inner().push(Arc::clone(task)),
        }
    }

    fn dequeue(&self, task: &Arc<CaptchaTask>) {
        let remove = |tasks: &mut Vec<Arc<CaptchaTask>>| {
            tasks.retain(|t| !Arc::ptr_eq(t, task));
        };
        match self.tasks.lock() {
            Ok(mut guard) => remove(&mut guard),
            Err(poisoned) => remove(&mut poisoned.into_inner()),
        }
    }
}

/// Automatic solver failure.
#[derive(Debug, Error)]
pub enum SolverError {
    /// The solver backend is not installed or not reachable.
    #[error("solver backend unavailable: {0}")]
    Unavailable(String),
    /// The solver ran but produced no usable answer.
    #[error("{0}")]
    Failed(String),
}

/// Automatic image-solving backend for one source.
pub trait AutoSolver: Send + Sync {
    /// True when the backend can actually run (binaries installed, etc.)
    fn is_available(&self) -> bool {
        true
    }

    /// Solves the persisted challenge image.
    ///
    /// # Errors
    ///
    /// Returns [`SolverError`] when the backend cannot produce an answer.
    fn solve(&self, image_path: &Path) -> Result<CaptchaResult, SolverError>;
}

/// Automatic solvers keyed by source id.
#[derive(Default)]
pub struct SolverRegistry {
    solvers: HashMap<String, Arc<dyn AutoSolver>>,
}

impl std::fmt::Debug for SolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverRegistry")
            .field("sources", &self.solvers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SolverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a solver for `source`.
    pub fn register(&mut self, source: impl Into<String>, solver: Arc<dyn AutoSolver>) {
        self.solvers.insert(source.into(), solver);
    }

    /// Looks up the solver registered for `source`.
    #[must_use]
    pub fn get(&self, source: &str) -> Option<Arc<dyn AutoSolver>> {
        self.solvers.get(source).map(Arc::clone)
    }
}

/// Removes the temporary captcha image on drop unless debug mode keeps it.
struct TempImageGuard {
    path: PathBuf,
    keep: bool,
}

impl Drop for TempImageGuard {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = std::fs::remove_file(&self.path) {
                debug!(path = %self.path.display(), error = %e, "temp captcha file not removed");
            }
        }
    }
}

/// Dequeues the task on drop; queue membership never outlives the call.
struct QueueMembership {
    hub: Arc<dyn CaptchaHub>,
    task: Arc<CaptchaTask>,
}

impl Drop for QueueMembership {
    fn drop(&mut self) {
        self.hub.dequeue(&self.task);
    }
}

/// Short identifier derived from the current time, used in temp filenames.
fn short_time_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let formatted = format!("{secs:.2}");
    let tail: String = formatted
        .chars()
        .rev()
        .take(6)
        .collect::<String>()
        .chars()
        .rev()
        .filter(|c| *c != '.')
        .collect();
    tail
}

impl JobSession {
    /// Obtains and resolves a captcha challenge.
    ///
    /// Fetches the image at `url`, persists it under the configured temp
    /// directory, then resolves it automatically when solving is enabled,
    /// a solver is registered for this source, it is available and
    /// `force_human` is false; otherwise parks a task on the human queue
    /// and polls it once a second.
    ///
    /// # Errors
    ///
    /// [`JobSignal::Abort`] when the abort flag rises mid-wait;
    /// [`JobSignal::Fail`] on fetch errors or resolution failure, with
    /// the message picked by precedence: solver-exists-but-no-backend,
    /// then the task's own error, then a timeout message.
    pub async fn solve_captcha(
        &mut self,
        url: &str,
        query: &[(String, String)],
        image_format: &str,
        kind: CaptchaResultKind,
        force_human: bool,
    ) -> Result<CaptchaResult, JobSignal> {
        let image_url = self.fix_url(url)?;
        let response = self
            .transport
            .fetch(FetchRequest {
                url: image_url,
                query: query.to_vec(),
                form: None,
                cookies: true,
                headers_only: false,
            })
            .await
            .map_err(|e| JobSignal::fail(e.to_string()))?;
        let image = response.body;

        let path = self.ctx.config.tmp_dir.join(format!(
            "tmpCaptcha_{}_{}.{}",
            self.job.source(),
            short_time_id(),
            image_format
        ));
        tokio::fs::write(&path, &image).await.map_err(|e| {
            JobSignal::fail(format!("cannot write captcha image {}: {e}", path.display()))
        })?;
        let _image_guard = TempImageGuard {
            path: path.clone(),
            keep: self.ctx.config.debug,
        };

        let has_auto = self.ctx.solvers.get(self.job.source()).is_some();
        let auto = if self.ctx.config.captcha_solving && !force_human {
            self.ctx
                .solvers
                .get(self.job.source())
                .filter(|s| s.is_available())
        } else {
            None
        };

        if let Some(solver) = auto {
            // Randomized delay breaks up burst patterns hosts look for.
            let delay: u64 = rand::thread_rng().gen_range(3000..=5000);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.ensure_not_aborted()?;

            let result = solver
                .solve(&path)
                .map_err(|e| JobSignal::fail(e.to_string()))?;
            debug!(job = self.job.id(), "automatic captcha result obtained");
            return Ok(result);
        }

        let task = CaptchaTask::new(image, image_format, path.clone(), kind);
        self.last_captcha_task = Some(Arc::clone(&task));
        self.ctx.captcha_hub.enqueue(&task);
        let _membership = QueueMembership {
            hub: Arc::clone(&self.ctx.captcha_hub),
            task: Arc::clone(&task),
        };
        info!(job = self.job.id(), "captcha task parked for human resolution");

        while task.is_waiting() {
            if self.job.is_aborted() {
                return Err(JobSignal::Abort);
            }
            tokio::time::sleep(HUMAN_POLL).await;
        }

        if let Some(error) = task.error() {
            if has_auto {
                warn!(job = self.job.id(), error = %error, "solver registered but unusable");
                return Err(JobSignal::fail(
                    "No captcha solving backend installed and no human solver connected",
                ));
            }
            return Err(JobSignal::fail(error));
        }

        let Some(result) = task.result() else {
            return Err(JobSignal::fail(
                "No captcha result obtained in appropriate time",
            ));
        };
        debug!(job = self.job.id(), "human captcha result obtained");
        Ok(result)
    }

    /// Reports the last human-solved answer as rejected by the host.
    ///
    /// No-op when no task is held, so extraction logic can call it
    /// unconditionally on a failed submission.
    pub fn invalid_captcha(&self) {
        if let Some(task) = &self.last_captcha_task {
            debug!(job = self.job.id(), "captcha answer reported invalid");
            task.report_invalid();
        }
    }

    /// Reports the last human-solved answer as accepted by the host.
    ///
    /// Called implicitly once a download starts, since getting that far
    /// means the challenge was passed.
    pub fn correct_captcha(&self) {
        if let Some(task) = &self.last_captcha_task {
            debug!(job = self.job.id(), "captcha answer confirmed");
            task.report_correct();
        }
    }
}
