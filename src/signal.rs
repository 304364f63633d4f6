//! Cancellation outcomes unwound from a job to the external scheduler.
//!
//! The original engine design distinguishes five cancellation-style exits
//! from a running job. None of them is swallowed internally: every engine
//! operation returns `Result<T, JobSignal>` and the signal travels up the
//! call chain via `?` until the scheduler decides what to do with the job.

use thiserror::Error;

/// Sub-classification of a terminal [`JobSignal::Fail`].
///
/// The scheduler may deprioritize and re-queue `TempOffline` failures at a
/// higher level; `Offline` and `Generic` are final for this job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    /// The source no longer serves this file.
    Offline,
    /// The source is temporarily unreachable or rejecting requests.
    TempOffline,
    /// Any other unrecoverable failure.
    Generic,
}

/// Cancellation outcome of a job operation.
///
/// These replace exception-based unwinding in the original design with an
/// explicit discriminated type threaded through the job-execution call
/// chain. Cancellation is cooperative: signals are produced only at poll
/// boundaries and before network operations, never preemptively.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobSignal {
    /// Cooperative stop, externally or internally triggered. No further retry.
    #[error("job aborted")]
    Abort,

    /// Job-initiated restart of the `process` entry point. Bounded by the
    /// retry controller; not a failure by itself.
    #[error("job restarting: {reason}")]
    Retry {
        /// Why the job asked to restart.
        reason: String,
    },

    /// Request for a new network identity before resuming. Raised only for
    /// jobs not bound to an account.
    #[error("reconnect requested")]
    Reconnect,

    /// Non-error terminal outcome: duplicate or pre-existing artifact.
    #[error("job skipped: {reason}")]
    Skip {
        /// Human-readable reason for skipping.
        reason: String,
    },

    /// Terminal unrecoverable outcome.
    #[error("{message}")]
    Fail {
        /// Failure sub-classification.
        kind: FailKind,
        /// Human-readable failure message.
        message: String,
    },
}

impl JobSignal {
    /// Creates a generic terminal failure.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            kind: FailKind::Generic,
            message: message.into(),
        }
    }

    /// Creates a "source offline" terminal failure.
    pub fn offline(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Fail {
            kind: FailKind::Offline,
            message: if message.is_empty() {
                "offline".to_string()
            } else {
                message
            },
        }
    }

    /// Creates a "temporarily offline" terminal failure.
    pub fn temp_offline(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Fail {
            kind: FailKind::TempOffline,
            message: if message.is_empty() {
                "temporarily offline".to_string()
            } else {
                message
            },
        }
    }

    /// Creates a skip outcome with a reason.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip {
            reason: reason.into(),
        }
    }

    /// Creates a retry outcome with a reason.
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            reason: reason.into(),
        }
    }

    /// Returns true for outcomes that end the job attempt for good
    /// (everything except [`JobSignal::Retry`] and [`JobSignal::Reconnect`]).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Abort | Self::Skip { .. } | Self::Fail { .. })
    }
}
