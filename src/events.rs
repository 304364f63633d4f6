//! Fire-and-forget event notification.

use crate::job::Job;

/// External event collaborator.
///
/// Notifications are fire-and-forget: the engine never waits on a sink
/// and sink failures must stay inside the implementation.
pub trait EventSink: Send + Sync {
    /// Emits a named event for a job.
    ///
    /// `payload` carries event-specific key/value details, such as the
    /// source URL and destination path of a starting download.
    fn notify(&self, event: &str, job: &Job, payload: &[(&str, &str)]);
}

/// Sink that drops all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn notify(&self, _event: &str, _job: &Job, _payload: &[(&str, &str)]) {}
}
