//! Wait gate: interruptible, cooperative sleep.
//!
//! Used for scheduled delays, reconnection windows and retry backoff. The
//! gate polls at fixed 1 s ticks, so cancellation is observed with at most
//! one tick of latency; there is no busy-spinning and no preemption.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::job::JobStatus;
use crate::signal::JobSignal;

use super::JobSession;

/// Poll interval of the wait loop.
const TICK: Duration = Duration::from_secs(1);

/// Process-wide request to rotate the outbound network identity.
///
/// Set by the external reconnection manager; observed only by sessions
/// without an account, whose network identity is not fixed.
#[derive(Debug, Default)]
pub struct ReconnectSignal {
    flag: AtomicBool,
}

impl ReconnectSignal {
    /// Creates an unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Clears the signal.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// True while the signal is raised.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl JobSession {
    /// Schedules a wait of at least `seconds` and marks the job waiting.
    ///
    /// The resume instant gets one extra second of slack, so it always
    /// lies strictly in the future at the moment the status flips.
    pub fn schedule_wait(&mut self, seconds: u64) {
        let wait_time = seconds.max(1);
        let until = Instant::now() + Duration::from_secs(wait_time + 1);
        debug!(job = self.job.id(), wait_secs = wait_time, "scheduling wait");

        self.job.set_wait_until(Some(until));
        let previous = self.job.set_status(JobStatus::Waiting);
        if self.status_before_wait.is_none() {
            self.status_before_wait = Some(previous);
        }
    }

    /// Flags whether a reconnect would shorten the current wait.
    pub fn set_reconnect(&mut self, reconnect: bool) {
        debug!(
            job = self.job.id(),
            reconnect,
            previous = self.wants_reconnect,
            "setting wants_reconnect"
        );
        self.wants_reconnect = reconnect;
    }

    /// True when a reconnect would shorten the current wait; sampled by
    /// the external reconnection manager before rotating the identity.
    #[must_use]
    pub fn wants_reconnect(&self) -> bool {
        self.wants_reconnect
    }

    /// Blocks until the scheduled resume time elapses or a cancellation
    /// fires, then restores the status held before waiting began.
    ///
    /// # Errors
    ///
    /// [`JobSignal::Abort`] when the job's abort flag rises at any tick;
    /// [`JobSignal::Reconnect`] when the process-wide reconnection signal
    /// is observed (account-less sessions only).
    pub async fn wait(&mut self) -> Result<(), JobSignal> {
        self.wait_gate(true).await
    }

    /// Convenience: [`schedule_wait`](Self::schedule_wait) then
    /// [`wait`](Self::wait).
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait).
    pub async fn wait_for(&mut self, seconds: u64) -> Result<(), JobSignal> {
        self.schedule_wait(seconds);
        self.wait().await
    }

    /// Waits with reconnection forced off for the duration; used by the
    /// retry controller so backoff never turns into identity rotation.
    ///
    /// # Errors
    ///
    /// [`JobSignal::Abort`] when the abort flag rises.
    pub(super) async fn wait_no_reconnect(&mut self, seconds: u64) -> Result<(), JobSignal> {
        self.wants_reconnect = false;
        self.schedule_wait(seconds);
        self.wait_gate(false).await
    }

    async fn wait_gate(&mut self, reconnect_eligible: bool) -> Result<(), JobSignal> {
        let eligible = reconnect_eligible && self.account_user.is_none();
        if let Some(until) = self.job.wait_until() {
            info!(
                job = self.job.id(),
                remaining_secs = until.saturating_duration_since(Instant::now()).as_secs(),
                reconnect_eligible = eligible,
                "waiting"
            );
        }

        let mut tick: u64 = 0;
        loop {
            let Some(until) = self.job.wait_until() else {
                break;
            };
            if Instant::now() >= until {
                break;
            }

            if self.job.is_aborted() {
                self.status_before_wait = None;
                return Err(JobSignal::Abort);
            }

            // The shared signal is sampled every second tick (2 s).
            if eligible && tick % 2 == 0 && self.ctx.reconnect.is_set() {
                self.wants_reconnect = false;
                self.status_before_wait = None;
                self.job.set_wait_until(None);
                return Err(JobSignal::Reconnect);
            }

            tokio::time::sleep(TICK).await;
            tick += 1;
        }

        self.job.set_wait_until(None);
        let prior = self.status_before_wait.take().unwrap_or(JobStatus::Starting);
        self.job.set_status(prior);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::account::{AccountBroker, AccountInfo, TrafficLeft};
    use crate::testutil::{TestHarness, TransportScript};
    use std::collections::HashMap;
    use std::sync::Arc;

    struct AnyAccount;

    impl AccountBroker for AnyAccount {
        fn can_use(&self) -> bool {
            true
        }
        fn select(&self) -> (String, HashMap<String, String>) {
            ("bob".to_string(), HashMap::new())
        }
        fn is_premium(&self, _user: &str) -> bool {
            false
        }
        fn check_login(&self, _user: &str) -> Result<(), String> {
            Ok(())
        }
        fn account_info(&self, _user: &str, _refresh: bool) -> AccountInfo {
            AccountInfo {
                traffic_left: TrafficLeft::Unlimited,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_wait_sets_future_resume_time() {
        let harness = TestHarness::new(TransportScript::default());
        let mut session = harness.session();
        let before = Instant::now();
        session.schedule_wait(5);
        let until = harness.job.wait_until().unwrap();
        assert!(until >= before + Duration::from_secs(5));
        assert_eq!(harness.job.status(), JobStatus::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_does_not_return_early_and_restores_status() {
        let harness = TestHarness::new(TransportScript::default());
        harness.job.set_status(JobStatus::Starting);
        let mut session = harness.session();

        let start = Instant::now();
        session.wait_for(5).await.unwrap();
        assert!(Instant::now() - start >= Duration::from_secs(5));
        assert_eq!(harness.job.status(), JobStatus::Starting);
        assert!(harness.job.wait_until().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_wait_is_one_second() {
        let harness = TestHarness::new(TransportScript::default());
        let mut session = harness.session();
        let start = Instant::now();
        session.wait_for(0).await.unwrap();
        assert!(Instant::now() - start >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_flag_cancels_wait() {
        let harness = TestHarness::new(TransportScript::default());
        harness.job.request_abort();
        let mut session = harness.session();
        let signal = session.wait_for(600).await.unwrap_err();
        assert_eq!(signal, JobSignal::Abort);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_signal_cancels_wait_and_clears_state() {
        let harness = TestHarness::new(TransportScript::default());
        harness.ctx().reconnect.set();
        let mut session = harness.session();
        session.set_reconnect(true);

        let signal = session.wait_for(600).await.unwrap_err();
        assert_eq!(signal, JobSignal::Reconnect);
        assert!(!session.wants_reconnect);
        assert!(harness.job.wait_until().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_does_not_pin_stale_status() {
        let harness = TestHarness::new(TransportScript::default());
        harness.ctx().reconnect.set();
        harness.job.set_status(JobStatus::Starting);
        let mut session = harness.session();
        session.set_reconnect(true);

        let signal = session.wait_for(600).await.unwrap_err();
        assert_eq!(signal, JobSignal::Reconnect);

        // The next wait must restore the status held when it began, not
        // the one recorded before the cancelled wait.
        harness.ctx().reconnect.clear();
        harness.job.set_status(JobStatus::Downloading);
        session.wait_for(2).await.unwrap();
        assert_eq!(harness.job.status(), JobStatus::Downloading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wants_reconnect_is_observable() {
        let harness = TestHarness::new(TransportScript::default());
        let mut session = harness.session();
        assert!(!session.wants_reconnect());
        session.set_reconnect(true);
        assert!(session.wants_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_bound_session_ignores_reconnect() {
        let mut harness = TestHarness::new(TransportScript::default());
        harness.set_accounts(Arc::new(AnyAccount));
        harness.ctx().reconnect.set();
        let mut session = harness.session();

        // Completes normally despite the raised signal.
        session.wait_for(3).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_no_reconnect_ignores_signal() {
        let harness = TestHarness::new(TransportScript::default());
        harness.ctx().reconnect.set();
        let mut session = harness.session();
        session.set_reconnect(true);

        session.wait_no_reconnect(3).await.unwrap();
        assert!(!session.wants_reconnect);
    }
}
