//! Retry controller: bounded restarts of the extraction entry point.
//!
//! Each distinct retry point in the extraction logic passes its own stable
//! site identifier, giving it an independent attempt budget in the
//! session-local ledger. The ledger lives and dies with the session, so a
//! fresh job attempt starts counting from zero.

use tracing::{debug, warn};

use crate::signal::JobSignal;

use super::JobSession;

/// Default message when a retry budget is exhausted without a reason.
const MAX_RETRIES_REACHED: &str = "Max retries reached";

impl JobSession {
    /// Requests a restart of the `process` entry point.
    ///
    /// `max_tries = 0` means unlimited. Before the budget for `site_id`
    /// runs out, this waits `wait_seconds` (reconnection forced off),
    /// increments the counter, and unwinds with [`JobSignal::Retry`]; all
    /// job-local progress except the ledger and the job fields is
    /// discarded by the restart. Once the budget is exhausted the job
    /// fails terminally with `reason` or a default message.
    ///
    /// # Errors
    ///
    /// Never returns `Ok`: [`JobSignal::Retry`] on a granted restart,
    /// [`JobSignal::Fail`] on exhaustion, [`JobSignal::Abort`] if the
    /// abort flag rises during the backoff wait.
    pub async fn retry(
        &mut self,
        site_id: &str,
        max_tries: u32,
        wait_seconds: u64,
        reason: &str,
    ) -> Result<(), JobSignal> {
        let attempts = self.retries.get(site_id).copied().unwrap_or(0);

        if max_tries > 0 && attempts >= max_tries {
            warn!(
                job = self.job.id(),
                site_id, attempts, max_tries, "retry budget exhausted"
            );
            let message = if reason.is_empty() {
                MAX_RETRIES_REACHED
            } else {
                reason
            };
            return Err(JobSignal::fail(message));
        }

        self.wait_no_reconnect(wait_seconds).await?;

        let counter = self.retries.entry(site_id.to_string()).or_insert(0);
        *counter += 1;
        debug!(
            job = self.job.id(),
            site_id,
            attempt = *counter,
            "restarting process"
        );
        Err(JobSignal::retry(reason))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testutil::{TestHarness, TransportScript};

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_after_max_tries() {
        let harness = TestHarness::new(TransportScript::default());
        let mut session = harness.session();

        // maxTries=2: first and second calls grant a restart.
        for _ in 0..2 {
            let signal = session.retry("captcha", 2, 1, "wrong captcha").await.unwrap_err();
            assert!(matches!(signal, JobSignal::Retry { .. }));
        }

        // Third call fails terminally with the configured reason.
        let signal = session.retry("captcha", 2, 1, "wrong captcha").await.unwrap_err();
        assert_eq!(signal, JobSignal::fail("wrong captcha"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_uses_default_message_without_reason() {
        let harness = TestHarness::new(TransportScript::default());
        let mut session = harness.session();

        let _ = session.retry("site", 1, 1, "").await;
        let signal = session.retry("site", 1, 1, "").await.unwrap_err();
        assert_eq!(signal, JobSignal::fail("Max retries reached"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_sites_have_independent_budgets() {
        let harness = TestHarness::new(TransportScript::default());
        let mut session = harness.session();

        let _ = session.retry("form", 1, 1, "a").await;
        let exhausted = session.retry("form", 1, 1, "a").await.unwrap_err();
        assert!(matches!(exhausted, JobSignal::Fail { .. }));

        // A different site is unaffected by the first site's counter.
        let fresh = session.retry("link", 1, 1, "b").await.unwrap_err();
        assert!(matches!(fresh, JobSignal::Retry { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_tries_is_unlimited() {
        let harness = TestHarness::new(TransportScript::default());
        let mut session = harness.session();

        for _ in 0..10 {
            let signal = session.retry("poll", 0, 1, "still processing").await.unwrap_err();
            assert!(matches!(signal, JobSignal::Retry { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_backoff_wins() {
        let harness = TestHarness::new(TransportScript::default());
        harness.job.request_abort();
        let mut session = harness.session();

        let signal = session.retry("site", 3, 30, "x").await.unwrap_err();
        assert_eq!(signal, JobSignal::Abort);
    }
}
