//! Per-job engine instance.
//!
//! The external scheduler builds one [`JobSession`] per job attempt and
//! calls [`JobSession::run`] with the host-specific [`Extractor`]. The
//! extraction callback then drives the session's operations - waiting,
//! retrying, captcha resolution, downloading, verification, duplicate
//! checks - in whatever order its host requires. All operations take
//! `&mut self`: within one job they execute strictly sequentially.

mod captcha;
mod direct;
mod download;
mod duplicates;
mod retry;
mod verify;
mod wait;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use url::Url;

use crate::account::{AccountBroker, NoAccounts};
use crate::config::EngineConfig;
use crate::events::{EventSink, NullEventSink};
use crate::job::{Job, JobCache, JobStatus};
use crate::signal::JobSignal;
use crate::transport::NetworkTransport;

pub use captcha::{
    AutoSolver, CaptchaFeedback, CaptchaHub, CaptchaResult, CaptchaResultKind, CaptchaTask,
    MemoryCaptchaHub, SolverError, SolverRegistry,
};
pub use download::DownloadOptions;
pub use duplicates::{DuplicateIndex, DuplicateRecord, NullDuplicateIndex};
pub use verify::VerificationRule;
pub use wait::ReconnectSignal;

/// Host-specific extraction logic.
///
/// Implementations parse a particular host's pages to discover the final
/// download URL and call back into the session for everything else. The
/// engine treats them as interchangeable.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Stable identifier of this source, used for captcha solver lookup
    /// and temporary file naming.
    fn source_id(&self) -> &str;

    /// Plugin-specific ceiling on parallel chunks; 0 means no ceiling.
    fn chunk_ceiling(&self) -> u32 {
        1
    }

    /// Whether transfers from this host may resume partial data.
    fn resumable(&self) -> bool {
        false
    }

    /// The main entry point, re-invoked from the beginning after a
    /// [`JobSignal::Retry`].
    async fn process(&self, session: &mut JobSession) -> Result<(), JobSignal>;
}

/// Injected collaborator bundle shared by all sessions.
///
/// Everything the original design reached for via process-wide singletons
/// is an explicit field here, so tests can supply fakes without global
/// state.
pub struct EngineContext {
    /// Engine configuration.
    pub config: EngineConfig,
    /// Account subsystem.
    pub accounts: Arc<dyn AccountBroker>,
    /// Event notification sink.
    pub events: Arc<dyn EventSink>,
    /// Human captcha-solving queue.
    pub captcha_hub: Arc<dyn CaptchaHub>,
    /// Automatic captcha solvers keyed by source id.
    pub solvers: SolverRegistry,
    /// Persistent duplicate index.
    pub duplicates: Arc<dyn DuplicateIndex>,
    /// Cache of currently tracked jobs.
    pub jobs: Arc<JobCache>,
    /// Process-wide reconnection signal.
    pub reconnect: Arc<ReconnectSignal>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("tracked_jobs", &self.jobs.len())
            .finish()
    }
}

impl EngineContext {
    /// Creates a context with null collaborators; callers replace the
    /// fields they need before sharing the context.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            accounts: Arc::new(NoAccounts),
            events: Arc::new(NullEventSink),
            captcha_hub: Arc::new(MemoryCaptchaHub::new()),
            solvers: SolverRegistry::new(),
            duplicates: Arc::new(NullDuplicateIndex),
            jobs: Arc::new(JobCache::new()),
            reconnect: Arc::new(ReconnectSignal::new()),
        }
    }
}

/// One engine instance for one job attempt.
pub struct JobSession {
    ctx: Arc<EngineContext>,
    job: Arc<Job>,
    transport: Arc<dyn NetworkTransport>,

    account_user: Option<String>,
    premium: bool,
    unlimited_chunks: bool,
    chunk_ceiling: u32,
    resume_download: bool,

    wants_reconnect: bool,
    status_before_wait: Option<JobStatus>,

    /// Attempt counts per retry site, discarded with the session.
    retries: HashMap<String, u32>,

    /// Last task parked on the human queue, kept for answer feedback.
    last_captcha_task: Option<Arc<CaptchaTask>>,

    /// Path of the last successful download, consumed by verification.
    last_download: Option<PathBuf>,
    /// Text matched by the last pattern rule during verification.
    last_check: Option<String>,
}

impl std::fmt::Debug for JobSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSession")
            .field("job", &self.job.id())
            .field("account_user", &self.account_user)
            .field("premium", &self.premium)
            .finish()
    }
}

impl JobSession {
    /// Creates a session for `job`, selecting an account when one is
    /// usable. Account-bound sessions get the unlimited chunk override,
    /// resumable transfers, and lose reconnect eligibility.
    #[must_use]
    pub fn new(
        ctx: Arc<EngineContext>,
        job: Arc<Job>,
        transport: Arc<dyn NetworkTransport>,
    ) -> Self {
        let mut session = Self {
            ctx,
            job,
            transport,
            account_user: None,
            premium: false,
            unlimited_chunks: false,
            chunk_ceiling: 1,
            resume_download: false,
            wants_reconnect: false,
            status_before_wait: None,
            retries: HashMap::new(),
            last_captcha_task: None,
            last_download: None,
            last_check: None,
        };

        if session.ctx.accounts.can_use() {
            let (user, _credentials) = session.ctx.accounts.select();
            session.premium = session.ctx.accounts.is_premium(&user);
            debug!(user = %user, premium = session.premium, "account selected");
            session.account_user = Some(user);
            session.unlimited_chunks = true;
            session.resume_download = true;
        }

        session
    }

    /// Runs the preprocess -> process entry sequence for one attempt.
    ///
    /// # Errors
    ///
    /// Unwinds any [`JobSignal`] produced by preprocessing or by the
    /// extraction logic.
    #[instrument(skip(self, extractor), fields(job = self.job.id(), source = extractor.source_id()))]
    pub async fn run(&mut self, extractor: &dyn Extractor) -> Result<(), JobSignal> {
        self.preprocess(extractor)?;
        extractor.process(self).await
    }

    fn preprocess(&mut self, extractor: &dyn Extractor) -> Result<(), JobSignal> {
        if let Some(user) = self.account_user.clone() {
            self.ctx.accounts.check_login(&user).map_err(JobSignal::fail)?;
        } else {
            self.transport.clear_cookies();
            self.chunk_ceiling = extractor.chunk_ceiling();
            self.resume_download = extractor.resumable();
        }

        self.job.set_status(JobStatus::Starting);
        Ok(())
    }

    /// The job this session drives.
    #[must_use]
    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    /// The shared collaborator bundle.
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// True when this session runs under an account.
    #[must_use]
    pub fn account_bound(&self) -> bool {
        self.account_user.is_some()
    }

    /// True when the selected account is premium.
    #[must_use]
    pub fn premium(&self) -> bool {
        self.premium
    }

    /// Path of the most recent successful download, if any.
    #[must_use]
    pub fn last_download(&self) -> Option<&PathBuf> {
        self.last_download.as_ref()
    }

    /// Text matched by the last pattern verification rule, if any.
    #[must_use]
    pub fn last_check(&self) -> Option<&str> {
        self.last_check.as_deref()
    }

    /// Password the user attached to the owning package, if any.
    #[must_use]
    pub fn package_password(&self) -> String {
        self.job
            .package()
            .password
            .clone()
            .unwrap_or_default()
    }

    /// Errors with [`JobSignal::Abort`] once the external abort flag is up.
    pub fn ensure_not_aborted(&self) -> Result<(), JobSignal> {
        if self.job.is_aborted() {
            Err(JobSignal::Abort)
        } else {
            Ok(())
        }
    }

    /// Resolves a possibly relative URL against the job URL's scheme and
    /// host.
    ///
    /// # Errors
    ///
    /// Fails the job when the URL is empty or the job URL itself cannot
    /// serve as a base.
    pub fn fix_url(&self, raw: &str) -> Result<String, JobSignal> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(JobSignal::fail("No url given"));
        }
        if Url::parse(trimmed).is_ok() {
            return Ok(trimmed.to_string());
        }

        let mut base = Url::parse(self.job.url())
            .map_err(|_| JobSignal::fail(format!("invalid job URL: {}", self.job.url())))?;
        base.set_path("/");
        base.set_query(None);
        base.set_fragment(None);
        base.join(trimmed)
            .map(String::from)
            .map_err(|_| JobSignal::fail(format!("cannot resolve URL: {raw}")))
    }

    /// True when the account's remaining traffic covers the job size.
    /// Sessions without an account always pass.
    #[must_use]
    pub fn check_traffic_left(&self) -> bool {
        let Some(user) = &self.account_user else {
            return true;
        };
        let info = self.ctx.accounts.account_info(user, true);
        info!(
            user = %user,
            size_kib = self.job.size() / 1024,
            traffic = ?info.traffic_left,
            "checking traffic quota"
        );
        info.traffic_left.allows(self.job.size())
    }

    /// Drops the selected account and restarts the attempt without it.
    ///
    /// # Errors
    ///
    /// Always errors with [`JobSignal::Retry`] (or the signals its wait
    /// can produce).
    pub async fn reset_account(&mut self) -> Result<(), JobSignal> {
        info!(job = self.job.id(), "dropping account and retrying");
        self.account_user = None;
        self.premium = false;
        self.unlimited_chunks = false;
        self.resume_download = false;
        self.retry("account-reset", 5, 1, "account reset").await
    }

    /// Effective chunk count for the next transfer: the configured global
    /// default, capped by the plugin ceiling unless the session holds the
    /// unlimited override.
    fn chunk_count(&self) -> u32 {
        let global = self.ctx.config.chunk_count.max(1);
        if self.unlimited_chunks || self.chunk_ceiling == 0 {
            global
        } else {
            global.min(self.chunk_ceiling)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::account::{AccountInfo, TrafficLeft};
    use crate::testutil::{TestHarness, TransportScript};

    struct PremiumBroker {
        traffic: TrafficLeft,
    }

    impl AccountBroker for PremiumBroker {
        fn can_use(&self) -> bool {
            true
        }
        fn select(&self) -> (String, HashMap<String, String>) {
            ("alice".to_string(), HashMap::new())
        }
        fn is_premium(&self, _user: &str) -> bool {
            true
        }
        fn check_login(&self, _user: &str) -> Result<(), String> {
            Ok(())
        }
        fn account_info(&self, _user: &str, _refresh: bool) -> AccountInfo {
            AccountInfo {
                traffic_left: self.traffic,
            }
        }
    }

    struct NoopExtractor;

    #[async_trait]
    impl Extractor for NoopExtractor {
        fn source_id(&self) -> &str {
            "Noop"
        }
        fn chunk_ceiling(&self) -> u32 {
            2
        }
        fn resumable(&self) -> bool {
            true
        }
        async fn process(&self, session: &mut JobSession) -> Result<(), JobSignal> {
            session.job().set_status(JobStatus::Finished);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_sets_starting_then_invokes_process() {
        let harness = TestHarness::new(TransportScript::default());
        let mut session = harness.session();
        session.run(&NoopExtractor).await.unwrap();
        assert_eq!(harness.job.status(), JobStatus::Finished);
    }

    #[tokio::test]
    async fn test_plugin_limits_applied_without_account() {
        let harness = TestHarness::new(TransportScript::default());
        let mut session = harness.session();
        session.run(&NoopExtractor).await.unwrap();
        assert_eq!(session.chunk_ceiling, 2);
        assert!(session.resume_download);
        assert!(!session.account_bound());
    }

    #[tokio::test]
    async fn test_account_session_gets_overrides() {
        let mut harness = TestHarness::new(TransportScript::default());
        harness.set_accounts(Arc::new(PremiumBroker {
            traffic: TrafficLeft::Unlimited,
        }));
        let mut session = harness.session();
        assert!(session.account_bound());
        assert!(session.premium());
        assert!(session.unlimited_chunks);
        assert!(session.resume_download);

        // Plugin limits must not shadow the account override.
        session.run(&NoopExtractor).await.unwrap();
        assert!(session.unlimited_chunks);
        let global = harness.ctx().config.chunk_count;
        assert_eq!(session.chunk_count(), global);
    }

    #[tokio::test]
    async fn test_chunk_count_caps_at_plugin_ceiling() {
        let harness = TestHarness::new(TransportScript::default());
        let mut session = harness.session();
        session.chunk_ceiling = 1;
        assert_eq!(session.chunk_count(), 1);
        session.chunk_ceiling = 0; // no plugin cap
        assert_eq!(session.chunk_count(), harness.ctx().config.chunk_count);
    }

    #[tokio::test]
    async fn test_fix_url_resolves_relative_against_job_origin() {
        let harness = TestHarness::new(TransportScript::default());
        let session = harness.session();
        // harness jobs live at https://files.example.com/get/42
        let fixed = session.fix_url("/dl/abc.bin").unwrap();
        assert_eq!(fixed, "https://files.example.com/dl/abc.bin");

        let absolute = session.fix_url("https://other.example.com/x").unwrap();
        assert_eq!(absolute, "https://other.example.com/x");

        assert!(session.fix_url("   ").is_err());
    }

    #[tokio::test]
    async fn test_check_traffic_left() {
        let mut harness = TestHarness::new(TransportScript::default());
        harness.set_accounts(Arc::new(PremiumBroker {
            traffic: TrafficLeft::KiB(1),
        }));
        let session = harness.session();
        harness.job.set_size(10 * 1024);
        assert!(!session.check_traffic_left());
        harness.job.set_size(1024);
        assert!(session.check_traffic_left());
    }

    #[tokio::test]
    async fn test_package_password_defaults_to_empty() {
        let harness = TestHarness::new(TransportScript::default());
        let session = harness.session();
        assert_eq!(session.package_password(), "");

        let package = Arc::new(crate::job::Package {
            folder: "pkg".to_string(),
            password: Some("hunter2".to_string()),
        });
        let job = Arc::new(crate::job::Job::new(
            9,
            "https://files.example.com/get/9",
            "b.bin",
            0,
            "TestSource",
            package,
        ));
        let session = JobSession::new(
            Arc::clone(harness.ctx()),
            job,
            Arc::clone(&harness.transport) as Arc<dyn crate::transport::NetworkTransport>,
        );
        assert_eq!(session.package_password(), "hunter2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_account_raises_retry() {
        let mut harness = TestHarness::new(TransportScript::default());
        harness.set_accounts(Arc::new(PremiumBroker {
            traffic: TrafficLeft::Unlimited,
        }));
        let mut session = harness.session();
        let signal = session.reset_account().await.unwrap_err();
        assert!(matches!(signal, JobSignal::Retry { .. }));
        assert!(!session.account_bound());
        assert!(!session.unlimited_chunks);
    }
}
