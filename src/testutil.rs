//! Shared test fixtures: a scripted transport and a ready-made engine
//! context pointing at throwaway directories.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::account::AccountBroker;
use crate::config::EngineConfig;
use crate::job::{Job, Package};
use crate::session::{
    AutoSolver, CaptchaHub, DuplicateIndex, EngineContext, JobSession, MemoryCaptchaHub,
};
use crate::transport::{
    ChunkedFetchRequest, ChunkedTransfer, FetchRequest, FetchResponse, Headers, NetworkTransport,
    TransportError,
};

/// Builds a bodyless response with the given headers.
pub(crate) fn header_response(status: u16, headers: &[(&str, &str)]) -> FetchResponse {
    let mut folded = Headers::new();
    for (name, value) in headers {
        folded.push(*name, *value);
    }
    FetchResponse {
        status,
        headers: folded,
        body: Vec::new(),
    }
}

/// Builds a header-less response carrying `body`.
pub(crate) fn body_response(status: u16, body: &[u8]) -> FetchResponse {
    FetchResponse {
        status,
        headers: Headers::new(),
        body: body.to_vec(),
    }
}

/// One scripted chunked transfer.
pub(crate) enum ChunkedScript {
    /// Succeed, writing `body` to the destination.
    Write {
        body: Vec<u8>,
        disposition: Option<String>,
    },
    /// Fail after reporting `bytes` transferred.
    FailAfter { bytes: u64 },
}

/// Scripted transport behavior, consumed in order.
#[derive(Default)]
pub(crate) struct TransportScript {
    pub fetches: Vec<Result<FetchResponse, TransportError>>,
    pub chunked: Vec<ChunkedScript>,
}

/// Transport double that replays a [`TransportScript`].
pub(crate) struct MockTransport {
    fetches: Mutex<VecDeque<Result<FetchResponse, TransportError>>>,
    chunked: Mutex<VecDeque<ChunkedScript>>,
    transferred: AtomicU64,
    fetch_log: Mutex<Vec<FetchRequest>>,
    chunked_log: Mutex<Vec<String>>,
}

impl MockTransport {
    fn new(script: TransportScript) -> Self {
        Self {
            fetches: Mutex::new(script.fetches.into_iter().collect()),
            chunked: Mutex::new(script.chunked.into_iter().collect()),
            transferred: AtomicU64::new(0),
            fetch_log: Mutex::new(Vec::new()),
            chunked_log: Mutex::new(Vec::new()),
        }
    }

    /// All plain fetch requests seen, in order.
    pub(crate) fn fetch_requests(&self) -> Vec<FetchRequest> {
        self.fetch_log.lock().unwrap().clone()
    }

    /// URLs of all chunked transfers seen, in order.
    pub(crate) fn chunked_urls(&self) -> Vec<String> {
        self.chunked_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkTransport for MockTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        self.fetch_log.lock().unwrap().push(request.clone());
        self.fetches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::http_status(request.url, 599)))
    }

    async fn chunked_fetch(
        &self,
        request: ChunkedFetchRequest,
    ) -> Result<ChunkedTransfer, TransportError> {
        self.chunked_log.lock().unwrap().push(request.url.clone());
        let script = self.chunked.lock().unwrap().pop_front();
        match script {
            Some(ChunkedScript::Write { body, disposition }) => {
                std::fs::write(&request.dest, &body)
                    .map_err(|e| TransportError::io(request.dest.clone(), e))?;
                let len = body.len() as u64;
                self.transferred.store(len, Ordering::SeqCst);
                if let Some(progress) = &request.progress {
                    progress(len, Some(len));
                }
                Ok(ChunkedTransfer {
                    disposition_name: if request.honor_disposition {
                        disposition
                    } else {
                        None
                    },
                })
            }
            Some(ChunkedScript::FailAfter { bytes }) => {
                self.transferred.store(bytes, Ordering::SeqCst);
                Err(TransportError::io(
                    request.dest,
                    std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset"),
                ))
            }
            None => Err(TransportError::io(
                request.dest,
                std::io::Error::other("no scripted transfer"),
            )),
        }
    }

    fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }
}

/// A job, context and scripted transport wired together over temp dirs.
pub(crate) struct TestHarness {
    #[allow(dead_code)]
    tmp: tempfile::TempDir,
    ctx: Arc<EngineContext>,
    pub job: Arc<Job>,
    pub transport: Arc<MockTransport>,
    pub memory_hub: Arc<MemoryCaptchaHub>,
}

impl TestHarness {
    /// Harness around one job at `https://files.example.com/get/42`,
    /// named `archive.bin` in package folder `pkg`, source `TestSource`.
    pub(crate) fn new(script: TransportScript) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            download_root: tmp.path().join("downloads"),
            tmp_dir: tmp.path().join("tmp"),
            ..EngineConfig::default()
        };
        std::fs::create_dir_all(&config.download_root).unwrap();
        std::fs::create_dir_all(&config.tmp_dir).unwrap();

        let memory_hub = Arc::new(MemoryCaptchaHub::new());
        let mut ctx = EngineContext::new(config);
        ctx.captcha_hub = Arc::clone(&memory_hub) as Arc<dyn CaptchaHub>;

        let job = Arc::new(Job::new(
            1,
            "https://files.example.com/get/42",
            "archive.bin",
            0,
            "TestSource",
            Arc::new(Package::new("pkg")),
        ));

        Self {
            tmp,
            ctx: Arc::new(ctx),
            job,
            transport: Arc::new(MockTransport::new(script)),
            memory_hub,
        }
    }

    /// The shared context.
    pub(crate) fn ctx(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    fn ctx_mut(&mut self) -> &mut EngineContext {
        Arc::get_mut(&mut self.ctx).expect("context mutated after sharing")
    }

    /// Edits the engine configuration; call before creating sessions.
    pub(crate) fn configure(&mut self, edit: impl FnOnce(&mut EngineConfig)) {
        edit(&mut self.ctx_mut().config);
    }

    /// Replaces the account broker; call before creating sessions.
    pub(crate) fn set_accounts(&mut self, accounts: Arc<dyn AccountBroker>) {
        self.ctx_mut().accounts = accounts;
    }

    /// Replaces the event sink; call before creating sessions.
    pub(crate) fn set_events(&mut self, events: Arc<dyn crate::events::EventSink>) {
        self.ctx_mut().events = events;
    }

    /// Replaces the duplicate index; call before creating sessions.
    pub(crate) fn set_duplicates(&mut self, duplicates: Arc<dyn DuplicateIndex>) {
        self.ctx_mut().duplicates = duplicates;
    }

    /// Registers an automatic captcha solver; call before creating sessions.
    pub(crate) fn register_solver(&mut self, source: &str, solver: Arc<dyn AutoSolver>) {
        self.ctx_mut().solvers.register(source, solver);
    }

    /// A fresh session over the harness job and transport.
    pub(crate) fn session(&self) -> JobSession {
        JobSession::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.job),
            Arc::clone(&self.transport) as Arc<dyn NetworkTransport>,
        )
    }
}
