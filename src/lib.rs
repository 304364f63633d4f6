//! Grabcore - download-orchestration engine
//!
//! This library is the generic orchestration core underlying a multi-host
//! file-retrieval tool. Per-host extraction plugins implement the
//! [`Extractor`] trait and delegate to a [`JobSession`] for everything with
//! real coordination in it: scheduled waits, bounded retries, captcha
//! arbitration, chunked transfers, post-download verification and duplicate
//! suppression.
//!
//! # Architecture
//!
//! - [`job`] - Job/Package data model and the shared tracked-job cache
//! - [`session`] - Per-job engine instance and its operations
//! - [`transport`] - Network collaborator trait plus the reqwest-backed default
//! - [`signal`] - Cancellation outcomes unwound to the scheduler
//! - [`config`] - Injected engine configuration
//! - [`account`] - Account subsystem collaborator contract
//! - [`events`] - Fire-and-forget event notification
//!
//! The external scheduler constructs one [`JobSession`] per job attempt and
//! calls [`JobSession::run`]; everything the session does from there is
//! driven by the extraction callback.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod account;
pub mod config;
pub mod events;
pub mod job;
pub mod session;
pub mod signal;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use account::{AccountBroker, AccountInfo, NoAccounts, TrafficLeft};
pub use config::EngineConfig;
pub use events::{EventSink, NullEventSink};
pub use job::{Job, JobCache, JobStatus, Package};
pub use session::{
    AutoSolver, CaptchaFeedback, CaptchaHub, CaptchaResult, CaptchaResultKind, CaptchaTask,
    DownloadOptions, DuplicateIndex, DuplicateRecord, EngineContext, Extractor, JobSession,
    MemoryCaptchaHub, NullDuplicateIndex, ReconnectSignal, SolverError, SolverRegistry,
    VerificationRule,
};
pub use signal::{FailKind, JobSignal};
pub use transport::{
    ChunkedFetchRequest, ChunkedTransfer, FetchRequest, FetchResponse, Headers, HttpTransport,
    NetworkTransport, TransportError,
};
