//! Engine configuration.
//!
//! All knobs the engine reads at runtime live here and are injected into
//! the [`EngineContext`](crate::session::EngineContext) at construction.
//! Nothing in the engine consults ambient global state, so tests can
//! supply a throwaway config pointing at temp directories.

use std::path::PathBuf;

use serde::Deserialize;

fn default_chunk_count() -> u32 {
    3
}

fn default_size_tolerance() -> u64 {
    1000
}

fn default_download_root() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Typed configuration for the orchestration engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory downloads land in; package folders are created below it.
    pub download_root: PathBuf,

    /// Directory for temporary captcha images.
    pub tmp_dir: PathBuf,

    /// Global default number of parallel byte-range chunks per transfer.
    pub chunk_count: u32,

    /// Skip a starting job when its target file already exists on disk
    /// with at least the expected size.
    pub skip_existing: bool,

    /// Master switch for automatic captcha solving.
    pub captcha_solving: bool,

    /// Debug mode keeps temporary captcha images for postmortem inspection.
    pub debug: bool,

    /// Permission bits applied to created package folders (unix only).
    pub folder_mode: Option<u32>,

    /// Permission bits applied to completed downloads (unix only).
    pub file_mode: Option<u32>,

    /// Numeric owner id applied to created folders and files (unix only).
    pub owner_uid: Option<u32>,

    /// Numeric group id applied to created folders and files (unix only).
    pub owner_gid: Option<u32>,

    /// Default byte tolerance for post-download size verification.
    pub size_tolerance: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_root: default_download_root(),
            tmp_dir: default_tmp_dir(),
            chunk_count: default_chunk_count(),
            skip_existing: false,
            captcha_solving: true,
            debug: false,
            folder_mode: None,
            file_mode: None,
            owner_uid: None,
            owner_gid: None,
            size_tolerance: default_size_tolerance(),
        }
    }
}
