//! Limits and defaults consumed by the dispatcher and the process runner.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const MIN_TIMEOUT_SECS: u64 = 5;
pub const MAX_TIMEOUT_SECS: u64 = 900;

pub const DEFAULT_MAX_WORKERS: u32 = 32;
pub const MAX_WORKERS: u32 = 512;

pub const DEFAULT_PARALLEL_JOBS: usize = 2;
pub const MAX_PARALLEL_JOBS: usize = 8;

/// Extra time granted on top of the scan timeout before the process is killed.
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Number of progress events retained per job.
pub const PROGRESS_WINDOW: usize = 200;
/// Number of progress events included in a job snapshot.
pub const SNAPSHOT_PROGRESS: usize = 20;

pub const DEFAULT_SCANNER_NAME: &str = "secscanner";

/// Missing or zero means default; anything else lands in 5..=900.
pub fn clamp_timeout_secs(requested: Option<u64>) -> u64 {
    match requested {
        Some(secs) if secs > 0 => secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS),
        _ => DEFAULT_TIMEOUT_SECS,
    }
}

/// Missing or zero means default; anything else lands in 1..=512.
pub fn clamp_workers(requested: Option<u32>) -> u32 {
    match requested {
        Some(n) if n > 0 => n.min(MAX_WORKERS),
        _ => DEFAULT_MAX_WORKERS,
    }
}

pub fn clamp_parallel_jobs(requested: usize) -> usize {
    requested.clamp(1, MAX_PARALLEL_JOBS)
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_parallel_jobs: usize,
}

impl DispatcherConfig {
    pub fn new(max_parallel_jobs: usize) -> Self {
        Self {
            max_parallel_jobs: clamp_parallel_jobs(max_parallel_jobs),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLEL_JOBS)
    }
}

/// Where to look for the scanner binary and how long to let it run.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Explicit binary location; checked first.
    pub scanner_bin: Option<PathBuf>,
    /// Anchor for the conventional install locations.
    pub base_dir: PathBuf,
    pub scanner_name: String,
    /// Working directory for the spawned process.
    pub work_dir: Option<PathBuf>,
    pub timeout_grace: Duration,
}

impl RunnerConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            scanner_bin: None,
            base_dir: base_dir.into(),
            scanner_name: DEFAULT_SCANNER_NAME.to_string(),
            work_dir: None,
            timeout_grace: TIMEOUT_GRACE,
        }
    }

    pub fn with_scanner_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.scanner_bin = Some(bin.into());
        self
    }
}

/// Directory holding the running executable, symlinks resolved. Scanner
/// lookup is anchored here unless a base directory is configured.
pub fn executable_dir() -> io::Result<PathBuf> {
    let exe = std::env::current_exe()?.canonicalize()?;
    exe.parent().map(Path::to_path_buf).ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "executable has no parent directory")
    })
}
