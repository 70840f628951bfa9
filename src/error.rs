use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::JobError;

/// Why a scan produced no result. Each variant ends exactly one job.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scanner binary not found; set SCANNER_BIN if needed. Tried: {}", format_tried(.tried))]
    BinaryNotFound { tried: Vec<PathBuf> },

    #[error("failed to start scanner at {}: {source}", .path.display())]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("scanner exceeded the allowed time ({}s)", .after.as_secs())]
    Timeout { after: Duration },

    #[error("scanner exited with code {} (signal: {}) and produced no output", fmt_opt(.code), fmt_opt(.signal))]
    AbnormalExit {
        code: Option<i32>,
        signal: Option<i32>,
        stdout: Vec<String>,
        stderr: Vec<String>,
    },

    #[error("scan cancelled before completion")]
    Cancelled,

    #[error("failed to persist scan result: {0}")]
    Persist(String),
}

impl ScanError {
    pub fn code(&self) -> &'static str {
        match self {
            ScanError::BinaryNotFound { .. } => "binary_not_found",
            ScanError::SpawnFailed { .. } => "spawn_failed",
            ScanError::Timeout { .. } => "timeout",
            ScanError::AbnormalExit { .. } => "abnormal_exit",
            ScanError::Cancelled => "cancelled",
            ScanError::Persist(_) => "persist_failed",
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, ScanError::Timeout { .. })
    }

    pub fn to_job_error(&self) -> JobError {
        let exit_code = match self {
            ScanError::AbnormalExit { code, .. } => *code,
            _ => None,
        };
        JobError {
            message: self.to_string(),
            code: Some(self.code().to_string()),
            exit_code,
            timed_out: self.timed_out(),
        }
    }
}

/// Raised by the dispatcher handle when the dispatcher loop is gone.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher is shut down")]
    Stopped,
}

/// Rejected scan request input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("target is required")]
    EmptyTarget,
    #[error("target is too long")]
    TargetTooLong,
    #[error("target contains forbidden characters")]
    ForbiddenCharacters,
    #[error("target must be a valid hostname or IPv4 address")]
    InvalidTarget,
    #[error("port list is required")]
    EmptyPorts,
    #[error("invalid port list format, use commas and ranges, e.g. \"22,80,8000-8100\"")]
    InvalidPortsFormat,
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("port out of range: {0}")]
    PortOutOfRange(String),
}

fn format_tried(tried: &[PathBuf]) -> String {
    if tried.is_empty() {
        return "<no candidate paths>".to_string();
    }
    tried
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" | ")
}

pub(crate) fn fmt_opt(v: &Option<i32>) -> String {
    v.map(|n| n.to_string()).unwrap_or_else(|| "none".to_string())
}
