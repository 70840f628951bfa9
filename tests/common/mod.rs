#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use scan_dispatch::error::ScanError;
use scan_dispatch::runner::{ProgressFn, ScanExecutor};
use scan_dispatch::types::{
    ExecutionMetadata, JobId, PortObservation, ProgressEvent, Protocol, RawOutput, ScanParams,
    ScanResult, StreamKind,
};
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub fn params(target: &str) -> ScanParams {
    ScanParams {
        target: target.to_string(),
        ports: "22,80,8000-8100".to_string(),
        timeout_secs: Some(30),
        max_workers: Some(32),
    }
}

pub fn sample_result(job_id: JobId, params: &ScanParams) -> ScanResult {
    let now = OffsetDateTime::now_utc();
    ScanResult {
        scan_id: job_id,
        target: params.target.clone(),
        requested_ports: params.ports.clone(),
        timeout_secs: 30,
        max_workers: 32,
        started_at: now,
        finished_at: now,
        duration_ms: 12,
        ports: vec![PortObservation {
            port: 22,
            protocol: Protocol::Tcp,
            state: "open".into(),
            banner: Some("OpenSSH 8.9".into()),
        }],
        raw: RawOutput {
            stdout: vec![
                "[+] Puerto 22/tcp -> open".into(),
                "Banner: OpenSSH 8.9".into(),
            ],
            stderr: vec![],
        },
        metadata: ExecutionMetadata {
            binary_path: PathBuf::from("/opt/secscanner/build/secscanner"),
            args: vec!["-t".into(), params.target.clone()],
            exit_code: Some(0),
            signal: None,
            abnormal_exit: false,
        },
        warnings: vec![],
    }
}

/// Stand-in for the process runner. Each execution emits `lines` progress
/// events, then waits for a permit from `gate` (or cancellation). The
/// target name picks the outcome: `timeout*` times out, `silent*` fails
/// without output, `abnormal*` succeeds with partial results, anything
/// else succeeds.
pub struct FakeExecutor {
    gate: Semaphore,
    lines: usize,
    current: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl FakeExecutor {
    /// Every scan blocks until [`FakeExecutor::release`] is called.
    pub fn gated() -> Self {
        Self::new(0, 1)
    }

    /// Scans finish immediately.
    pub fn open() -> Self {
        Self::new(1 << 20, 1)
    }

    pub fn new(permits: usize, lines: usize) -> Self {
        Self {
            gate: Semaphore::new(permits),
            lines,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScanExecutor for FakeExecutor {
    async fn execute(
        &self,
        job_id: JobId,
        params: &ScanParams,
        cancel: CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<ScanResult, ScanError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(params.target.clone());

        for n in 0..self.lines {
            on_progress(ProgressEvent {
                scan_id: job_id,
                line: format!("line {n}"),
                stream: StreamKind::Stdout,
                timestamp: OffsetDateTime::now_utc(),
                port: None,
                banner: None,
            });
        }

        let gate = tokio::select! {
            permit = self.gate.acquire() => {
                permit.expect("gate closed").forget();
                Ok(())
            }
            _ = cancel.cancelled() => Err(ScanError::Cancelled),
        };
        self.current.fetch_sub(1, Ordering::SeqCst);
        gate?;

        if params.target.starts_with("timeout") {
            return Err(ScanError::Timeout {
                after: Duration::from_secs(5),
            });
        }
        if params.target.starts_with("silent") {
            return Err(ScanError::AbnormalExit {
                code: Some(1),
                signal: None,
                stdout: vec![],
                stderr: vec![],
            });
        }
        let mut result = sample_result(job_id, params);
        if params.target.starts_with("abnormal") {
            result.metadata.exit_code = Some(1);
            result.metadata.abnormal_exit = true;
            result
                .warnings
                .push("scanner exited with code 1 (signal: none); results may be partial".into());
        }
        Ok(result)
    }
}

/// Writes an executable `/bin/sh` script standing in for the scanner.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}
