//! Runs one scan as an external process, end to end.
//!
//! The runner resolves the scanner binary, spawns it with piped output,
//! feeds every stdout/stderr line through a [`LineParser`] as it arrives,
//! enforces the deadline and classifies the exit. It knows nothing about
//! queues or job storage; callers see progress through a callback and the
//! outcome through the returned `Result`.

use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ::time::OffsetDateTime;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Split};
use tokio::process::Command;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{clamp_timeout_secs, clamp_workers, RunnerConfig};
use crate::error::{fmt_opt, ScanError};
use crate::locate::BinaryLocator;
use crate::parser::{LineParser, PatternParser, PortLine, ScannerLine};
use crate::types::{
    ExecutionMetadata, JobId, PortObservation, ProgressEvent, Protocol, RawOutput, ScanParams,
    ScanResult, StreamKind,
};

/// Progress callback, invoked synchronously for every output line.
pub type ProgressFn<'a> = &'a (dyn Fn(ProgressEvent) + Send + Sync);

/// Executes a single scan. The dispatcher only talks to this seam.
#[async_trait]
pub trait ScanExecutor: Send + Sync {
    /// Resolves once the scan is over and, when a process was started, after
    /// it has terminated. Cancelling `cancel` kills the process.
    async fn execute(
        &self,
        job_id: JobId,
        params: &ScanParams,
        cancel: CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<ScanResult, ScanError>;
}

pub struct ProcessRunner {
    config: RunnerConfig,
    parser: Arc<dyn LineParser>,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            parser: Arc::new(PatternParser::new()),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn LineParser>) -> Self {
        self.parser = parser;
        self
    }

    fn locator(&self) -> BinaryLocator {
        BinaryLocator::new(
            self.config.scanner_bin.clone(),
            &self.config.base_dir,
            &self.config.scanner_name,
        )
    }
}

/// Argument vector handed to the scanner. Inputs are expected to be
/// validated and clamped already.
pub fn build_args(target: &str, ports: &str, timeout_secs: u64, workers: u32) -> Vec<String> {
    vec![
        "-t".to_string(),
        target.to_string(),
        "-p".to_string(),
        ports.to_string(),
        "-T".to_string(),
        (timeout_secs * 1000).to_string(),
        "-c".to_string(),
        workers.to_string(),
        "-v".to_string(),
    ]
}

/// Reconciles port observations by `(port, protocol)`; the last port line
/// seen becomes the target for subsequent banners.
#[derive(Debug, Default)]
pub struct PortTracker {
    ports: HashMap<(u16, Protocol), PortObservation>,
    current: Option<(u16, Protocol)>,
}

impl PortTracker {
    pub fn observe(&mut self, line: PortLine) -> PortObservation {
        let key = (line.port, line.protocol);
        let entry = self.ports.entry(key).or_insert_with(|| PortObservation {
            port: line.port,
            protocol: line.protocol,
            state: String::new(),
            banner: None,
        });
        entry.state = line.state;
        self.current = Some(key);
        entry.clone()
    }

    /// Returns `None` when no port has been reported yet; the banner is dropped.
    pub fn attach_banner(&mut self, banner: String) -> Option<PortObservation> {
        let entry = self.ports.get_mut(&self.current?)?;
        entry.banner = Some(banner);
        Some(entry.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn into_sorted(self) -> Vec<PortObservation> {
        let mut ports: Vec<PortObservation> = self.ports.into_values().collect();
        ports.sort_by_key(|p| (p.port, p.protocol));
        ports
    }
}

struct LineRecorder<'a> {
    job_id: JobId,
    parser: &'a dyn LineParser,
    on_progress: ProgressFn<'a>,
    tracker: PortTracker,
    raw: RawOutput,
}

impl LineRecorder<'_> {
    fn record(&mut self, line: String, stream: StreamKind) {
        let mut event = ProgressEvent {
            scan_id: self.job_id,
            line: line.clone(),
            stream,
            timestamp: OffsetDateTime::now_utc(),
            port: None,
            banner: None,
        };
        match self.parser.parse(&line) {
            Some(ScannerLine::Port(port)) => event.port = Some(self.tracker.observe(port)),
            Some(ScannerLine::Banner(banner)) => {
                if let Some(obs) = self.tracker.attach_banner(banner) {
                    event.banner = obs.banner.clone();
                    event.port = Some(obs);
                }
            }
            None => {}
        }
        match stream {
            StreamKind::Stdout => self.raw.stdout.push(line),
            StreamKind::Stderr => self.raw.stderr.push(line),
        }
        (self.on_progress)(event);
    }
}

enum Ending {
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    TimedOut,
    Cancelled,
}

/// Next newline-terminated line. Scanner output carries raw banner bytes,
/// so invalid UTF-8 is replaced rather than treated as a read error.
async fn next_line<R>(segments: &mut Option<Split<R>>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(segments) = segments else {
        return Ok(None);
    };
    Ok(segments.next_segment().await?.map(|bytes| decode_line(&bytes)))
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[async_trait]
impl ScanExecutor for ProcessRunner {
    async fn execute(
        &self,
        job_id: JobId,
        params: &ScanParams,
        cancel: CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<ScanResult, ScanError> {
        let resolution = self.locator().resolve();
        debug!(
            %job_id,
            binary = ?resolution.binary_path,
            override_path = ?resolution.override_path,
            tried = resolution.tried.len(),
            "scanner binary resolution"
        );
        let binary_path = resolution.into_result()?;

        let timeout_secs = clamp_timeout_secs(params.timeout_secs);
        let max_workers = clamp_workers(params.max_workers);
        let args = build_args(&params.target, &params.ports, timeout_secs, max_workers);

        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();

        let mut cmd = Command::new(&binary_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.work_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|source| ScanError::SpawnFailed {
            path: binary_path.clone(),
            source,
        })?;
        info!(%job_id, pid = ?child.id(), binary = %binary_path.display(), target = %params.target, "scanner started");

        let mut out_lines = child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
        let mut err_lines = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));
        let mut out_open = out_lines.is_some();
        let mut err_open = err_lines.is_some();
        let mut exit: Option<(Option<i32>, Option<i32>)> = None;

        let mut recorder = LineRecorder {
            job_id,
            parser: self.parser.as_ref(),
            on_progress,
            tracker: PortTracker::default(),
            raw: RawOutput::default(),
        };

        let deadline = time::sleep(Duration::from_secs(timeout_secs) + self.config.timeout_grace);
        tokio::pin!(deadline);

        let ending = loop {
            if let (Some((code, signal)), false, false) = (exit, out_open, err_open) {
                break Ending::Exited { code, signal };
            }
            tokio::select! {
                line = next_line(&mut out_lines), if out_open => match line {
                    Ok(Some(line)) => recorder.record(line, StreamKind::Stdout),
                    Ok(None) => out_open = false,
                    Err(e) => {
                        warn!(%job_id, error = %e, "stdout read failed");
                        out_open = false;
                    }
                },
                line = next_line(&mut err_lines), if err_open => match line {
                    Ok(Some(line)) => recorder.record(line, StreamKind::Stderr),
                    Ok(None) => err_open = false,
                    Err(e) => {
                        warn!(%job_id, error = %e, "stderr read failed");
                        err_open = false;
                    }
                },
                status = child.wait(), if exit.is_none() => match status {
                    Ok(status) => exit = Some((status.code(), exit_signal(&status))),
                    Err(e) => {
                        warn!(%job_id, error = %e, "failed to wait for scanner");
                        exit = Some((None, None));
                    }
                },
                _ = &mut deadline => break Ending::TimedOut,
                _ = cancel.cancelled() => break Ending::Cancelled,
            }
        };

        let (code, signal) = match ending {
            Ending::Exited { code, signal } => (code, signal),
            Ending::TimedOut => {
                warn!(%job_id, timeout_secs, "scanner deadline exceeded, killing process");
                if let Err(e) = child.kill().await {
                    warn!(%job_id, error = %e, "failed to kill scanner");
                }
                return Err(ScanError::Timeout {
                    after: Duration::from_secs(timeout_secs),
                });
            }
            Ending::Cancelled => {
                info!(%job_id, "scan cancelled, killing process");
                if let Err(e) = child.kill().await {
                    warn!(%job_id, error = %e, "failed to kill scanner");
                }
                return Err(ScanError::Cancelled);
            }
        };

        let finished_at = OffsetDateTime::now_utc();
        let LineRecorder { tracker, raw, .. } = recorder;
        let had_ports = !tracker.is_empty();

        if code != Some(0) && !had_ports && raw.is_empty() {
            warn!(%job_id, exit_code = ?code, signal = ?signal, "scanner failed without output");
            return Err(ScanError::AbnormalExit {
                code,
                signal,
                stdout: raw.stdout,
                stderr: raw.stderr,
            });
        }

        let mut result = ScanResult {
            scan_id: job_id,
            target: params.target.clone(),
            requested_ports: params.ports.clone(),
            timeout_secs,
            max_workers,
            started_at,
            finished_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            ports: tracker.into_sorted(),
            raw,
            metadata: ExecutionMetadata {
                binary_path,
                args,
                exit_code: code,
                signal,
                abnormal_exit: false,
            },
            warnings: Vec::new(),
        };

        if code != Some(0) {
            warn!(%job_id, exit_code = ?code, signal = ?signal, "scanner exited abnormally, keeping partial output");
            result.metadata.abnormal_exit = true;
            result.warnings.push(format!(
                "scanner exited with code {} (signal: {}); results may be partial, check the raw output",
                fmt_opt(&code),
                fmt_opt(&signal)
            ));
        }

        info!(%job_id, ports = result.ports.len(), duration_ms = result.duration_ms, "scanner finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(port: u16, protocol: Protocol, state: &str) -> PortLine {
        PortLine {
            port,
            protocol,
            state: state.to_string(),
        }
    }

    #[test]
    fn decode_line_is_lossy_and_strips_carriage_return() {
        assert_eq!(decode_line(b"[+] Puerto 22/tcp -> open\r"), "[+] Puerto 22/tcp -> open");
        assert_eq!(decode_line(b"Banner: \xff\xfessh"), "Banner: \u{fffd}\u{fffd}ssh");
        assert_eq!(decode_line(b""), "");
    }

    #[test]
    fn args_carry_timeout_in_millis() {
        let args = build_args("10.0.0.1", "22,80", 30, 64);
        assert_eq!(
            args,
            vec!["-t", "10.0.0.1", "-p", "22,80", "-T", "30000", "-c", "64", "-v"]
        );
    }

    #[test]
    fn later_observation_overwrites_state() {
        let mut tracker = PortTracker::default();
        tracker.observe(line(80, Protocol::Tcp, "filtered"));
        tracker.observe(line(22, Protocol::Tcp, "open"));
        tracker.observe(line(80, Protocol::Tcp, "open"));
        tracker.observe(line(80, Protocol::Udp, "closed"));

        let ports = tracker.into_sorted();
        let keys: Vec<_> = ports.iter().map(|p| (p.port, p.protocol)).collect();
        assert_eq!(
            keys,
            vec![(22, Protocol::Tcp), (80, Protocol::Tcp), (80, Protocol::Udp)]
        );
        assert_eq!(ports[1].state, "open");
    }

    #[test]
    fn banner_attaches_to_latest_port_and_keeps_on_state_change() {
        let mut tracker = PortTracker::default();
        assert!(tracker.attach_banner("early".into()).is_none());

        tracker.observe(line(22, Protocol::Tcp, "open"));
        tracker.observe(line(443, Protocol::Tcp, "open"));
        let obs = tracker.attach_banner("nginx".into()).unwrap();
        assert_eq!(obs.port, 443);

        tracker.observe(line(443, Protocol::Tcp, "closed"));
        let ports = tracker.into_sorted();
        assert_eq!(ports[0].banner, None);
        assert_eq!(ports[1].banner.as_deref(), Some("nginx"));
        assert_eq!(ports[1].state, "closed");
    }
}
