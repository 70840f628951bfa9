//! Lifecycle notifications published by the dispatcher.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::store::JobView;
use crate::types::{JobError, JobId, ProgressEvent, ScanResult};

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// A job was admitted and is now running.
    Status { job_id: JobId, job: Box<JobView> },
    Progress {
        job_id: JobId,
        payload: ProgressEvent,
    },
    Done {
        job_id: JobId,
        result: Box<ScanResult>,
        result_path: PathBuf,
    },
    Error { job_id: JobId, error: JobError },
}

impl ScanEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            ScanEvent::Status { job_id, .. }
            | ScanEvent::Progress { job_id, .. }
            | ScanEvent::Done { job_id, .. }
            | ScanEvent::Error { job_id, .. } => *job_id,
        }
    }

    /// Name used on UI-facing transports.
    pub fn name(&self) -> &'static str {
        match self {
            ScanEvent::Status { .. } => "scan:status",
            ScanEvent::Progress { .. } => "scan:progress",
            ScanEvent::Done { .. } => "scan:done",
            ScanEvent::Error { .. } => "scan:error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanEvent::Done { .. } | ScanEvent::Error { .. })
    }
}

/// Best-effort broadcast target. Must not block: it is called from the
/// dispatcher loop.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ScanEvent);
}

/// Fans events out to any number of `tokio::sync::broadcast` subscribers.
/// Slow subscribers lag and lose events; nothing is queued per subscriber.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ScanEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: ScanEvent) {
        // no subscribers is fine
        if self.tx.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }
}
