//! Bounded-concurrency job queue.
//!
//! A single task owns the [`JobStore`], the FIFO admission queue and the
//! running counter. Callers talk to it through a cloneable [`Dispatcher`]
//! handle; every scan runs in its own task and reports progress and its
//! outcome back over the same channel, so the store has exactly one writer.
//!
//! The queue has no depth limit. The only backpressure is
//! `max_parallel_jobs`: admission is retried after every terminal
//! transition, so the bound stays saturated while work is queued.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, ScanError};
use crate::events::{EventSink, ScanEvent};
use crate::runner::ScanExecutor;
use crate::store::{Job, JobStore, JobView, ResultStore};
use crate::types::{JobId, JobStatus, ProgressEvent, ScanParams, ScanResult};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    pub queued: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
    pub max_parallel_jobs: usize,
}

enum Message {
    Enqueue {
        params: ScanParams,
        reply: oneshot::Sender<Result<Job, DispatchError>>,
    },
    Get {
        id: JobId,
        reply: oneshot::Sender<Option<Job>>,
    },
    Contains {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        id: JobId,
        reply: oneshot::Sender<Option<JobView>>,
    },
    Stats {
        reply: oneshot::Sender<DispatcherStats>,
    },
    AwaitIdle {
        reply: oneshot::Sender<()>,
    },
    Progress {
        id: JobId,
        event: ProgressEvent,
    },
    Finished {
        id: JobId,
        outcome: Result<(ScanResult, PathBuf), ScanError>,
    },
}

/// Handle to the dispatcher task. Dropping the last clone shuts it down and
/// kills any running scans.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    _guard: Arc<DropGuard>,
}

impl Dispatcher {
    /// Starts the dispatcher task. Must be called inside a Tokio runtime.
    pub fn spawn(
        config: DispatcherConfig,
        executor: Arc<dyn ScanExecutor>,
        sink: Arc<dyn EventSink>,
        results: ResultStore,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        info!(
            max_parallel_jobs = config.max_parallel_jobs,
            data_dir = %results.dir().display(),
            "dispatcher started"
        );
        let worker = Worker {
            config,
            store: JobStore::new(),
            queue: VecDeque::new(),
            running: 0,
            stopping: false,
            idle_waiters: Vec::new(),
            executor,
            sink,
            results,
            tx: tx.clone(),
            rx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(worker.run());
        Self {
            tx,
            _guard: Arc::new(shutdown.clone().drop_guard()),
            shutdown,
        }
    }

    /// Creates a queued job and tries to admit it right away. The returned
    /// record reflects the state after that admission attempt.
    pub async fn enqueue(&self, params: ScanParams) -> Result<Job, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Enqueue { params, reply })?;
        rx.await.map_err(|_| DispatchError::Stopped)?
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Get { id, reply })?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    pub async fn has_job(&self, id: JobId) -> Result<bool, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Contains { id, reply })?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    /// Looks the job up and returns its shared projection.
    pub async fn snapshot(&self, id: JobId) -> Result<Option<JobView>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Snapshot { id, reply })?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    pub fn serialize(job: &Job) -> JobView {
        job.view()
    }

    pub async fn stats(&self) -> Result<DispatcherStats, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Stats { reply })?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    /// Kills running scans, fails queued jobs and waits for the task to stop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let (reply, rx) = oneshot::channel();
        if self.send(Message::AwaitIdle { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, msg: Message) -> Result<(), DispatchError> {
        self.tx.send(msg).map_err(|_| DispatchError::Stopped)
    }
}

struct Worker {
    config: DispatcherConfig,
    store: JobStore,
    queue: VecDeque<JobId>,
    running: usize,
    stopping: bool,
    idle_waiters: Vec<oneshot::Sender<()>>,
    executor: Arc<dyn ScanExecutor>,
    sink: Arc<dyn EventSink>,
    results: ResultStore,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                _ = self.shutdown.cancelled(), if !self.stopping => self.begin_shutdown(),
            }
            if self.stopping && self.running == 0 {
                for waiter in self.idle_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                break;
            }
        }
        info!(jobs = self.store.len(), "dispatcher stopped");
    }

    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Enqueue { params, reply } => {
                let _ = reply.send(self.enqueue(params));
            }
            Message::Get { id, reply } => {
                let _ = reply.send(self.store.get(&id).cloned());
            }
            Message::Contains { id, reply } => {
                let _ = reply.send(self.store.contains(&id));
            }
            Message::Snapshot { id, reply } => {
                let _ = reply.send(self.store.get(&id).map(Job::view));
            }
            Message::Stats { reply } => {
                let _ = reply.send(DispatcherStats {
                    queued: self.queue.len(),
                    running: self.running,
                    done: self.store.count_with_status(JobStatus::Done),
                    error: self.store.count_with_status(JobStatus::Error),
                    max_parallel_jobs: self.config.max_parallel_jobs,
                });
            }
            Message::AwaitIdle { reply } => self.idle_waiters.push(reply),
            Message::Progress { id, event } => self.on_progress(id, event),
            Message::Finished { id, outcome } => self.on_finished(id, outcome),
        }
    }

    fn enqueue(&mut self, params: ScanParams) -> Result<Job, DispatchError> {
        if self.stopping {
            return Err(DispatchError::Stopped);
        }
        let id = Uuid::new_v4();
        let job = Job::new(id, params, self.results.path_for(&id));
        info!(job_id = %id, target = %job.params.target, ports = %job.params.ports, "job queued");
        self.store.insert(job);
        self.queue.push_back(id);
        self.admit();
        self.store.get(&id).cloned().ok_or(DispatchError::Stopped)
    }

    /// Admits queued jobs in FIFO order while below the parallelism bound.
    fn admit(&mut self) {
        while !self.stopping && self.running < self.config.max_parallel_jobs {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            let Some(job) = self.store.get_mut(&id) else {
                warn!(job_id = %id, "queued job missing from store, skipping");
                continue;
            };
            job.mark_running();
            let params = job.params.clone();
            let view = job.view();
            self.running += 1;
            info!(job_id = %id, running = self.running, queued = self.queue.len(), "job admitted");
            self.sink.publish(ScanEvent::Status {
                job_id: id,
                job: Box::new(view),
            });
            self.spawn_scan(id, params);
        }
    }

    fn spawn_scan(&self, id: JobId, params: ScanParams) {
        let executor = Arc::clone(&self.executor);
        let results = self.results.clone();
        let tx = self.tx.clone();
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            let progress_tx = tx.clone();
            let on_progress = move |event: ProgressEvent| {
                let _ = progress_tx.send(Message::Progress { id, event });
            };
            let outcome = match executor.execute(id, &params, cancel, &on_progress).await {
                Ok(result) => match results.save(&result).await {
                    Ok(path) => Ok((result, path)),
                    Err(e) => {
                        error!(job_id = %id, error = %format!("{e:#}"), "failed to persist result");
                        Err(ScanError::Persist(format!("{e:#}")))
                    }
                },
                Err(e) => Err(e),
            };
            let _ = tx.send(Message::Finished { id, outcome });
        });
    }

    fn on_progress(&mut self, id: JobId, event: ProgressEvent) {
        let Some(job) = self.store.get_mut(&id) else {
            return;
        };
        if job.push_progress(event.clone()) {
            self.sink.publish(ScanEvent::Progress {
                job_id: id,
                payload: event,
            });
        } else {
            debug!(job_id = %id, status = %job.status, "progress ignored for job not running");
        }
    }

    fn on_finished(&mut self, id: JobId, outcome: Result<(ScanResult, PathBuf), ScanError>) {
        self.running = self.running.saturating_sub(1);
        match self.store.get_mut(&id) {
            Some(job) => match outcome {
                Ok((result, path)) => {
                    info!(
                        job_id = %id,
                        ports = result.ports.len(),
                        abnormal_exit = result.metadata.abnormal_exit,
                        path = %path.display(),
                        "job done"
                    );
                    job.result_path = path.clone();
                    job.complete(result.clone());
                    self.sink.publish(ScanEvent::Done {
                        job_id: id,
                        result: Box::new(result),
                        result_path: path,
                    });
                }
                Err(e) => {
                    warn!(job_id = %id, code = e.code(), error = %e, "job failed");
                    let error = e.to_job_error();
                    job.fail(error.clone());
                    self.sink.publish(ScanEvent::Error { job_id: id, error });
                }
            },
            None => warn!(job_id = %id, "finished job missing from store"),
        }
        self.admit();
    }

    fn begin_shutdown(&mut self) {
        self.stopping = true;
        info!(running = self.running, queued = self.queue.len(), "dispatcher shutting down");
        let error = ScanError::Cancelled.to_job_error();
        for id in self.queue.drain(..) {
            if let Some(job) = self.store.get_mut(&id) {
                job.fail(error.clone());
                self.sink.publish(ScanEvent::Error {
                    job_id: id,
                    error: error.clone(),
                });
            }
        }
    }
}
