//! Job records, their bounded progress window, and persisted results.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::{PROGRESS_WINDOW, SNAPSHOT_PROGRESS};
use crate::types::{JobError, JobId, JobStatus, ProgressEvent, ScanParams, ScanResult};

/// One scheduled scan and everything observed about it so far.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub params: ScanParams,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    /// Most recent progress events, oldest first.
    pub progress: VecDeque<ProgressEvent>,
    pub result: Option<ScanResult>,
    pub error: Option<JobError>,
    pub result_path: PathBuf,
}

impl Job {
    pub fn new(id: JobId, params: ScanParams, result_path: PathBuf) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            status: JobStatus::Queued,
            params,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            progress: VecDeque::new(),
            result: None,
            error: None,
            result_path,
        }
    }

    pub fn mark_running(&mut self) {
        let now = OffsetDateTime::now_utc();
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Appends to the rolling window; ignored once the job is terminal.
    pub fn push_progress(&mut self, event: ProgressEvent) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.progress.push_back(event);
        while self.progress.len() > PROGRESS_WINDOW {
            self.progress.pop_front();
        }
        self.updated_at = OffsetDateTime::now_utc();
        true
    }

    pub fn complete(&mut self, result: ScanResult) {
        let now = OffsetDateTime::now_utc();
        self.status = JobStatus::Done;
        self.result = Some(result);
        self.error = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub fn fail(&mut self, error: JobError) {
        let now = OffsetDateTime::now_utc();
        self.status = JobStatus::Error;
        self.error = Some(error);
        self.result = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Snapshot shared with observers: only the last few progress events.
    pub fn view(&self) -> JobView {
        let done = self.status == JobStatus::Done;
        let skip = self.progress.len().saturating_sub(SNAPSHOT_PROGRESS);
        JobView {
            scan_id: self.id,
            status: self.status,
            params: self.params.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
            result_path: done.then(|| self.result_path.clone()),
            result: if done { self.result.clone() } else { None },
            progress: self.progress.iter().skip(skip).cloned().collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobView {
    pub scan_id: JobId,
    pub status: JobStatus,
    pub params: ScanParams,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub error: Option<JobError>,
    pub result_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ScanResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub progress: Vec<ProgressEvent>,
}

/// In-memory job table. Volatile: lost on restart.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: HashMap<JobId, Job>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|j| j.status == status).count()
    }
}

/// Durable scan results, one pretty-printed JSON file per job id.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create data dir: {}", self.dir.display()))
    }

    pub async fn save(&self, result: &ScanResult) -> Result<PathBuf> {
        self.ensure_dir().await?;
        let path = self.path_for(&result.scan_id);
        let body = serde_json::to_vec_pretty(result).context("failed to encode scan result")?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    /// `Ok(None)` if nothing was persisted for this id.
    pub async fn load(&self, id: &JobId) -> Result<Option<ScanResult>> {
        let path = self.path_for(id);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let result = serde_json::from_slice(&body)
            .with_context(|| format!("corrupt scan result: {}", path.display()))?;
        Ok(Some(result))
    }
}
