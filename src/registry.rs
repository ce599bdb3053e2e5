//! In-memory registry of transfer jobs.
//!
//! Every job lives here for the lifetime of the process; nothing is evicted.
//! Each record has a single writer (the worker that owns the job) and any
//! number of readers polling status. Updates run inside one write-lock
//! critical section, so readers never observe half of a field group.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("task {0} already exists")]
    DuplicateId(String),
    #[error("task {0} not found")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    #[default]
    Video,
    AudioOnly,
}

/// Latest transfer counters reported by the provider. Every field stays unknown
/// until the first progress event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TransferProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    /// Bytes per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Seconds remaining.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub task_id: String,
    pub status: JobStatus,
    pub kind: JobKind,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub progress: TransferProgress,
    pub filename: Option<PathBuf>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(task_id: impl Into<String>, url: impl Into<String>, kind: JobKind) -> Self {
        Self {
            task_id: task_id.into(),
            status: JobStatus::Pending,
            kind,
            url: url.into(),
            created_at: Utc::now(),
            progress: TransferProgress::default(),
            filename: None,
            error: None,
        }
    }

    /// Moves a pending job to running. Returns `false` when the job already
    /// left the pending state.
    pub fn mark_running(&mut self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Running;
        true
    }

    /// Replaces the progress snapshot. Late events for a finished job are
    /// dropped so a terminal record never changes again.
    pub fn record_progress(&mut self, progress: TransferProgress) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Running;
        self.progress = progress;
        true
    }

    pub fn complete(&mut self, location: PathBuf) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Completed;
        self.filename = Some(location);
        true
    }

    pub fn fail(&mut self, detail: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error = Some(detail.into());
        true
    }
}

/// Shared handle to the job table. Clones point at the same map.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, job: Job) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.task_id) {
            return Err(RegistryError::DuplicateId(job.task_id));
        }
        jobs.insert(job.task_id.clone(), job);
        Ok(())
    }

    /// Runs `update` against the stored record while holding the write lock.
    pub fn mutate<R>(
        &self,
        task_id: &str,
        update: impl FnOnce(&mut Job) -> R,
    ) -> Result<R, RegistryError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(task_id)
            .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))?;
        Ok(update(job))
    }

    pub fn get(&self, task_id: &str) -> Result<Job, RegistryError> {
        self.jobs
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))
    }

    /// Snapshot of every job, oldest first.
    pub fn list_all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}
