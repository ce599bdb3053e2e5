//! Fire-and-forget transfer jobs.
//!
//! `submit` records a pending job and hands it to a tokio task. The task waits
//! for a concurrency permit, runs the provider on the blocking pool, streams
//! progress into the registry and finally records exactly one terminal state.
//! Jobs cannot be cancelled once submitted.

use std::{path::PathBuf, sync::Arc};

use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::credentials::CredentialBundle;
use crate::provider::{ExtractionProvider, TransferRequest};
use crate::registry::{Job, JobKind, RegistryError, TaskRegistry, TransferProgress};

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub format: Option<String>,
    pub kind: JobKind,
}

#[derive(Clone)]
pub struct TaskDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: TaskRegistry,
    provider: Arc<dyn ExtractionProvider>,
    output_dir: PathBuf,
    permits: Arc<Semaphore>,
}

impl TaskDispatcher {
    /// `max_concurrent_jobs == 0` lifts the limit entirely.
    pub fn new(
        registry: TaskRegistry,
        provider: Arc<dyn ExtractionProvider>,
        output_dir: PathBuf,
        max_concurrent_jobs: usize,
    ) -> Self {
        let permits = match max_concurrent_jobs {
            0 => Semaphore::MAX_PERMITS,
            limit => limit,
        };
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                provider,
                output_dir,
                permits: Arc::new(Semaphore::new(permits)),
            }),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Registers a pending job and starts its worker. Returns without waiting
    /// for the transfer. Must be called from inside a tokio runtime.
    pub fn submit(
        &self,
        source_url: String,
        options: SubmitOptions,
        credentials: Option<CredentialBundle>,
    ) -> Result<String, RegistryError> {
        let job_id = Uuid::new_v4().to_string();
        self.inner
            .registry
            .create(Job::new(job_id.clone(), source_url.clone(), options.kind))?;

        let request = TransferRequest {
            url: source_url,
            kind: options.kind,
            format: options.format,
            credentials,
            output_dir: self.inner.output_dir.clone(),
        };
        info!(job_id = %job_id, url = %request.url, kind = ?request.kind, "queued transfer");
        tokio::spawn(run_job(self.inner.clone(), job_id.clone(), request));
        Ok(job_id)
    }
}

async fn run_job(inner: Arc<DispatcherInner>, job_id: String, request: TransferRequest) {
    let _permit = match inner.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(err) => {
            finish(&inner.registry, &job_id, Err(format!("worker pool closed: {err}")));
            return;
        }
    };

    if let Err(err) = inner.registry.mutate(&job_id, Job::mark_running) {
        warn!(job_id = %job_id, error = %err, "job vanished before it started");
        return;
    }

    let worker = inner.clone();
    let worker_job_id = job_id.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let registry = worker.registry.clone();
        let mut on_progress = |id: &str, progress: TransferProgress| {
            apply_progress(&registry, id, progress);
        };
        worker
            .provider
            .transfer(&worker_job_id, &request, &mut on_progress)
    })
    .await;

    let result = match outcome {
        Ok(Ok(location)) => Ok(location),
        Ok(Err(err)) => Err(err.to_string()),
        Err(err) => Err(format!("transfer worker crashed: {err}")),
    };
    finish(&inner.registry, &job_id, result);
}

fn apply_progress(registry: &TaskRegistry, job_id: &str, progress: TransferProgress) {
    if let Err(err) = registry.mutate(job_id, |job| job.record_progress(progress)) {
        warn!(job_id, error = %err, "dropping progress for unknown job");
    }
}

fn finish(registry: &TaskRegistry, job_id: &str, result: Result<PathBuf, String>) {
    let applied = match &result {
        Ok(location) => registry.mutate(job_id, |job| job.complete(location.clone())),
        Err(detail) => registry.mutate(job_id, |job| job.fail(detail.clone())),
    };
    match (applied, result) {
        (Ok(true), Ok(location)) => {
            info!(job_id, location = %location.display(), "transfer completed")
        }
        (Ok(true), Err(detail)) => warn!(job_id, error = %detail, "transfer failed"),
        (Ok(false), _) => warn!(job_id, "job already finished; ignoring second outcome"),
        (Err(err), _) => warn!(job_id, error = %err, "could not record job outcome"),
    }
}
