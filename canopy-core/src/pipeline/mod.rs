//! Multi-stage job pipeline.
//!
//! Jobs move `pending → in_progress → {completed | failed | cancelled}` and run
//! the fixed [`Stage::SEQUENCE`] on a fixed pool of Tokio worker tasks. Stage
//! work is delegated to a [`StageExecutor`]; [`stages::CatalogStages`] is the
//! default one that wires the hierarchy builder, analyzer and similarity
//! calculator together.
//!
//! Job state lives in one mutex-protected registry that is never held across
//! an `.await`. Cancellation is cooperative: it is observed between stages and
//! between batches, never inside one.

pub mod batch;
pub mod job;
pub mod stages;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PipelineSection;
use crate::error::PipelineError;
use crate::progress::ProgressSnapshot;

pub use batch::{BatchOutcome, ItemFailure};
pub use job::{JobError, JobErrorCode, JobId, JobStatus, JobType, ProcessingJob, Stage};
pub use stages::{
    CatalogStages, NodeSource, PipelineOutput, ResultSink, StageContext, StageExecutor,
};

/// Called with a fresh snapshot whenever a job's progress changes.
pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub workers: usize,
    pub batch_size: usize,
    /// Items in flight at once within one batch.
    pub concurrency: usize,
    pub stage_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&PipelineSection::default())
    }
}

impl From<&PipelineSection> for PipelineSettings {
    fn from(section: &PipelineSection) -> Self {
        Self {
            workers: section.workers.max(1),
            batch_size: section.batch_size.max(1),
            concurrency: section.concurrency.max(1),
            stage_timeout: Duration::from_secs(section.stage_timeout_secs),
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct JobEntry {
    job: ProcessingJob,
    started: Option<Instant>,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<JobId, JobEntry>,
    pending: VecDeque<JobId>,
    callbacks: HashMap<JobId, ProgressCallback>,
    workers_started: bool,
    shut_down: bool,
}

impl Registry {
    fn snapshot(&self, id: JobId) -> Option<ProgressSnapshot> {
        let entry = self.jobs.get(&id)?;
        let job = &entry.job;
        Some(ProgressSnapshot::compute(
            id,
            job.status,
            job.stage,
            job.processed_items,
            job.total_items,
            entry.started.map_or(Duration::ZERO, |s| s.elapsed()),
        ))
    }
}

struct Shared {
    registry: Mutex<Registry>,
    /// Wakes idle workers when a job is queued or on shutdown.
    work_ready: Notify,
    /// Wakes `wait` callers when any job changes status.
    job_changed: Notify,
    executor: Arc<dyn StageExecutor>,
    settings: PipelineSettings,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running pipeline. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct ProcessingPipeline {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProcessingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingPipeline")
            .field("settings", &self.shared.settings)
            .finish_non_exhaustive()
    }
}

impl ProcessingPipeline {
    pub fn new(executor: Arc<dyn StageExecutor>, settings: PipelineSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                work_ready: Notify::new(),
                job_changed: Notify::new(),
                executor,
                settings,
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.shared.settings
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.shared
            .registry
            .lock()
            .expect("pipeline registry mutex poisoned")
    }

    // ── Job control ────────────────────────────────────────────────

    /// Validate, enqueue, and make sure the worker pool is running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, job: ProcessingJob) -> Result<JobId, PipelineError> {
        job.validate().map_err(PipelineError::InvalidJob)?;
        let id = job.id;
        self.ensure_workers()?;
        {
            let mut reg = self.registry();
            if reg.shut_down {
                return Err(PipelineError::ShutDown);
            }
            if reg.jobs.contains_key(&id) {
                return Err(PipelineError::InvalidJob(format!("job {id} already submitted")));
            }
            reg.jobs.insert(id, JobEntry { job, started: None });
            reg.pending.push_back(id);
        }
        self.shared.work_ready.notify_one();
        info!(job_id = %id, "Job submitted");
        Ok(id)
    }

    /// Cancel a job. Pending jobs leave the queue without ever starting;
    /// running jobs stop at the next stage or batch boundary. Returns the
    /// job's status afterwards (terminal jobs are left as they are).
    pub fn cancel(&self, id: JobId) -> Result<JobStatus, PipelineError> {
        let status = {
            let mut reg = self.registry();
            let entry = reg.jobs.get_mut(&id).ok_or(PipelineError::JobNotFound(id))?;
            let was = entry.job.status;
            if was.can_transition_to(JobStatus::Cancelled) {
                entry.job.status = JobStatus::Cancelled;
                entry.job.completed_at = Some(Utc::now());
            }
            if was == JobStatus::Pending {
                reg.pending.retain(|p| *p != id);
            }
            info!(job_id = %id, from = %was, "Job cancel requested");
            reg.jobs[&id].job.status
        };
        self.emit_progress(id);
        self.shared.job_changed.notify_waiters();
        Ok(status)
    }

    /// Re-run a failed job as a new pending job with the same configuration.
    pub fn retry(&self, id: JobId) -> Result<JobId, PipelineError> {
        let retried = {
            let reg = self.registry();
            let entry = reg.jobs.get(&id).ok_or(PipelineError::JobNotFound(id))?;
            if entry.job.status != JobStatus::Failed {
                return Err(PipelineError::NotRetryable {
                    id,
                    status: entry.job.status,
                });
            }
            entry.job.retried()
        };
        info!(job_id = %id, retry_id = %retried.id, "Job retried");
        self.submit(retried)
    }

    pub fn get(&self, id: JobId) -> Option<ProcessingJob> {
        self.registry().jobs.get(&id).map(|e| e.job.clone())
    }

    /// Every known job, oldest first.
    pub fn jobs(&self) -> Vec<ProcessingJob> {
        let mut jobs: Vec<ProcessingJob> =
            self.registry().jobs.values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn stats(&self) -> PipelineStats {
        let reg = self.registry();
        let mut stats = PipelineStats::default();
        for entry in reg.jobs.values() {
            match entry.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::InProgress => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Wait until the job reaches a terminal status.
    pub async fn wait(&self, id: JobId) -> Result<ProcessingJob, PipelineError> {
        loop {
            let notified = self.shared.job_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let job = self.get(id).ok_or(PipelineError::JobNotFound(id))?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            notified.await;
        }
    }

    /// Stop accepting jobs and let workers exit after their current job.
    /// Jobs still queued stay pending.
    pub async fn shutdown(&self) {
        self.registry().shut_down = true;
        self.shared.work_ready.notify_waiters();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .shared
                .workers
                .lock()
                .expect("pipeline workers mutex poisoned"),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pipeline worker ended abnormally");
            }
        }
        info!("Pipeline shut down");
    }

    // ── Progress ───────────────────────────────────────────────────

    /// Current progress, computed on demand.
    pub fn progress(&self, id: JobId) -> Option<ProgressSnapshot> {
        self.registry().snapshot(id)
    }

    /// Register the progress callback for a job, replacing any earlier one.
    pub fn on_progress(
        &self,
        id: JobId,
        callback: impl Fn(&ProgressSnapshot) + Send + Sync + 'static,
    ) -> Result<(), PipelineError> {
        let mut reg = self.registry();
        if !reg.jobs.contains_key(&id) {
            return Err(PipelineError::JobNotFound(id));
        }
        reg.callbacks.insert(id, Arc::new(callback));
        Ok(())
    }

    /// Returns whether a callback was registered.
    pub fn remove_progress_callback(&self, id: JobId) -> bool {
        self.registry().callbacks.remove(&id).is_some()
    }

    fn emit_progress(&self, id: JobId) {
        let (callback, snapshot) = {
            let reg = self.registry();
            let Some(callback) = reg.callbacks.get(&id).cloned() else {
                return;
            };
            let Some(snapshot) = reg.snapshot(id) else {
                return;
            };
            (callback, snapshot)
        };
        callback(&snapshot);
    }

    /// Apply `f` to a job's record, then notify its progress callback.
    pub(crate) fn update_job(&self, id: JobId, f: impl FnOnce(&mut ProcessingJob)) {
        {
            let mut reg = self.registry();
            let Some(entry) = reg.jobs.get_mut(&id) else {
                return;
            };
            f(&mut entry.job);
        }
        self.emit_progress(id);
    }

    pub(crate) fn is_cancelled(&self, id: JobId) -> bool {
        self.registry()
            .jobs
            .get(&id)
            .is_some_and(|e| e.job.status == JobStatus::Cancelled)
    }

    // ── Workers ────────────────────────────────────────────────────

    fn ensure_workers(&self) -> Result<(), PipelineError> {
        {
            let mut reg = self.registry();
            if reg.workers_started {
                return Ok(());
            }
            let handle =
                tokio::runtime::Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
            reg.workers_started = true;
            drop(reg);

            let mut workers = self
                .shared
                .workers
                .lock()
                .expect("pipeline workers mutex poisoned");
            for worker in 0..self.shared.settings.workers {
                let pipeline = self.clone();
                workers.push(handle.spawn(async move { pipeline.worker_loop(worker).await }));
            }
        }
        info!(workers = self.shared.settings.workers, "Pipeline workers started");
        Ok(())
    }

    async fn worker_loop(self, worker: usize) {
        debug!(worker, "Worker started");
        loop {
            let notified = self.shared.work_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.registry().shut_down {
                break;
            }
            match self.take_next() {
                Some(id) => self.run_job(worker, id).await,
                None => notified.await,
            }
        }
        debug!(worker, "Worker stopped");
    }

    /// Pop the next pending job and mark it in progress.
    fn take_next(&self) -> Option<JobId> {
        let mut reg = self.registry();
        while let Some(id) = reg.pending.pop_front() {
            let Some(entry) = reg.jobs.get_mut(&id) else {
                continue;
            };
            if entry.job.status != JobStatus::Pending {
                continue;
            }
            entry.job.status = JobStatus::InProgress;
            entry.job.started_at = Some(Utc::now());
            entry.started = Some(Instant::now());
            return Some(id);
        }
        None
    }

    async fn run_job(&self, worker: usize, id: JobId) {
        let started = Instant::now();
        self.shared.job_changed.notify_waiters();
        info!(worker, job_id = %id, "Job started");

        for stage in Stage::SEQUENCE {
            if self.is_cancelled(id) {
                info!(job_id = %id, stage = %stage, "Job cancelled before stage");
                break;
            }
            self.update_job(id, |job| job.stage = stage);
            let Some(job) = self.get(id) else {
                return;
            };
            let ctx = StageContext::new(job, self.clone());

            let stage_start = Instant::now();
            let outcome = tokio::time::timeout(
                self.shared.settings.stage_timeout,
                self.shared.executor.run_stage(stage, &ctx),
            )
            .await;

            let error = match outcome {
                Ok(Ok(())) => {
                    debug!(
                        job_id = %id,
                        stage = %stage,
                        elapsed_ms = stage_start.elapsed().as_millis(),
                        "Stage finished"
                    );
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(job_id = %id, stage = %stage, error = %e, "Stage failed");
                    JobError::new(JobErrorCode::StageFailed, stage, e.to_string())
                }
                Err(_) => {
                    let timeout = self.shared.settings.stage_timeout;
                    let limit_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                    warn!(job_id = %id, stage = %stage, timeout_ms = limit_ms, "Stage timed out");
                    JobError::new(
                        JobErrorCode::StageTimeout,
                        stage,
                        format!("stage {stage} exceeded {limit_ms}ms"),
                    )
                    .with_details(serde_json::json!({ "timeout_ms": limit_ms }))
                }
            };
            self.update_job(id, |job| {
                if job.status == JobStatus::InProgress {
                    job.status = JobStatus::Failed;
                    job.error = Some(error);
                    job.completed_at = Some(Utc::now());
                }
            });
            break;
        }

        self.update_job(id, |job| {
            if job.status == JobStatus::InProgress {
                job.status = JobStatus::Completed;
                job.stage = Stage::Complete;
                job.progress = 100.0;
                job.completed_at = Some(Utc::now());
            }
        });

        if let Some(job) = self.get(id) {
            self.shared.executor.finish_job(&job).await;
            info!(
                worker,
                job_id = %id,
                status = %job.status,
                elapsed_ms = started.elapsed().as_millis(),
                "Job finished"
            );
        }
        self.shared.job_changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests;
