//! Worker-side execution of an export job
//!
//! [`ExportRunner`] takes ownership of the job in the state manager, runs
//! the pipeline with a [`JobObserver`] wired to the state manager and the
//! worker's control inbox, then records the outcome. The terminal state is
//! always persisted before the artifact is deleted or the queue entry is
//! acknowledged.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::cache::ResultCache;
use crate::error::{ExportError, Result};
use crate::lifecycle::artifact_path;
use crate::model::{Checkpoint, ExportArtifact, ExportJob, JobStatus, Progress};
use crate::pipeline::{
    ArtifactSink, ExportCoordinator, ExportPlan, Flow, PipelineObserver, PipelineOutcome,
    StopReason,
};
use crate::queue::JobQueue;
use crate::state::JobStateManager;
use crate::worker::{Assignment, ControlInbox, JobRegistry, JobRunner};

pub struct ExportRunner {
    manager: Arc<JobStateManager>,
    queue: Arc<JobQueue>,
    cache: Arc<ResultCache>,
    registry: Arc<JobRegistry>,
    coordinator: ExportCoordinator,
    temp_dir: PathBuf,
}

impl ExportRunner {
    pub fn new(
        manager: Arc<JobStateManager>,
        queue: Arc<JobQueue>,
        cache: Arc<ResultCache>,
        registry: Arc<JobRegistry>,
        coordinator: ExportCoordinator,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            manager,
            queue,
            cache,
            registry,
            coordinator,
            temp_dir,
        }
    }

    fn plan(&self, job: &ExportJob) -> ExportPlan {
        ExportPlan {
            job_id: job.id.clone(),
            format: job.format,
            filters: job.filters.clone(),
            as_of: job.created_at,
            artifact_path: artifact_path(&self.temp_dir, job),
            checkpoint: job.checkpoint.clone(),
            known_total: job
                .checkpoint
                .as_ref()
                .map(|_| job.progress.total_items),
        }
    }

    async fn record_outcome(&self, job: &ExportJob, plan: &ExportPlan, outcome: Result<PipelineOutcome>) {
        let id = job.id.as_str();
        let attempt = job.attempt;

        match outcome {
            Ok(PipelineOutcome::Completed {
                total_processed,
                artifact_path,
                size_bytes,
            }) => {
                let artifact = ExportArtifact {
                    temp_path: artifact_path,
                    filename: job.filename.clone(),
                    size_bytes,
                };
                match self.manager.complete(id, attempt, artifact, total_processed).await {
                    Ok(_) => {
                        info!(job_id = id, total_processed, size_bytes, "export completed");
                        if let Err(e) = self.cache.mark_completed(&job.cache_key, id, size_bytes).await {
                            warn!(job_id = id, error = %e, "failed to start cache TTL");
                        }
                        self.ack(id).await;
                    }
                    Err(e) if e.is_stale_attempt() => {
                        debug!(job_id = id, attempt, "completion from superseded attempt ignored");
                    }
                    Err(e) => error!(job_id = id, error = %e, "failed to record completion"),
                }
            }
            Ok(PipelineOutcome::Paused {
                processed_items,
                checkpoint,
                progress,
                ..
            }) => match self
                .manager
                .pause(id, Some(attempt), Some(checkpoint), Some(progress))
                .await
            {
                Ok(_) => {
                    info!(job_id = id, processed_items, "export paused");
                    self.ack(id).await;
                }
                Err(e) if e.is_stale_attempt() => {
                    debug!(job_id = id, attempt, "pause from superseded attempt ignored");
                }
                Err(e) => error!(job_id = id, error = %e, "failed to record pause"),
            },
            Ok(PipelineOutcome::Cancelled {
                processed_items,
                artifact_path,
            }) => {
                let cancelled = match self.manager.cancel(id, Some(attempt)).await {
                    Ok(_) => true,
                    Err(e) if e.is_stale_attempt() => false,
                    Err(e) => {
                        // A direct cancel may have won the race.
                        let current = self.manager.get(id).await;
                        let already = matches!(current, Ok(ref job) if job.status == JobStatus::Cancelled);
                        if !already {
                            error!(job_id = id, error = %e, "failed to record cancellation");
                        }
                        already
                    }
                };
                if cancelled {
                    info!(job_id = id, processed_items, "export cancelled");
                    self.discard(job, &artifact_path).await;
                }
            }
            Ok(PipelineOutcome::Superseded) => {
                debug!(job_id = id, attempt, "run superseded by a newer attempt");
            }
            Err(e) => {
                error!(job_id = id, error = %e, "export failed");
                match self.manager.fail(id, Some(attempt), e.to_string()).await {
                    Ok(_) => self.discard(job, &plan.artifact_path).await,
                    Err(e) if e.is_stale_attempt() => {
                        debug!(job_id = id, attempt, "failure from superseded attempt ignored");
                    }
                    Err(e) => error!(job_id = id, error = %e, "failed to record failure"),
                }
            }
        }

        if let Ok(current) = self.manager.get(id).await {
            if current.status.is_terminal() {
                self.manager.forget(id);
            }
        }
    }

    /// Delete the artifact, drop the cache entry and the queue entry
    async fn discard(&self, job: &ExportJob, path: &std::path::Path) {
        if let Err(e) = ArtifactSink::delete(path).await {
            warn!(job_id = %job.id, error = %e, "failed to delete artifact");
        }
        if let Err(e) = self.cache.evict(&job.cache_key, &job.id).await {
            warn!(job_id = %job.id, error = %e, "failed to evict cache entry");
        }
        self.ack(&job.id).await;
    }

    async fn ack(&self, job_id: &str) {
        if let Err(e) = self.queue.ack(job_id).await {
            warn!(job_id, error = %e, "failed to acknowledge queue entry");
        }
    }
}

#[async_trait]
impl JobRunner for ExportRunner {
    async fn run(&self, assignment: Assignment, control: ControlInbox<'_>) {
        let job_id = assignment.job.id.clone();
        let job = match self.manager.begin(&job_id).await {
            Ok(job) => job,
            Err(e) if e.is_transient() => {
                warn!(job_id = %job_id, error = %e, "could not start job, returning it to the queue");
                if let Err(e) = self.queue.release(&assignment.entry).await {
                    warn!(job_id = %job_id, error = %e, "failed to requeue job");
                }
                return;
            }
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "job is not runnable, dropping queue entry");
                self.ack(&job_id).await;
                return;
            }
        };
        self.registry
            .record_attempt(&job_id, assignment.lease, job.attempt);

        let plan = self.plan(&job);
        let mut observer = JobObserver {
            manager: &self.manager,
            job_id: &job_id,
            attempt: job.attempt,
            control,
        };
        let outcome = self.coordinator.execute(&plan, &mut observer).await;
        self.record_outcome(&job, &plan, outcome).await;
    }

    async fn on_worker_lost(&self, job_id: &str, attempt: Option<u32>) {
        let job = match self.manager.get(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id, error = %e, "cannot load job of terminated worker");
                return;
            }
        };
        match job.status {
            JobStatus::Pending => {
                // Lost before it started; give it to another worker.
                if let Err(e) = self.queue.enqueue(job_id, job.priority, job.enqueued_at).await {
                    warn!(job_id, error = %e, "failed to requeue job of terminated worker");
                }
            }
            JobStatus::Processing => {
                let reason = ExportError::WorkerTerminated.to_string();
                match self.manager.fail(job_id, attempt, reason).await {
                    Ok(_) => {
                        let path = artifact_path(&self.temp_dir, &job);
                        self.discard(&job, &path).await;
                        self.manager.forget(job_id);
                    }
                    Err(e) => warn!(job_id, error = %e, "failed to fail job of terminated worker"),
                }
            }
            _ => self.ack(job_id).await,
        }
    }
}

/// Pipeline observer bound to one job attempt
struct JobObserver<'a> {
    manager: &'a JobStateManager,
    job_id: &'a str,
    attempt: u32,
    control: ControlInbox<'a>,
}

#[async_trait]
impl PipelineObserver for JobObserver<'_> {
    async fn on_progress(
        &mut self,
        progress: Option<Progress>,
        checkpoint: Option<Checkpoint>,
    ) -> Flow {
        if let Some(reason) = self.control.try_recv() {
            return Flow::Stop(reason);
        }
        self.manager
            .update_progress(self.job_id, self.attempt, progress, checkpoint)
            .await
    }

    async fn on_restart(&mut self) -> Result<()> {
        self.manager
            .reset_progress(self.job_id, self.attempt)
            .await
            .map(|_| ())
    }

    fn poll_stop(&mut self) -> Option<StopReason> {
        self.control.try_recv()
    }

    async fn stopped(&mut self) -> StopReason {
        self.control.recv().await
    }
}
