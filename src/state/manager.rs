//! Job state manager
//!
//! [`JobStateManager`] is the only component that writes [`ExportJob`]
//! records. Each job has a slot holding the last persisted snapshot behind
//! a fair async mutex, so updates for one job are applied strictly in
//! arrival order while different jobs proceed in parallel.
//!
//! An update is a pure function from the current snapshot to the next one.
//! The manager diffs the two, writes only the changed fields with a
//! version-guarded store write, swaps the snapshot and broadcasts. A lost
//! version race reloads the snapshot and applies the update once more.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{debug, info, warn};

use crate::config::StateConfig;
use crate::error::{ExportError, Result, StorageError, TransitionError};
use crate::model::{Checkpoint, ExportArtifact, ExportJob, JobStatus, Progress};
use crate::pipeline::{Flow, StopReason};
use crate::queue::JobQueue;

use super::events::{JobEvent, StatusUpdate};
use super::retry::RetryPolicy;

const CANCELLED_MESSAGE: &str = "export cancelled";

type Slot = Arc<AsyncMutex<Option<ExportJob>>>;

pub struct JobStateManager {
    queue: Arc<JobQueue>,
    slots: Mutex<HashMap<String, Slot>>,
    events: broadcast::Sender<JobEvent>,
    hard: RetryPolicy,
    soft: RetryPolicy,
}

impl JobStateManager {
    pub fn new(queue: Arc<JobQueue>, config: &StateConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            queue,
            slots: Mutex::new(HashMap::new()),
            events,
            hard: RetryPolicy::hard(config),
            soft: RetryPolicy::best_effort(),
        }
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Persist a new job and announce it
    pub async fn create(&self, job: ExportJob) -> Result<ExportJob> {
        let slot = self.slot(&job.id);
        let mut guard = slot.lock().await;
        self.hard.run("create job", || self.queue.insert(&job)).await?;
        *guard = Some(job.clone());
        self.send(JobEvent::StatusChanged(StatusUpdate::from_job(&job)));
        debug!(job_id = %job.id, format = %job.format, "created export job");
        Ok(job)
    }

    /// Current persisted state of a job
    pub async fn get(&self, job_id: &str) -> Result<ExportJob> {
        self.queue
            .get_status(job_id)
            .await?
            .ok_or_else(|| ExportError::NotFound(job_id.to_string()))
    }

    /// A worker takes ownership of the job
    ///
    /// Accepts a pending job or a resumed one that is already `processing`,
    /// and bumps `attempt`; writes from earlier attempts are rejected from
    /// now on.
    pub async fn begin(&self, job_id: &str) -> Result<ExportJob> {
        let job = self
            .update(job_id, &self.hard, |job| {
                if !matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
                    return Err(wrong_status(job, "start"));
                }
                let mut next = job.clone();
                next.status = JobStatus::Processing;
                next.attempt = job.attempt + 1;
                next.error = None;
                if next.started_at.is_none() {
                    next.started_at = Some(Utc::now());
                }
                Ok(Some(next))
            })
            .await?;
        info!(job_id, attempt = job.attempt, "export job started");
        Ok(job)
    }

    /// Record progress and/or a durable checkpoint from the owning worker
    ///
    /// Best-effort: a failed write is logged and the run continues. The
    /// returned [`Flow`] tells the pipeline to stop when the job was paused,
    /// cancelled, or taken over in the meantime.
    pub async fn update_progress(
        &self,
        job_id: &str,
        attempt: u32,
        progress: Option<Progress>,
        checkpoint: Option<Checkpoint>,
    ) -> Flow {
        let result = self
            .update(job_id, &self.soft, |job| {
                check_owner(job, attempt)?;
                if job.status != JobStatus::Processing {
                    return Err(wrong_status(job, "report progress for"));
                }
                let mut next = job.clone();
                if let Some(p) = progress {
                    if p.processed_items >= job.progress.processed_items {
                        next.progress = Progress {
                            percentage: p.percentage.max(job.progress.percentage),
                            ..p
                        };
                    }
                }
                if let Some(ref cp) = checkpoint {
                    next.checkpoint = Some(cp.clone());
                }
                Ok(Some(next))
            })
            .await;

        match result {
            Ok(_) => Flow::Continue,
            Err(e) => match stop_reason(&e) {
                Some(reason) => {
                    debug!(job_id, attempt, %reason, "progress rejected, stopping run");
                    Flow::Stop(reason)
                }
                None => {
                    warn!(job_id, error = %e, "dropping progress update");
                    Flow::Continue
                }
            },
        }
    }

    /// Drop progress and checkpoint after the artifact was found corrupt
    pub async fn reset_progress(&self, job_id: &str, attempt: u32) -> Result<ExportJob> {
        self.update(job_id, &self.hard, |job| {
            check_owner(job, attempt)?;
            let mut next = job.clone();
            next.progress = Progress::new(0, job.progress.total_items);
            next.checkpoint = None;
            Ok(Some(next))
        })
        .await
    }

    /// Move a job to `paused`
    ///
    /// With `attempt` set this is the owning worker recording where it
    /// stopped; the job may already be paused by a direct request, in which
    /// case only the checkpoint is updated. Without it the job must not be
    /// held by any worker.
    pub async fn pause(
        &self,
        job_id: &str,
        attempt: Option<u32>,
        checkpoint: Option<Checkpoint>,
        progress: Option<Progress>,
    ) -> Result<ExportJob> {
        self.update(job_id, &self.hard, |job| {
            if let Some(attempt) = attempt {
                check_owner(job, attempt)?;
            }
            let already = job.status == JobStatus::Paused && attempt.is_some();
            if !already {
                check_transition(job, JobStatus::Paused)?;
            }
            let mut next = job.clone();
            next.status = JobStatus::Paused;
            if let Some(ref cp) = checkpoint {
                next.checkpoint = Some(cp.clone());
            }
            if let Some(p) = progress {
                next.progress = p;
            }
            Ok(Some(next))
        })
        .await
    }

    /// Move a paused job back to `processing`, ready to be queued again
    pub async fn resume(&self, job_id: &str) -> Result<ExportJob> {
        self.update(job_id, &self.hard, |job| {
            if job.status != JobStatus::Paused {
                return Err(wrong_status(job, "resume"));
            }
            let mut next = job.clone();
            next.status = JobStatus::Processing;
            next.enqueued_at = Utc::now();
            Ok(Some(next))
        })
        .await
    }

    /// Move a processing or paused job to `cancelled`
    pub async fn cancel(&self, job_id: &str, attempt: Option<u32>) -> Result<ExportJob> {
        self.update(job_id, &self.hard, |job| {
            if let Some(attempt) = attempt {
                check_owner(job, attempt)?;
            }
            check_transition(job, JobStatus::Cancelled)?;
            let mut next = job.clone();
            next.status = JobStatus::Cancelled;
            next.error = Some(CANCELLED_MESSAGE.to_string());
            next.checkpoint = None;
            next.finished_at = Some(Utc::now());
            Ok(Some(next))
        })
        .await
    }

    /// Record a finished artifact
    pub async fn complete(
        &self,
        job_id: &str,
        attempt: u32,
        artifact: ExportArtifact,
        total_items: u64,
    ) -> Result<ExportJob> {
        self.update(job_id, &self.hard, |job| {
            check_owner(job, attempt)?;
            check_transition(job, JobStatus::Completed)?;
            let mut next = job.clone();
            next.status = JobStatus::Completed;
            next.progress = Progress::complete(total_items);
            next.result = Some(artifact.clone());
            next.checkpoint = None;
            next.error = None;
            next.finished_at = Some(Utc::now());
            Ok(Some(next))
        })
        .await
    }

    /// Move a processing job to `failed`
    pub async fn fail(
        &self,
        job_id: &str,
        attempt: Option<u32>,
        error: impl Into<String>,
    ) -> Result<ExportJob> {
        let error = error.into();
        self.update(job_id, &self.hard, |job| {
            if let Some(attempt) = attempt {
                check_owner(job, attempt)?;
            }
            check_transition(job, JobStatus::Failed)?;
            let mut next = job.clone();
            next.status = JobStatus::Failed;
            next.error = Some(error.clone());
            next.checkpoint = None;
            next.finished_at = Some(Utc::now());
            Ok(Some(next))
        })
        .await
    }

    /// Put a stalled job back to `pending` and fence out its current owner
    ///
    /// Applies only while the job is still at `expected_version`, so a
    /// worker that wrote in the meantime keeps the job. Returns `None` when
    /// nothing was changed.
    pub async fn requeue(&self, job_id: &str, expected_version: u64) -> Result<Option<ExportJob>> {
        let mut changed = false;
        let job = self
            .update(job_id, &self.hard, |job| {
                if job.version != expected_version || job.status != JobStatus::Processing {
                    return Ok(None);
                }
                changed = true;
                let mut next = job.clone();
                next.status = JobStatus::Pending;
                next.attempt = job.attempt + 1;
                next.started_at = None;
                Ok(Some(next))
            })
            .await?;
        Ok(changed.then_some(job))
    }

    /// Forget the artifact of a terminal job whose file was deleted
    pub async fn clear_result(&self, job_id: &str) -> Result<ExportJob> {
        self.update(job_id, &self.hard, |job| {
            if !job.status.is_terminal() {
                return Err(wrong_status(job, "clear the result of"));
            }
            let mut next = job.clone();
            next.result = None;
            Ok(Some(next))
        })
        .await
    }

    /// Drop the in-memory snapshot of a job
    pub fn forget(&self, job_id: &str) {
        self.slots.lock().remove(job_id);
    }

    /// Number of jobs with a live snapshot
    pub fn tracked(&self) -> usize {
        self.slots.lock().len()
    }

    fn slot(&self, job_id: &str) -> Slot {
        self.slots
            .lock()
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    async fn load(&self, job_id: &str) -> Result<ExportJob> {
        self.queue
            .get_status(job_id)
            .await?
            .ok_or_else(|| ExportError::NotFound(job_id.to_string()))
    }

    /// Apply `change` to the job under its slot lock
    ///
    /// `change` returns `Ok(None)` to leave the job as it is.
    async fn update<F>(&self, job_id: &str, policy: &RetryPolicy, mut change: F) -> Result<ExportJob>
    where
        F: FnMut(&ExportJob) -> Result<Option<ExportJob>> + Send,
    {
        let slot = self.slot(job_id);
        let mut guard = slot.lock().await;
        let mut attempt = 0;
        let mut conflicts = 0;

        loop {
            let current = match guard.as_ref() {
                Some(job) => job.clone(),
                None => {
                    let job = self.load(job_id).await?;
                    *guard = Some(job.clone());
                    job
                }
            };

            let Some(mut next) = change(&current)? else {
                return Ok(current);
            };
            next.updated_at = Utc::now();
            let patch = current.diff(&next);
            if patch.is_empty() {
                return Ok(current);
            }

            match self.queue.set_status(job_id, current.version, &patch).await {
                Ok(Some(stored)) => {
                    debug!(job_id, fields = ?patch.changed_fields(), version = stored.version, "job updated");
                    *guard = Some(stored.clone());
                    self.publish(&current, &stored);
                    return Ok(stored);
                }
                Ok(None) => {
                    conflicts += 1;
                    if conflicts > 1 {
                        return Err(StorageError::VersionConflict {
                            job_id: job_id.to_string(),
                            expected: current.version,
                        }
                        .into());
                    }
                    debug!(job_id, version = current.version, "version conflict, reloading job");
                    *guard = Some(self.load(job_id).await?);
                }
                Err(e) if policy.should_retry(attempt, e.is_transient()) => {
                    let delay = policy.delay(attempt);
                    warn!(job_id, attempt, delay_ms = delay.as_millis() as u64, error = %e, "job write failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Broadcast client-visible changes between two snapshots
    fn publish(&self, prev: &ExportJob, next: &ExportJob) {
        let visible = prev.status != next.status
            || prev.progress != next.progress
            || prev.result != next.result
            || prev.error != next.error;
        if !visible {
            return;
        }
        self.send(JobEvent::StatusChanged(StatusUpdate::from_job(next)));

        if prev.status == next.status {
            return;
        }
        let special = match next.status {
            JobStatus::Completed => next.result.as_ref().map(|r| JobEvent::Completed {
                job_id: next.id.clone(),
                filename: r.filename.clone(),
                total_items: next.progress.total_items,
                size_bytes: r.size_bytes,
            }),
            JobStatus::Failed => Some(JobEvent::Failed {
                job_id: next.id.clone(),
                error: next.error.clone().unwrap_or_default(),
            }),
            JobStatus::Cancelled => Some(JobEvent::Cancelled {
                job_id: next.id.clone(),
            }),
            _ => None,
        };
        if let Some(event) = special {
            self.send(event);
        }
    }

    fn send(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn check_owner(job: &ExportJob, attempt: u32) -> Result<()> {
    if job.attempt != attempt {
        return Err(TransitionError::StaleAttempt {
            job_id: job.id.clone(),
            expected: attempt,
            found: job.attempt,
        }
        .into());
    }
    Ok(())
}

fn check_transition(job: &ExportJob, to: JobStatus) -> Result<()> {
    if !job.status.can_transition_to(to) {
        return Err(TransitionError::Illegal {
            job_id: job.id.clone(),
            from: job.status,
            to,
        }
        .into());
    }
    Ok(())
}

fn wrong_status(job: &ExportJob, operation: &'static str) -> ExportError {
    TransitionError::WrongStatus {
        job_id: job.id.clone(),
        status: job.status,
        operation,
    }
    .into()
}

/// Stop reason implied by a rejected progress write
fn stop_reason(err: &ExportError) -> Option<StopReason> {
    match err {
        ExportError::Transition(TransitionError::StaleAttempt { .. }) => Some(StopReason::Superseded),
        ExportError::Transition(TransitionError::WrongStatus { status, .. }) => Some(match status {
            JobStatus::Paused => StopReason::Paused,
            JobStatus::Cancelled => StopReason::Cancelled,
            _ => StopReason::Superseded,
        }),
        ExportError::NotFound(_) => Some(StopReason::Superseded),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExportFormat, JobPriority, NormalizedFilters};
    use crate::store::{MemoryStore, PriorityQueueStore};
    use std::path::PathBuf;

    fn config() -> StateConfig {
        StateConfig {
            retry_attempts: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            event_capacity: 64,
        }
    }

    fn new_job() -> ExportJob {
        ExportJob::new(
            ExportFormat::Csv,
            NormalizedFilters::default(),
            "key".to_string(),
            JobPriority::Normal,
            None,
            Utc::now(),
        )
    }

    fn setup() -> (JobStateManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new(store.clone()));
        (JobStateManager::new(queue, &config()), store)
    }

    fn artifact() -> ExportArtifact {
        ExportArtifact {
            temp_path: PathBuf::from("/tmp/x.csv"),
            filename: "x.csv".to_string(),
            size_bytes: 42,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_lifecycle_broadcasts_each_visible_change() {
        let (manager, _) = setup();
        let mut rx = manager.subscribe();
        let job = manager.create(new_job()).await.unwrap();

        let job = manager.begin(&job.id).await.unwrap();
        assert_eq!(job.attempt, 1);
        for i in 1..=3 {
            let flow = manager
                .update_progress(&job.id, 1, Some(Progress::new(i, 3)), None)
                .await;
            assert_eq!(flow, Flow::Continue);
        }
        let cp = Checkpoint {
            last_processed_key: Some("k".into()),
            last_valid_byte_offset: 10,
            processed_items: 3,
        };
        manager.update_progress(&job.id, 1, None, Some(cp)).await;
        let done = manager.complete(&job.id, 1, artifact(), 3).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.checkpoint, None);

        let events = drain(&mut rx);
        let statuses: Vec<(JobStatus, u8)> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::StatusChanged(u) => Some((u.status, u.progress)),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                (JobStatus::Pending, 0),
                (JobStatus::Processing, 0),
                (JobStatus::Processing, 33),
                (JobStatus::Processing, 66),
                (JobStatus::Processing, 100),
                (JobStatus::Completed, 100),
            ]
        );
        assert!(matches!(
            events.last(),
            Some(JobEvent::Completed { total_items: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_illegal_transitions_are_rejected() {
        let (manager, _) = setup();
        let job = manager.create(new_job()).await.unwrap();

        let err = manager.cancel(&job.id, None).await.unwrap_err();
        assert!(matches!(
            err,
            ExportError::Transition(TransitionError::Illegal { .. })
        ));
        assert!(manager.resume(&job.id).await.is_err());

        manager.begin(&job.id).await.unwrap();
        manager.fail(&job.id, Some(1), "boom").await.unwrap();
        assert!(manager.complete(&job.id, 1, artifact(), 1).await.is_err());
        assert!(manager.pause(&job.id, None, None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_attempt_is_fenced() {
        let (manager, _) = setup();
        let job = manager.create(new_job()).await.unwrap();
        let first = manager.begin(&job.id).await.unwrap();

        let requeued = manager.requeue(&job.id, first.version).await.unwrap();
        assert!(requeued.is_some());
        let second = manager.begin(&job.id).await.unwrap();
        assert_eq!(second.attempt, 3);

        let flow = manager
            .update_progress(&job.id, first.attempt, Some(Progress::new(1, 2)), None)
            .await;
        assert_eq!(flow, Flow::Stop(StopReason::Superseded));
        let err = manager
            .complete(&job.id, first.attempt, artifact(), 2)
            .await
            .unwrap_err();
        assert!(err.is_stale_attempt());

        manager
            .complete(&job.id, second.attempt, artifact(), 2)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_requeue_ignores_newer_version() {
        let (manager, _) = setup();
        let job = manager.create(new_job()).await.unwrap();
        let started = manager.begin(&job.id).await.unwrap();
        manager
            .update_progress(&job.id, started.attempt, Some(Progress::new(1, 4)), None)
            .await;

        assert!(manager.requeue(&job.id, started.version).await.unwrap().is_none());
        assert_eq!(manager.get(&job.id).await.unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_progress_never_moves_backwards() {
        let (manager, _) = setup();
        let job = manager.create(new_job()).await.unwrap();
        manager.begin(&job.id).await.unwrap();
        manager
            .update_progress(&job.id, 1, Some(Progress::new(5, 10)), None)
            .await;
        manager
            .update_progress(&job.id, 1, Some(Progress::new(3, 10)), None)
            .await;
        let job = manager.get(&job.id).await.unwrap();
        assert_eq!(job.progress.processed_items, 5);
        assert_eq!(job.progress.percentage, 50);
    }

    #[tokio::test]
    async fn test_paused_job_stops_progress() {
        let (manager, _) = setup();
        let job = manager.create(new_job()).await.unwrap();
        manager.begin(&job.id).await.unwrap();
        manager.pause(&job.id, None, None, None).await.unwrap();

        let flow = manager
            .update_progress(&job.id, 1, Some(Progress::new(2, 10)), None)
            .await;
        assert_eq!(flow, Flow::Stop(StopReason::Paused));

        // The owner may still record its checkpoint on an already paused job.
        let cp = Checkpoint {
            last_processed_key: Some("k".into()),
            last_valid_byte_offset: 9,
            processed_items: 1,
        };
        let paused = manager
            .pause(&job.id, Some(1), Some(cp.clone()), Some(Progress::new(1, 10)))
            .await
            .unwrap();
        assert_eq!(paused.checkpoint, Some(cp));

        let resumed = manager.resume(&job.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_for_terminal_writes() {
        let (manager, store) = setup();
        let job = manager.create(new_job()).await.unwrap();
        manager.begin(&job.id).await.unwrap();

        store.fail_next_writes(2);
        let done = manager.complete(&job.id, 1, artifact(), 5).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_progress_write_failure_is_skipped() {
        let (manager, store) = setup();
        let job = manager.create(new_job()).await.unwrap();
        manager.begin(&job.id).await.unwrap();

        store.fail_next_writes(1);
        let flow = manager
            .update_progress(&job.id, 1, Some(Progress::new(1, 10)), None)
            .await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(manager.get(&job.id).await.unwrap().progress.processed_items, 0);
    }

    #[tokio::test]
    async fn test_conflicting_writer_is_reloaded() {
        let (manager, store) = setup();
        let job = manager.create(new_job()).await.unwrap();
        let started = manager.begin(&job.id).await.unwrap();

        // Someone else writes behind the manager's back.
        let patch = crate::model::JobPatch {
            error: Some(Some("external".into())),
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        store.update_job(&job.id, started.version, &patch).await.unwrap();

        let paused = manager.pause(&job.id, None, None, None).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.error.as_deref(), Some("external"));
    }
}
