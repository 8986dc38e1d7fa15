//! Priority job store
//!
//! [`JobQueue`] layers the export queue semantics over a
//! [`PriorityQueueStore`]: priority scores, stale-entry skipping on dequeue,
//! startup recovery of jobs orphaned by a dead process, stall detection,
//! and retention cleanup of terminal job records.
//!
//! Entries follow the reliable-queue pattern. `dequeue_next` flips an entry
//! from `queued` to `inflight` instead of deleting it; the entry is
//! acknowledged when the job pauses or finishes. Whatever is still in flight
//! at startup belonged to a process that died.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{ExportJob, JobPatch, JobPriority, JobStatus};
use crate::store::{EntryState, JobQuery, PriorityQueueStore, QueueEntry};

/// Score distance between adjacent priority classes, larger than any epoch-millis timestamp
pub const PRIORITY_WEIGHT: i64 = 10_000_000_000_000;

/// Queue score of a job: priority class first, then enqueue time
pub fn score(priority: JobPriority, enqueued_at: DateTime<Utc>) -> i64 {
    priority.rank() * PRIORITY_WEIGHT + enqueued_at.timestamp_millis()
}

/// Outcome of a startup recovery pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs reset to pending and put back in the queue
    pub requeued: Vec<String>,
    /// Stale entries removed because their job was gone, paused, or terminal
    pub discarded: Vec<String>,
}

pub struct JobQueue {
    store: Arc<dyn PriorityQueueStore>,
    seq: AtomicU64,
    notify: Notify,
    owner: String,
}

impl JobQueue {
    pub fn new(store: Arc<dyn PriorityQueueStore>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            store,
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            owner: format!("{host}-{}", std::process::id()),
        }
    }

    pub fn store(&self) -> &Arc<dyn PriorityQueueStore> {
        &self.store
    }

    /// Persist a new job record
    pub async fn insert(&self, job: &ExportJob) -> Result<()> {
        self.store.insert_job(job).await
    }

    /// Add a job to the queue, replacing any entry it already has
    pub async fn enqueue(
        &self,
        job_id: &str,
        priority: JobPriority,
        enqueued_at: DateTime<Utc>,
    ) -> Result<QueueEntry> {
        let entry = QueueEntry {
            job_id: job_id.to_string(),
            score: score(priority, enqueued_at),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            state: EntryState::Queued,
            claimed_by: None,
            claimed_at: None,
        };
        self.store.push_entry(&entry).await?;
        debug!(job_id, %priority, score = entry.score, "enqueued export job");
        self.notify.notify_one();
        Ok(entry)
    }

    /// Pop the best runnable job
    ///
    /// Entries whose job is missing, paused, or terminal are acknowledged
    /// and skipped.
    pub async fn dequeue_next(&self) -> Result<Option<(QueueEntry, ExportJob)>> {
        loop {
            let Some(entry) = self.store.pop_min(&self.owner).await? else {
                return Ok(None);
            };
            match self.store.get_job(&entry.job_id).await? {
                Some(job) if matches!(job.status, JobStatus::Pending | JobStatus::Processing) => {
                    return Ok(Some((entry, job)));
                }
                Some(job) => {
                    debug!(job_id = %job.id, status = %job.status, "skipping stale queue entry");
                    self.store.remove_entry(&entry.job_id).await?;
                }
                None => {
                    debug!(job_id = %entry.job_id, "skipping queue entry of deleted job");
                    self.store.remove_entry(&entry.job_id).await?;
                }
            }
        }
    }

    /// Put a popped entry back without changing its position
    ///
    /// Does not wake the dispatcher; the entry becomes visible on its next
    /// pass.
    pub async fn release(&self, entry: &QueueEntry) -> Result<()> {
        self.store.push_entry(entry).await
    }

    /// Acknowledge a job's entry once it paused or finished
    pub async fn ack(&self, job_id: &str) -> Result<bool> {
        self.store.remove_entry(job_id).await
    }

    pub async fn get_status(&self, job_id: &str) -> Result<Option<ExportJob>> {
        self.store.get_job(job_id).await
    }

    /// Conditional write of changed job fields
    pub async fn set_status(
        &self,
        job_id: &str,
        expected_version: u64,
        patch: &JobPatch,
    ) -> Result<Option<ExportJob>> {
        self.store.update_job(job_id, expected_version, patch).await
    }

    /// Page of job history, newest first, with the total count
    pub async fn history(&self, skip: u64, limit: u64) -> Result<(Vec<ExportJob>, u64)> {
        let query = JobQuery {
            skip,
            limit: Some(limit),
            ..Default::default()
        };
        let jobs = self.store.find_jobs(&query).await?;
        let total = self.store.count_jobs(&JobQuery::default()).await?;
        Ok((jobs, total))
    }

    pub async fn queued_len(&self) -> Result<u64> {
        self.store.queued_count().await
    }

    /// Wait until something was enqueued
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Requeue jobs orphaned by a previous process
    ///
    /// In-flight entries and `processing` records are reset to `pending`
    /// with a version-guarded write and re-enqueued with their original
    /// priority and enqueue time. Terminal jobs only lose their stale entry,
    /// so a finished job is never run twice. Pending jobs that lost their
    /// entry are pushed again.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for entry in self.store.inflight_entries().await? {
            match self.store.get_job(&entry.job_id).await? {
                Some(job) if matches!(job.status, JobStatus::Pending | JobStatus::Processing) => {
                    self.reset_to_pending(&job).await?;
                    self.store.push_entry(&entry).await?;
                    report.requeued.push(job.id);
                }
                _ => {
                    self.store.remove_entry(&entry.job_id).await?;
                    report.discarded.push(entry.job_id);
                }
            }
        }

        let orphaned = self
            .store
            .find_jobs(&JobQuery::with_statuses(&[
                JobStatus::Processing,
                JobStatus::Pending,
            ]))
            .await?;
        for job in orphaned {
            if report.requeued.contains(&job.id) {
                continue;
            }
            let entry = self.store.get_entry(&job.id).await?;
            if job.status == JobStatus::Processing {
                self.reset_to_pending(&job).await?;
            }
            match entry {
                Some(_) if job.status == JobStatus::Pending => continue,
                Some(entry) => self.store.push_entry(&entry).await?,
                None => {
                    self.enqueue(&job.id, job.priority, job.enqueued_at).await?;
                }
            }
            report.requeued.push(job.id);
        }

        if !report.requeued.is_empty() || !report.discarded.is_empty() {
            info!(
                requeued = report.requeued.len(),
                discarded = report.discarded.len(),
                "recovered export queue"
            );
            self.notify.notify_one();
        }
        Ok(report)
    }

    async fn reset_to_pending(&self, job: &ExportJob) -> Result<()> {
        if job.status != JobStatus::Processing {
            return Ok(());
        }
        let patch = JobPatch {
            status: Some(JobStatus::Pending),
            started_at: Some(None),
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        if self.store.update_job(&job.id, job.version, &patch).await?.is_none() {
            warn!(job_id = %job.id, "job changed during recovery, leaving it as is");
        }
        Ok(())
    }

    /// In-flight jobs that have not been written for longer than `timeout`
    ///
    /// Queued entries are ignored: a resumed job waiting for a worker is
    /// `processing` without being stalled.
    pub async fn stalled(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<ExportJob>> {
        let cutoff = now - timeout;
        let mut stalled = Vec::new();
        for entry in self.store.inflight_entries().await? {
            if let Some(job) = self.store.get_job(&entry.job_id).await? {
                if job.status == JobStatus::Processing && job.updated_at < cutoff {
                    stalled.push(job);
                }
            }
        }
        Ok(stalled)
    }

    /// Delete terminal job records that finished before `cutoff`
    pub async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExportJob>> {
        let query = JobQuery {
            statuses: JobStatus::TERMINAL.to_vec(),
            finished_before: Some(cutoff),
            ..Default::default()
        };
        let expired = self.store.find_jobs(&query).await?;
        for job in &expired {
            self.store.delete_job(&job.id).await?;
            self.store.remove_entry(&job.id).await?;
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "removed expired export job records");
        }
        Ok(expired)
    }
}
