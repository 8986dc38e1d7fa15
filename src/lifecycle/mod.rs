//! Artifact retention and cleanup
//!
//! A sweep removes, in order:
//!
//! 1. artifacts of terminal jobs past the retention window, clearing the
//!    job's result pointer
//! 2. terminal job records past the job retention window
//! 3. files in the temp directory that no tracked job refers to, once they
//!    are older than the orphan grace period
//! 4. cache entries whose job or artifact is gone
//!
//! Temp files are named `{job_id}.{ext}`, which is how a file is tied back
//! to its job.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ResultCache, artifact_exists};
use crate::config::LifecycleConfig;
use crate::error::Result;
use crate::model::{ExportJob, JobStatus};
use crate::pipeline::ArtifactSink;
use crate::queue::JobQueue;
use crate::state::JobStateManager;
use crate::store::JobQuery;

/// What one sweep removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_artifacts: usize,
    pub expired_jobs: usize,
    pub orphaned_files: usize,
    pub dangling_cache_entries: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Artifact path of a job
pub fn artifact_path(temp_dir: &Path, job: &ExportJob) -> PathBuf {
    temp_dir.join(format!("{}.{}", job.id, job.format.extension()))
}

pub struct ArtifactLifecycle {
    queue: Arc<JobQueue>,
    manager: Arc<JobStateManager>,
    cache: Arc<ResultCache>,
    temp_dir: PathBuf,
    config: LifecycleConfig,
}

impl ArtifactLifecycle {
    pub fn new(
        queue: Arc<JobQueue>,
        manager: Arc<JobStateManager>,
        cache: Arc<ResultCache>,
        temp_dir: PathBuf,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            queue,
            manager,
            cache,
            temp_dir,
            config,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as if the current time were `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport {
            expired_artifacts: self.expire_artifacts(now).await?,
            expired_jobs: self.expire_jobs(now).await?,
            ..Default::default()
        };
        report.orphaned_files = self.remove_orphans(now).await?;
        report.dangling_cache_entries = self.remove_dangling_cache_entries().await?;

        if report.is_empty() {
            debug!("artifact sweep found nothing to remove");
        } else {
            info!(
                expired_artifacts = report.expired_artifacts,
                expired_jobs = report.expired_jobs,
                orphaned_files = report.orphaned_files,
                dangling_cache_entries = report.dangling_cache_entries,
                "artifact sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `sweep_interval` until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.sweep_interval().max(StdDuration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "artifact sweep failed");
                        }
                    }
                }
            }
        })
    }

    async fn expire_artifacts(&self, now: DateTime<Utc>) -> Result<usize> {
        let query = JobQuery {
            statuses: JobStatus::TERMINAL.to_vec(),
            finished_before: Some(now - to_chrono(self.config.artifact_retention())),
            ..Default::default()
        };
        let mut removed = 0;
        for job in self.queue.store().find_jobs(&query).await? {
            let Some(ref artifact) = job.result else {
                continue;
            };
            if let Err(e) = self.expire_artifact(&job, &artifact.temp_path).await {
                warn!(job_id = %job.id, error = %e, "failed to expire artifact");
                continue;
            }
            debug!(job_id = %job.id, path = %artifact.temp_path.display(), "deleted expired artifact");
            removed += 1;
        }
        Ok(removed)
    }

    async fn expire_artifact(&self, job: &ExportJob, path: &Path) -> Result<()> {
        ArtifactSink::delete(path).await?;
        self.manager.clear_result(&job.id).await?;
        self.cache.evict(&job.cache_key, &job.id).await?;
        self.manager.forget(&job.id);
        Ok(())
    }

    async fn expire_jobs(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - to_chrono(self.config.job_retention());
        let removed = self.queue.cleanup(cutoff).await?;
        for job in &removed {
            if let Err(e) = self.release_job(job).await {
                warn!(job_id = %job.id, error = %e, "failed to clean up expired job");
            }
        }
        Ok(removed.len())
    }

    /// Drop the file and cache entry of a job whose record is already gone
    async fn release_job(&self, job: &ExportJob) -> Result<()> {
        self.manager.forget(&job.id);
        if let Some(ref artifact) = job.result {
            ArtifactSink::delete(&artifact.temp_path).await?;
        }
        self.cache.evict(&job.cache_key, &job.id).await?;
        Ok(())
    }

    async fn remove_orphans(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut dir = match tokio::fs::read_dir(&self.temp_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let grace_cutoff = now - to_chrono(self.config.orphan_grace());
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = metadata.modified()?.into();
            if modified > grace_cutoff {
                continue;
            }
            let Some(job_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if self.is_referenced(job_id, &path).await? {
                continue;
            }
            if ArtifactSink::delete(&path).await? {
                debug!(path = %path.display(), "deleted orphaned artifact");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Whether a live job still owns the file at `path`
    async fn is_referenced(&self, job_id: &str, path: &Path) -> Result<bool> {
        let Some(job) = self.queue.get_status(job_id).await? else {
            return Ok(false);
        };
        Ok(match job.status {
            JobStatus::Pending | JobStatus::Processing | JobStatus::Paused => true,
            _ => job.result.is_some_and(|r| r.temp_path.as_path() == path),
        })
    }

    async fn remove_dangling_cache_entries(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in self.cache.entries().await? {
            let live = match self.queue.get_status(&entry.job_id).await? {
                Some(job) => match job.status {
                    JobStatus::Pending | JobStatus::Processing => true,
                    JobStatus::Completed => match job.result {
                        Some(ref artifact) => artifact_exists(&artifact.temp_path).await,
                        None => false,
                    },
                    JobStatus::Paused | JobStatus::Failed | JobStatus::Cancelled => false,
                },
                None => false,
            };
            if !live && self.cache.evict(&entry.key, &entry.job_id).await? {
                debug!(key = %entry.key, job_id = %entry.job_id, "removed dangling cache entry");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn to_chrono(duration: StdDuration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, StateConfig};
    use crate::model::{ExportArtifact, ExportFormat, JobPriority, NormalizedFilters};
    use crate::store::{CacheEntry, CacheStore, MemoryStore};

    struct Fixture {
        lifecycle: ArtifactLifecycle,
        manager: Arc<JobStateManager>,
        cache: Arc<ResultCache>,
        store: Arc<MemoryStore>,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new(store.clone()));
        let state = StateConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            ..Default::default()
        };
        let manager = Arc::new(JobStateManager::new(queue.clone(), &state));
        let cache = Arc::new(ResultCache::new(
            store.clone(),
            queue.clone(),
            CacheConfig::default(),
        ));
        let config = LifecycleConfig {
            artifact_retention_secs: 3600,
            job_retention_secs: 7 * 24 * 3600,
            orphan_grace_secs: 0,
            ..Default::default()
        };
        let lifecycle = ArtifactLifecycle::new(
            queue,
            manager.clone(),
            cache.clone(),
            dir.path().to_path_buf(),
            config,
        );
        Fixture {
            lifecycle,
            manager,
            cache,
            store,
            dir,
        }
    }

    async fn completed_job(f: &Fixture) -> ExportJob {
        let job = ExportJob::new(
            ExportFormat::Csv,
            NormalizedFilters::default(),
            format!("key-{}", uuid::Uuid::new_v4()),
            JobPriority::Normal,
            None,
            Utc::now(),
        );
        let job = f.manager.create(job).await.unwrap();
        let job = f.manager.begin(&job.id).await.unwrap();
        let path = artifact_path(f.dir.path(), &job);
        tokio::fs::write(&path, b"id\n1\n").await.unwrap();
        let artifact = ExportArtifact {
            temp_path: path,
            filename: job.filename.clone(),
            size_bytes: 5,
        };
        f.store
            .put_cached(&CacheEntry {
                key: job.cache_key.clone(),
                job_id: job.id.clone(),
                format: job.format,
                size_bytes: Some(5),
                created_at: Utc::now(),
                expires_at: None,
            })
            .await
            .unwrap();
        f.manager
            .complete(&job.id, job.attempt, artifact, 1)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_results_survive() {
        let f = fixture();
        let job = completed_job(&f).await;
        let report = f.lifecycle.sweep().await.unwrap();
        assert!(report.is_empty(), "{report:?}");
        assert!(job.result.unwrap().temp_path.exists());
    }

    #[tokio::test]
    async fn test_expired_artifact_is_removed_and_pointer_cleared() {
        let f = fixture();
        let job = completed_job(&f).await;
        let path = job.result.clone().unwrap().temp_path;

        let report = f
            .lifecycle
            .sweep_at(Utc::now() + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(report.expired_artifacts, 1);
        assert!(!path.exists());
        let job = f.manager.get(&job.id).await.unwrap();
        assert!(job.result.is_none());
        assert!(f.cache.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_old_job_records_are_deleted() {
        let f = fixture();
        let job = completed_job(&f).await;
        let report = f
            .lifecycle
            .sweep_at(Utc::now() + Duration::days(8))
            .await
            .unwrap();
        assert_eq!(report.expired_artifacts, 1);
        assert_eq!(report.expired_jobs, 1);
        assert!(f.manager.get(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn test_orphans_and_dangling_entries() {
        let f = fixture();
        let orphan = f.dir.path().join("no-such-job.csv");
        tokio::fs::write(&orphan, b"junk").await.unwrap();

        let job = completed_job(&f).await;
        tokio::fs::remove_file(&job.result.unwrap().temp_path)
            .await
            .unwrap();

        let report = f
            .lifecycle
            .sweep_at(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.orphaned_files, 1);
        assert_eq!(report.dangling_cache_entries, 1);
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn test_partial_artifact_of_paused_job_is_kept() {
        let f = fixture();
        let job = ExportJob::new(
            ExportFormat::Json,
            NormalizedFilters::default(),
            "paused".to_string(),
            JobPriority::Normal,
            None,
            Utc::now(),
        );
        let job = f.manager.create(job).await.unwrap();
        f.manager.begin(&job.id).await.unwrap();
        f.manager.pause(&job.id, None, None, None).await.unwrap();
        let path = artifact_path(f.dir.path(), &job);
        tokio::fs::write(&path, b"[\n{}").await.unwrap();

        let report = f
            .lifecycle
            .sweep_at(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.orphaned_files, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_failed_expiry_does_not_abort_sweep() {
        let f = fixture();
        let job = completed_job(&f).await;
        let orphan = f.dir.path().join("stray.json");
        tokio::fs::write(&orphan, b"[]").await.unwrap();

        f.store.fail_next_writes(100);
        let later = Utc::now() + Duration::hours(2);
        let report = f.lifecycle.sweep_at(later).await.unwrap();
        assert_eq!(report.expired_artifacts, 0);
        assert_eq!(report.orphaned_files, 1);
        assert!(!orphan.exists());
        assert!(f.manager.get(&job.id).await.unwrap().result.is_some());

        f.store.fail_next_writes(0);
        let report = f.lifecycle.sweep_at(later).await.unwrap();
        assert_eq!(report.expired_artifacts, 1);
        assert!(f.manager.get(&job.id).await.unwrap().result.is_none());
    }
}
