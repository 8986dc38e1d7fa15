//! Content-addressed result cache
//!
//! Requests are keyed by the fingerprint of `(format, normalized filters)`.
//! A lookup either serves a completed artifact, joins the job already
//! working on the same fingerprint, or creates a new job. Lookups for one
//! key are serialized through striped async locks, so two concurrent
//! requests cannot both miss and start duplicate jobs.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::model::{ExportFormat, ExportJob, JobStatus};
use crate::queue::JobQueue;
use crate::store::{CacheEntry, CacheStore};

/// How a request was resolved
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// A completed, unexpired artifact exists
    Hit(ExportJob),
    /// A job for the same fingerprint is pending or processing
    InFlight(ExportJob),
    /// No reusable job; a new one was created
    Created(ExportJob),
}

impl CacheLookup {
    pub fn job(&self) -> &ExportJob {
        match self {
            CacheLookup::Hit(job) | CacheLookup::InFlight(job) | CacheLookup::Created(job) => job,
        }
    }

    pub fn into_job(self) -> ExportJob {
        match self {
            CacheLookup::Hit(job) | CacheLookup::InFlight(job) | CacheLookup::Created(job) => job,
        }
    }

    pub fn is_reused(&self) -> bool {
        !matches!(self, CacheLookup::Created(_))
    }
}

pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    queue: Arc<JobQueue>,
    stripes: Vec<Mutex<()>>,
    config: CacheConfig,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>, queue: Arc<JobQueue>, config: CacheConfig) -> Self {
        let stripes = (0..config.lock_stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            store,
            queue,
            stripes,
            config,
        }
    }

    /// Resolve a request for `key`, calling `create` only on a miss
    pub async fn lookup_or_create<F, Fut>(
        &self,
        key: &str,
        format: ExportFormat,
        create: F,
    ) -> Result<CacheLookup>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ExportJob>>,
    {
        let _guard = self.stripe(key).lock().await;
        let now = Utc::now();

        if let Some(entry) = self.store.get_cached(key).await? {
            match self.queue.get_status(&entry.job_id).await? {
                Some(job) if self.servable(&entry, &job, now).await => {
                    debug!(key, job_id = %job.id, "result cache hit");
                    return Ok(CacheLookup::Hit(job));
                }
                Some(job) if matches!(job.status, JobStatus::Pending | JobStatus::Processing) => {
                    debug!(key, job_id = %job.id, "joining in-flight export");
                    return Ok(CacheLookup::InFlight(job));
                }
                _ => {
                    debug!(key, job_id = %entry.job_id, "dropping stale cache entry");
                    self.store.remove_cached(key, &entry.job_id).await?;
                }
            }
        }

        let job = create().await?;
        self.store
            .put_cached(&CacheEntry {
                key: key.to_string(),
                job_id: job.id.clone(),
                format,
                size_bytes: None,
                created_at: now,
                expires_at: None,
            })
            .await?;
        Ok(CacheLookup::Created(job))
    }

    /// Start the TTL of a finished job's entry, tiered by result size
    pub async fn mark_completed(&self, key: &str, job_id: &str, size_bytes: u64) -> Result<bool> {
        let _guard = self.stripe(key).lock().await;
        let Some(mut entry) = self.store.get_cached(key).await? else {
            return Ok(false);
        };
        if entry.job_id != job_id {
            return Ok(false);
        }
        let ttl = chrono::Duration::from_std(self.config.ttl_for(size_bytes))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let now = Utc::now();
        entry.size_bytes = Some(size_bytes);
        entry.expires_at = Some(now + ttl);
        self.store.put_cached(&entry).await?;
        debug!(key, job_id, size_bytes, ttl_secs = ttl.num_seconds(), "cached export result");
        Ok(true)
    }

    /// Remove the entry for `key` if it still points at `job_id`
    pub async fn evict(&self, key: &str, job_id: &str) -> Result<bool> {
        let _guard = self.stripe(key).lock().await;
        self.store.remove_cached(key, job_id).await
    }

    pub async fn entries(&self) -> Result<Vec<CacheEntry>> {
        self.store.list_cached().await
    }

    async fn servable(&self, entry: &CacheEntry, job: &ExportJob, now: DateTime<Utc>) -> bool {
        if job.status != JobStatus::Completed || entry.is_expired(now) {
            return false;
        }
        match job.result {
            Some(ref artifact) => artifact_exists(&artifact.temp_path).await,
            None => false,
        }
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let hash = key
            .bytes()
            .fold(0usize, |h, b| h.wrapping_mul(31).wrapping_add(usize::from(b)));
        &self.stripes[hash % self.stripes.len()]
    }
}

pub(crate) async fn artifact_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExportArtifact, JobPatch, JobPriority, NormalizedFilters};
    use crate::store::{MemoryStore, PriorityQueueStore};

    fn setup(config: CacheConfig) -> (ResultCache, Arc<JobQueue>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new(store.clone()));
        let cache = ResultCache::new(store.clone(), queue.clone(), config);
        (cache, queue, store)
    }

    async fn create_job(queue: &JobQueue) -> Result<ExportJob> {
        let job = ExportJob::new(
            ExportFormat::Csv,
            NormalizedFilters::default(),
            "k1".to_string(),
            JobPriority::Normal,
            None,
            Utc::now(),
        );
        queue.insert(&job).await?;
        Ok(job)
    }

    async fn finish(store: &MemoryStore, job: &ExportJob, path: &Path) {
        let patch = JobPatch {
            status: Some(JobStatus::Completed),
            result: Some(Some(ExportArtifact {
                temp_path: path.to_path_buf(),
                filename: "x.csv".into(),
                size_bytes: 3,
            })),
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        store.update_job(&job.id, job.version, &patch).await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_job_is_shared() {
        let (cache, queue, _) = setup(CacheConfig::default());
        let first = cache
            .lookup_or_create("k1", ExportFormat::Csv, || create_job(&queue))
            .await
            .unwrap();
        let second = cache
            .lookup_or_create("k1", ExportFormat::Csv, || create_job(&queue))
            .await
            .unwrap();
        assert!(matches!(first, CacheLookup::Created(_)));
        assert!(matches!(second, CacheLookup::InFlight(_)));
        assert_eq!(first.job().id, second.job().id);
    }

    #[tokio::test]
    async fn test_completed_hit_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.csv");
        tokio::fs::write(&path, b"a\n1\n").await.unwrap();

        let (cache, queue, store) = setup(CacheConfig::default());
        let created = cache
            .lookup_or_create("k1", ExportFormat::Csv, || create_job(&queue))
            .await
            .unwrap()
            .into_job();
        finish(&store, &created, &path).await;
        assert!(cache.mark_completed("k1", &created.id, 4).await.unwrap());

        let hit = cache
            .lookup_or_create("k1", ExportFormat::Csv, || create_job(&queue))
            .await
            .unwrap();
        assert!(matches!(hit, CacheLookup::Hit(ref job) if job.id == created.id));

        tokio::fs::remove_file(&path).await.unwrap();
        let miss = cache
            .lookup_or_create("k1", ExportFormat::Csv, || create_job(&queue))
            .await
            .unwrap();
        assert!(matches!(miss, CacheLookup::Created(ref job) if job.id != created.id));
    }

    #[tokio::test]
    async fn test_expired_entry_is_not_served() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.csv");
        tokio::fs::write(&path, b"a\n").await.unwrap();

        let config = CacheConfig {
            small_ttl_secs: 0,
            ..Default::default()
        };
        let (cache, queue, store) = setup(config);
        let created = cache
            .lookup_or_create("k1", ExportFormat::Csv, || create_job(&queue))
            .await
            .unwrap()
            .into_job();
        finish(&store, &created, &path).await;
        cache.mark_completed("k1", &created.id, 2).await.unwrap();

        let next = cache
            .lookup_or_create("k1", ExportFormat::Csv, || create_job(&queue))
            .await
            .unwrap();
        assert!(!next.is_reused());
    }

    #[tokio::test]
    async fn test_evict_checks_owner() {
        let (cache, queue, _) = setup(CacheConfig::default());
        let job = cache
            .lookup_or_create("k1", ExportFormat::Csv, || create_job(&queue))
            .await
            .unwrap()
            .into_job();
        assert!(!cache.evict("k1", "someone-else").await.unwrap());
        assert!(cache.evict("k1", &job.id).await.unwrap());
        assert!(cache.entries().await.unwrap().is_empty());
    }
}
