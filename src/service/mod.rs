//! Export service orchestrator
//!
//! [`Exporter`] owns one instance of every component and is the entry
//! point for the control operations: start, pause, resume, cancel, status,
//! history, and download. It is cheap to clone; all clones share the same
//! components.
//!
//! Background work starts with [`Exporter::start`]:
//!
//! - recovery of jobs left in flight by a previous process
//! - the dispatcher, pairing idle workers with queued jobs
//! - the stall monitor, requeueing jobs whose worker went quiet
//! - the periodic artifact sweep

mod dispatch;
pub mod download;
pub mod runner;

pub use download::Download;
pub use runner::ExportRunner;

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheLookup, ResultCache};
use crate::config::{Config, StoreBackend};
use crate::connection::ConnectionManager;
use crate::error::{Result, ValidationError};
use crate::lifecycle::{ArtifactLifecycle, SweepReport, artifact_path};
use crate::model::{ExportFilters, ExportFormat, ExportJob, JobPriority, JobStatus};
use crate::pipeline::{ArtifactSink, ExportCoordinator};
use crate::queue::{JobQueue, RecoveryReport};
use crate::state::{JobEvent, JobStateManager};
use crate::store::{
    CacheStore, MemoryStore, MongoJobStore, MongoRecordStore, PriorityQueueStore, RecordStore,
};
use crate::worker::{JobRegistry, WorkerPool};

/// Largest page `get_history` serves
pub const MAX_PAGE_SIZE: u64 = 100;

/// One page of job history, newest first
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub jobs: Vec<ExportJob>,
    pub page: u64,
    pub limit: u64,
    pub total: u64,
}

impl HistoryPage {
    pub fn total_pages(&self) -> u64 {
        self.total.div_ceil(self.limit.max(1))
    }
}

#[derive(Clone)]
pub struct Exporter {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    queue: Arc<JobQueue>,
    manager: Arc<JobStateManager>,
    cache: Arc<ResultCache>,
    pool: Arc<WorkerPool>,
    lifecycle: Arc<ArtifactLifecycle>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connection: tokio::sync::Mutex<Option<ConnectionManager>>,
}

impl Exporter {
    /// Wire the service over the given stores; must be called inside a Tokio runtime
    pub fn new(
        config: Config,
        jobs: Arc<dyn PriorityQueueStore>,
        cache_store: Arc<dyn CacheStore>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        let temp_dir = config.pipeline.temp_dir.clone();
        let queue = Arc::new(JobQueue::new(jobs));
        let manager = Arc::new(JobStateManager::new(queue.clone(), &config.state));
        let cache = Arc::new(ResultCache::new(
            cache_store,
            queue.clone(),
            config.cache.clone(),
        ));
        let registry = Arc::new(JobRegistry::new());
        let runner = Arc::new(ExportRunner::new(
            manager.clone(),
            queue.clone(),
            cache.clone(),
            registry.clone(),
            ExportCoordinator::new(records, config.pipeline.clone()),
            temp_dir.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(&config.workers, registry, runner));
        let lifecycle = Arc::new(ArtifactLifecycle::new(
            queue.clone(),
            manager.clone(),
            cache.clone(),
            temp_dir,
            config.lifecycle.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                queue,
                manager,
                cache,
                pool,
                lifecycle,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                connection: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Service backed by process-local stores
    pub fn in_memory(config: Config, records: Arc<dyn RecordStore>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(config, store.clone(), store, records)
    }

    /// Service backed by the configured store
    ///
    /// For the MongoDB backend this connects, ensures indexes, and keeps the
    /// connection until [`Exporter::shutdown`].
    pub async fn connect(config: Config) -> Result<Self> {
        match config.store.backend {
            StoreBackend::Memory => {
                let records = Arc::new(crate::store::MemoryRecordStore::new());
                Ok(Self::in_memory(config, records))
            }
            StoreBackend::Mongodb => {
                let mut connection = ConnectionManager::new(config.store.clone());
                connection.connect().await?;
                let db = connection.database()?;
                let jobs = Arc::new(MongoJobStore::new(&db, &config.store));
                jobs.ensure_indexes().await?;
                let records = Arc::new(MongoRecordStore::new(&db, &config.store));

                let exporter = Self::new(config, jobs.clone(), jobs, records);
                *exporter.inner.connection.lock().await = Some(connection);
                Ok(exporter)
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Recover in-flight jobs, then start the background loops
    pub async fn start(&self) -> Result<RecoveryReport> {
        tokio::fs::create_dir_all(&self.inner.config.pipeline.temp_dir).await?;
        let report = self.inner.queue.recover().await?;
        info!(
            requeued = report.requeued.len(),
            discarded = report.discarded.len(),
            "recovered queue"
        );

        let inner = &self.inner;
        let lifecycle = &inner.config.lifecycle;
        let mut tasks = inner.tasks.lock();
        tasks.push(tokio::spawn(dispatch::dispatch_loop(
            inner.queue.clone(),
            inner.pool.clone(),
            inner.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(dispatch::stall_monitor(
            inner.queue.clone(),
            inner.manager.clone(),
            inner.pool.clone(),
            lifecycle.stall_timeout(),
            lifecycle.stall_check_interval(),
            inner.shutdown.clone(),
        )));
        tasks.push(inner.lifecycle.clone().spawn(inner.shutdown.clone()));
        info!(workers = inner.pool.size(), "export service started");
        Ok(report)
    }

    /// Stop the background loops and the worker pool
    ///
    /// Running exports are interrupted where they are; the next start
    /// requeues them.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.inner.pool.shutdown().await;
        if let Some(mut connection) = self.inner.connection.lock().await.take() {
            connection.disconnect().await;
        }
        info!("export service stopped");
    }

    /// Request an export with normal priority
    pub async fn start_export(
        &self,
        format: ExportFormat,
        filters: ExportFilters,
        client_id: Option<String>,
    ) -> Result<CacheLookup> {
        self.start_export_with(format, filters, client_id, JobPriority::Normal)
            .await
    }

    /// Request an export, reusing a cached or in-flight job for the same request
    pub async fn start_export_with(
        &self,
        format: ExportFormat,
        filters: ExportFilters,
        client_id: Option<String>,
        priority: JobPriority,
    ) -> Result<CacheLookup> {
        let filters = filters.normalize()?;
        let key = filters.fingerprint(format)?;
        let inner = &self.inner;

        let lookup = inner
            .cache
            .lookup_or_create(&key, format, || async {
                let job = ExportJob::new(
                    format,
                    filters.clone(),
                    key.clone(),
                    priority,
                    client_id.clone(),
                    Utc::now(),
                );
                let job = inner.manager.create(job).await?;
                inner
                    .queue
                    .enqueue(&job.id, job.priority, job.enqueued_at)
                    .await?;
                Ok(job)
            })
            .await?;

        match &lookup {
            CacheLookup::Created(job) => info!(job_id = %job.id, %format, %priority, "export queued"),
            CacheLookup::InFlight(job) => info!(job_id = %job.id, "joined in-flight export"),
            CacheLookup::Hit(job) => info!(job_id = %job.id, "served export from cache"),
        }
        Ok(lookup)
    }

    /// Pause a processing job
    ///
    /// A job held by a local worker is signalled and pauses at its next
    /// control check; the returned record may still read `processing`.
    pub async fn pause_export(&self, job_id: &str) -> Result<ExportJob> {
        let job = self.inner.manager.get(job_id).await?;
        if job.status == JobStatus::Processing && self.inner.pool.pause(job_id).await {
            debug!(job_id, "pause signalled to worker");
            return Ok(job);
        }
        let job = self.inner.manager.pause(job_id, None, None, None).await?;
        self.ack(job_id).await;
        info!(job_id, "export paused");
        Ok(job)
    }

    /// Put a paused job back in the queue
    pub async fn resume_export(&self, job_id: &str) -> Result<ExportJob> {
        let job = self.inner.manager.resume(job_id).await?;
        self.inner
            .queue
            .enqueue(&job.id, job.priority, job.enqueued_at)
            .await?;
        info!(job_id, processed_items = job.progress.processed_items, "export resumed");
        Ok(job)
    }

    /// Cancel a processing or paused job and discard its artifact
    pub async fn cancel_export(&self, job_id: &str) -> Result<ExportJob> {
        let job = self.inner.manager.get(job_id).await?;
        if job.status == JobStatus::Processing && self.inner.pool.cancel(job_id).await {
            debug!(job_id, "cancel signalled to worker");
            return Ok(job);
        }
        let cancelled = self.inner.manager.cancel(job_id, None).await?;
        let path = artifact_path(&self.inner.config.pipeline.temp_dir, &cancelled);
        if let Err(e) = ArtifactSink::delete(&path).await {
            warn!(job_id, error = %e, "failed to delete artifact");
        }
        self.ack(job_id).await;
        if let Err(e) = self.inner.cache.evict(&cancelled.cache_key, job_id).await {
            warn!(job_id, error = %e, "failed to evict cache entry");
        }
        self.inner.manager.forget(job_id);
        info!(job_id, "export cancelled");
        Ok(cancelled)
    }

    pub async fn get_status(&self, job_id: &str) -> Result<ExportJob> {
        self.inner.manager.get(job_id).await
    }

    /// Jobs newest first; `page` starts at 1
    pub async fn get_history(&self, page: u64, limit: u64) -> Result<HistoryPage> {
        if page == 0 {
            return Err(ValidationError::InvalidPage("page starts at 1".to_string()).into());
        }
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(ValidationError::InvalidPage(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            ))
            .into());
        }
        let skip = (page - 1).saturating_mul(limit);
        let (jobs, total) = self.inner.queue.history(skip, limit).await?;
        Ok(HistoryPage {
            jobs,
            page,
            limit,
            total,
        })
    }

    /// Open the artifact of a completed job
    pub async fn download_export(&self, job_id: &str) -> Result<Download> {
        let job = self.inner.manager.get(job_id).await?;
        Download::open(&job).await
    }

    /// Status events of every job
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.manager.subscribe()
    }

    /// Run one artifact sweep now
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.inner.lifecycle.sweep().await
    }

    /// Jobs waiting in the queue
    pub async fn queued(&self) -> Result<u64> {
        self.inner.queue.queued_len().await
    }

    /// Workers currently running or about to run a job
    pub fn busy_workers(&self) -> usize {
        self.inner.pool.busy()
    }

    async fn ack(&self, job_id: &str) {
        if let Err(e) = self.inner.queue.ack(job_id).await {
            warn!(job_id, error = %e, "failed to acknowledge queue entry");
        }
    }
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("backend", &self.inner.config.store.backend)
            .field("workers", &self.inner.pool.size())
            .finish()
    }
}

/// Wait for the `Completed`, `Failed` or `Cancelled` event of `job_id`
///
/// The terminal `StatusChanged` that precedes it is skipped. Returns `None`
/// when the channel closes first. Lagged receivers skip
/// ahead; callers that must not miss the end should re-read the status.
pub async fn wait_terminal(
    events: &mut broadcast::Receiver<JobEvent>,
    job_id: &str,
) -> Option<JobEvent> {
    loop {
        match events.recv().await {
            Ok(JobEvent::StatusChanged(_)) => {}
            Ok(event) if event.job_id() == job_id && event.is_terminal() => return Some(event),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "status subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportError;
    use crate::store::MemoryRecordStore;

    fn exporter() -> (Exporter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.store.backend = StoreBackend::Memory;
        config.pipeline.temp_dir = dir.path().to_path_buf();
        let records = Arc::new(MemoryRecordStore::new());
        (Exporter::in_memory(config, records), dir)
    }

    #[tokio::test]
    async fn test_history_paging_validation() {
        let (exporter, _dir) = exporter();
        assert!(matches!(
            exporter.get_history(0, 10).await,
            Err(ExportError::Validation(ValidationError::InvalidPage(_)))
        ));
        assert!(matches!(
            exporter.get_history(1, MAX_PAGE_SIZE + 1).await,
            Err(ExportError::Validation(ValidationError::InvalidPage(_)))
        ));

        let page = exporter.get_history(1, 10).await.unwrap();
        assert!(page.jobs.is_empty());
        assert_eq!(page.total_pages(), 0);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (exporter, _dir) = exporter();
        assert!(matches!(
            exporter.get_status("missing").await,
            Err(ExportError::NotFound(_))
        ));
        assert!(matches!(
            exporter.pause_export("missing").await,
            Err(ExportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_job_cannot_be_cancelled() {
        let (exporter, _dir) = exporter();
        let lookup = exporter
            .start_export(ExportFormat::Csv, ExportFilters::default(), None)
            .await
            .unwrap();
        let err = exporter.cancel_export(&lookup.job().id).await.unwrap_err();
        assert!(matches!(err, ExportError::Transition(_)));
    }

    #[tokio::test]
    async fn test_wait_terminal_returns_specialized_event() {
        let (tx, mut rx) = broadcast::channel(8);
        let update = |id: &str| {
            JobEvent::StatusChanged(crate::state::StatusUpdate {
                job_id: id.to_string(),
                status: crate::model::JobStatus::Completed,
                progress: 100,
                processed_items: 3,
                total_items: 3,
                filename: Some("export.csv".to_string()),
                error: None,
            })
        };
        let completed = |id: &str| JobEvent::Completed {
            job_id: id.to_string(),
            filename: "export.csv".to_string(),
            total_items: 3,
            size_bytes: 12,
        };
        tx.send(update("other")).unwrap();
        tx.send(completed("other")).unwrap();
        tx.send(update("j1")).unwrap();
        tx.send(completed("j1")).unwrap();

        let event = wait_terminal(&mut rx, "j1").await.unwrap();
        assert_eq!(event, completed("j1"));

        drop(tx);
        assert!(wait_terminal(&mut rx, "j1").await.is_none());
    }
}
