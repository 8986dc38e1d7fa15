//! Storage seams of the export service
//!
//! Three traits describe everything the service needs from the outside
//! world:
//!
//! - [`PriorityQueueStore`]: durable job records with conditional writes,
//!   plus a sorted queue with an atomic pop-min
//! - [`CacheStore`]: fingerprint → job pointers for the result cache
//! - [`RecordStore`]: filtered, key-sorted cursors over exportable records
//!
//! Any backend with compare-and-swap or single-document atomic updates can
//! implement them. Two backends ship with the crate: [`memory`] for tests and
//! single-process use, [`mongo`] for production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{ExportFormat, ExportJob, JobPatch, JobStatus, NormalizedFilters};
use crate::pipeline::RecordCursor;

pub mod memory;
pub mod mongo;

pub use memory::{MemoryRecordStore, MemoryStore};
pub use mongo::{MongoJobStore, MongoRecordStore};

/// Whether a queue entry waits for a worker or has been handed to one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Queued,
    Inflight,
}

/// A job's place in the priority queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    #[serde(rename = "_id")]
    pub job_id: String,
    /// `priority_rank * PRIORITY_WEIGHT + enqueue_millis`, popped lowest first
    pub score: i64,
    /// Tie-break for entries enqueued within the same millisecond
    pub seq: u64,
    pub state: EntryState,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Selection of job records
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    /// Only jobs in one of these statuses (all when empty)
    pub statuses: Vec<JobStatus>,
    /// Only jobs that finished before this instant
    pub finished_before: Option<DateTime<Utc>>,
    /// Only jobs last written before this instant
    pub updated_before: Option<DateTime<Utc>>,
    pub skip: u64,
    pub limit: Option<u64>,
}

impl JobQuery {
    pub fn with_statuses(statuses: &[JobStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    /// Whether a job satisfies the predicate part of the query
    pub fn matches(&self, job: &ExportJob) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self
                .finished_before
                .is_none_or(|cutoff| job.finished_at.is_some_and(|f| f < cutoff))
            && self.updated_before.is_none_or(|cutoff| job.updated_at < cutoff)
    }
}

/// Result cache pointer from a fingerprint to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    #[serde(rename = "_id")]
    pub key: String,
    pub job_id: String,
    pub format: ExportFormat,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Unset while the job is in flight
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Durable job records plus the priority queue
///
/// Job writes are conditional: [`update_job`](Self::update_job) applies a
/// patch only when the stored version equals `expected_version` and
/// returns `None` when it does not. [`pop_min`](Self::pop_min) must be
/// atomic: under concurrency exactly one caller receives a given entry.
#[async_trait]
pub trait PriorityQueueStore: Send + Sync {
    async fn insert_job(&self, job: &ExportJob) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<ExportJob>>;

    async fn update_job(
        &self,
        job_id: &str,
        expected_version: u64,
        patch: &JobPatch,
    ) -> Result<Option<ExportJob>>;

    async fn delete_job(&self, job_id: &str) -> Result<bool>;

    /// Jobs matching the query, newest first
    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<ExportJob>>;

    async fn count_jobs(&self, query: &JobQuery) -> Result<u64>;

    /// Insert or replace an entry, resetting it to `queued`
    async fn push_entry(&self, entry: &QueueEntry) -> Result<()>;

    /// Atomically take the lowest-score queued entry and mark it in flight
    async fn pop_min(&self, claimed_by: &str) -> Result<Option<QueueEntry>>;

    async fn get_entry(&self, job_id: &str) -> Result<Option<QueueEntry>>;

    async fn remove_entry(&self, job_id: &str) -> Result<bool>;

    async fn inflight_entries(&self) -> Result<Vec<QueueEntry>>;

    async fn queued_count(&self) -> Result<u64>;
}

/// Persistence for result cache entries
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_cached(&self, key: &str) -> Result<Option<CacheEntry>>;

    async fn put_cached(&self, entry: &CacheEntry) -> Result<()>;

    /// Remove the entry only if it still points at `job_id`
    async fn remove_cached(&self, key: &str, job_id: &str) -> Result<bool>;

    async fn list_cached(&self) -> Result<Vec<CacheEntry>>;
}

/// Source of exportable records
///
/// Cursors are ordered by record sort key. When `after_key` is given only
/// records with a strictly greater key are returned, which makes resume
/// stable under concurrent inserts and deletes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn count(&self, filters: &NormalizedFilters, as_of: DateTime<Utc>) -> Result<u64>;

    async fn scan(
        &self,
        filters: &NormalizedFilters,
        as_of: DateTime<Utc>,
        after_key: Option<String>,
        batch_size: u32,
    ) -> Result<Box<dyn RecordCursor>>;
}
