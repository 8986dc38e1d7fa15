//! In-memory store backend
//!
//! [`MemoryStore`] keeps jobs, the queue, and cache entries behind one
//! mutex, which makes every operation trivially atomic. The queue is a
//! `BTreeSet` ordered by `(score, seq, job_id)`, so pop-min is the first
//! element. [`MemoryRecordStore`] is a live, key-sorted record table whose
//! cursors see concurrent inserts and deletes past their position.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;

use crate::error::{ExportError, Result, StorageError};
use crate::model::{ExportJob, JobPatch, NormalizedFilters, TaskRecord};
use crate::pipeline::RecordCursor;

use super::{
    CacheEntry, CacheStore, EntryState, JobQuery, PriorityQueueStore, QueueEntry, RecordStore,
};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, ExportJob>,
    entries: HashMap<String, QueueEntry>,
    queued: BTreeSet<(i64, u64, String)>,
    cache: HashMap<String, CacheEntry>,
    /// Remaining job writes to fail with `Unavailable`
    failing_writes: u32,
}

/// Job, queue and cache store held in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` job writes fail as if the store were down
    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().failing_writes = count;
    }

    fn check_write(state: &mut MemoryState) -> Result<()> {
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(StorageError::Unavailable("injected write failure".into()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl PriorityQueueStore for MemoryStore {
    async fn insert_job(&self, job: &ExportJob) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_write(&mut state)?;
        if state.jobs.contains_key(&job.id) {
            return Err(StorageError::Duplicate(job.id.clone()).into());
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<ExportJob>> {
        Ok(self.state.lock().jobs.get(job_id).cloned())
    }

    async fn update_job(
        &self,
        job_id: &str,
        expected_version: u64,
        patch: &JobPatch,
    ) -> Result<Option<ExportJob>> {
        let mut state = self.state.lock();
        Self::check_write(&mut state)?;
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Err(ExportError::NotFound(job_id.to_string()));
        };
        if job.version != expected_version {
            return Ok(None);
        }
        job.apply(patch);
        Ok(Some(job.clone()))
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool> {
        Ok(self.state.lock().jobs.remove(job_id).is_some())
    }

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<ExportJob>> {
        let state = self.state.lock();
        let mut jobs: Vec<ExportJob> = state
            .jobs
            .values()
            .filter(|job| query.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let limit = query.limit.map_or(usize::MAX, |l| l as usize);
        Ok(jobs
            .into_iter()
            .skip(query.skip as usize)
            .take(limit)
            .collect())
    }

    async fn count_jobs(&self, query: &JobQuery) -> Result<u64> {
        let state = self.state.lock();
        Ok(state.jobs.values().filter(|job| query.matches(job)).count() as u64)
    }

    async fn push_entry(&self, entry: &QueueEntry) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(old) = state.entries.remove(&entry.job_id) {
            state.queued.remove(&(old.score, old.seq, old.job_id));
        }
        let mut entry = entry.clone();
        entry.state = EntryState::Queued;
        entry.claimed_by = None;
        entry.claimed_at = None;
        state
            .queued
            .insert((entry.score, entry.seq, entry.job_id.clone()));
        state.entries.insert(entry.job_id.clone(), entry);
        Ok(())
    }

    async fn pop_min(&self, claimed_by: &str) -> Result<Option<QueueEntry>> {
        let mut state = self.state.lock();
        let Some((_, _, job_id)) = state.queued.pop_first() else {
            return Ok(None);
        };
        let Some(entry) = state.entries.get_mut(&job_id) else {
            return Ok(None);
        };
        entry.state = EntryState::Inflight;
        entry.claimed_by = Some(claimed_by.to_string());
        entry.claimed_at = Some(Utc::now());
        Ok(Some(entry.clone()))
    }

    async fn get_entry(&self, job_id: &str) -> Result<Option<QueueEntry>> {
        Ok(self.state.lock().entries.get(job_id).cloned())
    }

    async fn remove_entry(&self, job_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.entries.remove(job_id) {
            Some(entry) => {
                state.queued.remove(&(entry.score, entry.seq, entry.job_id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn inflight_entries(&self) -> Result<Vec<QueueEntry>> {
        let state = self.state.lock();
        let mut entries: Vec<QueueEntry> = state
            .entries
            .values()
            .filter(|e| e.state == EntryState::Inflight)
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.score, e.seq));
        Ok(entries)
    }

    async fn queued_count(&self) -> Result<u64> {
        Ok(self.state.lock().queued.len() as u64)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get_cached(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.state.lock().cache.get(key).cloned())
    }

    async fn put_cached(&self, entry: &CacheEntry) -> Result<()> {
        self.state
            .lock()
            .cache
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn remove_cached(&self, key: &str, job_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if state.cache.get(key).is_some_and(|e| e.job_id == job_id) {
            state.cache.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn list_cached(&self) -> Result<Vec<CacheEntry>> {
        Ok(self.state.lock().cache.values().cloned().collect())
    }
}

type RecordTable = Arc<RwLock<BTreeMap<String, TaskRecord>>>;

/// Live record table sorted by record key
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RecordTable,
    gate: Option<Arc<Semaphore>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = TaskRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.upsert(record);
        }
        store
    }

    /// Require one semaphore permit per cursor batch
    ///
    /// Lets callers hold a running export at an exact record count.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn upsert(&self, record: TaskRecord) {
        self.records.write().insert(record.id.clone(), record);
    }

    pub fn remove(&self, id: &str) -> Option<TaskRecord> {
        self.records.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn count(&self, filters: &NormalizedFilters, as_of: DateTime<Utc>) -> Result<u64> {
        let records = self.records.read();
        Ok(records
            .values()
            .filter(|r| filters.matches(r, as_of))
            .count() as u64)
    }

    async fn scan(
        &self,
        filters: &NormalizedFilters,
        as_of: DateTime<Utc>,
        after_key: Option<String>,
        batch_size: u32,
    ) -> Result<Box<dyn RecordCursor>> {
        Ok(Box::new(MemoryCursor {
            records: Arc::clone(&self.records),
            filters: filters.clone(),
            as_of,
            last_key: after_key,
            batch_size: batch_size.max(1) as usize,
            gate: self.gate.clone(),
            exhausted: false,
        }))
    }
}

/// Cursor that re-reads the table after its last returned key
struct MemoryCursor {
    records: RecordTable,
    filters: NormalizedFilters,
    as_of: DateTime<Utc>,
    last_key: Option<String>,
    batch_size: usize,
    gate: Option<Arc<Semaphore>>,
    exhausted: bool,
}

#[async_trait]
impl RecordCursor for MemoryCursor {
    async fn next_batch(&mut self) -> Result<Option<Vec<TaskRecord>>> {
        if self.exhausted {
            return Ok(None);
        }
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| StorageError::Unavailable("record gate closed".into()))?
                .forget();
        }

        let batch: Vec<TaskRecord> = {
            let records = self.records.read();
            let lower = match &self.last_key {
                Some(key) => Bound::Excluded(key.clone()),
                None => Bound::Unbounded,
            };
            records
                .range((lower, Bound::Unbounded))
                .map(|(_, record)| record)
                .filter(|record| self.filters.matches(record, self.as_of))
                .take(self.batch_size)
                .cloned()
                .collect()
        };

        match batch.last() {
            Some(last) => {
                self.last_key = Some(last.id.clone());
                Ok(Some(batch))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.exhausted = true;
        Ok(())
    }
}
