//! MongoDB store backend
//!
//! Jobs, queue entries and cache entries live in three collections of one
//! database; records are read from a fourth. Every conditional write is a
//! single-document operation:
//!
//! - job CAS: `findOneAndUpdate({_id, version}, {$set: diff, $inc: {version: 1}})`
//! - pop-min: `findOneAndUpdate({state: "queued"}, {$set: {state: "inflight"}})`
//!   sorted by `{score: 1, seq: 1}`

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::ReturnDocument;
use mongodb::{Collection, Database, IndexModel};
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{ExportError, Result, StorageError};
use crate::model::{DateRange, ExportJob, JobPatch, NormalizedFilters, NumberRange, TaskRecord};
use crate::model::filter::RECENTLY_COMPLETED_DAYS;
use crate::pipeline::{CursorRecordSource, RecordCursor};

use super::{CacheEntry, CacheStore, JobQuery, PriorityQueueStore, QueueEntry, RecordStore};

const DUPLICATE_KEY: i32 = 11000;

/// Jobs, queue and cache collections
#[derive(Clone)]
pub struct MongoJobStore {
    jobs: Collection<ExportJob>,
    queue: Collection<QueueEntry>,
    cache: Collection<CacheEntry>,
}

impl MongoJobStore {
    pub fn new(db: &Database, config: &StoreConfig) -> Self {
        Self {
            jobs: db.collection(&config.jobs_collection),
            queue: db.collection(&config.queue_collection),
            cache: db.collection(&config.cache_collection),
        }
    }

    /// Create the indexes the queue and sweeps rely on
    pub async fn ensure_indexes(&self) -> Result<()> {
        self.queue
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "state": 1, "score": 1, "seq": 1 })
                    .build(),
            )
            .await?;
        self.jobs
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "status": 1, "updatedAt": 1 })
                    .build(),
            )
            .await?;
        self.jobs
            .create_index(IndexModel::builder().keys(doc! { "createdAt": -1 }).build())
            .await?;
        debug!("ensured export store indexes");
        Ok(())
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn optional_millis(ts: Option<DateTime<Utc>>) -> Bson {
    ts.map_or(Bson::Null, |t| Bson::Int64(millis(t)))
}

/// `$set` document for the changed fields of a patch
fn patch_document(patch: &JobPatch) -> Result<Document> {
    let mut set = Document::new();
    if let Some(status) = patch.status {
        set.insert("status", bson::to_bson(&status)?);
    }
    if let Some(progress) = patch.progress {
        set.insert("progress", bson::to_bson(&progress)?);
    }
    if let Some(ref checkpoint) = patch.checkpoint {
        set.insert("checkpoint", bson::to_bson(checkpoint)?);
    }
    if let Some(ref result) = patch.result {
        set.insert("result", bson::to_bson(result)?);
    }
    if let Some(ref error) = patch.error {
        set.insert("error", bson::to_bson(error)?);
    }
    if let Some(attempt) = patch.attempt {
        set.insert("attempt", i64::from(attempt));
    }
    if let Some(enqueued_at) = patch.enqueued_at {
        set.insert("enqueuedAt", millis(enqueued_at));
    }
    if let Some(started_at) = patch.started_at {
        set.insert("startedAt", optional_millis(started_at));
    }
    if let Some(finished_at) = patch.finished_at {
        set.insert("finishedAt", optional_millis(finished_at));
    }
    if let Some(updated_at) = patch.updated_at {
        set.insert("updatedAt", millis(updated_at));
    }
    Ok(set)
}

fn job_query_document(query: &JobQuery) -> Result<Document> {
    let mut filter = Document::new();
    if !query.statuses.is_empty() {
        let statuses = bson::to_bson(&query.statuses)?;
        filter.insert("status", doc! { "$in": statuses });
    }
    if let Some(cutoff) = query.finished_before {
        filter.insert("finishedAt", doc! { "$ne": Bson::Null, "$lt": millis(cutoff) });
    }
    if let Some(cutoff) = query.updated_before {
        filter.insert("updatedAt", doc! { "$lt": millis(cutoff) });
    }
    Ok(filter)
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY
    )
}

#[async_trait]
impl PriorityQueueStore for MongoJobStore {
    async fn insert_job(&self, job: &ExportJob) -> Result<()> {
        match self.jobs.insert_one(job).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(StorageError::Duplicate(job.id.clone()).into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<ExportJob>> {
        Ok(self.jobs.find_one(doc! { "_id": job_id }).await?)
    }

    async fn update_job(
        &self,
        job_id: &str,
        expected_version: u64,
        patch: &JobPatch,
    ) -> Result<Option<ExportJob>> {
        let set = patch_document(patch)?;
        let mut update = doc! { "$inc": { "version": 1_i64 } };
        if !set.is_empty() {
            update.insert("$set", set);
        }
        let updated = self
            .jobs
            .find_one_and_update(
                doc! { "_id": job_id, "version": expected_version as i64 },
                update,
            )
            .return_document(ReturnDocument::After)
            .await?;
        if updated.is_none() && self.get_job(job_id).await?.is_none() {
            return Err(ExportError::NotFound(job_id.to_string()));
        }
        Ok(updated)
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let result = self.jobs.delete_one(doc! { "_id": job_id }).await?;
        Ok(result.deleted_count > 0)
    }

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<ExportJob>> {
        let mut find = self
            .jobs
            .find(job_query_document(query)?)
            .sort(doc! { "createdAt": -1, "_id": 1 })
            .skip(query.skip);
        if let Some(limit) = query.limit {
            find = find.limit(limit as i64);
        }
        let cursor = find.await?;
        Ok(cursor.try_collect().await?)
    }

    async fn count_jobs(&self, query: &JobQuery) -> Result<u64> {
        Ok(self.jobs.count_documents(job_query_document(query)?).await?)
    }

    async fn push_entry(&self, entry: &QueueEntry) -> Result<()> {
        let mut entry = entry.clone();
        entry.state = super::EntryState::Queued;
        entry.claimed_by = None;
        entry.claimed_at = None;
        self.queue
            .replace_one(doc! { "_id": entry.job_id.as_str() }, &entry)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn pop_min(&self, claimed_by: &str) -> Result<Option<QueueEntry>> {
        Ok(self
            .queue
            .find_one_and_update(
                doc! { "state": "queued" },
                doc! { "$set": {
                    "state": "inflight",
                    "claimedBy": claimed_by,
                    "claimedAt": millis(Utc::now()),
                } },
            )
            .sort(doc! { "score": 1, "seq": 1 })
            .return_document(ReturnDocument::After)
            .await?)
    }

    async fn get_entry(&self, job_id: &str) -> Result<Option<QueueEntry>> {
        Ok(self.queue.find_one(doc! { "_id": job_id }).await?)
    }

    async fn remove_entry(&self, job_id: &str) -> Result<bool> {
        let result = self.queue.delete_one(doc! { "_id": job_id }).await?;
        Ok(result.deleted_count > 0)
    }

    async fn inflight_entries(&self) -> Result<Vec<QueueEntry>> {
        let cursor = self
            .queue
            .find(doc! { "state": "inflight" })
            .sort(doc! { "score": 1, "seq": 1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn queued_count(&self) -> Result<u64> {
        Ok(self.queue.count_documents(doc! { "state": "queued" }).await?)
    }
}

#[async_trait]
impl CacheStore for MongoJobStore {
    async fn get_cached(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.cache.find_one(doc! { "_id": key }).await?)
    }

    async fn put_cached(&self, entry: &CacheEntry) -> Result<()> {
        self.cache
            .replace_one(doc! { "_id": entry.key.as_str() }, entry)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn remove_cached(&self, key: &str, job_id: &str) -> Result<bool> {
        let result = self
            .cache
            .delete_one(doc! { "_id": key, "jobId": job_id })
            .await?;
        Ok(result.deleted_count > 0)
    }

    async fn list_cached(&self) -> Result<Vec<CacheEntry>> {
        let cursor = self.cache.find(doc! {}).await?;
        Ok(cursor.try_collect().await?)
    }
}

/// Record collection read through filtered, `_id`-sorted cursors
#[derive(Clone)]
pub struct MongoRecordStore {
    records: Collection<TaskRecord>,
}

impl MongoRecordStore {
    pub fn new(db: &Database, config: &StoreConfig) -> Self {
        Self {
            records: db.collection(&config.records_collection),
        }
    }
}

/// Translate normalized filters into a query document
///
/// Mirrors [`NormalizedFilters::matches`]; time-relative predicates are
/// evaluated at `as_of`.
pub fn filter_document(
    filters: &NormalizedFilters,
    as_of: DateTime<Utc>,
    after_key: Option<&str>,
) -> Result<Document> {
    let mut clauses: Vec<Document> = Vec::new();

    if let Some(key) = after_key {
        clauses.push(doc! { "_id": { "$gt": key } });
    }
    if !filters.statuses.is_empty() {
        let statuses = bson::to_bson(&filters.statuses)?;
        clauses.push(doc! { "status": { "$in": statuses } });
    }
    if !filters.priorities.is_empty() {
        let priorities = bson::to_bson(&filters.priorities)?;
        clauses.push(doc! { "priority": { "$in": priorities } });
    }
    if let Some(ref needle) = filters.search {
        let pattern = escape_regex(needle);
        let pattern = pattern.as_str();
        clauses.push(doc! { "$or": [
            { "title": { "$regex": pattern, "$options": "i" } },
            { "description": { "$regex": pattern, "$options": "i" } },
            { "tags": { "$regex": pattern, "$options": "i" } },
        ] });
    }
    if let Some(ref range) = filters.created {
        clauses.push(doc! { "createdAt": date_range(range) });
    }
    if let Some(ref range) = filters.updated {
        clauses.push(doc! { "updatedAt": date_range(range) });
    }
    if let Some(ref range) = filters.completed {
        let mut cond = date_range(range);
        cond.insert("$ne", Bson::Null);
        clauses.push(doc! { "completedAt": cond });
    }
    if let Some(ref range) = filters.estimated_hours {
        clauses.push(doc! { "estimatedHours": number_range(range) });
    }
    if let Some(ref range) = filters.actual_hours {
        clauses.push(doc! { "actualHours": number_range(range) });
    }
    if filters.overdue {
        clauses.push(doc! {
            "status": { "$ne": "done" },
            "dueDate": { "$ne": Bson::Null, "$lt": millis(as_of) },
        });
    }
    if filters.recently_completed {
        let cutoff = as_of - Duration::days(RECENTLY_COMPLETED_DAYS);
        clauses.push(doc! { "completedAt": { "$ne": Bson::Null, "$gte": millis(cutoff) } });
    }
    if filters.over_estimated || filters.under_estimated {
        let op = if filters.over_estimated { "$lt" } else { "$gt" };
        let mut compare = Document::new();
        compare.insert(op, vec!["$actualHours", "$estimatedHours"]);
        clauses.push(doc! {
            "estimatedHours": { "$type": "number" },
            "actualHours": { "$type": "number" },
            "$expr": compare,
        });
    }

    Ok(match clauses.len() {
        0 => Document::new(),
        1 => clauses.remove(0),
        _ => doc! { "$and": clauses },
    })
}

fn date_range(range: &DateRange) -> Document {
    let mut cond = Document::new();
    if let Some(from) = range.from {
        cond.insert("$gte", millis(from));
    }
    if let Some(to) = range.to {
        cond.insert("$lte", millis(to));
    }
    cond
}

fn number_range(range: &NumberRange) -> Document {
    let mut cond = doc! { "$type": "number" };
    if let Some(min) = range.min {
        cond.insert("$gte", min);
    }
    if let Some(max) = range.max {
        cond.insert("$lte", max);
    }
    cond
}

fn escape_regex(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl RecordStore for MongoRecordStore {
    async fn count(&self, filters: &NormalizedFilters, as_of: DateTime<Utc>) -> Result<u64> {
        let filter = filter_document(filters, as_of, None)?;
        Ok(self.records.count_documents(filter).await?)
    }

    async fn scan(
        &self,
        filters: &NormalizedFilters,
        as_of: DateTime<Utc>,
        after_key: Option<String>,
        batch_size: u32,
    ) -> Result<Box<dyn RecordCursor>> {
        let filter = filter_document(filters, as_of, after_key.as_deref())?;
        debug!(filter = %filter, "opening record cursor");
        let cursor = self
            .records
            .find(filter)
            .sort(doc! { "_id": 1 })
            .batch_size(batch_size)
            .await?;
        Ok(Box::new(CursorRecordSource::new(cursor, batch_size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobStatus, Progress, TaskStatus};
    use chrono::TimeZone;

    #[test]
    fn test_patch_document_sets_only_changed_fields() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let patch = JobPatch {
            status: Some(JobStatus::Paused),
            progress: Some(Progress::new(4, 10)),
            finished_at: Some(None),
            updated_at: Some(ts),
            ..Default::default()
        };
        let set = patch_document(&patch).unwrap();
        assert_eq!(set.get_str("status").unwrap(), "paused");
        assert_eq!(
            set.get_document("progress").unwrap().get_i32("percentage").unwrap(),
            40
        );
        assert_eq!(set.get("finishedAt"), Some(&Bson::Null));
        assert_eq!(set.get_i64("updatedAt").unwrap(), ts.timestamp_millis());
        assert!(!set.contains_key("checkpoint"));
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let filter = filter_document(&NormalizedFilters::default(), Utc::now(), None).unwrap();
        assert!(filter.is_empty());
    }

    #[test]
    fn test_filter_document_combines_clauses() {
        let filters = NormalizedFilters {
            statuses: vec![TaskStatus::Todo, TaskStatus::InProgress],
            search: Some("a.b".to_string()),
            overdue: true,
            ..Default::default()
        };
        let filter = filter_document(&filters, Utc::now(), Some("k-9")).unwrap();
        let clauses = filter.get_array("$and").unwrap();
        assert_eq!(clauses.len(), 4);
        let rendered = filter.to_string();
        assert!(rendered.contains("in_progress"));
        assert!(rendered.contains(r"a\\.b") || rendered.contains(r"a\.b"));
        assert!(rendered.contains("k-9"));
    }

    #[test]
    fn test_job_query_document() {
        let query = JobQuery::with_statuses(&JobStatus::TERMINAL);
        let filter = job_query_document(&query).unwrap();
        let statuses = filter
            .get_document("status")
            .unwrap()
            .get_array("$in")
            .unwrap();
        assert_eq!(statuses.len(), 3);
    }

    #[test]
    fn test_escape_regex() {
        assert_eq!(escape_regex("a+b (c)"), r"a\+b \(c\)");
        assert_eq!(escape_regex("plain"), "plain");
    }
}
