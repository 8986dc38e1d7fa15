//! Export job record, status machine and field diffs
//!
//! The persisted [`ExportJob`] is written only by the job state manager.
//! Every write is expressed as a [`JobPatch`] computed by diffing the
//! previous snapshot against the proposed next one, so stores persist only
//! the fields that actually changed.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExportError, ValidationError};

use super::filter::NormalizedFilters;
use super::format::ExportFormat;

/// Lifecycle status of an export job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Legal edges: pending→processing, processing↔paused,
    /// processing→{completed, failed, cancelled}, paused→cancelled.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Paused)
                | (Paused, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Paused, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub const TERMINAL: [JobStatus; 3] =
        [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled];
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority; lower rank is dequeued first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    pub fn rank(self) -> i64 {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
            JobPriority::Low => 2,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::High => f.write_str("high"),
            JobPriority::Normal => f.write_str("normal"),
            JobPriority::Low => f.write_str("low"),
        }
    }
}

impl FromStr for JobPriority {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(JobPriority::High),
            "normal" => Ok(JobPriority::Normal),
            "low" => Ok(JobPriority::Low),
            other => Err(ValidationError::InvalidPriority(other.to_string()).into()),
        }
    }
}

/// Record-count progress of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub processed_items: u64,
    pub total_items: u64,
    pub percentage: u8,
}

impl Progress {
    /// `percentage = floor(processed / total * 100)`, capped at 100
    pub fn new(processed_items: u64, total_items: u64) -> Self {
        let percentage = if total_items == 0 {
            0
        } else {
            (processed_items.saturating_mul(100) / total_items).min(100) as u8
        };
        Self {
            processed_items,
            total_items,
            percentage,
        }
    }

    /// Final progress of a finished export
    pub fn complete(total_items: u64) -> Self {
        Self {
            processed_items: total_items,
            total_items,
            percentage: 100,
        }
    }
}

/// Last durably flushed position of an artifact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Sort key of the last record whose bytes are flushed
    pub last_processed_key: Option<String>,
    /// Artifact length covering exactly the checkpointed records
    pub last_valid_byte_offset: u64,
    /// Records contained in the first `last_valid_byte_offset` bytes
    pub processed_items: u64,
}

/// Completed artifact pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportArtifact {
    pub temp_path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
}

/// Persisted export job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    #[serde(rename = "_id")]
    pub id: String,
    pub format: ExportFormat,
    pub filters: NormalizedFilters,
    pub cache_key: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub progress: Progress,
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub result: Option<ExportArtifact>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Attachment name offered on download
    pub filename: String,
    /// Ownership epoch, bumped whenever a worker takes the job
    pub attempt: u32,
    /// Write counter used for compare-and-swap
    pub version: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    /// Create a new pending job
    pub fn new(
        format: ExportFormat,
        filters: NormalizedFilters,
        cache_key: String,
        priority: JobPriority,
        client_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let filename = format!(
            "tasks-export-{}-{}.{}",
            now.format("%Y%m%d-%H%M%S"),
            &id[..8],
            format.extension()
        );
        Self {
            id,
            format,
            filters,
            cache_key,
            priority,
            status: JobStatus::Pending,
            progress: Progress::default(),
            checkpoint: None,
            result: None,
            error: None,
            client_id,
            filename,
            attempt: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Compute the fields that differ between `self` and `next`
    pub fn diff(&self, next: &ExportJob) -> JobPatch {
        let mut patch = JobPatch::default();
        if self.status != next.status {
            patch.status = Some(next.status);
        }
        if self.progress != next.progress {
            patch.progress = Some(next.progress);
        }
        if self.checkpoint != next.checkpoint {
            patch.checkpoint = Some(next.checkpoint.clone());
        }
        if self.result != next.result {
            patch.result = Some(next.result.clone());
        }
        if self.error != next.error {
            patch.error = Some(next.error.clone());
        }
        if self.attempt != next.attempt {
            patch.attempt = Some(next.attempt);
        }
        if self.enqueued_at != next.enqueued_at {
            patch.enqueued_at = Some(next.enqueued_at);
        }
        if self.started_at != next.started_at {
            patch.started_at = Some(next.started_at);
        }
        if self.finished_at != next.finished_at {
            patch.finished_at = Some(next.finished_at);
        }
        if !patch.is_empty() {
            patch.updated_at = Some(next.updated_at);
        }
        patch
    }

    /// Apply a patch in place and bump the version
    pub fn apply(&mut self, patch: &JobPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress;
        }
        if let Some(ref checkpoint) = patch.checkpoint {
            self.checkpoint = checkpoint.clone();
        }
        if let Some(ref result) = patch.result {
            self.result = result.clone();
        }
        if let Some(ref error) = patch.error {
            self.error = error.clone();
        }
        if let Some(attempt) = patch.attempt {
            self.attempt = attempt;
        }
        if let Some(enqueued_at) = patch.enqueued_at {
            self.enqueued_at = enqueued_at;
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = started_at;
        }
        if let Some(finished_at) = patch.finished_at {
            self.finished_at = finished_at;
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
        self.version += 1;
    }
}

/// Changed fields of one job write
///
/// `Some(None)` clears an optional field, `None` leaves it untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<Progress>,
    pub checkpoint: Option<Option<Checkpoint>>,
    pub result: Option<Option<ExportArtifact>>,
    pub error: Option<Option<String>>,
    pub attempt: Option<u32>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.progress.is_none()
            && self.checkpoint.is_none()
            && self.result.is_none()
            && self.error.is_none()
            && self.attempt.is_none()
            && self.enqueued_at.is_none()
            && self.started_at.is_none()
            && self.finished_at.is_none()
    }

    /// Names of the changed fields, for logging
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.status.is_some() {
            fields.push("status");
        }
        if self.progress.is_some() {
            fields.push("progress");
        }
        if self.checkpoint.is_some() {
            fields.push("checkpoint");
        }
        if self.result.is_some() {
            fields.push("result");
        }
        if self.error.is_some() {
            fields.push("error");
        }
        if self.attempt.is_some() {
            fields.push("attempt");
        }
        if self.enqueued_at.is_some() {
            fields.push("enqueuedAt");
        }
        if self.started_at.is_some() {
            fields.push("startedAt");
        }
        if self.finished_at.is_some() {
            fields.push("finishedAt");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ExportJob {
        ExportJob::new(
            ExportFormat::Csv,
            NormalizedFilters::default(),
            "key".to_string(),
            JobPriority::Normal,
            Some("client-1".to_string()),
            Utc::now(),
        )
    }

    #[test]
    fn test_legal_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Processing));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));

        assert!(!Pending.can_transition_to(Cancelled));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_progress_percentage_floors() {
        assert_eq!(Progress::new(1, 3).percentage, 33);
        assert_eq!(Progress::new(2, 3).percentage, 66);
        assert_eq!(Progress::new(3, 3).percentage, 100);
        assert_eq!(Progress::new(12, 10).percentage, 100);
        assert_eq!(Progress::new(0, 0).percentage, 0);
        assert_eq!(Progress::complete(0).percentage, 100);
    }

    #[test]
    fn test_diff_only_changed_fields() {
        let prev = job();
        let mut next = prev.clone();
        next.status = JobStatus::Processing;
        next.progress = Progress::new(1, 10);
        next.updated_at = prev.updated_at + chrono::Duration::seconds(1);

        let patch = prev.diff(&next);
        assert_eq!(patch.changed_fields(), vec!["status", "progress"]);
        assert_eq!(patch.updated_at, Some(next.updated_at));

        let mut applied = prev.clone();
        applied.apply(&patch);
        assert_eq!(applied.status, JobStatus::Processing);
        assert_eq!(applied.version, prev.version + 1);
    }

    #[test]
    fn test_diff_of_identical_is_empty() {
        let prev = job();
        let mut next = prev.clone();
        next.updated_at = Utc::now();
        assert!(prev.diff(&next).is_empty());
    }

    #[test]
    fn test_new_job_filename() {
        let job = job();
        assert!(job.filename.starts_with("tasks-export-"));
        assert!(job.filename.ends_with(".csv"));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_priority_rank_order() {
        assert!(JobPriority::High.rank() < JobPriority::Normal.rank());
        assert!(JobPriority::Normal.rank() < JobPriority::Low.rank());
        assert_eq!("LOW".parse::<JobPriority>().unwrap(), JobPriority::Low);
    }
}
