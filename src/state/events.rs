//! Job events and the client-side reducer
//!
//! Every client-visible change of a job is broadcast as a
//! [`JobEvent::StatusChanged`] carrying a full [`StatusUpdate`]; terminal
//! transitions are followed by one specialized event. Delivery is
//! at-least-once, so [`JobView`] applies events idempotently.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{ExportJob, JobStatus};

/// Status broadcast payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub job_id: String,
    pub status: JobStatus,
    /// Percentage, 0-100
    pub progress: u8,
    pub processed_items: u64,
    pub total_items: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn from_job(job: &ExportJob) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress.percentage,
            processed_items: job.progress.processed_items,
            total_items: job.progress.total_items,
            filename: job.result.as_ref().map(|r| r.filename.clone()),
            error: job.error.clone(),
        }
    }
}

/// Broadcast event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobEvent {
    StatusChanged(StatusUpdate),
    #[serde(rename_all = "camelCase")]
    Completed {
        job_id: String,
        filename: String,
        total_items: u64,
        size_bytes: u64,
    },
    #[serde(rename_all = "camelCase")]
    Failed { job_id: String, error: String },
    #[serde(rename_all = "camelCase")]
    Cancelled { job_id: String },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::StatusChanged(update) => &update.job_id,
            JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id } => job_id,
        }
    }

    /// Whether this event ends the job's event stream
    pub fn is_terminal(&self) -> bool {
        match self {
            JobEvent::StatusChanged(update) => update.status.is_terminal(),
            _ => true,
        }
    }
}

/// Latest known status per job, folded from events
#[derive(Debug, Default, Clone)]
pub struct JobView {
    jobs: HashMap<String, StatusUpdate>,
}

impl JobView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the view
    ///
    /// Returns `true` if the view changed. Replayed and duplicated events
    /// leave it untouched: terminal states are sticky and progress within
    /// one status never moves backwards.
    pub fn apply(&mut self, event: &JobEvent) -> bool {
        let JobEvent::StatusChanged(update) = event else {
            return false;
        };
        match self.jobs.get(&update.job_id) {
            Some(current) if current == update => false,
            Some(current) if current.status.is_terminal() => false,
            Some(current)
                if current.status == update.status
                    && update.processed_items < current.processed_items =>
            {
                false
            }
            _ => {
                self.jobs.insert(update.job_id.clone(), update.clone());
                true
            }
        }
    }

    pub fn get(&self, job_id: &str) -> Option<&StatusUpdate> {
        self.jobs.get(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(status: JobStatus, processed: u64) -> JobEvent {
        JobEvent::StatusChanged(StatusUpdate {
            job_id: "job-1".to_string(),
            status,
            progress: (processed * 10) as u8,
            processed_items: processed,
            total_items: 10,
            filename: None,
            error: None,
        })
    }

    #[test]
    fn test_status_update_is_camel_case() {
        let JobEvent::StatusChanged(payload) = update(JobStatus::Processing, 4) else {
            unreachable!()
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["jobId"], "job-1");
        assert_eq!(json["processedItems"], 4);
        assert_eq!(json["totalItems"], 10);
        assert_eq!(json["progress"], 40);
        assert!(json.get("filename").is_none());
    }

    #[test]
    fn test_view_is_idempotent() {
        let mut view = JobView::new();
        let events = [
            update(JobStatus::Processing, 3),
            update(JobStatus::Processing, 3),
            update(JobStatus::Processing, 5),
            update(JobStatus::Processing, 4),
            update(JobStatus::Completed, 10),
            update(JobStatus::Processing, 9),
        ];
        let changed: Vec<bool> = events.iter().map(|e| view.apply(e)).collect();
        assert_eq!(changed, vec![true, false, true, false, true, false]);

        let state = view.get("job-1").unwrap();
        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(state.processed_items, 10);
    }

    #[test]
    fn test_specialized_events_do_not_change_view() {
        let mut view = JobView::new();
        assert!(!view.apply(&JobEvent::Cancelled {
            job_id: "job-1".to_string()
        }));
        assert!(view.is_empty());
    }
}
