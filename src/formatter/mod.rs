//! Output formatting for the command line
//!
//! Every command prints through [`Formatter`], either as human-readable
//! tables and messages or as JSON for scripting (`--json`).

pub mod table;

pub use table::{TableFormatter, TableStyle, format_bytes};

use serde::Serialize;
use serde_json::json;

use crate::cache::CacheLookup;
use crate::error::Result;
use crate::lifecycle::SweepReport;
use crate::model::ExportJob;
use crate::queue::RecoveryReport;
use crate::service::HistoryPage;
use crate::state::JobEvent;

/// Output mode selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

pub struct Formatter {
    mode: OutputMode,
    use_colors: bool,
}

impl Formatter {
    pub fn new(mode: OutputMode, use_colors: bool) -> Self {
        Self { mode, use_colors }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    fn table(&self) -> TableFormatter {
        TableFormatter::new().with_colors(self.use_colors)
    }

    fn json<T: Serialize>(value: &T) -> Result<String> {
        Ok(serde_json::to_string_pretty(value)?)
    }

    /// Result of an export request
    pub fn format_lookup(&self, lookup: &CacheLookup) -> Result<String> {
        let (how, job) = match lookup {
            CacheLookup::Created(job) => ("created", job),
            CacheLookup::InFlight(job) => ("in_flight", job),
            CacheLookup::Hit(job) => ("cached", job),
        };
        match self.mode {
            OutputMode::Json => Self::json(&json!({ "resolution": how, "job": job })),
            OutputMode::Table => {
                let headline = match lookup {
                    CacheLookup::Created(_) => format!("Export {} queued", job.id),
                    CacheLookup::InFlight(_) => {
                        format!("Joined export {} already in progress", job.id)
                    }
                    CacheLookup::Hit(_) => format!("Export {} served from cache", job.id),
                };
                Ok(format!("{headline}\n{}", self.table().format_job(job)))
            }
        }
    }

    pub fn format_job(&self, job: &ExportJob) -> Result<String> {
        match self.mode {
            OutputMode::Json => Self::json(job),
            OutputMode::Table => Ok(self.table().format_job(job)),
        }
    }

    pub fn format_history(&self, page: &HistoryPage) -> Result<String> {
        match self.mode {
            OutputMode::Json => Self::json(page),
            OutputMode::Table => Ok(format!(
                "{}\nPage {} of {} ({} jobs)",
                self.table().format_jobs(&page.jobs),
                page.page,
                page.total_pages().max(1),
                page.total
            )),
        }
    }

    pub fn format_sweep(&self, report: &SweepReport) -> Result<String> {
        match self.mode {
            OutputMode::Json => Self::json(&json!({
                "expiredArtifacts": report.expired_artifacts,
                "expiredJobs": report.expired_jobs,
                "orphanedFiles": report.orphaned_files,
                "danglingCacheEntries": report.dangling_cache_entries,
            })),
            OutputMode::Table if report.is_empty() => Ok("Nothing to clean up".to_string()),
            OutputMode::Table => Ok(format!(
                "Removed {} expired artifact(s), {} expired job(s), {} orphaned file(s), {} dangling cache entr(ies)",
                report.expired_artifacts,
                report.expired_jobs,
                report.orphaned_files,
                report.dangling_cache_entries
            )),
        }
    }

    pub fn format_recovery(&self, report: &RecoveryReport) -> Result<String> {
        match self.mode {
            OutputMode::Json => Self::json(&json!({
                "requeued": report.requeued,
                "discarded": report.discarded,
            })),
            OutputMode::Table => Ok(format!(
                "Recovered queue: {} requeued, {} stale entries discarded",
                report.requeued.len(),
                report.discarded.len()
            )),
        }
    }

    /// One status event as a single line
    pub fn format_event(&self, event: &JobEvent) -> Result<String> {
        match self.mode {
            OutputMode::Json => Ok(serde_json::to_string(event)?),
            OutputMode::Table => Ok(match event {
                JobEvent::StatusChanged(update) => format!(
                    "{} {} {}% ({}/{})",
                    update.job_id,
                    update.status,
                    update.progress,
                    update.processed_items,
                    update.total_items
                ),
                JobEvent::Completed {
                    job_id,
                    filename,
                    total_items,
                    size_bytes,
                } => format!(
                    "{job_id} completed: {filename}, {total_items} items, {}",
                    format_bytes(*size_bytes)
                ),
                JobEvent::Failed { job_id, error } => format!("{job_id} failed: {error}"),
                JobEvent::Cancelled { job_id } => format!("{job_id} cancelled"),
            }),
        }
    }

    /// Plain message, wrapped as `{"message": ...}` in JSON mode
    pub fn format_message(&self, message: &str) -> Result<String> {
        match self.mode {
            OutputMode::Json => Self::json(&json!({ "message": message })),
            OutputMode::Table => Ok(message.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExportFormat, JobPriority, JobStatus, NormalizedFilters};
    use crate::state::StatusUpdate;
    use chrono::Utc;

    fn job() -> ExportJob {
        ExportJob::new(
            ExportFormat::Json,
            NormalizedFilters::default(),
            "key".to_string(),
            JobPriority::Normal,
            None,
            Utc::now(),
        )
    }

    #[test]
    fn test_lookup_json_names_resolution() {
        let formatter = Formatter::new(OutputMode::Json, false);
        let output = formatter.format_lookup(&CacheLookup::InFlight(job())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["resolution"], "in_flight");
        assert_eq!(value["job"]["status"], "pending");
    }

    #[test]
    fn test_event_lines() {
        let formatter = Formatter::new(OutputMode::Table, false);
        let mut job = job();
        job.status = JobStatus::Processing;
        let line = formatter
            .format_event(&JobEvent::StatusChanged(StatusUpdate::from_job(&job)))
            .unwrap();
        assert!(line.contains("processing 0%"));

        let line = formatter
            .format_event(&JobEvent::Failed {
                job_id: "j1".to_string(),
                error: "worker terminated".to_string(),
            })
            .unwrap();
        assert_eq!(line, "j1 failed: worker terminated");
    }

    #[test]
    fn test_empty_sweep() {
        let formatter = Formatter::new(OutputMode::Table, false);
        assert_eq!(
            formatter.format_sweep(&SweepReport::default()).unwrap(),
            "Nothing to clean up"
        );
    }
}
