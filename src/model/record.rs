//! Exported record type
//!
//! Records are read from the record store through a cursor sorted by
//! [`TaskRecord::sort_key`]. Timestamps are stored as epoch milliseconds so
//! range filters compare numerically in every backend.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, ValidationError};

/// Workflow state of a task record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
    Archived,
}

/// Priority of a task record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

/// A single exportable record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Unique id, also the cursor sort key
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub actual_hours: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// CSV header columns, in output order
pub const CSV_COLUMNS: &[&str] = &[
    "id",
    "title",
    "description",
    "status",
    "priority",
    "estimatedHours",
    "actualHours",
    "tags",
    "dueDate",
    "createdAt",
    "updatedAt",
    "completedAt",
];

/// JSON shape of a record inside an export artifact
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRow<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub estimated_hours: Option<f64>,
    pub actual_hours: Option<f64>,
    pub tags: &'a [String],
    pub due_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl TaskRecord {
    /// Key used for ordering and key-based cursor continuation
    pub fn sort_key(&self) -> &str {
        &self.id
    }

    /// Plain-text cell values in [`CSV_COLUMNS`] order, not yet escaped
    pub fn csv_fields(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.title.clone(),
            self.description.clone().unwrap_or_default(),
            self.status.to_string(),
            self.priority.to_string(),
            format_hours(self.estimated_hours),
            format_hours(self.actual_hours),
            self.tags.join(";"),
            format_optional_time(self.due_date),
            format_time(self.created_at),
            format_time(self.updated_at),
            format_optional_time(self.completed_at),
        ]
    }

    /// Borrowed view used by the JSON encoder
    pub fn export_row(&self) -> ExportRow<'_> {
        ExportRow {
            id: &self.id,
            title: &self.title,
            description: self.description.as_deref(),
            status: self.status,
            priority: self.priority,
            estimated_hours: self.estimated_hours,
            actual_hours: self.actual_hours,
            tags: &self.tags,
            due_date: self.due_date.map(format_time),
            created_at: format_time(self.created_at),
            updated_at: format_time(self.updated_at),
            completed_at: self.completed_at.map(format_time),
        }
    }
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_optional_time(ts: Option<DateTime<Utc>>) -> String {
    ts.map(format_time).unwrap_or_default()
}

fn format_hours(hours: Option<f64>) -> String {
    hours.map(|h| h.to_string()).unwrap_or_default()
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Archived => "archived",
        }
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "archived" => Ok(TaskStatus::Archived),
            other => Err(ValidationError::InvalidFilter {
                field: "status".to_string(),
                reason: format!("unknown status '{other}'"),
            }
            .into()),
        }
    }
}

impl FromStr for TaskPriority {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "urgent" => Ok(TaskPriority::Urgent),
            other => Err(ValidationError::InvalidFilter {
                field: "priority".to_string(),
                reason: format!("unknown priority '{other}'"),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> TaskRecord {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        TaskRecord {
            id: "t-001".to_string(),
            title: "Write report".to_string(),
            description: Some("Quarterly, final".to_string()),
            status: TaskStatus::InProgress,
            priority: TaskPriority::High,
            estimated_hours: Some(4.5),
            actual_hours: None,
            tags: vec!["ops".to_string(), "q1".to_string()],
            due_date: None,
            created_at: created,
            updated_at: created,
            completed_at: None,
        }
    }

    #[test]
    fn test_csv_fields_match_columns() {
        let fields = record().csv_fields();
        assert_eq!(fields.len(), CSV_COLUMNS.len());
        assert_eq!(fields[3], "in_progress");
        assert_eq!(fields[5], "4.5");
        assert_eq!(fields[7], "ops;q1");
        assert_eq!(fields[9], "2024-03-01T09:30:00.000Z");
    }

    #[test]
    fn test_export_row_json() {
        let rec = record();
        let json = serde_json::to_value(rec.export_row()).unwrap();
        assert_eq!(json["id"], "t-001");
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["createdAt"], "2024-03-01T09:30:00.000Z");
        assert!(json["completedAt"].is_null());
    }

    #[test]
    fn test_storage_round_trip_uses_millis() {
        let rec = record();
        let value = serde_json::to_value(&rec).unwrap();
        assert_eq!(value["_id"], "t-001");
        assert!(value["createdAt"].is_i64());
        let back: TaskRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_parse_status() {
        assert_eq!("in-progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert!("unknown".parse::<TaskStatus>().is_err());
    }
}
