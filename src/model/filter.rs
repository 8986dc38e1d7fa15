//! Export filter specification and normalization
//!
//! Clients send [`ExportFilters`]; everything downstream works with
//! [`NormalizedFilters`], whose canonical JSON form is the input of the
//! result-cache fingerprint. Two requests that mean the same thing must
//! normalize to byte-identical JSON.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, ValidationError};

use super::format::ExportFormat;
use super::record::{TaskPriority, TaskRecord, TaskStatus};

/// Window for the `recentlyCompleted` derived predicate
pub const RECENTLY_COMPLETED_DAYS: i64 = 7;

/// A filter value that accepts either a single item or a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Inclusive timestamp range; either bound may be open
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

/// Inclusive numeric range; either bound may be open
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Filters as received from a client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportFilters {
    pub status: Option<OneOrMany<TaskStatus>>,
    pub priority: Option<OneOrMany<TaskPriority>>,
    pub search: Option<String>,
    pub created: Option<DateRange>,
    pub updated: Option<DateRange>,
    pub completed: Option<DateRange>,
    pub estimated_hours: Option<NumberRange>,
    pub actual_hours: Option<NumberRange>,
    pub overdue: Option<bool>,
    pub recently_completed: Option<bool>,
    pub over_estimated: Option<bool>,
    pub under_estimated: Option<bool>,
}

/// Canonical filter form stored on jobs and hashed into cache keys
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedFilters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<TaskStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priorities: Vec<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<NumberRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_hours: Option<NumberRange>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub overdue: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub recently_completed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub over_estimated: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub under_estimated: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ExportFilters {
    /// Validate and canonicalize the filters
    ///
    /// Sets are sorted and deduplicated, search text is trimmed and
    /// lower-cased, empty values and `false` flags are dropped.
    pub fn normalize(self) -> Result<NormalizedFilters> {
        let mut statuses = self.status.map(OneOrMany::into_vec).unwrap_or_default();
        statuses.sort();
        statuses.dedup();

        let mut priorities = self.priority.map(OneOrMany::into_vec).unwrap_or_default();
        priorities.sort();
        priorities.dedup();

        let search = self
            .search
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let over_estimated = self.over_estimated.unwrap_or(false);
        let under_estimated = self.under_estimated.unwrap_or(false);
        if over_estimated && under_estimated {
            return Err(ValidationError::InvalidFilter {
                field: "overEstimated".to_string(),
                reason: "cannot be combined with underEstimated".to_string(),
            }
            .into());
        }

        Ok(NormalizedFilters {
            statuses,
            priorities,
            search,
            created: normalize_date_range("created", self.created)?,
            updated: normalize_date_range("updated", self.updated)?,
            completed: normalize_date_range("completed", self.completed)?,
            estimated_hours: normalize_number_range("estimatedHours", self.estimated_hours)?,
            actual_hours: normalize_number_range("actualHours", self.actual_hours)?,
            overdue: self.overdue.unwrap_or(false),
            recently_completed: self.recently_completed.unwrap_or(false),
            over_estimated,
            under_estimated,
        })
    }
}

fn normalize_date_range(field: &str, range: Option<DateRange>) -> Result<Option<DateRange>> {
    let Some(range) = range else {
        return Ok(None);
    };
    if range.from.is_none() && range.to.is_none() {
        return Ok(None);
    }
    if let (Some(from), Some(to)) = (range.from, range.to) {
        if from > to {
            return Err(ValidationError::InvalidFilter {
                field: field.to_string(),
                reason: "range start is after range end".to_string(),
            }
            .into());
        }
    }
    Ok(Some(range))
}

fn normalize_number_range(field: &str, range: Option<NumberRange>) -> Result<Option<NumberRange>> {
    let Some(range) = range else {
        return Ok(None);
    };
    if range.min.is_some_and(f64::is_nan) || range.max.is_some_and(f64::is_nan) {
        return Err(ValidationError::InvalidFilter {
            field: field.to_string(),
            reason: "bound is not a number".to_string(),
        }
        .into());
    }
    match (range.min, range.max) {
        (None, None) => Ok(None),
        (Some(min), Some(max)) if min > max => Err(ValidationError::InvalidFilter {
            field: field.to_string(),
            reason: "minimum is greater than maximum".to_string(),
        }
        .into()),
        _ => Ok(Some(range)),
    }
}

impl DateRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| ts >= from) && self.to.is_none_or(|to| ts <= to)
    }
}

impl NumberRange {
    pub fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

impl NormalizedFilters {
    /// Content address of an export: SHA-256 over format and canonical filters
    pub fn fingerprint(&self, format: ExportFormat) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hasher = Sha256::new();
        hasher.update(format.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Evaluate the filters against a record
    ///
    /// `as_of` anchors the time-relative predicates (overdue, recently
    /// completed) so every run of one job sees the same record set.
    pub fn matches(&self, record: &TaskRecord, as_of: DateTime<Utc>) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if !self.priorities.is_empty() && !self.priorities.contains(&record.priority) {
            return false;
        }
        if let Some(ref needle) = self.search {
            let hit = record.title.to_lowercase().contains(needle)
                || record
                    .description
                    .as_deref()
                    .is_some_and(|d| d.to_lowercase().contains(needle))
                || record.tags.iter().any(|t| t.to_lowercase().contains(needle));
            if !hit {
                return false;
            }
        }
        if let Some(ref range) = self.created {
            if !range.contains(record.created_at) {
                return false;
            }
        }
        if let Some(ref range) = self.updated {
            if !range.contains(record.updated_at) {
                return false;
            }
        }
        if let Some(ref range) = self.completed {
            if !record.completed_at.is_some_and(|c| range.contains(c)) {
                return false;
            }
        }
        if let Some(ref range) = self.estimated_hours {
            if !record.estimated_hours.is_some_and(|h| range.contains(h)) {
                return false;
            }
        }
        if let Some(ref range) = self.actual_hours {
            if !record.actual_hours.is_some_and(|h| range.contains(h)) {
                return false;
            }
        }
        if self.overdue {
            let overdue = record.status != TaskStatus::Done
                && record.due_date.is_some_and(|due| due < as_of);
            if !overdue {
                return false;
            }
        }
        if self.recently_completed {
            let cutoff = as_of - Duration::days(RECENTLY_COMPLETED_DAYS);
            if !record.completed_at.is_some_and(|c| c >= cutoff) {
                return false;
            }
        }
        if self.over_estimated || self.under_estimated {
            let (Some(estimated), Some(actual)) = (record.estimated_hours, record.actual_hours)
            else {
                return false;
            };
            if self.over_estimated && actual >= estimated {
                return false;
            }
            if self.under_estimated && actual <= estimated {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, status: TaskStatus) -> TaskRecord {
        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        TaskRecord {
            id: id.to_string(),
            title: format!("Task {id}"),
            description: Some("Migrate the Billing service".to_string()),
            status,
            priority: TaskPriority::Medium,
            estimated_hours: Some(8.0),
            actual_hours: Some(10.0),
            tags: vec!["backend".to_string()],
            due_date: Some(ts - Duration::days(1)),
            created_at: ts,
            updated_at: ts,
            completed_at: None,
        }
    }

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let filters = ExportFilters {
            status: Some(OneOrMany::Many(vec![
                TaskStatus::Done,
                TaskStatus::Todo,
                TaskStatus::Done,
            ])),
            search: Some("  Billing ".to_string()),
            overdue: Some(false),
            ..Default::default()
        };
        let normalized = filters.normalize().unwrap();
        assert_eq!(normalized.statuses, vec![TaskStatus::Todo, TaskStatus::Done]);
        assert_eq!(normalized.search.as_deref(), Some("billing"));
        assert!(!normalized.overdue);
    }

    #[test]
    fn test_equivalent_filters_share_fingerprint() {
        let a = ExportFilters {
            status: Some(OneOrMany::One(TaskStatus::Todo)),
            search: Some("Report".to_string()),
            ..Default::default()
        };
        let b = ExportFilters {
            status: Some(OneOrMany::Many(vec![TaskStatus::Todo, TaskStatus::Todo])),
            search: Some(" report".to_string()),
            recently_completed: Some(false),
            ..Default::default()
        };
        let fa = a.normalize().unwrap().fingerprint(ExportFormat::Csv).unwrap();
        let fb = b.normalize().unwrap().fingerprint(ExportFormat::Csv).unwrap();
        assert_eq!(fa, fb);

        let json = ExportFilters::default()
            .normalize()
            .unwrap()
            .fingerprint(ExportFormat::Json)
            .unwrap();
        assert_ne!(fa, json);
        assert_eq!(fa.len(), 64);
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        let ts = Utc::now();
        let filters = ExportFilters {
            created: Some(DateRange {
                from: Some(ts),
                to: Some(ts - Duration::hours(1)),
            }),
            ..Default::default()
        };
        assert!(filters.normalize().is_err());

        let filters = ExportFilters {
            actual_hours: Some(NumberRange {
                min: Some(5.0),
                max: Some(1.0),
            }),
            ..Default::default()
        };
        assert!(filters.normalize().is_err());

        let filters = ExportFilters {
            over_estimated: Some(true),
            under_estimated: Some(true),
            ..Default::default()
        };
        assert!(filters.normalize().is_err());
    }

    #[test]
    fn test_matches_derived_predicates() {
        let as_of = Utc.with_ymd_and_hms(2024, 5, 12, 0, 0, 0).unwrap();
        let rec = record("a", TaskStatus::Todo);

        let overdue = NormalizedFilters {
            overdue: true,
            ..Default::default()
        };
        assert!(overdue.matches(&rec, as_of));
        assert!(!overdue.matches(&record("b", TaskStatus::Done), as_of));

        let under = NormalizedFilters {
            under_estimated: true,
            ..Default::default()
        };
        assert!(under.matches(&rec, as_of));

        let over = NormalizedFilters {
            over_estimated: true,
            ..Default::default()
        };
        assert!(!over.matches(&rec, as_of));
    }

    #[test]
    fn test_matches_search_and_ranges() {
        let as_of = Utc::now();
        let rec = record("a", TaskStatus::Todo);
        let filters = ExportFilters {
            search: Some("BILLING".to_string()),
            estimated_hours: Some(NumberRange {
                min: Some(4.0),
                max: None,
            }),
            ..Default::default()
        }
        .normalize()
        .unwrap();
        assert!(filters.matches(&rec, as_of));

        let filters = NormalizedFilters {
            completed: Some(DateRange {
                from: Some(as_of - Duration::days(30)),
                to: None,
            }),
            ..Default::default()
        };
        assert!(!filters.matches(&rec, as_of));
    }

    #[test]
    fn test_single_or_many_deserialize() {
        let one: ExportFilters = serde_json::from_str(r#"{"status":"done"}"#).unwrap();
        let many: ExportFilters = serde_json::from_str(r#"{"status":["done"]}"#).unwrap();
        assert_eq!(one.normalize().unwrap(), many.normalize().unwrap());
    }
}
