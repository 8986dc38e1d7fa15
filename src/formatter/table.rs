//! Table formatting for export jobs using tabled
//!
//! Rows are built with the `Builder` so columns stay fixed regardless of
//! which optional fields a job carries.

use tabled::{
    Table,
    builder::Builder,
    settings::{Alignment, Color, Modify, Style, object::Columns, object::Rows, width::Width},
};

use crate::model::ExportJob;

/// Maximum width for a single column (characters)
const DEFAULT_MAX_COLUMN_WIDTH: usize = 40;

const JOB_COLUMNS: &[&str] = &[
    "id", "format", "priority", "status", "progress", "items", "created", "file",
];

/// Table formatter for job listings
pub struct TableFormatter {
    max_column_width: usize,
    style: TableStyle,
    use_colors: bool,
}

/// Available table styles
#[derive(Debug, Clone, Copy)]
pub enum TableStyle {
    /// Modern style with box-drawing borders
    Modern,
    /// ASCII style with basic characters
    Ascii,
    /// Rounded style
    Rounded,
    /// Psql style
    Psql,
}

impl TableFormatter {
    pub fn new() -> Self {
        Self {
            max_column_width: DEFAULT_MAX_COLUMN_WIDTH,
            style: TableStyle::Rounded,
            use_colors: false,
        }
    }

    pub fn with_colors(mut self, use_colors: bool) -> Self {
        self.use_colors = use_colors;
        self
    }

    pub fn with_style(mut self, style: TableStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_max_column_width(mut self, width: usize) -> Self {
        self.max_column_width = width;
        self
    }

    /// One row per job
    pub fn format_jobs(&self, jobs: &[ExportJob]) -> String {
        if jobs.is_empty() {
            return "(no export jobs)".to_string();
        }

        let mut builder = Builder::default();
        builder.push_record(JOB_COLUMNS.iter().map(|column| column.to_string()));
        for job in jobs {
            builder.push_record(job_row(job));
        }
        self.finish(builder.build(), JOB_COLUMNS.len())
    }

    /// Two-column field/value listing of one job
    pub fn format_job(&self, job: &ExportJob) -> String {
        let mut builder = Builder::default();
        builder.push_record(["field".to_string(), "value".to_string()]);
        for (field, value) in job_fields(job) {
            builder.push_record([field.to_string(), value]);
        }
        self.finish(builder.build(), 2)
    }

    fn finish(&self, mut table: Table, columns: usize) -> String {
        self.apply_style(&mut table);
        for i in 0..columns {
            table.with(Modify::new(Columns::new(i..=i)).with(Width::wrap(self.max_column_width)));
        }
        table.with(Modify::new(Rows::first()).with(Alignment::center()));
        if self.use_colors {
            table.modify(Rows::first(), Color::FG_CYAN | Color::BOLD);
        }
        table.to_string()
    }

    fn apply_style(&self, table: &mut Table) {
        match self.style {
            TableStyle::Modern => table.with(Style::modern()),
            TableStyle::Ascii => table.with(Style::ascii()),
            TableStyle::Rounded => table.with(Style::rounded()),
            TableStyle::Psql => table.with(Style::psql()),
        };
    }
}

impl Default for TableFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn job_row(job: &ExportJob) -> Vec<String> {
    vec![
        job.id.clone(),
        job.format.to_string(),
        job.priority.to_string(),
        job.status.to_string(),
        format!("{}%", job.progress.percentage),
        format!("{}/{}", job.progress.processed_items, job.progress.total_items),
        job.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        job.result
            .as_ref()
            .map(|artifact| artifact.filename.clone())
            .unwrap_or_default(),
    ]
}

fn job_fields(job: &ExportJob) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("id", job.id.clone()),
        ("status", job.status.to_string()),
        ("format", job.format.to_string()),
        ("priority", job.priority.to_string()),
        (
            "progress",
            format!(
                "{}% ({}/{})",
                job.progress.percentage, job.progress.processed_items, job.progress.total_items
            ),
        ),
        ("filename", job.filename.clone()),
        ("attempt", job.attempt.to_string()),
        ("created", job.created_at.to_rfc3339()),
        ("updated", job.updated_at.to_rfc3339()),
    ];
    if let Some(started) = job.started_at {
        fields.push(("started", started.to_rfc3339()));
    }
    if let Some(finished) = job.finished_at {
        fields.push(("finished", finished.to_rfc3339()));
    }
    if let Some(ref checkpoint) = job.checkpoint {
        fields.push((
            "checkpoint",
            format!(
                "{} items @ byte {}",
                checkpoint.processed_items, checkpoint.last_valid_byte_offset
            ),
        ));
    }
    if let Some(ref artifact) = job.result {
        fields.push(("artifact", artifact.temp_path.display().to_string()));
        fields.push(("size", format_bytes(artifact.size_bytes)));
    }
    if let Some(ref error) = job.error {
        fields.push(("error", error.clone()));
    }
    if let Some(ref client) = job.client_id {
        fields.push(("client", client.clone()));
    }
    fields
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExportFormat, JobPriority, NormalizedFilters};
    use chrono::Utc;

    fn job() -> ExportJob {
        ExportJob::new(
            ExportFormat::Csv,
            NormalizedFilters::default(),
            "key".to_string(),
            JobPriority::High,
            Some("client-1".to_string()),
            Utc::now(),
        )
    }

    #[test]
    fn test_empty_listing() {
        assert_eq!(TableFormatter::new().format_jobs(&[]), "(no export jobs)");
    }

    #[test]
    fn test_job_listing_has_columns_and_rows() {
        let job = job();
        let output = TableFormatter::new()
            .with_style(TableStyle::Ascii)
            .with_max_column_width(80)
            .format_jobs(std::slice::from_ref(&job));
        assert!(output.contains("status"));
        assert!(output.contains(&job.id));
        assert!(output.contains("pending"));
        assert!(output.contains("high"));
    }

    #[test]
    fn test_single_job_fields() {
        let output = TableFormatter::new()
            .with_max_column_width(80)
            .format_job(&job());
        assert!(output.contains("client-1"));
        assert!(!output.contains("error"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
