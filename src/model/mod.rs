//! Domain types shared by every component
//!
//! - [`ExportJob`]: the persisted job record and its status machine
//! - [`ExportFilters`] / [`NormalizedFilters`]: what to export
//! - [`TaskRecord`]: what a row of the export looks like
//! - [`ExportFormat`]: csv or json

pub mod filter;
pub mod format;
pub mod job;
pub mod record;

pub use filter::{DateRange, ExportFilters, NormalizedFilters, NumberRange, OneOrMany};
pub use format::ExportFormat;
pub use job::{Checkpoint, ExportArtifact, ExportJob, JobPatch, JobPriority, JobStatus, Progress};
pub use record::{CSV_COLUMNS, TaskPriority, TaskRecord, TaskStatus};
