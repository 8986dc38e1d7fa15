//! exportd library
//!
//! A resumable background export service: clients request bulk exports of
//! filtered task records to CSV or JSON, and the service runs them on a
//! bounded worker pool with pause, resume and cancel support.
//!
//! # Modules
//!
//! - `model`: jobs, filters, records, formats
//! - `store`: storage traits with in-memory and MongoDB backends
//! - `queue`: priority job queue with crash recovery
//! - `worker`: worker pool and job ownership registry
//! - `pipeline`: cursor → progress → encoder → sink streaming export
//! - `state`: job state machine and status broadcasting
//! - `cache`: result reuse by request fingerprint
//! - `lifecycle`: artifact retention and cleanup
//! - `service`: the [`Exporter`] orchestrator
//! - `cli`, `config`, `connection`, `error`, `formatter`: ambient plumbing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use exportd::{Config, Exporter};
//! use exportd::model::{ExportFilters, ExportFormat};
//! use exportd::store::MemoryRecordStore;
//!
//! #[tokio::main]
//! async fn main() -> exportd::Result<()> {
//!     let exporter = Exporter::in_memory(Config::default(), Arc::new(MemoryRecordStore::new()));
//!     exporter.start().await?;
//!
//!     let lookup = exporter
//!         .start_export(ExportFormat::Csv, ExportFilters::default(), None)
//!         .await?;
//!     println!("job {}", lookup.job().id);
//!
//!     exporter.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod formatter;
pub mod lifecycle;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod service;
pub mod state;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use cache::CacheLookup;
pub use config::Config;
pub use error::{ExportError, Result};
pub use model::{ExportFilters, ExportFormat, ExportJob, JobPriority, JobStatus};
pub use service::{Download, Exporter, HistoryPage};
pub use state::{JobEvent, JobView};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
