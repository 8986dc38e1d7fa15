//! Error handling for export operations.
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! [`ExportError`] wraps per-area error kinds. [`ExportError::class`] maps any
//! error onto the export taxonomy:
//!
//! - `Validation`: bad format or filter, rejected before a job exists
//! - `NotFound`: unknown job id
//! - `TransientIo`: store or disk unavailable, retried with backoff
//! - `StructuralCorruption`: artifact inconsistent with its checkpoint,
//!   the job restarts from scratch
//!
//! Pausing and cancelling are not errors; the pipeline reports them as
//! [`crate::pipeline::StopReason`] values.
//!
//! # Example
//!
//! ```rust
//! use exportd::error::{ExportError, StorageError};
//!
//! let err = ExportError::from(StorageError::Unavailable("primary stepped down".into()));
//! assert!(err.is_transient());
//! ```

pub mod kinds;

// Re-export commonly used types
pub use kinds::{
    ArtifactError, ConfigError, ErrorClass, ExportError, Result, StorageError, TransitionError,
    ValidationError,
};
