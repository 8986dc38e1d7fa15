use std::{fmt, io};

use crate::model::JobStatus;

/// Crate-wide `Result` type using [`ExportError`] as the error.
///
/// This alias is re-exported by the parent `error` module and is intended
/// to be used throughout the crate for fallible operations.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Top-level error type for export operations.
///
/// This type wraps more specific error kinds and provides a single
/// error type that can be used throughout the crate.
#[derive(Debug)]
pub enum ExportError {
    /// Bad request input (format, filters, paging).
    Validation(ValidationError),

    /// Unknown job id.
    NotFound(String),

    /// Illegal or fenced state transition.
    Transition(TransitionError),

    /// Job/queue/cache store errors.
    Storage(StorageError),

    /// Artifact (temp file) errors.
    Artifact(ArtifactError),

    /// Configuration errors.
    Config(ConfigError),

    /// I/O errors.
    Io(io::Error),

    /// MongoDB driver errors.
    MongoDb(mongodb::error::Error),

    /// Encoding or decoding of a record or job failed.
    Serialization(String),

    /// The worker holding the job exited before reporting an outcome.
    WorkerTerminated,

    /// Generic error with a free-form message.
    Generic(String),
}

/// Classification of errors used for retry and user-visible reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad format or filter.
    Validation,
    /// Unknown job.
    NotFound,
    /// Store or disk temporarily unavailable; retried with backoff.
    TransientIo,
    /// Artifact inconsistent with checkpoint; job restarts from scratch.
    StructuralCorruption,
    /// Illegal transition or lost ownership.
    Conflict,
    /// Anything else.
    Internal,
}

/// Validation-specific errors.
#[derive(Debug)]
pub enum ValidationError {
    /// Export format is not csv or json.
    UnsupportedFormat(String),

    /// Filter value is malformed.
    InvalidFilter { field: String, reason: String },

    /// Paging parameters are out of range.
    InvalidPage(String),

    /// Priority name is unknown.
    InvalidPriority(String),
}

/// State machine errors.
#[derive(Debug)]
pub enum TransitionError {
    /// The edge is not part of the legal transition graph.
    Illegal {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// A worker attempt that no longer owns the job tried to write.
    StaleAttempt {
        job_id: String,
        expected: u32,
        found: u32,
    },

    /// Operation requires a different status than the job has.
    WrongStatus {
        job_id: String,
        status: JobStatus,
        operation: &'static str,
    },
}

/// Store-specific errors.
#[derive(Debug)]
pub enum StorageError {
    /// Backend cannot be reached right now.
    Unavailable(String),

    /// Conditional write lost against a concurrent writer.
    VersionConflict { job_id: String, expected: u64 },

    /// Stored document could not be decoded.
    Corrupt(String),

    /// A record with the same id already exists.
    Duplicate(String),
}

/// Artifact-specific errors.
#[derive(Debug)]
pub enum ArtifactError {
    /// Artifact does not agree with its checkpoint.
    StructuralCorruption { path: String, reason: String },

    /// Completed artifact is no longer on disk.
    Missing(String),

    /// Job has not produced a downloadable artifact.
    NotReady { job_id: String, status: JobStatus },
}

/// Configuration-specific errors.
#[derive(Debug)]
pub enum ConfigError {
    /// Config file not found.
    FileNotFound(String),

    /// Invalid config format.
    InvalidFormat(String),

    /// Invalid field value.
    InvalidValue { field: String, value: String },
}

impl ExportError {
    /// Map the error onto the export error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            ExportError::Validation(_) | ExportError::Config(_) => ErrorClass::Validation,
            ExportError::NotFound(_) => ErrorClass::NotFound,
            ExportError::Transition(_) => ErrorClass::Conflict,
            ExportError::Storage(StorageError::Unavailable(_)) => ErrorClass::TransientIo,
            ExportError::Storage(StorageError::VersionConflict { .. }) => ErrorClass::Conflict,
            ExportError::Storage(_) => ErrorClass::Internal,
            ExportError::Artifact(ArtifactError::StructuralCorruption { .. }) => {
                ErrorClass::StructuralCorruption
            }
            ExportError::Artifact(ArtifactError::NotReady { .. }) => ErrorClass::Conflict,
            ExportError::Artifact(ArtifactError::Missing(_)) => ErrorClass::NotFound,
            ExportError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ErrorClass::Internal,
                _ => ErrorClass::TransientIo,
            },
            ExportError::MongoDb(e) => {
                if is_transient_mongo_error(e) {
                    ErrorClass::TransientIo
                } else {
                    ErrorClass::Internal
                }
            }
            ExportError::Serialization(_)
            | ExportError::WorkerTerminated
            | ExportError::Generic(_) => ErrorClass::Internal,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::TransientIo
    }

    /// Whether the error means the artifact must be rebuilt from scratch.
    pub fn is_corruption(&self) -> bool {
        self.class() == ErrorClass::StructuralCorruption
    }

    /// Whether the error is a fencing rejection for a superseded worker.
    pub fn is_stale_attempt(&self) -> bool {
        matches!(
            self,
            ExportError::Transition(TransitionError::StaleAttempt { .. })
        )
    }

    /// Shorthand for a structural corruption error.
    pub fn corruption(path: impl fmt::Display, reason: impl Into<String>) -> Self {
        ExportError::Artifact(ArtifactError::StructuralCorruption {
            path: path.to_string(),
            reason: reason.into(),
        })
    }
}

fn is_transient_mongo_error(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    if err.contains_label(mongodb::error::RETRYABLE_WRITE_ERROR)
        || err.contains_label(mongodb::error::TRANSIENT_TRANSACTION_ERROR)
    {
        return true;
    }
    matches!(
        err.kind.as_ref(),
        ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::ServerSelection { .. }
    )
}

/* ========================= Display & Error impls ========================= */

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::Validation(e) => write!(f, "Validation error: {e}"),
            ExportError::NotFound(id) => write!(f, "Export job not found: {id}"),
            ExportError::Transition(e) => write!(f, "{e}"),
            ExportError::Storage(e) => write!(f, "Storage error: {e}"),
            ExportError::Artifact(e) => write!(f, "Artifact error: {e}"),
            ExportError::Config(e) => write!(f, "Configuration error: {e}"),
            ExportError::Io(e) => write!(f, "I/O error: {e}"),
            ExportError::MongoDb(e) => write!(f, "MongoDB error: {e}"),
            ExportError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            ExportError::WorkerTerminated => write!(f, "worker terminated"),
            ExportError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::UnsupportedFormat(format) => {
                write!(f, "Unsupported export format '{format}' (expected csv or json)")
            }
            ValidationError::InvalidFilter { field, reason } => {
                write!(f, "Invalid filter '{field}': {reason}")
            }
            ValidationError::InvalidPage(msg) => write!(f, "Invalid page: {msg}"),
            ValidationError::InvalidPriority(p) => {
                write!(f, "Invalid priority '{p}' (expected high, normal or low)")
            }
        }
    }
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::Illegal { job_id, from, to } => {
                write!(f, "Job {job_id} cannot move from {from} to {to}")
            }
            TransitionError::StaleAttempt {
                job_id,
                expected,
                found,
            } => write!(
                f,
                "Job {job_id} is owned by attempt {found}, update from attempt {expected} rejected"
            ),
            TransitionError::WrongStatus {
                job_id,
                status,
                operation,
            } => write!(f, "Cannot {operation} job {job_id} while it is {status}"),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StorageError::VersionConflict { job_id, expected } => {
                write!(f, "job {job_id} changed concurrently (expected version {expected})")
            }
            StorageError::Corrupt(msg) => write!(f, "stored document is corrupt: {msg}"),
            StorageError::Duplicate(id) => write!(f, "duplicate id: {id}"),
        }
    }
}

impl fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactError::StructuralCorruption { path, reason } => {
                write!(f, "artifact {path} is inconsistent with its checkpoint: {reason}")
            }
            ArtifactError::Missing(path) => write!(f, "artifact {path} no longer exists"),
            ArtifactError::NotReady { job_id, status } => {
                write!(f, "job {job_id} is {status}, no artifact to download")
            }
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::InvalidFormat(msg) => write!(f, "Invalid config format: {msg}"),
            ConfigError::InvalidValue { field, value } => {
                write!(f, "Invalid value '{value}' for field '{field}'")
            }
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExportError::Io(e) => Some(e),
            ExportError::MongoDb(e) => Some(e),
            _ => None,
        }
    }
}
impl std::error::Error for ValidationError {}
impl std::error::Error for TransitionError {}
impl std::error::Error for StorageError {}
impl std::error::Error for ArtifactError {}
impl std::error::Error for ConfigError {}

/* ========================= Conversions to ExportError ========================= */

impl From<io::Error> for ExportError {
    fn from(err: io::Error) -> Self {
        ExportError::Io(err)
    }
}

impl From<mongodb::error::Error> for ExportError {
    fn from(err: mongodb::error::Error) -> Self {
        ExportError::MongoDb(err)
    }
}

impl From<bson::ser::Error> for ExportError {
    fn from(err: bson::ser::Error) -> Self {
        ExportError::Serialization(err.to_string())
    }
}

impl From<bson::de::Error> for ExportError {
    fn from(err: bson::de::Error) -> Self {
        ExportError::Storage(StorageError::Corrupt(err.to_string()))
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::Serialization(err.to_string())
    }
}

impl From<ValidationError> for ExportError {
    fn from(err: ValidationError) -> Self {
        ExportError::Validation(err)
    }
}

impl From<TransitionError> for ExportError {
    fn from(err: TransitionError) -> Self {
        ExportError::Transition(err)
    }
}

impl From<StorageError> for ExportError {
    fn from(err: StorageError) -> Self {
        ExportError::Storage(err)
    }
}

impl From<ArtifactError> for ExportError {
    fn from(err: ArtifactError) -> Self {
        ExportError::Artifact(err)
    }
}

impl From<ConfigError> for ExportError {
    fn from(err: ConfigError) -> Self {
        ExportError::Config(err)
    }
}

impl From<String> for ExportError {
    fn from(msg: String) -> Self {
        ExportError::Generic(msg)
    }
}

impl From<&str> for ExportError {
    fn from(msg: &str) -> Self {
        ExportError::Generic(msg.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = ExportError::from(StorageError::Unavailable("down".into()));
        assert!(err.is_transient());
        assert!(!err.is_corruption());

        let err = ExportError::corruption("/tmp/a.csv", "short");
        assert!(err.is_corruption());
        assert_eq!(err.class(), ErrorClass::StructuralCorruption);

        let err = ExportError::NotFound("x".into());
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[test]
    fn test_io_error_class() {
        let err = ExportError::from(io::Error::new(io::ErrorKind::TimedOut, "slow disk"));
        assert!(err.is_transient());
        let err = ExportError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_stale_attempt_display() {
        let err = ExportError::from(TransitionError::StaleAttempt {
            job_id: "j1".into(),
            expected: 1,
            found: 2,
        });
        assert!(err.is_stale_attempt());
        assert_eq!(
            err.to_string(),
            "Job j1 is owned by attempt 2, update from attempt 1 rejected"
        );
    }

    #[test]
    fn test_worker_terminated_message() {
        assert_eq!(ExportError::WorkerTerminated.to_string(), "worker terminated");
    }
}
