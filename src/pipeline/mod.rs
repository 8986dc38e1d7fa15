//! Streaming export pipeline
//!
//! The pipeline turns a record cursor into an artifact file without ever
//! holding the full result set in memory:
//!
//! 1. **RecordCursor**: lazily pulls key-sorted batches from the record store
//! 2. **ProgressStage**: counts records and decides when progress is reported
//! 3. **RecordEncoder**: renders CSV rows or JSON array elements
//! 4. **ArtifactSink**: appendable file writer with durable flushes
//!
//! These components are orchestrated by the **ExportCoordinator**. It
//! reports progress and checkpoints to a [`PipelineObserver`], whose answer
//! ([`Flow`]) can stop the run for a pause, a cancellation, or because the
//! job was taken over by another worker.
//!
//! A checkpoint is only reported after the bytes it covers were flushed and
//! synced, so a resumed run can trust `last_valid_byte_offset`.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;

use crate::error::Result;
use crate::model::{Checkpoint, Progress};

pub mod coordinator;
pub mod encoder;
pub mod progress;
pub mod sink;
pub mod source;

pub use coordinator::{ExportCoordinator, ExportPlan};
pub use encoder::{CsvEncoder, JsonEncoder, RecordEncoder, encoder_for};
pub use progress::ProgressStage;
pub use sink::ArtifactSink;
pub use source::{CursorRecordSource, RecordCursor};

/// Why a run stopped before reaching the end of the cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Keep the flushed artifact and checkpoint for a later resume
    Paused,
    /// Abandon the artifact
    Cancelled,
    /// Another worker attempt owns the job; leave everything untouched
    Superseded,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Paused => f.write_str("paused"),
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::Superseded => f.write_str("superseded"),
        }
    }
}

/// Answer of the observer to a progress report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop(StopReason),
}

/// How a pipeline run ended
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed {
        total_processed: u64,
        artifact_path: PathBuf,
        size_bytes: u64,
    },
    Paused {
        processed_items: u64,
        last_processed_key: Option<String>,
        checkpoint: Checkpoint,
        progress: Progress,
    },
    Cancelled {
        processed_items: u64,
        artifact_path: PathBuf,
    },
    Superseded,
}

/// Receiver of pipeline progress and source of control signals
#[async_trait]
pub trait PipelineObserver: Send {
    /// Report new progress, a new durable checkpoint, or both
    async fn on_progress(
        &mut self,
        progress: Option<Progress>,
        checkpoint: Option<Checkpoint>,
    ) -> Flow;

    /// The artifact was found corrupt and the run restarts from zero
    async fn on_restart(&mut self) -> Result<()>;

    /// Non-blocking check for a pending pause or cancel
    fn poll_stop(&mut self) -> Option<StopReason>;

    /// Resolves once a stop signal arrives; never resolves otherwise
    ///
    /// Must be cancel-safe: the coordinator races it against cursor reads.
    async fn stopped(&mut self) -> StopReason;
}
