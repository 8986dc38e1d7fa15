//! Format encoders for export artifacts
//!
//! An encoder produces the bytes of an artifact in three parts: a preamble
//! written once when the artifact is created, one chunk per record, and a
//! footer written when the run ends. Encoders are stateless; whether a
//! record is the first in the artifact is passed in, which lets a resumed
//! run continue an existing file byte-for-byte.

use crate::error::Result;
use crate::model::{ExportFormat, TaskRecord};

pub mod csv;
pub mod json;

pub use csv::CsvEncoder;
pub use json::JsonEncoder;

/// Trait for rendering records into an artifact format
pub trait RecordEncoder: Send + Sync {
    fn format(&self) -> ExportFormat;

    /// Bytes at the very start of a new artifact
    fn preamble(&self) -> Vec<u8>;

    /// Append the bytes of one record to `out`
    fn encode(&self, record: &TaskRecord, first: bool, out: &mut Vec<u8>) -> Result<()>;

    /// Bytes closing the artifact; not covered by checkpoints
    fn footer(&self) -> &'static [u8];

    /// Whether `byte` can end a checkpointed prefix of an artifact
    fn is_boundary(&self, byte: u8) -> bool;
}

/// Create the encoder for a format
pub fn encoder_for(format: ExportFormat) -> Box<dyn RecordEncoder> {
    match format {
        ExportFormat::Csv => Box::new(CsvEncoder),
        ExportFormat::Json => Box::new(JsonEncoder),
    }
}
