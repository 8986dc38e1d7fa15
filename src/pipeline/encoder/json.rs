//! JSON array encoder
//!
//! Layout: `[` then `\n{record}` for the first record and `,\n{record}` for
//! every later one, closed by `\n]\n`. A checkpointed prefix therefore always
//! ends in `[` (no records yet) or `}` (after a record), and the closing
//! bracket can be truncated away to append more records.

use crate::error::Result;
use crate::model::{ExportFormat, TaskRecord};

use super::RecordEncoder;

pub struct JsonEncoder;

impl RecordEncoder for JsonEncoder {
    fn format(&self) -> ExportFormat {
        ExportFormat::Json
    }

    fn preamble(&self) -> Vec<u8> {
        b"[".to_vec()
    }

    fn encode(&self, record: &TaskRecord, first: bool, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(if first { b"\n" } else { b",\n" });
        serde_json::to_writer(&mut *out, &record.export_row())?;
        Ok(())
    }

    fn footer(&self) -> &'static [u8] {
        b"\n]\n"
    }

    fn is_boundary(&self, byte: u8) -> bool {
        byte == b'}' || byte == b'['
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskPriority, TaskStatus};
    use chrono::{TimeZone, Utc};

    fn record(id: &str) -> TaskRecord {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        TaskRecord {
            id: id.to_string(),
            title: format!("Task {id}"),
            description: Some("line one\nline two".to_string()),
            status: TaskStatus::Done,
            priority: TaskPriority::Urgent,
            estimated_hours: Some(2.0),
            actual_hours: Some(1.5),
            tags: vec!["a".to_string()],
            due_date: None,
            created_at: ts,
            updated_at: ts,
            completed_at: Some(ts),
        }
    }

    #[test]
    fn test_artifact_is_valid_json_array() {
        let encoder = JsonEncoder;
        let mut bytes = encoder.preamble();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            encoder.encode(&record(id), i == 0, &mut bytes).unwrap();
        }
        bytes.extend_from_slice(encoder.footer());

        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let items = parsed.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1]["id"], "b");
        assert_eq!(items[2]["priority"], "urgent");
    }

    #[test]
    fn test_empty_artifact_is_empty_array() {
        let encoder = JsonEncoder;
        let mut bytes = encoder.preamble();
        bytes.extend_from_slice(encoder.footer());
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, serde_json::json!([]));
    }

    #[test]
    fn test_boundary_bytes() {
        let encoder = JsonEncoder;
        let mut bytes = encoder.preamble();
        assert!(encoder.is_boundary(*bytes.last().unwrap()));
        encoder.encode(&record("a"), true, &mut bytes).unwrap();
        assert!(encoder.is_boundary(*bytes.last().unwrap()));
        assert!(!encoder.is_boundary(b','));
        assert!(!encoder.is_boundary(b']'));
    }
}
