//! CSV encoder
//!
//! One header row with the fixed record columns, then one row per record.
//! Every row ends with `\n`, which is the boundary byte checked on resume.

use crate::error::Result;
use crate::model::{CSV_COLUMNS, ExportFormat, TaskRecord};

use super::RecordEncoder;

pub struct CsvEncoder;

impl CsvEncoder {
    /// Quote a value if it contains a comma, quote, or line break
    fn escape_csv_value(value: &str) -> String {
        if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r')
        {
            format!("\"{}\"", value.replace('"', "\"\""))
        } else {
            value.to_string()
        }
    }
}

impl RecordEncoder for CsvEncoder {
    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    fn preamble(&self) -> Vec<u8> {
        let mut header = CSV_COLUMNS.join(",");
        header.push('\n');
        header.into_bytes()
    }

    fn encode(&self, record: &TaskRecord, _first: bool, out: &mut Vec<u8>) -> Result<()> {
        let row = record
            .csv_fields()
            .iter()
            .map(|value| Self::escape_csv_value(value))
            .collect::<Vec<_>>()
            .join(",");
        out.extend_from_slice(row.as_bytes());
        out.push(b'\n');
        Ok(())
    }

    fn footer(&self) -> &'static [u8] {
        b""
    }

    fn is_boundary(&self, byte: u8) -> bool {
        byte == b'\n'
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskPriority, TaskStatus};
    use chrono::{TimeZone, Utc};

    fn record(title: &str) -> TaskRecord {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        TaskRecord {
            id: "r1".to_string(),
            title: title.to_string(),
            description: None,
            status: TaskStatus::Todo,
            priority: TaskPriority::Low,
            estimated_hours: None,
            actual_hours: None,
            tags: vec![],
            due_date: None,
            created_at: ts,
            updated_at: ts,
            completed_at: None,
        }
    }

    #[test]
    fn test_csv_escape_value() {
        assert_eq!(CsvEncoder::escape_csv_value("simple"), "simple");
        assert_eq!(CsvEncoder::escape_csv_value("with,comma"), "\"with,comma\"");
        assert_eq!(CsvEncoder::escape_csv_value("with\"quote"), "\"with\"\"quote\"");
        assert_eq!(CsvEncoder::escape_csv_value("with\nnewline"), "\"with\nnewline\"");
    }

    #[test]
    fn test_header_matches_columns() {
        let header = String::from_utf8(CsvEncoder.preamble()).unwrap();
        assert!(header.starts_with("id,title,description,status"));
        assert!(header.ends_with("completedAt\n"));
    }

    #[test]
    fn test_row_is_escaped_and_terminated() {
        let mut out = Vec::new();
        CsvEncoder
            .encode(&record("Hello, \"world\""), true, &mut out)
            .unwrap();
        let row = String::from_utf8(out).unwrap();
        assert!(row.starts_with("r1,\"Hello, \"\"world\"\"\",,todo,low,"));
        assert!(row.ends_with('\n'));
        assert!(CsvEncoder.is_boundary(*row.as_bytes().last().unwrap()));
    }
}
