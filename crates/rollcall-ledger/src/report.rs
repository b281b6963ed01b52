//! Operator-facing attendance report.

use crate::store::LedgerError;
use crate::types::Action;
use chrono::{DateTime, Local, Utc};
use std::io::Write;

pub const CSV_HEADER: [&str; 3] = ["name", "action", "timestamp"];
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// One event joined with the subject's name.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub name: String,
    pub action: Action,
    pub timestamp: DateTime<Utc>,
}

impl ReportRow {
    /// Timestamp in local time, as shown to operators.
    pub fn local_timestamp(&self) -> String {
        self.timestamp
            .with_timezone(&Local)
            .format(TIMESTAMP_FORMAT)
            .to_string()
    }
}

/// Write `rows` as CSV with a header row. Returns the number of data rows.
pub fn export_csv<W: Write>(rows: &[ReportRow], writer: W) -> Result<usize, LedgerError> {
    let mut out = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
    out.write_record(CSV_HEADER)?;
    for row in rows {
        out.write_record([row.name.as_str(), row.action.as_str(), &row.local_timestamp()])?;
    }
    out.flush()?;
    tracing::debug!(rows = rows.len(), "report exported");
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, action: Action, secs: i64) -> ReportRow {
        ReportRow {
            name: name.into(),
            action,
            timestamp: DateTime::from_timestamp(secs, 250_000_000).unwrap(),
        }
    }

    #[test]
    fn test_csv_has_header_and_rows() {
        let rows = vec![row("alice", Action::PunchOut, 1_760_000_100), row("bob", Action::PunchIn, 1_760_000_000)];
        let mut buf = Vec::new();
        assert_eq!(export_csv(&rows, &mut buf).unwrap(), 2);

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "name,action,timestamp");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("alice,PUNCH_OUT,"));
        assert!(lines[1].ends_with(".250000"));
        assert!(lines[2].starts_with("bob,PUNCH_IN,"));
    }

    #[test]
    fn test_empty_report_is_header_only() {
        let mut buf = Vec::new();
        assert_eq!(export_csv(&[], &mut buf).unwrap(), 0);
        assert_eq!(String::from_utf8(buf).unwrap(), "name,action,timestamp\n");
    }

    #[test]
    fn test_names_with_commas_are_quoted() {
        let mut buf = Vec::new();
        export_csv(&[row("Doe, Jane", Action::PunchIn, 1_760_000_000)], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.lines().nth(1).unwrap().starts_with("\"Doe, Jane\",PUNCH_IN,"));
    }
}
