use chrono::{DateTime, Local, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    PunchIn,
    PunchOut,
}

impl Action {
    pub const ALL: [Action; 2] = [Action::PunchIn, Action::PunchOut];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::PunchIn => "PUNCH_IN",
            Action::PunchOut => "PUNCH_OUT",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseActionError(pub String);

impl fmt::Display for ParseActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown action {:?} (expected PUNCH_IN or PUNCH_OUT)", self.0)
    }
}

impl std::error::Error for ParseActionError {}

impl FromStr for Action {
    type Err = ParseActionError;

    /// Accepts the stored form and the short `in` / `out` spellings, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "PUNCH_IN" | "IN" => Ok(Action::PunchIn),
            "PUNCH_OUT" | "OUT" => Ok(Action::PunchOut),
            _ => Err(ParseActionError(s.to_string())),
        }
    }
}

impl ToSql for Action {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Action {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// An enrolled person as known to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subject {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One immutable ledger row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub id: i64,
    pub subject_id: i64,
    pub action: Action,
    pub timestamp: DateTime<Utc>,
}

/// Returned by a successful record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Confirmation {
    pub message: String,
    pub event: AttendanceEvent,
}

impl Confirmation {
    pub(crate) fn for_event(event: AttendanceEvent) -> Self {
        let at = event.timestamp.with_timezone(&Local).format("%H:%M:%S");
        Self {
            message: format!("Successfully marked {} at {}", event.action, at),
            event,
        }
    }
}

/// Microseconds since the Unix epoch, the on-disk timestamp.
pub(crate) fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| rusqlite::Error::IntegralValueOutOfRange(0, micros))
}
