//! SQLite-backed subjects and attendance events.
//!
//! The cooldown check and the insert it guards run inside one
//! `BEGIN IMMEDIATE` transaction. The write lock is taken before the latest
//! event is read, so two writers (threads or processes) sharing a database
//! file cannot both pass the check.

use crate::clock::{Clock, SystemClock};
use crate::report::ReportRow;
use crate::types::{from_micros, to_micros, Action, AttendanceEvent, Confirmation, Subject};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Cooldown active. Please wait {}s.", ceil_secs(.remaining))]
    CooldownActive { action: Action, remaining: Duration },
    #[error("no subject with id {0}")]
    UnknownSubject(i64),
    #[error("clock went backwards: last event at {last}, now {now}")]
    ClockRegression {
        last: DateTime<Utc>,
        now: DateTime<Utc>,
    },
    #[error("ledger store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("csv export error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn ceil_secs(d: &Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Minimum spacing between two events of the same action for one subject.
    pub cooldown: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

pub struct Ledger<C = SystemClock> {
    conn: Connection,
    config: LedgerConfig,
    clock: C,
}

impl Ledger<SystemClock> {
    pub fn open(path: impl AsRef<Path>, config: LedgerConfig) -> Result<Self, LedgerError> {
        Self::open_with_clock(path, config, SystemClock)
    }
}

impl<C: Clock> Ledger<C> {
    pub fn open_with_clock(
        path: impl AsRef<Path>,
        config: LedgerConfig,
        clock: C,
    ) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        let ledger = Self {
            conn,
            config,
            clock,
        };
        ledger.ensure_schema()?;
        tracing::info!(
            path = %path.display(),
            cooldown_secs = ledger.config.cooldown.as_secs(),
            "ledger opened"
        );
        Ok(ledger)
    }

    fn ensure_schema(&self) -> Result<(), LedgerError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS subjects (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              subject_id INTEGER NOT NULL REFERENCES subjects(id),
              action TEXT NOT NULL CHECK (action IN ('PUNCH_IN', 'PUNCH_OUT')),
              timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_subject_time ON events(subject_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_subjects_name ON subjects(name);
            "#,
        )?;
        Ok(())
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn add_subject(&self, name: &str) -> Result<Subject, LedgerError> {
        let created_at = self.clock.now();
        self.conn.execute(
            "INSERT INTO subjects (name, created_at) VALUES (?1, ?2)",
            params![name, to_micros(created_at)],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(id, name, "subject added");
        Ok(Subject {
            id,
            name: name.to_string(),
            created_at,
        })
    }

    /// Names are not unique; the earliest subject with `name` wins.
    pub fn find_subject_by_name(&self, name: &str) -> Result<Option<Subject>, LedgerError> {
        let subject = self
            .conn
            .query_row(
                "SELECT id, name, created_at FROM subjects WHERE name = ?1 ORDER BY id LIMIT 1",
                params![name],
                subject_from_row,
            )
            .optional()?;
        Ok(subject)
    }

    pub fn subject(&self, id: i64) -> Result<Option<Subject>, LedgerError> {
        let subject = self
            .conn
            .query_row(
                "SELECT id, name, created_at FROM subjects WHERE id = ?1",
                params![id],
                subject_from_row,
            )
            .optional()?;
        Ok(subject)
    }

    /// Look the subject up by name, creating it if absent.
    pub fn ensure_subject(&self, name: &str) -> Result<Subject, LedgerError> {
        match self.find_subject_by_name(name)? {
            Some(s) => Ok(s),
            None => self.add_subject(name),
        }
    }

    pub fn subjects(&self) -> Result<Vec<Subject>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, created_at FROM subjects ORDER BY id")?;
        let rows = stmt.query_map([], subject_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Record `action` for `subject_id` at the current time.
    pub fn record(&mut self, subject_id: i64, action: Action) -> Result<Confirmation, LedgerError> {
        let now = self.clock.now();
        self.record_at(subject_id, action, now)
    }

    /// Record `action` for `subject_id` at `at`.
    ///
    /// Only the subject's most recent event is consulted: a repeat of the
    /// same action inside the cooldown is refused; a different action is
    /// always accepted.
    pub fn record_at(
        &mut self,
        subject_id: i64,
        action: Action,
        at: DateTime<Utc>,
    ) -> Result<Confirmation, LedgerError> {
        let cooldown = self.config.cooldown;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM subjects WHERE id = ?1",
                params![subject_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Err(LedgerError::UnknownSubject(subject_id));
        }

        let last: Option<(Action, i64)> = tx
            .query_row(
                "SELECT action, timestamp FROM events WHERE subject_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT 1",
                params![subject_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((last_action, last_micros)) = last {
            let last_at = from_micros(last_micros)?;
            if at < last_at {
                tracing::warn!(subject_id, %last_at, %at, "event older than subject's last event");
                return Err(LedgerError::ClockRegression { last: last_at, now: at });
            }
            let elapsed = (at - last_at).to_std().unwrap_or(Duration::ZERO);
            if last_action == action && elapsed < cooldown {
                let remaining = cooldown - elapsed;
                tracing::warn!(
                    subject_id,
                    %action,
                    remaining_ms = remaining.as_millis() as u64,
                    "cooldown active"
                );
                return Err(LedgerError::CooldownActive { action, remaining });
            }
        }

        tx.execute(
            "INSERT INTO events (subject_id, action, timestamp) VALUES (?1, ?2, ?3)",
            params![subject_id, action, to_micros(at)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::info!(id, subject_id, %action, "attendance recorded");
        Ok(Confirmation::for_event(AttendanceEvent {
            id,
            subject_id,
            action,
            timestamp: at,
        }))
    }

    /// Events for one subject, oldest first.
    pub fn events_for(&self, subject_id: i64) -> Result<Vec<AttendanceEvent>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, subject_id, action, timestamp FROM events
             WHERE subject_id = ?1 ORDER BY timestamp, id",
        )?;
        let rows = stmt.query_map(params![subject_id], |row| {
            Ok(AttendanceEvent {
                id: row.get(0)?,
                subject_id: row.get(1)?,
                action: row.get(2)?,
                timestamp: from_micros(row.get(3)?)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Every event joined with its subject's name, newest first.
    pub fn report(&self) -> Result<Vec<ReportRow>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.name, e.action, e.timestamp
             FROM events e JOIN subjects s ON s.id = e.subject_id
             ORDER BY e.timestamp DESC, e.id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ReportRow {
                name: row.get(0)?,
                action: row.get(1)?,
                timestamp: from_micros(row.get(2)?)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

fn configure_connection(conn: &Connection) -> Result<(), LedgerError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::debug!(mode, "WAL unavailable for this database");
    }
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(())
}

fn subject_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subject> {
    Ok(Subject {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: from_micros(row.get(2)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeDelta;
    use std::sync::{Arc, Barrier};

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_760_000_000, 0).unwrap()
    }

    fn open_ledger(dir: &tempfile::TempDir) -> (Ledger<ManualClock>, ManualClock) {
        let clock = ManualClock::new(start());
        let ledger = Ledger::open_with_clock(
            dir.path().join("attendance.db"),
            LedgerConfig::default(),
            clock.clone(),
        )
        .unwrap();
        (ledger, clock)
    }

    #[test]
    fn test_same_action_inside_cooldown_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ledger, clock) = open_ledger(&dir);
        let alice = ledger.add_subject("alice").unwrap();

        let ok = ledger.record(alice.id, Action::PunchIn).unwrap();
        assert!(ok.message.starts_with("Successfully marked PUNCH_IN at "));

        clock.advance(TimeDelta::seconds(20));
        let err = ledger.record(alice.id, Action::PunchIn).unwrap_err();
        match err {
            LedgerError::CooldownActive { action, remaining } => {
                assert_eq!(action, Action::PunchIn);
                assert_eq!(remaining, Duration::from_secs(40));
            }
            other => panic!("expected cooldown, got {other:?}"),
        }
        assert_eq!(ledger.events_for(alice.id).unwrap().len(), 1);
    }

    #[test]
    fn test_cooldown_message() {
        let err = LedgerError::CooldownActive {
            action: Action::PunchIn,
            remaining: Duration::from_millis(39_200),
        };
        assert_eq!(err.to_string(), "Cooldown active. Please wait 40s.");
    }

    #[test]
    fn test_different_action_has_no_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ledger, _clock) = open_ledger(&dir);
        let alice = ledger.add_subject("alice").unwrap();
        ledger.record(alice.id, Action::PunchIn).unwrap();
        let out = ledger.record(alice.id, Action::PunchOut).unwrap();
        assert_eq!(out.event.action, Action::PunchOut);
    }

    #[test]
    fn test_repeat_allowed_once_cooldown_elapsed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ledger, clock) = open_ledger(&dir);
        let alice = ledger.add_subject("alice").unwrap();
        ledger.record(alice.id, Action::PunchIn).unwrap();

        clock.advance(TimeDelta::milliseconds(59_999));
        assert!(ledger.record(alice.id, Action::PunchIn).is_err());
        clock.advance(TimeDelta::milliseconds(1));
        ledger.record(alice.id, Action::PunchIn).unwrap();
        assert_eq!(ledger.events_for(alice.id).unwrap().len(), 2);
    }

    #[test]
    fn test_only_latest_event_guards() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ledger, clock) = open_ledger(&dir);
        let alice = ledger.add_subject("alice").unwrap();
        ledger.record(alice.id, Action::PunchIn).unwrap();
        clock.advance(TimeDelta::seconds(1));
        ledger.record(alice.id, Action::PunchOut).unwrap();
        clock.advance(TimeDelta::seconds(1));
        ledger.record(alice.id, Action::PunchIn).unwrap();
    }

    #[test]
    fn test_cooldown_is_per_subject() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ledger, _clock) = open_ledger(&dir);
        let alice = ledger.add_subject("alice").unwrap();
        let bob = ledger.add_subject("bob").unwrap();
        ledger.record(alice.id, Action::PunchIn).unwrap();
        ledger.record(bob.id, Action::PunchIn).unwrap();
    }

    #[test]
    fn test_unknown_subject() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ledger, _clock) = open_ledger(&dir);
        assert!(matches!(
            ledger.record(42, Action::PunchIn),
            Err(LedgerError::UnknownSubject(42))
        ));
    }

    #[test]
    fn test_clock_regression_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ledger, clock) = open_ledger(&dir);
        let alice = ledger.add_subject("alice").unwrap();
        ledger.record(alice.id, Action::PunchIn).unwrap();
        clock.set(start() - TimeDelta::seconds(5));
        assert!(matches!(
            ledger.record(alice.id, Action::PunchOut),
            Err(LedgerError::ClockRegression { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_resolve_to_lowest_id() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, _clock) = open_ledger(&dir);
        let first = ledger.add_subject("sam").unwrap();
        let second = ledger.add_subject("sam").unwrap();
        assert!(second.id > first.id);
        assert_eq!(ledger.find_subject_by_name("sam").unwrap().unwrap().id, first.id);
        assert_eq!(ledger.ensure_subject("sam").unwrap().id, first.id);
        assert!(ledger.find_subject_by_name("nobody").unwrap().is_none());
        assert_eq!(ledger.subjects().unwrap().len(), 2);
    }

    #[test]
    fn test_report_newest_first_with_names() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ledger, clock) = open_ledger(&dir);
        let alice = ledger.add_subject("alice").unwrap();
        let bob = ledger.add_subject("bob").unwrap();
        ledger.record(alice.id, Action::PunchIn).unwrap();
        clock.advance(TimeDelta::seconds(5));
        ledger.record(bob.id, Action::PunchIn).unwrap();
        clock.advance(TimeDelta::seconds(5));
        ledger.record(alice.id, Action::PunchOut).unwrap();

        let rows = ledger.report().unwrap();
        let got: Vec<(&str, Action)> = rows.iter().map(|r| (r.name.as_str(), r.action)).collect();
        assert_eq!(
            got,
            vec![
                ("alice", Action::PunchOut),
                ("bob", Action::PunchIn),
                ("alice", Action::PunchIn),
            ]
        );
        assert_eq!(rows[0].timestamp, start() + TimeDelta::seconds(10));
    }

    #[test]
    fn test_events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let (mut ledger, _clock) = open_ledger(&dir);
            let alice = ledger.add_subject("alice").unwrap();
            ledger.record(alice.id, Action::PunchIn).unwrap();
            alice.id
        };
        let (mut ledger, _clock) = open_ledger(&dir);
        assert_eq!(ledger.events_for(id).unwrap().len(), 1);
        assert!(matches!(
            ledger.record(id, Action::PunchIn),
            Err(LedgerError::CooldownActive { .. })
        ));
    }

    #[test]
    fn test_concurrent_writers_record_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        let subject_id = {
            let ledger = Ledger::open(&path, LedgerConfig::default()).unwrap();
            ledger.add_subject("alice").unwrap().id
        };

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut ledger = Ledger::open(&path, LedgerConfig::default()).unwrap();
                    barrier.wait();
                    ledger.record_at(subject_id, Action::PunchIn, start())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let cooled = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::CooldownActive { .. })))
            .count();
        assert_eq!((ok, cooled), (1, 3));

        let ledger = Ledger::open(&path, LedgerConfig::default()).unwrap();
        assert_eq!(ledger.events_for(subject_id).unwrap().len(), 1);
    }
}
