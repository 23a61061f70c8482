//! SQLite-backed alarm store.
//!
//! Provides persistent storage for:
//! - Alarm profiles and their templates
//! - Scheduled journeys and their materialized alarms
//! - Ad-hoc alarm instances
//!
//! The handle is constructed explicitly and shared through [`SharedDb`]; nothing
//! in the crate opens the database behind the caller's back.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;

use super::{data_dir, migrations};
use crate::error::{CoreError, DatabaseError};

/// File name of the database inside the data directory.
pub const DB_FILE: &str = "overlord.db";

/// SQLite database for profiles, journeys and alarms.
pub struct AlarmDb {
    pub(super) conn: Connection,
}

impl AlarmDb {
    /// Get a reference to the underlying SQLite connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Open the database at `<data_dir>/overlord.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self, CoreError> {
        let path = data_dir()?.join(DB_FILE);
        Self::open_at(&path)
    }

    /// Open (or create) the database at an explicit path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_at(path: &Path) -> Result<Self, CoreError> {
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::init(conn)
    }

    /// Open an in-memory database.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be created.
    pub fn open_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, CoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::migrate(&conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self { conn })
    }
}

/// Shared handle to one [`AlarmDb`].
///
/// Every component that touches the store receives a clone of this handle.
#[derive(Clone)]
pub struct SharedDb {
    inner: Arc<Mutex<AlarmDb>>,
}

impl SharedDb {
    pub fn new(db: AlarmDb) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    /// Run `f` with exclusive access to the database.
    ///
    /// # Errors
    /// Returns whatever `f` returns, or [`DatabaseError::Poisoned`] if a previous
    /// holder panicked.
    pub fn with<T>(
        &self,
        f: impl FnOnce(&mut AlarmDb) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let mut guard = self.inner.lock().map_err(|_| DatabaseError::Poisoned)?;
        f(&mut guard)
    }
}

/// Canonical text form of a stored instant.
///
/// Fixed width (millisecond precision, `Z` suffix) so that string comparison in
/// SQL agrees with chronological order.
pub(crate) fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn opt_ts(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(fmt_ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn open_memory_enables_foreign_keys() {
        let db = AlarmDb::open_memory().unwrap();
        let enabled: i64 = db
            .conn()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn open_at_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DB_FILE);
        AlarmDb::open_at(&path).unwrap();
        assert!(path.exists());
        // Reopening an existing database is fine.
        AlarmDb::open_at(&path).unwrap();
    }

    #[test]
    fn timestamps_sort_as_text() {
        let a = Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(250);
        assert!(fmt_ts(a) < fmt_ts(b));
        assert_eq!(parse_ts(0, &fmt_ts(b)).unwrap(), b);
    }

    #[test]
    fn shared_db_runs_closures() {
        let shared = SharedDb::new(AlarmDb::open_memory().unwrap());
        let count: i64 = shared
            .with(|db| {
                Ok(db
                    .conn()
                    .query_row("SELECT COUNT(*) FROM alarm_profiles", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
