//! Database layer for the clinic ledger.

mod schema;
mod patients;
mod audit;
mod commissions;
mod fees;
mod refills;

pub use schema::*;
pub use audit::*;
pub use commissions::*;
#[allow(unused_imports)]
pub use fees::*;
#[allow(unused_imports)]
pub use refills::*;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open database at path, creating if needed.
    ///
    /// File databases use WAL so several connections can share one file.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Create in-memory database (for testing).
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Initialize schema.
    fn initialize(&self) -> DbResult<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Get raw connection (for advanced queries).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a write transaction that takes the database write lock up front.
    ///
    /// Read-then-write sequences (counter bumps, chain appends) must run inside
    /// one of these so concurrent writers serialize instead of interleaving.
    /// Called while a transaction is already open on this connection, it joins
    /// that transaction and the outer scope decides commit or rollback.
    pub fn begin_immediate(&self) -> DbResult<WriteTx<'_>> {
        if !self.conn.is_autocommit() {
            return Ok(WriteTx::Joined);
        }
        Ok(WriteTx::Owned(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?))
    }
}

/// Write scope returned by [`Database::begin_immediate`].
///
/// Dropping an owned scope without committing rolls it back.
pub enum WriteTx<'conn> {
    Owned(Transaction<'conn>),
    Joined,
}

impl WriteTx<'_> {
    pub fn commit(self) -> rusqlite::Result<()> {
        match self {
            WriteTx::Owned(tx) => tx.commit(),
            WriteTx::Joined => Ok(()),
        }
    }
}

/// Fixed-width UTC timestamp; lexical order matches time order.
pub(crate) fn to_db_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in storage format.
pub(crate) fn now_db_time() -> String {
    to_db_time(&Utc::now())
}

fn parse_db_time(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

/// Read a timestamp column.
pub(crate) fn get_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_db_time(idx, &value)
}

/// Read a nullable timestamp column.
pub(crate) fn get_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value.map(|v| parse_db_time(idx, &v)).transpose()
}

/// Map an unknown enum string to a conversion error.
pub(crate) fn bad_enum(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value: {}", value).into(),
    )
}
