//! `SQLite` connection source backed by `rusqlite`.
//!
//! A fixed pool of connections to one database file. Checkout prefers an idle
//! connection, starting from a round-robin index, and blocks on that index
//! when every connection is busy.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use rusqlite::types::{Null, Value};
use rusqlite::{OpenFlags, Statement};
use thiserror::Error;

use crate::binding::SqlParam;
use crate::{BatchRowResult, Connection, ConnectionSource, DatabaseError, DatabaseValue, DriverSignal, Row};

pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RusqliteDatabaseError {
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
}

impl RusqliteDatabaseError {
    /// Extended result code and message of a failure reported by `SQLite`.
    #[must_use]
    pub fn driver_signal(&self) -> Option<DriverSignal> {
        match self {
            Self::Rusqlite(rusqlite::Error::SqliteFailure(err, message)) => Some(DriverSignal::new(
                Some(i64::from(err.extended_code)),
                message.clone().unwrap_or_else(|| err.to_string()),
            )),
            Self::Rusqlite(_) => None,
        }
    }
}

impl From<RusqliteDatabaseError> for DatabaseError {
    fn from(value: RusqliteDatabaseError) -> Self {
        Self::Rusqlite(value)
    }
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(RusqliteDatabaseError::Rusqlite(value))
    }
}

#[derive(Debug)]
pub struct RusqliteConnectionSource {
    connections: Vec<Mutex<rusqlite::Connection>>,
    next_connection: AtomicUsize,
}

impl RusqliteConnectionSource {
    /// Opens `pool_size` connections to the database at `path`.
    ///
    /// `path` may be a `file:` URI.
    ///
    /// # Errors
    ///
    /// * If any connection fails to open or configure
    pub fn open(
        path: impl AsRef<Path>,
        pool_size: usize,
        busy_timeout: Duration,
    ) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        log::debug!("Opening {pool_size} sqlite connection(s) to {}", path.display());

        let connections = (0..pool_size.max(1))
            .map(|_| {
                let connection = rusqlite::Connection::open_with_flags(path, OpenFlags::default())?;
                connection.busy_timeout(busy_timeout)?;
                Ok(Mutex::new(connection))
            })
            .collect::<Result<Vec<_>, rusqlite::Error>>()?;

        Ok(Self::new(connections))
    }

    #[must_use]
    pub const fn new(connections: Vec<Mutex<rusqlite::Connection>>) -> Self {
        Self {
            connections,
            next_connection: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.connections.len()
    }

    fn checkout(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, DatabaseError> {
        if self.connections.is_empty() {
            return Err(DatabaseError::EmptyPool);
        }

        let start = self.next_connection.fetch_add(1, Ordering::Relaxed) % self.connections.len();

        for offset in 0..self.connections.len() {
            let index = (start + offset) % self.connections.len();
            match self.connections[index].try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Poisoned(_)) => return Err(DatabaseError::PoisonedConnection),
            }
        }

        log::trace!("checkout: all connections busy, waiting on {start}");
        self.connections[start]
            .lock()
            .map_err(|_| DatabaseError::PoisonedConnection)
    }
}

impl ConnectionSource for RusqliteConnectionSource {
    fn connection(&self) -> Result<Box<dyn Connection + '_>, DatabaseError> {
        Ok(Box::new(RusqliteConnection {
            connection: self.checkout()?,
            in_transaction: false,
        }))
    }
}

struct RusqliteConnection<'a> {
    connection: MutexGuard<'a, rusqlite::Connection>,
    in_transaction: bool,
}

impl Connection for RusqliteConnection<'_> {
    fn begin(&mut self) -> Result<(), DatabaseError> {
        if self.in_transaction {
            return Err(DatabaseError::AlreadyInTransaction);
        }
        self.connection.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DatabaseError> {
        if !self.in_transaction {
            return Err(DatabaseError::NoTransaction);
        }
        self.connection.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DatabaseError> {
        if !self.in_transaction {
            return Err(DatabaseError::NoTransaction);
        }
        self.connection.execute_batch("ROLLBACK")?;
        self.in_transaction = false;
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, DatabaseError> {
        let mut statement = self.connection.prepare_cached(sql)?;
        bind_values(&mut statement, params)?;
        let affected = statement.raw_execute()?;
        Ok(affected as u64)
    }

    fn execute_batch(
        &mut self,
        sql: &str,
        rows: &[Vec<SqlParam>],
    ) -> Result<Vec<BatchRowResult>, DatabaseError> {
        let mut statement = self.connection.prepare_cached(sql)?;
        let mut results = Vec::with_capacity(rows.len());

        for params in rows {
            statement.clear_bindings();
            bind_values(&mut statement, params)?;
            results.push(BatchRowResult::Affected(statement.raw_execute()? as u64));
        }

        Ok(results)
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        visit: &mut dyn FnMut(&Row) -> ControlFlow<()>,
    ) -> Result<(), DatabaseError> {
        let mut statement = self.connection.prepare_cached(sql)?;
        let column_names = statement
            .column_names()
            .iter()
            .map(|&x| x.to_string())
            .collect::<Vec<_>>();
        bind_values(&mut statement, params)?;

        let mut rows = statement.raw_query();
        let mut count = 0_usize;
        while let Some(row) = rows.next()? {
            count += 1;
            if visit(&from_row(&column_names, row)?).is_break() {
                break;
            }
        }
        log::trace!("query: visited {count} row{}", if count == 1 { "" } else { "s" });

        Ok(())
    }

    fn execute_script(&mut self, script: &str) -> Result<(), DatabaseError> {
        self.connection.execute_batch(script)?;
        Ok(())
    }
}

impl Drop for RusqliteConnection<'_> {
    fn drop(&mut self) {
        if self.in_transaction {
            log::warn!("Connection released inside a transaction, rolling back");
            if let Err(e) = self.connection.execute_batch("ROLLBACK") {
                log::error!("Failed to roll back released connection: {e:?}");
            }
        }
    }
}

fn bind_values(statement: &mut Statement<'_>, params: &[SqlParam]) -> Result<(), rusqlite::Error> {
    for (i, param) in params.iter().enumerate() {
        let index = i + 1;
        match param {
            SqlParam::Integer(value) => statement.raw_bind_parameter(index, value)?,
            SqlParam::Real(value) => statement.raw_bind_parameter(index, value)?,
            SqlParam::Text(value) => statement.raw_bind_parameter(index, value)?,
            SqlParam::Timestamp(Some(value)) => {
                statement.raw_bind_parameter(index, SqlParam::timestamp_text(value))?;
            }
            SqlParam::Timestamp(None) => statement.raw_bind_parameter(index, Null)?,
        }
    }
    Ok(())
}

impl From<Value> for DatabaseValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Integer(value) => Self::Int64(value),
            Value::Real(value) => Self::Real64(value),
            Value::Text(value) => Self::String(value),
            Value::Blob(value) => Self::String(String::from_utf8_lossy(&value).into_owned()),
        }
    }
}

fn from_row(column_names: &[String], row: &rusqlite::Row<'_>) -> Result<Row, rusqlite::Error> {
    let mut columns = Vec::with_capacity(column_names.len());

    for (index, column) in column_names.iter().enumerate() {
        columns.push((column.clone(), row.get::<_, Value>(index)?.into()));
    }

    Ok(Row { columns })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn source() -> (tempfile::TempDir, RusqliteConnectionSource) {
        let dir = tempfile::tempdir().unwrap();
        let source =
            RusqliteConnectionSource::open(dir.path().join("jobs.db"), 2, DEFAULT_BUSY_TIMEOUT)
                .unwrap();
        (dir, source)
    }

    #[test_log::test]
    fn binds_and_reads_back_values() {
        let (_dir, source) = source();
        let mut connection = source.connection().unwrap();

        connection
            .execute_script("create table t (id text, n integer, r real, at text)")
            .unwrap();
        connection
            .execute(
                "insert into t values (?, ?, ?, ?)",
                &[
                    SqlParam::Text("a".into()),
                    SqlParam::Integer(3),
                    SqlParam::Real(0.25),
                    SqlParam::Timestamp(None),
                ],
            )
            .unwrap();

        let mut rows = vec![];
        connection
            .query("select * from t", &[], &mut |row| {
                rows.push(row.clone());
                ControlFlow::Continue(())
            })
            .unwrap();

        assert_eq!(
            rows,
            vec![Row {
                columns: vec![
                    ("id".into(), DatabaseValue::String("a".into())),
                    ("n".into(), DatabaseValue::Int64(3)),
                    ("r".into(), DatabaseValue::Real64(0.25)),
                    ("at".into(), DatabaseValue::Null),
                ],
            }]
        );
    }

    #[test_log::test]
    fn unique_violation_exposes_driver_signal() {
        let (_dir, source) = source();
        let mut connection = source.connection().unwrap();

        connection
            .execute_script("create table t (id text primary key)")
            .unwrap();
        connection
            .execute("insert into t values (?)", &[SqlParam::Text("a".into())])
            .unwrap();
        let err = connection
            .execute("insert into t values (?)", &[SqlParam::Text("a".into())])
            .unwrap_err();

        let signal = err.driver_signal().unwrap();
        assert!(signal.code.is_some());
        assert!(signal.message.to_lowercase().contains("unique constraint"));
    }

    #[test_log::test]
    fn released_connection_never_straddles_a_transaction() {
        let (_dir, source) = source();
        {
            let mut connection = source.connection().unwrap();
            connection.execute_script("create table t (id text)").unwrap();
        }
        {
            let mut connection = source.connection().unwrap();
            connection.begin().unwrap();
            connection
                .execute("insert into t values (?)", &[SqlParam::Text("a".into())])
                .unwrap();
        }

        let mut connection = source.connection().unwrap();
        let mut count = 0;
        connection
            .query("select count(*) from t", &[], &mut |row| {
                count = row.as_long_at(0).unwrap();
                ControlFlow::Break(())
            })
            .unwrap();

        assert_eq!(count, 0);
    }

    #[test_log::test]
    fn nested_begin_is_rejected() {
        let (_dir, source) = source();
        let mut connection = source.connection().unwrap();

        connection.begin().unwrap();

        assert!(matches!(
            connection.begin(),
            Err(DatabaseError::AlreadyInTransaction)
        ));
        connection.rollback().unwrap();
    }

    #[test_log::test]
    fn failed_rollback_keeps_connection_in_transaction() {
        let (_dir, source) = source();
        let mut connection = RusqliteConnection {
            connection: source.checkout().unwrap(),
            in_transaction: false,
        };

        connection.begin().unwrap();
        // ends the transaction behind the connection's back
        connection.execute_script("COMMIT").unwrap();

        assert!(connection.rollback().is_err());
        assert!(connection.in_transaction);
    }
}
