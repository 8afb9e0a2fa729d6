//! Named-parameter SQL execution for the job storage layer.
//!
//! Table accessors author statements as templates with `:name` placeholders.
//! This crate compiles those templates into positional statements (cached for
//! the lifetime of the owning [`SqlEngine`]), resolves every placeholder to a
//! typed value, executes the statement over a connection checked out from a
//! [`ConnectionSource`] and reports lost-update races as
//! [`SqlError::ConcurrentModification`] instead of a generic failure.
//!
//! # Main Types
//!
//! * [`SqlEngine`] - Owns the connection source, dialect, table prefix and statement cache
//! * [`Sql`] - Per-call builder holding the parameter bindings for one execution
//! * [`Dialect`](dialect::Dialect) - Vendor specific pagination, quoting and conflict detection
//! * [`Row`](row::Row) - One result row with typed accessors
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = SqlEngine::new(source, Arc::new(AnsiDialect), Some("myapp_"));
//!
//! engine
//!     .sql::<()>("jobrunr_jobs")
//!     .with("state", "FAILED")
//!     .with("id", id)
//!     .with("expectedVersion", 3)
//!     .update_without_entity(
//!         "jobrunr_jobs set state = :state, version = version + 1 \
//!          where id = :id and version = :expectedVersion",
//!     )?;
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub mod binding;
pub mod dialect;
pub mod engine;
pub mod row;
#[cfg(feature = "sqlite-rusqlite")]
pub mod rusqlite;
pub mod statement;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

use std::ops::ControlFlow;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use binding::{BindFields, SqlParam};
pub use dialect::Dialect;
pub use engine::{ConcurrentModification, Sql, SqlEngine, SqlError};
pub use row::{Row, RowError};
pub use statement::{CompiledStatement, StatementCache};
pub use transaction::Transaction;

/// A value resolved for a named parameter, before bind-time coercion.
///
/// Also used for the column values of a [`Row`].
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    String(String),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Real64(f64),
    Instant(DateTime<Utc>),
    Duration(std::time::Duration),
    /// Symbolic name of an enumeration variant
    Enum(String),
    Uuid(Uuid),
}

impl DatabaseValue {
    /// Binds an enumeration by its symbolic name.
    #[must_use]
    pub fn enumeration(value: impl Into<&'static str>) -> Self {
        Self::Enum(value.into().to_string())
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) | Self::Enum(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(value) => Some(*value),
            Self::Int32(value) => Some(i64::from(*value)),
            _ => None,
        }
    }
}

impl<T: Into<Self>> From<Option<T>> for DatabaseValue {
    fn from(val: Option<T>) -> Self {
        val.map_or(Self::Null, std::convert::Into::into)
    }
}

impl From<bool> for DatabaseValue {
    fn from(val: bool) -> Self {
        Self::Bool(val)
    }
}

impl From<&str> for DatabaseValue {
    fn from(val: &str) -> Self {
        Self::String(val.to_string())
    }
}

impl From<&String> for DatabaseValue {
    fn from(val: &String) -> Self {
        Self::String(val.clone())
    }
}

impl From<String> for DatabaseValue {
    fn from(val: String) -> Self {
        Self::String(val)
    }
}

impl From<i32> for DatabaseValue {
    fn from(val: i32) -> Self {
        Self::Int32(val)
    }
}

impl From<i64> for DatabaseValue {
    fn from(val: i64) -> Self {
        Self::Int64(val)
    }
}

impl From<u32> for DatabaseValue {
    fn from(val: u32) -> Self {
        Self::Int64(i64::from(val))
    }
}

impl From<f32> for DatabaseValue {
    fn from(val: f32) -> Self {
        Self::Real64(f64::from(val))
    }
}

impl From<f64> for DatabaseValue {
    fn from(val: f64) -> Self {
        Self::Real64(val)
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(val: DateTime<Utc>) -> Self {
        Self::Instant(val)
    }
}

impl From<std::time::Duration> for DatabaseValue {
    fn from(val: std::time::Duration) -> Self {
        Self::Duration(val)
    }
}

impl From<Uuid> for DatabaseValue {
    fn from(val: Uuid) -> Self {
        Self::Uuid(val)
    }
}

impl From<&Uuid> for DatabaseValue {
    fn from(val: &Uuid) -> Self {
        Self::Uuid(*val)
    }
}

/// Raw error signal reported by a database driver.
///
/// Dialects inspect it to decide whether a failed insert or update is an
/// optimistic concurrency conflict. The classification is best effort: it
/// depends on vendor codes and message wording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSignal {
    /// Vendor error code, when the driver exposes one
    pub code: Option<i64>,
    pub message: String,
}

impl DriverSignal {
    #[must_use]
    pub fn new(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DriverSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "Driver error {code}: {}", self.message),
            None => write!(f, "Driver error: {}", self.message),
        }
    }
}

/// Storage and connectivity failures surfaced by a [`Connection`].
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[cfg(feature = "sqlite-rusqlite")]
    #[error(transparent)]
    Rusqlite(rusqlite::RusqliteDatabaseError),
    #[error("{0}")]
    Driver(DriverSignal),
    #[error("No row")]
    NoRow,
    #[error("Connection pool is empty")]
    EmptyPool,
    #[error("Connection lock poisoned")]
    PoisonedConnection,
    #[error("Already in transaction - nested transactions not supported")]
    AlreadyInTransaction,
    #[error("No transaction in progress")]
    NoTransaction,
}

impl DatabaseError {
    /// The raw driver signal behind this error, if it came from the driver.
    #[must_use]
    pub fn driver_signal(&self) -> Option<DriverSignal> {
        match self {
            #[cfg(feature = "sqlite-rusqlite")]
            Self::Rusqlite(err) => err.driver_signal(),
            Self::Driver(signal) => Some(signal.clone()),
            Self::NoRow
            | Self::EmptyPool
            | Self::PoisonedConnection
            | Self::AlreadyInTransaction
            | Self::NoTransaction => None,
        }
    }
}

/// Outcome of one row of a batch execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRowResult {
    /// The statement ran and reported the number of affected rows
    Affected(u64),
    /// The statement ran but the driver could not report a row count
    SuccessNoInfo,
    /// The statement failed for this row
    Failed,
}

impl BatchRowResult {
    /// JDBC-compatible result code (`n`, `-2` for no info, `-3` for failure).
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn code(self) -> i64 {
        match self {
            Self::Affected(count) => count as i64,
            Self::SuccessNoInfo => -2,
            Self::Failed => -3,
        }
    }
}

/// A single checked-out database connection.
///
/// Dropping the connection releases it back to its [`ConnectionSource`].
/// Statements run with auto-commit unless [`begin`](Self::begin) was called.
pub trait Connection {
    /// Starts an explicit transaction on this connection.
    ///
    /// # Errors
    ///
    /// * If a transaction is already open
    /// * If the driver fails to start the transaction
    fn begin(&mut self) -> Result<(), DatabaseError>;

    /// # Errors
    ///
    /// * If no transaction is open
    /// * If the driver fails to commit
    fn commit(&mut self) -> Result<(), DatabaseError>;

    /// # Errors
    ///
    /// * If no transaction is open
    /// * If the driver fails to roll back
    fn rollback(&mut self) -> Result<(), DatabaseError>;

    /// Executes a positional statement and returns the affected-row count.
    ///
    /// # Errors
    ///
    /// * If the driver rejects or fails the statement
    fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, DatabaseError>;

    /// Executes one positional statement once per parameter row.
    ///
    /// The result holds one entry per parameter row, in input order.
    ///
    /// # Errors
    ///
    /// * If the driver rejects or fails the batch
    fn execute_batch(
        &mut self,
        sql: &str,
        rows: &[Vec<SqlParam>],
    ) -> Result<Vec<BatchRowResult>, DatabaseError>;

    /// Runs a query and hands each row to `visit` until it breaks or the
    /// cursor is exhausted. The cursor is closed before this returns.
    ///
    /// # Errors
    ///
    /// * If the driver rejects or fails the query
    fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        visit: &mut dyn FnMut(&Row) -> ControlFlow<()>,
    ) -> Result<(), DatabaseError>;

    /// Executes a script of `;`-separated statements without parameters.
    ///
    /// # Errors
    ///
    /// * If any statement of the script fails
    fn execute_script(&mut self, script: &str) -> Result<(), DatabaseError>;
}

/// Externally supplied source of connections, shared by every caller.
///
/// Implementations must allow concurrent checkouts; the engine holds at most
/// one connection per in-flight call and never serializes access itself.
pub trait ConnectionSource: Send + Sync + std::fmt::Debug {
    /// # Errors
    ///
    /// * If no connection can be acquired
    fn connection(&self) -> Result<Box<dyn Connection + '_>, DatabaseError>;
}
