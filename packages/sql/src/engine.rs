//! Statement execution with optimistic concurrency checks.

use std::ops::ControlFlow;
use std::sync::Arc;

use thiserror::Error;

use crate::binding::{BindFields, Parameters, SqlParam, UnknownParameter};
use crate::dialect::Dialect;
use crate::row::{Row, RowError};
use crate::statement::{CompiledStatement, StatementCache};
use crate::transaction::Transaction;
use crate::{BatchRowResult, ConnectionSource, DatabaseError, DatabaseValue};

/// A write that lost an optimistic concurrency race.
///
/// Batch conflicts carry the whole input collection and every per-row
/// result. Identifying the row that lost is left to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrentModification<T> {
    pub entities: Vec<T>,
    pub results: Vec<BatchRowResult>,
}

impl<T> std::fmt::Display for ConcurrentModification<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let codes = self
            .results
            .iter()
            .map(|x| x.code().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "Concurrent modification of {} entities (results: [{codes}])",
            self.entities.len()
        )
    }
}

#[derive(Debug, Error)]
pub enum SqlError<T: std::fmt::Debug> {
    /// A placeholder no binding source could resolve. A defect in the caller.
    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("{0}")]
    ConcurrentModification(ConcurrentModification<T>),
    #[error("Could not insert or update all objects: expected {expected} results, got {actual}")]
    ResultSizeMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Row(#[from] RowError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl<T: std::fmt::Debug> From<UnknownParameter> for SqlError<T> {
    fn from(value: UnknownParameter) -> Self {
        Self::UnknownParameter(value.0)
    }
}

impl<T: std::fmt::Debug> SqlError<T> {
    #[must_use]
    pub const fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::ConcurrentModification(_))
    }
}

/// Shared execution handle.
///
/// Owns the connection source, dialect, table prefix and the statement cache
/// for that prefix. Cheap to share behind an [`Arc`]; every call checks out
/// its own connection.
#[derive(Debug)]
pub struct SqlEngine {
    source: Arc<dyn ConnectionSource>,
    dialect: Arc<dyn Dialect>,
    table_prefix: String,
    cache: StatementCache,
}

impl SqlEngine {
    #[must_use]
    pub fn new(
        source: Arc<dyn ConnectionSource>,
        dialect: Arc<dyn Dialect>,
        table_prefix: Option<&str>,
    ) -> Self {
        Self {
            source,
            dialect,
            table_prefix: table_prefix.unwrap_or_default().to_string(),
            cache: StatementCache::new(),
        }
    }

    #[must_use]
    pub fn dialect(&self) -> &dyn Dialect {
        &*self.dialect
    }

    #[must_use]
    pub fn table_prefix(&self) -> &str {
        &self.table_prefix
    }

    #[must_use]
    pub const fn cache(&self) -> &StatementCache {
        &self.cache
    }

    /// Starts a builder for statements against `table_name`.
    #[must_use]
    pub fn sql<T: BindFields + Clone + std::fmt::Debug>(&self, table_name: &str) -> Sql<'_, T> {
        Sql {
            engine: self,
            table_name: table_name.to_string(),
            params: Parameters::default(),
            suffix: String::new(),
        }
    }

    /// Checks out a connection wrapped in a [`Transaction`].
    ///
    /// # Errors
    ///
    /// * If no connection is available or the transaction fails to start
    pub fn transaction(&self, auto_commit: bool) -> Result<Transaction<'_>, DatabaseError> {
        Transaction::new(self.source.connection()?, auto_commit)
    }

    /// Runs an unparameterized script, e.g. DDL, in one explicit transaction.
    ///
    /// # Errors
    ///
    /// * If any statement of the script fails
    pub fn execute_script(&self, script: &str) -> Result<(), DatabaseError> {
        let mut transaction = self.transaction(false)?;
        transaction.connection().execute_script(script)?;
        transaction.commit()
    }
}

/// Builder for one call: bindings plus an optional pagination suffix.
///
/// Operations borrow the builder, so the same bindings can serve several
/// statements of one logical call.
pub struct Sql<'a, T> {
    engine: &'a SqlEngine,
    table_name: String,
    params: Parameters<'a, T>,
    suffix: String,
}

impl<T> std::fmt::Debug for Sql<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sql")
            .field("table_name", &self.table_name)
            .field("params", &self.params)
            .field("suffix", &self.suffix)
            .finish_non_exhaustive()
    }
}

impl<'a, T: BindFields + Clone + std::fmt::Debug> Sql<'a, T> {
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<DatabaseValue>) -> Self {
        self.params.set(name, value);
        self
    }

    /// Binds `name` to a value derived from each subject entity.
    #[must_use]
    pub fn with_fn(
        mut self,
        name: &str,
        derive: impl Fn(&T) -> DatabaseValue + Send + Sync + 'a,
    ) -> Self {
        self.params.set_fn(name, derive);
        self
    }

    /// Registers the version accessor behind `:previousVersion`.
    #[must_use]
    pub fn with_version(mut self, version: impl Fn(&T) -> i64 + Send + Sync + 'a) -> Self {
        self.params.set_version(version);
        self
    }

    /// Appends the dialect's pagination suffix to selects and binds
    /// `:limit` and `:offset`.
    #[must_use]
    pub fn with_order_limit_and_offset(mut self, order: &str, limit: u32, offset: u64) -> Self {
        self.suffix = self.engine.dialect.limit_and_offset(order);
        self.params.set("limit", limit);
        self.params
            .set("offset", i64::try_from(offset).unwrap_or(i64::MAX));
        self
    }

    fn compile(&self, statement: &str) -> Arc<CompiledStatement> {
        self.engine
            .cache
            .get_or_compile(statement, &self.table_name, &self.engine.table_prefix)
    }

    fn bind(&self, compiled: &CompiledStatement, entity: Option<&T>) -> Result<Vec<SqlParam>, SqlError<T>> {
        Ok(self.params.bind(&compiled.param_names, entity)?)
    }

    /// Runs `select <statement>` and visits rows until `visit` breaks or the
    /// cursor is exhausted. The cursor and connection are released before
    /// this returns.
    ///
    /// # Errors
    ///
    /// * If a parameter is unknown
    /// * If `visit` fails to read a row
    /// * If the query fails
    pub fn select_each(
        &self,
        statement: &str,
        mut visit: impl FnMut(&Row) -> Result<ControlFlow<()>, RowError>,
    ) -> Result<(), SqlError<T>> {
        let compiled = self.compile(&format!("select {statement}{}", self.suffix));
        let params = self.bind(&compiled, None)?;
        log::trace!("select: {} params={params:?}", compiled.text);

        let mut failure = None;
        let mut transaction = self.engine.transaction(true)?;
        transaction
            .connection()
            .query(&compiled.text, &params, &mut |row| match visit(row) {
                Ok(flow) => flow,
                Err(e) => {
                    failure = Some(e);
                    ControlFlow::Break(())
                }
            })?;
        transaction.commit()?;

        failure.map_or(Ok(()), |e| Err(e.into()))
    }

    /// # Errors
    ///
    /// * If the select fails or a row cannot be mapped
    pub fn select_map<R>(
        &self,
        statement: &str,
        mut map: impl FnMut(&Row) -> Result<R, RowError>,
    ) -> Result<Vec<R>, SqlError<T>> {
        let mut items = vec![];
        self.select_each(statement, |row| {
            items.push(map(row)?);
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(items)
    }

    /// Maps the first row only. The rest of the cursor is never read.
    ///
    /// # Errors
    ///
    /// * If the select fails or the row cannot be mapped
    pub fn select_first<R>(
        &self,
        statement: &str,
        map: impl FnOnce(&Row) -> Result<R, RowError>,
    ) -> Result<Option<R>, SqlError<T>> {
        let mut map = Some(map);
        let mut first = None;
        self.select_each(statement, |row| {
            if let Some(map) = map.take() {
                first = Some(map(row)?);
            }
            Ok(ControlFlow::Break(()))
        })?;
        Ok(first)
    }

    /// Runs `select count(*) <statement>`. The pagination suffix is not
    /// applied.
    ///
    /// # Errors
    ///
    /// * If the query fails or returns no count
    pub fn select_count(&self, statement: &str) -> Result<u64, SqlError<T>> {
        let compiled = self.compile(&format!("select count(*) {statement}"));
        let params = self.bind(&compiled, None)?;
        log::trace!("select_count: {} params={params:?}", compiled.text);

        let mut count = None;
        let mut transaction = self.engine.transaction(true)?;
        transaction
            .connection()
            .query(&compiled.text, &params, &mut |row| {
                count = Some(row.as_long_at(0));
                ControlFlow::Break(())
            })?;
        transaction.commit()?;

        let count = count.ok_or(DatabaseError::NoRow)??;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// # Errors
    ///
    /// * If the count query fails
    pub fn select_exists(&self, statement: &str) -> Result<bool, SqlError<T>> {
        Ok(self.select_count(statement)? > 0)
    }

    /// Runs `insert <statement>` for `item`; exactly one row must be affected.
    ///
    /// # Errors
    ///
    /// * [`SqlError::ConcurrentModification`] if the row count is not 1 or
    ///   the driver reports a duplicate key
    /// * If a parameter is unknown or the statement fails
    pub fn insert(&self, item: &T, statement: &str) -> Result<(), SqlError<T>> {
        self.insert_or_update(Some(item), &format!("insert {statement}"))
    }

    /// Runs `update <statement>` for `item`; exactly one row must be affected.
    ///
    /// # Errors
    ///
    /// * [`SqlError::ConcurrentModification`] if the row count is not 1 or
    ///   the driver reports a duplicate key
    /// * If a parameter is unknown or the statement fails
    pub fn update(&self, item: &T, statement: &str) -> Result<(), SqlError<T>> {
        self.insert_or_update(Some(item), &format!("update {statement}"))
    }

    /// Like [`update`](Self::update) with explicit bindings only. A conflict
    /// carries no entities.
    ///
    /// # Errors
    ///
    /// * [`SqlError::ConcurrentModification`] if the row count is not 1
    /// * If a parameter is unknown or the statement fails
    pub fn update_without_entity(&self, statement: &str) -> Result<(), SqlError<T>> {
        self.insert_or_update(None, &format!("update {statement}"))
    }

    /// Runs `delete <statement>` and returns the number of deleted rows.
    ///
    /// # Errors
    ///
    /// * If a parameter is unknown or the statement fails
    pub fn delete(&self, statement: &str) -> Result<u64, SqlError<T>> {
        let compiled = self.compile(&format!("delete {statement}"));
        let params = self.bind(&compiled, None)?;
        log::trace!("delete: {} params={params:?}", compiled.text);

        let mut transaction = self.engine.transaction(true)?;
        let deleted = transaction.connection().execute(&compiled.text, &params)?;
        transaction.commit()?;

        Ok(deleted)
    }

    fn insert_or_update(&self, item: Option<&T>, statement: &str) -> Result<(), SqlError<T>> {
        let compiled = self.compile(statement);
        let params = self.bind(&compiled, item)?;
        log::trace!("insert_or_update: {} params={params:?}", compiled.text);

        let mut transaction = self.engine.transaction(true)?;
        let affected = match transaction.connection().execute(&compiled.text, &params) {
            Ok(affected) => affected,
            Err(e) => {
                if e
                    .driver_signal()
                    .is_some_and(|x| self.engine.dialect.is_concurrency_conflict(&x))
                {
                    log::debug!("insert_or_update: conflict reported by driver: {e:?}");
                    return Err(conflict(item.into_iter().cloned().collect(), vec![
                        BatchRowResult::Affected(0),
                    ]));
                }
                return Err(e.into());
            }
        };
        transaction.commit()?;

        if affected != 1 {
            log::debug!("insert_or_update: expected 1 affected row, got {affected}");
            return Err(conflict(item.into_iter().cloned().collect(), vec![
                BatchRowResult::Affected(affected),
            ]));
        }

        Ok(())
    }

    /// Inserts every item as one batch in one transaction.
    ///
    /// # Errors
    ///
    /// * [`SqlError::ResultSizeMismatch`] if the driver returns a different
    ///   number of results than items
    /// * [`SqlError::ConcurrentModification`] with every item if any row
    ///   failed, reported no information or affected no row
    /// * If a parameter is unknown or the batch fails
    pub fn insert_all(&self, items: &[T], statement: &str) -> Result<(), SqlError<T>> {
        self.insert_or_update_all(items, &format!("insert {statement}"))
    }

    /// Updates every item as one batch in one transaction.
    ///
    /// # Errors
    ///
    /// * [`SqlError::ResultSizeMismatch`] if the driver returns a different
    ///   number of results than items
    /// * [`SqlError::ConcurrentModification`] with every item if any row
    ///   affected less than one row
    /// * If a parameter is unknown or the batch fails
    pub fn update_all(&self, items: &[T], statement: &str) -> Result<(), SqlError<T>> {
        self.insert_or_update_all(items, &format!("update {statement}"))
    }

    fn insert_or_update_all(&self, items: &[T], statement: &str) -> Result<(), SqlError<T>> {
        if items.is_empty() {
            return Ok(());
        }

        let compiled = self.compile(statement);
        let rows = items
            .iter()
            .map(|x| self.bind(&compiled, Some(x)))
            .collect::<Result<Vec<_>, _>>()?;
        log::trace!("insert_or_update_all: {} rows={}", compiled.text, rows.len());

        let mut transaction = self.engine.transaction(false)?;
        let results = transaction.connection().execute_batch(&compiled.text, &rows)?;
        transaction.commit()?;

        if results.len() != items.len() {
            return Err(SqlError::ResultSizeMismatch {
                expected: items.len(),
                actual: results.len(),
            });
        }

        if results
            .iter()
            .any(|x| !matches!(x, BatchRowResult::Affected(count) if *count >= 1))
        {
            log::debug!("insert_or_update_all: conflicting batch results {results:?}");
            return Err(conflict(items.to_vec(), results));
        }

        Ok(())
    }
}

fn conflict<T: std::fmt::Debug>(entities: Vec<T>, results: Vec<BatchRowResult>) -> SqlError<T> {
    SqlError::ConcurrentModification(ConcurrentModification { entities, results })
}
