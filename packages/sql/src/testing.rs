//! Scripted connection source that records every call it receives.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::{Mutex, MutexGuard};

use crate::{BatchRowResult, Connection, ConnectionSource, DatabaseError, Row, SqlParam};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Checkout,
    Begin,
    Commit,
    Rollback,
    Execute(String),
    Batch(String, usize),
    Query(String),
    Script(String),
    Release,
}

#[derive(Debug, Default)]
struct State {
    events: Vec<Event>,
    params: Vec<Vec<SqlParam>>,
    executes: VecDeque<Result<u64, DatabaseError>>,
    batches: VecDeque<Result<Vec<BatchRowResult>, DatabaseError>>,
    rows: Vec<Row>,
    visited: usize,
}

#[derive(Debug, Default)]
pub struct ScriptedSource {
    state: Mutex<State>,
}

impl ScriptedSource {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Queues the outcome of the next `execute`. Unscripted calls affect one row.
    pub fn push_execute(&self, result: Result<u64, DatabaseError>) {
        self.state().executes.push_back(result);
    }

    /// Queues the outcome of the next `execute_batch`. Unscripted calls
    /// affect one row per parameter row.
    pub fn push_batch(&self, result: Result<Vec<BatchRowResult>, DatabaseError>) {
        self.state().batches.push_back(result);
    }

    pub fn set_rows(&self, rows: Vec<Row>) {
        self.state().rows = rows;
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    /// Parameters of every statement, batch row and query, in call order.
    pub fn params(&self) -> Vec<Vec<SqlParam>> {
        self.state().params.clone()
    }

    /// Rows handed to query visitors so far.
    pub fn visited(&self) -> usize {
        self.state().visited
    }
}

impl ConnectionSource for ScriptedSource {
    fn connection(&self) -> Result<Box<dyn Connection + '_>, DatabaseError> {
        self.state().events.push(Event::Checkout);
        Ok(Box::new(ScriptedConnection {
            source: self,
            in_transaction: false,
        }))
    }
}

struct ScriptedConnection<'a> {
    source: &'a ScriptedSource,
    in_transaction: bool,
}

impl ScriptedConnection<'_> {
    fn record(&self, event: Event) {
        self.source.state().events.push(event);
    }
}

impl Connection for ScriptedConnection<'_> {
    fn begin(&mut self) -> Result<(), DatabaseError> {
        if self.in_transaction {
            return Err(DatabaseError::AlreadyInTransaction);
        }
        self.in_transaction = true;
        self.record(Event::Begin);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DatabaseError> {
        if !self.in_transaction {
            return Err(DatabaseError::NoTransaction);
        }
        self.in_transaction = false;
        self.record(Event::Commit);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DatabaseError> {
        if !self.in_transaction {
            return Err(DatabaseError::NoTransaction);
        }
        self.in_transaction = false;
        self.record(Event::Rollback);
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, DatabaseError> {
        let mut state = self.source.state();
        state.events.push(Event::Execute(sql.to_string()));
        state.params.push(params.to_vec());
        state.executes.pop_front().unwrap_or(Ok(1))
    }

    fn execute_batch(
        &mut self,
        sql: &str,
        rows: &[Vec<SqlParam>],
    ) -> Result<Vec<BatchRowResult>, DatabaseError> {
        let mut state = self.source.state();
        state.events.push(Event::Batch(sql.to_string(), rows.len()));
        state.params.extend(rows.iter().cloned());
        state
            .batches
            .pop_front()
            .unwrap_or_else(|| Ok(vec![BatchRowResult::Affected(1); rows.len()]))
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        visit: &mut dyn FnMut(&Row) -> ControlFlow<()>,
    ) -> Result<(), DatabaseError> {
        let rows = {
            let mut state = self.source.state();
            state.events.push(Event::Query(sql.to_string()));
            state.params.push(params.to_vec());
            state.rows.clone()
        };
        for row in &rows {
            self.source.state().visited += 1;
            if visit(row).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn execute_script(&mut self, script: &str) -> Result<(), DatabaseError> {
        self.record(Event::Script(script.to_string()));
        Ok(())
    }
}

impl Drop for ScriptedConnection<'_> {
    fn drop(&mut self) {
        self.record(Event::Release);
    }
}
