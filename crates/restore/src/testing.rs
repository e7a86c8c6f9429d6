//! Test doubles for the client seam: an in-memory connection factory that
//! records every statement in execution order and can be scripted to fail.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    client::{
        ConnectionFactory,
        DbConnection,
    },
    errors::ClientError,
};

#[derive(Debug, Clone)]
pub struct StatementRecord {
    pub conn_id: usize,
    pub sql: String,
}

struct ScriptedFailure {
    needle: String,
    remaining: u32,
    error: ClientError,
}

#[derive(Default)]
struct FakeState {
    next_conn_id: usize,
    log: Vec<StatementRecord>,
    resets: usize,
    scripted_failures: Vec<ScriptedFailure>,
}

/// Shared-state fake: every connection it hands out appends to one ordered
/// statement log, which is what the scheduling tests assert on.
#[derive(Clone, Default)]
pub struct FakeFactory {
    state: Arc<Mutex<FakeState>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements containing `needle` fail with `error` for the next
    /// `times` matching executions.
    pub fn fail_matching(&self, needle: &str, times: u32, error: ClientError) {
        self.state.lock().scripted_failures.push(ScriptedFailure {
            needle: needle.to_owned(),
            remaining: times,
            error,
        });
    }

    pub fn records(&self) -> Vec<StatementRecord> {
        self.state.lock().log.clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().log.iter().map(|r| r.sql.clone()).collect()
    }

    /// Index of the first recorded statement containing `needle`.
    pub fn first_index(&self, needle: &str) -> Option<usize> {
        self.state
            .lock()
            .log
            .iter()
            .position(|r| r.sql.contains(needle))
    }

    /// Index of the last recorded statement containing `needle`.
    pub fn last_index(&self, needle: &str) -> Option<usize> {
        self.state
            .lock()
            .log
            .iter()
            .rposition(|r| r.sql.contains(needle))
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.sql.contains(needle))
            .count()
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, ClientError> {
        let conn_id = {
            let mut state = self.state.lock();
            state.next_conn_id += 1;
            state.next_conn_id
        };
        Ok(Box::new(FakeConnection {
            conn_id,
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    conn_id: usize,
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl DbConnection for FakeConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64, ClientError> {
        let mut state = self.state.lock();
        for failure in &mut state.scripted_failures {
            if failure.remaining > 0 && sql.contains(&failure.needle) {
                failure.remaining -= 1;
                return Err(failure.error.clone());
            }
        }
        state.log.push(StatementRecord {
            conn_id: self.conn_id,
            sql: sql.to_owned(),
        });
        Ok(fake_affected_rows(sql))
    }

    async fn reset(&mut self) -> Result<(), ClientError> {
        self.state.lock().resets += 1;
        Ok(())
    }
}

/// Rows "affected" by a statement: the number of tuples in an INSERT's
/// VALUES list, zero otherwise.
fn fake_affected_rows(sql: &str) -> u64 {
    if !sql.trim_start().to_ascii_uppercase().starts_with("INSERT") {
        return 0;
    }
    sql.matches("),(").count() as u64 + 1
}
