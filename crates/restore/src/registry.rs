//! Descriptors for the databases and tables being restored, and the registry
//! that owns them.
//!
//! All mutable descriptor state sits behind the descriptor's own mutex;
//! `schema_state` is only read or written under it. Each descriptor pairs its
//! mutex with an event that is broadcast when the schema reaches `Created`,
//! giving waiters the standard re-check loop.

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        atomic::{
            AtomicI64,
            Ordering::SeqCst,
        },
        Arc,
    },
};

use event_listener::{
    Event,
    EventListener,
};
use parking_lot::{
    Mutex,
    MutexGuard,
};

use crate::jobs::{
    PendingDataJob,
    SchemaJob,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DbSchemaState {
    NotFound,
    NotCreated,
    Creating,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableSchemaState {
    /// Referenced by a data file; no schema file seen yet.
    NotFound,
    /// Terminal: producers finished and no schema file ever appeared. Data
    /// jobs for the table are discarded.
    NotFound2,
    NotCreated,
    Creating,
    Created,
    DataDone,
    IndexEnqueued,
    AllDone,
    /// Terminal: DDL or data loading failed past its retry budget.
    Failed,
}

impl TableSchemaState {
    /// True once the table needs no further data or index work.
    pub fn is_terminal(&self) -> bool {
        *self >= TableSchemaState::DataDone || *self == TableSchemaState::NotFound2
    }
}

pub struct DatabaseState {
    pub schema_state: DbSchemaState,
    /// Table-schema jobs that arrived before this database was created.
    pub pending_schema_jobs: Vec<SchemaJob>,
    /// Whether a CREATE DATABASE job for this database has been submitted.
    pub create_job_seen: bool,
}

impl DatabaseState {
    pub fn advance(&mut self, to: DbSchemaState) {
        debug_assert!(
            to >= self.schema_state,
            "database schema state may not move backwards: {:?} -> {to:?}",
            self.schema_state,
        );
        self.schema_state = to;
    }
}

pub struct DatabaseDescriptor {
    pub target_name: String,
    state: Mutex<DatabaseState>,
    created_event: Event,
}

impl DatabaseDescriptor {
    fn new(target_name: String) -> Self {
        Self {
            target_name,
            state: Mutex::new(DatabaseState {
                schema_state: DbSchemaState::NotFound,
                pending_schema_jobs: Vec::new(),
                create_job_seen: false,
            }),
            created_event: Event::new(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock()
    }

    pub fn schema_state(&self) -> DbSchemaState {
        self.state.lock().schema_state
    }

    pub fn listen_created(&self) -> EventListener {
        self.created_event.listen()
    }

    /// Broadcast: multiple workers may be waiting on the same database.
    pub fn notify_created(&self) {
        self.created_event.notify(usize::MAX);
    }
}

pub struct TableState {
    pub schema_state: TableSchemaState,
    /// FIFO of data jobs not yet handed to a worker. Its length is the
    /// `job_count` of the dispatch predicate.
    pub jobs: VecDeque<PendingDataJob>,
    /// Workers currently loading into this table.
    pub current_threads: u32,
    /// Per-table concurrency cap.
    pub max_threads: u32,
    /// True iff this table has a logical occurrence in the ready queue.
    pub in_ready_queue: bool,
    pub is_view: bool,
    pub is_sequence: bool,
    /// Data for this table is skipped (operator filter or purge-mode skip).
    pub no_data: bool,
    /// Deferred secondary-key statements from `--optimize-keys`.
    pub index_statements: Vec<String>,
    /// Statements from the table's post-data schema file.
    pub post_statements: Vec<String>,
}

impl TableState {
    /// The dispatch predicate. Must be evaluated under the table mutex.
    pub fn is_ready(&self) -> bool {
        self.schema_state == TableSchemaState::Created
            && !self.jobs.is_empty()
            && self.current_threads < self.max_threads
            && !self.is_view
            && !self.is_sequence
            && !self.no_data
    }

    pub fn advance(&mut self, to: TableSchemaState) {
        debug_assert!(
            to >= self.schema_state,
            "table schema state may not move backwards: {:?} -> {to:?}",
            self.schema_state,
        );
        self.schema_state = to;
    }
}

pub struct TableDescriptor {
    pub database: Arc<DatabaseDescriptor>,
    pub source_table_name: String,
    pub target_table_name: String,
    state: Mutex<TableState>,
    schema_event: Event,
    /// Pending plus in-flight data jobs; reaches zero only when every
    /// enqueued job has completed (or been discarded).
    remaining_jobs: AtomicI64,
}

impl TableDescriptor {
    fn new(
        database: Arc<DatabaseDescriptor>,
        source_table_name: String,
        target_table_name: String,
        max_threads: u32,
    ) -> Self {
        Self {
            database,
            source_table_name,
            target_table_name,
            state: Mutex::new(TableState {
                schema_state: TableSchemaState::NotFound,
                jobs: VecDeque::new(),
                current_threads: 0,
                max_threads,
                in_ready_queue: false,
                is_view: false,
                is_sequence: false,
                no_data: false,
                index_statements: Vec::new(),
                post_statements: Vec::new(),
            }),
            schema_event: Event::new(),
            remaining_jobs: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, TableState> {
        self.state.lock()
    }

    pub fn listen_schema(&self) -> EventListener {
        self.schema_event.listen()
    }

    /// Broadcast, not signal: multiple workers may be waiting on this table.
    pub fn notify_schema(&self) {
        self.schema_event.notify(usize::MAX);
    }

    pub fn remaining_jobs(&self) -> i64 {
        self.remaining_jobs.load(SeqCst)
    }

    pub fn add_remaining_job(&self) {
        self.remaining_jobs.fetch_add(1, SeqCst);
    }

    pub fn finish_remaining_job(&self) {
        let previous = self.remaining_jobs.fetch_sub(1, SeqCst);
        debug_assert!(previous > 0, "remaining_jobs underflow");
    }

    pub fn discard_remaining_jobs(&self, count: i64) {
        self.remaining_jobs.fetch_sub(count, SeqCst);
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database.target_name, self.target_table_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TableKey {
    database: String,
    table: String,
}

/// Owner of all descriptors: lookup-or-create keyed by target names, plus the
/// insertion-ordered table list the dispatcher's slow path scans.
pub struct Registry {
    databases: Mutex<HashMap<String, Arc<DatabaseDescriptor>>>,
    tables: Mutex<HashMap<TableKey, Arc<TableDescriptor>>>,
    table_list: Mutex<Vec<Arc<TableDescriptor>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
            table_list: Mutex::new(Vec::new()),
        }
    }

    pub fn database(&self, target_name: &str) -> Arc<DatabaseDescriptor> {
        self.databases
            .lock()
            .entry(target_name.to_owned())
            .or_insert_with(|| Arc::new(DatabaseDescriptor::new(target_name.to_owned())))
            .clone()
    }

    pub fn table(
        &self,
        database: &Arc<DatabaseDescriptor>,
        source_table_name: &str,
        target_table_name: &str,
        max_threads: u32,
    ) -> Arc<TableDescriptor> {
        let key = TableKey {
            database: database.target_name.clone(),
            table: target_table_name.to_owned(),
        };
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.get(&key) {
            return existing.clone();
        }
        let table = Arc::new(TableDescriptor::new(
            database.clone(),
            source_table_name.to_owned(),
            target_table_name.to_owned(),
            max_threads,
        ));
        tables.insert(key, table.clone());
        self.table_list.lock().push(table.clone());
        table
    }

    pub fn lookup_table(&self, database: &str, table: &str) -> Option<Arc<TableDescriptor>> {
        self.tables
            .lock()
            .get(&TableKey {
                database: database.to_owned(),
                table: table.to_owned(),
            })
            .cloned()
    }

    /// Insertion-order snapshot for the dispatcher's slow-path scan.
    pub fn snapshot_table_list(&self) -> Vec<Arc<TableDescriptor>> {
        self.table_list.lock().clone()
    }

    pub fn databases(&self) -> Vec<Arc<DatabaseDescriptor>> {
        self.databases.lock().values().cloned().collect()
    }

    pub fn table_count(&self) -> usize {
        self.table_list.lock().len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
