use std::{
    collections::HashSet,
    path::PathBuf,
    thread,
};

/// What to do when a table to be restored already exists on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PurgeMode {
    /// Fail the table if it already exists.
    Fail,
    /// `DROP TABLE IF EXISTS` before creating.
    Drop,
    /// `TRUNCATE` the existing table and keep its schema; falls through to
    /// CREATE when the table does not exist.
    #[default]
    Truncate,
    /// Leave the table alone and replay the CREATE as-is.
    None,
    /// Skip the table entirely (schema and data) if it already exists.
    Skip,
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Dump directory to restore from.
    pub directory: PathBuf,
    /// Data worker connections.
    pub threads: usize,
    /// Schema worker connections; 0 means `min(num_cores, 8)`.
    pub max_threads_for_schema_creation: usize,
    /// Index worker connections; 0 means `min(num_cores, 8)`.
    pub max_threads_for_index_creation: usize,
    /// Concurrent data workers allowed on a single table.
    pub max_threads_per_table: usize,
    /// Skip the data phase (schema only).
    pub no_data: bool,
    /// Skip DDL execution; descriptors are still marked created so the data
    /// phase dispatches.
    pub no_schemas: bool,
    pub overwrite_tables: bool,
    pub purge_mode: PurgeMode,
    /// Vendor error codes to treat as success.
    pub ignore_errors: HashSet<u16>,
    /// Decoder side-process cap; 0 means `min(threads, 32)`.
    pub max_decompressors: usize,
    /// Split secondary keys out of CREATE TABLE and build them after data.
    pub optimize_keys: bool,
    /// Restore a dump of `source_db` into `target_db`.
    pub source_db: Option<String>,
    pub target_db: Option<String>,
}

impl RestoreOptions {
    pub fn new(directory: PathBuf) -> Self {
        let threads = num_cores();
        Self {
            directory,
            threads,
            max_threads_for_schema_creation: 0,
            max_threads_for_index_creation: 0,
            max_threads_per_table: threads,
            no_data: false,
            no_schemas: false,
            overwrite_tables: true,
            purge_mode: PurgeMode::Truncate,
            ignore_errors: HashSet::new(),
            max_decompressors: 0,
            optimize_keys: false,
            source_db: None,
            target_db: None,
        }
    }

    pub fn schema_threads(&self) -> usize {
        resolve_pool_size(self.max_threads_for_schema_creation)
    }

    pub fn index_threads(&self) -> usize {
        resolve_pool_size(self.max_threads_for_index_creation)
    }

    pub fn decompressors(&self) -> usize {
        if self.max_decompressors > 0 {
            self.max_decompressors
        } else {
            self.threads.clamp(1, 32)
        }
    }

    /// Map a database name from the dump to its name on the target server.
    pub fn target_database<'a>(&'a self, source: &'a str) -> &'a str {
        match (&self.source_db, &self.target_db) {
            (Some(from), Some(to)) if from == source => to,
            _ => source,
        }
    }

    pub fn ignores(&self, code: Option<u16>) -> bool {
        code.is_some_and(|c| self.ignore_errors.contains(&c))
    }
}

fn resolve_pool_size(configured: usize) -> usize {
    if configured > 0 {
        configured
    } else {
        num_cores().min(8)
    }
}

fn num_cores() -> usize {
    thread::available_parallelism().map_or(4, |n| n.get())
}
