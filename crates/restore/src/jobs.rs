//! Job types drawn from the dump and the messages carried by the worker
//! channels. Channel shutdown is an explicit sentinel variant; a real job is
//! never stood in for by a placeholder.

use std::{
    path::PathBuf,
    sync::Arc,
};

use crate::registry::{
    DatabaseDescriptor,
    TableDescriptor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Strips a recognized compression suffix off a dump file name.
    pub fn split_suffix(name: &str) -> (Compression, &str) {
        if let Some(stem) = name.strip_suffix(".gz") {
            (Compression::Gzip, stem)
        } else if let Some(stem) = name.strip_suffix(".zst") {
            (Compression::Zstd, stem)
        } else {
            (Compression::None, name)
        }
    }

    /// Decoder argv for compressed kinds.
    pub fn decoder(&self) -> Option<Vec<String>> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some(vec!["gzip".to_owned(), "-dc".to_owned()]),
            Compression::Zstd => Some(vec!["zstd".to_owned(), "-qdc".to_owned()]),
        }
    }
}

/// A data job as it sits on its table's job list. The table back-reference is
/// attached at dispatch time, so descriptors never own `Arc` cycles through
/// their own job lists.
#[derive(Debug, Clone)]
pub struct PendingDataJob {
    pub path: PathBuf,
    pub offset: u64,
    pub compression: Compression,
}

/// A data job in flight to a data worker.
pub struct DataJob {
    pub table: Arc<TableDescriptor>,
    pub path: PathBuf,
    pub offset: u64,
    pub compression: Compression,
}

impl DataJob {
    pub fn dispatch(table: Arc<TableDescriptor>, pending: PendingDataJob) -> Self {
        Self {
            table,
            path: pending.path,
            offset: pending.offset,
            compression: pending.compression,
        }
    }
}

/// DDL work for the schema pipeline. `attempts` counts executions of this
/// same job; on failure the job itself is re-enqueued with the counter
/// bumped.
pub enum SchemaJob {
    CreateDatabase {
        database: Arc<DatabaseDescriptor>,
        path: PathBuf,
        compression: Compression,
        attempts: u32,
    },
    CreateTable {
        table: Arc<TableDescriptor>,
        path: PathBuf,
        compression: Compression,
        attempts: u32,
    },
}

impl SchemaJob {
    pub fn database(&self) -> &Arc<DatabaseDescriptor> {
        match self {
            SchemaJob::CreateDatabase { database, .. } => database,
            SchemaJob::CreateTable { table, .. } => &table.database,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            SchemaJob::CreateDatabase { attempts, .. } => *attempts,
            SchemaJob::CreateTable { attempts, .. } => *attempts,
        }
    }

    pub fn bump_attempts(&mut self) {
        match self {
            SchemaJob::CreateDatabase { attempts, .. } => *attempts += 1,
            SchemaJob::CreateTable { attempts, .. } => *attempts += 1,
        }
    }
}

/// Index creation and post-data statements for one table, run after its data
/// jobs complete.
pub struct IndexJob {
    pub table: Arc<TableDescriptor>,
    pub statements: Vec<String>,
}

pub enum SchemaMessage {
    Job(SchemaJob),
    Shutdown,
}

pub enum DataMessage {
    Job(DataJob),
    Shutdown,
}

pub enum IndexMessage {
    Job(IndexJob),
    Shutdown,
}
