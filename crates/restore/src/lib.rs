//! Concurrent restore of a multi-file logical dump into a MySQL-compatible
//! server.
//!
//! The core is the scheduler: per-table lifecycle state machines, a ready
//! queue giving O(1) dispatch in steady state, a single dispatcher task
//! pairing ready tables with idle data workers, a schema pipeline that
//! buffers table DDL until its database exists, and a bounded pool of
//! decoder side-processes for compressed dump files. No data statement is
//! ever dispatched for a table whose schema is not committed and visible.

pub mod client;
pub mod config;
pub mod context;
pub mod control;
pub mod coordinator;
pub mod data_worker;
pub mod decompress;
pub mod dispatcher;
pub mod errors;
pub mod index_worker;
pub mod jobs;
pub mod metrics;
pub mod ready_queue;
pub mod registry;
pub mod scanner;
pub mod schema;
pub mod sql;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::MySqlConnectionFactory;
pub use config::{
    PurgeMode,
    RestoreOptions,
};
pub use coordinator::{
    run_restore,
    RestoreSummary,
};
