//! Assembly and lifecycle of one restore run: scan the dump, spawn the
//! worker pools, feed the producers, drain the phases in order, and join
//! everything before reporting.

use std::sync::Arc;

use common::shutdown::ShutdownSignal;
use tokio::task::JoinHandle;

use crate::{
    client::ConnectionFactory,
    config::RestoreOptions,
    context::RestoreContext,
    control::ControlEvent,
    data_worker::run_data_worker,
    dispatcher::{
        enqueue_index_for,
        Dispatcher,
    },
    index_worker::run_index_worker,
    jobs::{
        IndexMessage,
        PendingDataJob,
        SchemaJob,
    },
    metrics::{
        spawn_progress_task,
        Stats,
    },
    registry::{
        TableDescriptor,
        TableSchemaState,
    },
    scanner::{
        scan_dump_dir,
        FileKind,
        FileRecord,
    },
    schema::{
        read_statements,
        run_schema_worker,
    },
};

#[derive(Debug)]
pub struct RestoreSummary {
    pub tables: usize,
    pub tables_created: u64,
    pub tables_all_done: u64,
    pub tables_failed: u64,
    pub data_jobs_completed: u64,
    pub jobs_dispatched: u64,
    pub rows_affected: u64,
    pub ready_queue_hit_rate: f64,
    pub fatal_errors: u64,
    pub first_error: Option<String>,
}

impl RestoreSummary {
    /// Exit-code policy: only fatal errors not covered by the ignore set
    /// fail the run (ignored errors never reach the fatal counter).
    pub fn success(&self) -> bool {
        self.fatal_errors == 0
    }
}

pub async fn run_restore(
    mut options: RestoreOptions,
    factory: Arc<dyn ConnectionFactory>,
) -> anyhow::Result<RestoreSummary> {
    if options.no_data {
        // A schema-only phase must leave complete schemas behind: a later
        // data-only phase never revisits key definitions.
        options.optimize_keys = false;
    }
    let records = scan_dump_dir(&options.directory)?;
    tracing::info!(
        files = records.len(),
        directory = %options.directory.display(),
        "starting restore",
    );

    let (shutdown, mut shutdown_rx) = ShutdownSignal::new();
    let (ctx, control_rx) = RestoreContext::new(options, factory, shutdown);

    let schema_pool: Vec<JoinHandle<()>> = (0..ctx.options.schema_threads())
        .map(|worker_id| tokio::spawn(run_schema_worker(worker_id, ctx.clone())))
        .collect();
    let index_pool: Vec<JoinHandle<()>> = (0..ctx.options.index_threads())
        .map(|worker_id| tokio::spawn(run_index_worker(worker_id, ctx.clone())))
        .collect();
    let data_phase = !ctx.options.no_data;
    let mut data_pool = Vec::new();
    let mut dispatcher = None;
    if data_phase {
        dispatcher = Some(tokio::spawn(Dispatcher::new(ctx.clone(), control_rx).run()));
        for worker_id in 0..ctx.options.threads {
            data_pool.push(tokio::spawn(run_data_worker(worker_id, ctx.clone())));
        }
    }
    let progress = spawn_progress_task(ctx.stats.clone(), ctx.registry.clone());

    produce_jobs(&ctx, records).await;
    ctx.schema.end_phase(&ctx.registry);
    ctx.control.send(ControlEvent::SchemaPhaseEnded);
    ctx.control.send(ControlEvent::FileTypeEnded);

    // Schema drain: every submitted schema job terminally disposed.
    ctx.schema.wait_idle().await;
    ctx.schema.send_shutdown(schema_pool.len());
    for handle in schema_pool {
        handle.await?;
    }

    if data_phase {
        // The dispatcher exits once drained, after sending the data-worker
        // sentinels.
        if let Some(handle) = dispatcher {
            handle.await?;
        }
        for handle in data_pool {
            handle.await?;
        }
    } else {
        finalize_tables_without_data(&ctx);
    }

    // Index shutdown sentinels are sent unconditionally, data phase or not.
    for _ in 0..index_pool.len() {
        ctx.index_tx.send(IndexMessage::Shutdown);
    }
    for handle in index_pool {
        handle.await?;
    }

    progress.abort();

    let summary = RestoreSummary {
        tables: ctx.registry.table_count(),
        tables_created: Stats::get(&ctx.stats.tables_created),
        tables_all_done: Stats::get(&ctx.stats.tables_all_done),
        tables_failed: Stats::get(&ctx.stats.tables_failed),
        data_jobs_completed: Stats::get(&ctx.stats.data_jobs_completed),
        jobs_dispatched: Stats::get(&ctx.stats.jobs_dispatched),
        rows_affected: Stats::get(&ctx.stats.rows_affected),
        ready_queue_hit_rate: ctx.stats.hit_rate(),
        fatal_errors: Stats::get(&ctx.stats.fatal_errors),
        first_error: shutdown_rx.try_recv().ok().map(|e| format!("{e:#}")),
    };
    tracing::info!(
        tables = summary.tables,
        failed = summary.tables_failed,
        rows = summary.rows_affected,
        hit_rate = summary.ready_queue_hit_rate,
        "restore finished",
    );
    Ok(summary)
}

/// The producer: walks the scanned records in order, registering
/// descriptors, submitting schema jobs, and appending data jobs to their
/// tables. Runs concurrently with all worker pools.
async fn produce_jobs(ctx: &Arc<RestoreContext>, records: Vec<FileRecord>) {
    for record in records {
        match record.kind {
            FileKind::Metadata => {},
            FileKind::CreateDatabase => {
                let target = ctx.options.target_database(&record.database).to_owned();
                let database = ctx.registry.database(&target);
                ctx.schema.submit(SchemaJob::CreateDatabase {
                    database,
                    path: record.path,
                    compression: record.compression,
                    attempts: 0,
                });
            },
            FileKind::CreateTable | FileKind::CreateView | FileKind::CreateSequence => {
                let table = register_table(ctx, &record);
                {
                    let mut table_state = table.state();
                    table_state.is_view = record.kind == FileKind::CreateView;
                    table_state.is_sequence = record.kind == FileKind::CreateSequence;
                }
                ctx.schema.submit(SchemaJob::CreateTable {
                    table,
                    path: record.path,
                    compression: record.compression,
                    attempts: 0,
                });
            },
            FileKind::SchemaPost => {
                let table = register_table(ctx, &record);
                match read_statements(ctx, &record.path, record.compression).await {
                    Ok(statements) => {
                        table.state().post_statements.extend(statements);
                    },
                    Err(e) => {
                        Stats::bump(&ctx.stats.fatal_errors);
                        tracing::error!(
                            file = %record.path.display(),
                            "cannot read post-data schema file: {e:#}",
                        );
                    },
                }
            },
            FileKind::Data => {
                if ctx.options.no_data {
                    continue;
                }
                let table = register_table(ctx, &record);
                let mut table_state = table.state();
                table_state.jobs.push_back(PendingDataJob {
                    path: record.path,
                    offset: 0,
                    compression: record.compression,
                });
                table.add_remaining_job();
                ctx.ready_queue
                    .try_enqueue(&table, &mut table_state, &ctx.control);
            },
        }
    }
}

fn register_table(ctx: &Arc<RestoreContext>, record: &FileRecord) -> Arc<TableDescriptor> {
    let target = ctx.options.target_database(&record.database).to_owned();
    let database = ctx.registry.database(&target);
    let table_name = record.table.as_deref().unwrap_or_default();
    ctx.registry.table(
        &database,
        table_name,
        table_name,
        ctx.options.max_threads_per_table as u32,
    )
}

/// Schema-only run: no dispatcher exists to sweep tables through
/// `DataDone`, so finalize them here before the index sentinels go out.
fn finalize_tables_without_data(ctx: &Arc<RestoreContext>) {
    for table in ctx.registry.snapshot_table_list() {
        let mut table_state = table.state();
        if table_state.schema_state == TableSchemaState::Created
            && !table_state.is_view
            && !table_state.is_sequence
        {
            table_state.advance(TableSchemaState::DataDone);
            enqueue_index_for(ctx, &table, &mut table_state);
        }
    }
}
