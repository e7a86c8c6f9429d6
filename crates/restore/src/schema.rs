//! The schema pipeline: ordering DDL so a table CREATE never reaches the
//! server before its database exists, even with concurrent producers.
//!
//! Table-schema jobs route through their database descriptor under its
//! mutex: straight to the schema-job queue once the database is `Created`,
//! buffered on the descriptor otherwise. The `Created` transition and the
//! drain of the buffer happen atomically under the same mutex, so a job is
//! pushed to the queue exactly once.

use std::sync::{
    atomic::{
        AtomicBool,
        AtomicI64,
        Ordering::SeqCst,
    },
    Arc,
};

use common::{
    fifo_queue::{
        fifo_queue,
        QueueReceiver,
        QueueSender,
    },
    knobs::SCHEMA_JOB_MAX_RETRIES,
};
use event_listener::Event;
use tokio::io::AsyncReadExt;

use crate::{
    client::{
        ensure_session,
        WorkerSession,
    },
    config::PurgeMode,
    context::RestoreContext,
    errors::{
        ClientError,
        ErrorKind,
        ER_TABLE_EXISTS_ERROR,
    },
    jobs::{
        Compression,
        SchemaJob,
        SchemaMessage,
    },
    metrics::Stats,
    registry::{
        DatabaseDescriptor,
        DbSchemaState,
        Registry,
        TableDescriptor,
        TableSchemaState,
    },
    sql::{
        split_indexes,
        StatementSplitter,
    },
};

pub struct SchemaPipeline {
    tx: QueueSender<SchemaMessage>,
    rx: QueueReceiver<SchemaMessage>,
    /// Jobs submitted (buffered or queued) and not yet terminally disposed.
    outstanding: AtomicI64,
    phase_ended: AtomicBool,
    idle_event: Event,
}

impl SchemaPipeline {
    pub fn new() -> Self {
        let (tx, rx) = fifo_queue();
        Self {
            tx,
            rx,
            outstanding: AtomicI64::new(0),
            phase_ended: AtomicBool::new(false),
            idle_event: Event::new(),
        }
    }

    pub fn receiver(&self) -> QueueReceiver<SchemaMessage> {
        self.rx.clone()
    }

    /// Submit a schema job from a producer. Database creates go straight to
    /// the queue; table creates are buffered until their database exists.
    pub fn submit(&self, job: SchemaJob) {
        self.outstanding.fetch_add(1, SeqCst);
        match job {
            SchemaJob::CreateDatabase { .. } => {
                {
                    let mut db_state = job.database().state();
                    if db_state.schema_state == DbSchemaState::NotFound {
                        db_state.advance(DbSchemaState::NotCreated);
                    }
                    db_state.create_job_seen = true;
                }
                self.tx.send(SchemaMessage::Job(job));
            },
            SchemaJob::CreateTable { ref table, .. } => {
                {
                    let mut table_state = table.state();
                    if table_state.schema_state == TableSchemaState::NotFound {
                        table_state.advance(TableSchemaState::NotCreated);
                    }
                }
                // Never hold the table mutex while taking the database's.
                let database = job.database().clone();
                let mut db_state = database.state();
                if db_state.schema_state == DbSchemaState::Created {
                    drop(db_state);
                    self.tx.send(SchemaMessage::Job(job));
                } else {
                    db_state.pending_schema_jobs.push(job);
                }
            },
        }
    }

    /// Transition the database to `Created` and flush its buffered table
    /// jobs into the schema queue, atomically under the database mutex.
    pub fn mark_created_and_drain(&self, database: &Arc<DatabaseDescriptor>) {
        let mut db_state = database.state();
        if db_state.schema_state != DbSchemaState::Created {
            db_state.advance(DbSchemaState::Created);
        }
        let drained = std::mem::take(&mut db_state.pending_schema_jobs);
        for job in drained {
            self.tx.send(SchemaMessage::Job(job));
        }
        drop(db_state);
        database.notify_created();
    }

    /// Producers are done submitting schema jobs. Databases that will never
    /// see a CREATE DATABASE job are marked created here so their buffered
    /// table jobs are not stranded; databases with a create job in flight
    /// drain when that job executes.
    pub fn end_phase(&self, registry: &Registry) {
        self.phase_ended.store(true, SeqCst);
        for database in registry.databases() {
            let needs_drain = {
                let db_state = database.state();
                db_state.schema_state != DbSchemaState::Created && !db_state.create_job_seen
            };
            if needs_drain {
                self.mark_created_and_drain(&database);
            }
        }
        self.maybe_notify_idle();
    }

    /// A job reached a terminal disposition (success or failure-for-good).
    pub fn complete_job(&self) {
        let remaining = self.outstanding.fetch_sub(1, SeqCst) - 1;
        debug_assert!(remaining >= 0, "schema job accounting underflow");
        if remaining == 0 {
            self.maybe_notify_idle();
        }
    }

    /// Push the failed job itself back for another attempt.
    pub fn retry(&self, job: SchemaJob) {
        self.tx.send(SchemaMessage::Job(job));
    }

    fn is_idle(&self) -> bool {
        self.phase_ended.load(SeqCst) && self.outstanding.load(SeqCst) == 0
    }

    fn maybe_notify_idle(&self) {
        if self.is_idle() {
            self.idle_event.notify(usize::MAX);
        }
    }

    /// Resolves once the phase has ended and every submitted job has been
    /// terminally disposed, retries included.
    pub async fn wait_idle(&self) {
        loop {
            let listener = self.idle_event.listen();
            if self.is_idle() {
                return;
            }
            listener.await;
        }
    }

    pub fn send_shutdown(&self, workers: usize) {
        for _ in 0..workers {
            self.tx.send(SchemaMessage::Shutdown);
        }
    }
}

impl Default for SchemaPipeline {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn run_schema_worker(worker_id: usize, ctx: Arc<RestoreContext>) {
    let rx = ctx.schema.receiver();
    let mut session = None;
    tracing::debug!(worker_id, "schema worker started");
    loop {
        match rx.recv().await {
            None | Some(SchemaMessage::Shutdown) => break,
            Some(SchemaMessage::Job(job)) => {
                process_schema_job(&ctx, &mut session, job).await;
            },
        }
    }
    tracing::debug!(worker_id, "schema worker finished");
}

async fn process_schema_job(
    ctx: &Arc<RestoreContext>,
    session: &mut Option<WorkerSession>,
    mut job: SchemaJob,
) {
    match execute_schema_job(ctx, session, &job).await {
        Ok(()) => ctx.schema.complete_job(),
        Err(e) => {
            let transient = e
                .downcast_ref::<ClientError>()
                .is_some_and(|c| c.kind == ErrorKind::TransientConnection);
            if transient {
                // The session is suspect; rebuild it before the retry.
                let reconnected = match session.as_mut() {
                    Some(s) => s.reconnect(ctx.factory.as_ref()).await.is_ok(),
                    None => false,
                };
                if reconnected {
                    Stats::bump(&ctx.stats.reconnects);
                } else {
                    *session = None;
                }
            }
            if job.attempts() + 1 < *SCHEMA_JOB_MAX_RETRIES {
                job.bump_attempts();
                Stats::bump(&ctx.stats.schema_retries);
                tracing::warn!(
                    attempts = job.attempts(),
                    "schema job failed, re-enqueueing: {e:#}",
                );
                ctx.schema.retry(job);
            } else {
                fail_schema_job(ctx, &job, e);
                ctx.schema.complete_job();
            }
        },
    }
}

/// Retry budget exhausted: mark the target terminally failed and keep going
/// with the rest of the restore.
fn fail_schema_job(ctx: &Arc<RestoreContext>, job: &SchemaJob, error: anyhow::Error) {
    Stats::bump(&ctx.stats.fatal_errors);
    match job {
        SchemaJob::CreateDatabase { database, .. } => {
            tracing::error!(
                database = %database.target_name,
                "giving up on database creation: {error:#}",
            );
            ctx.shutdown.signal(error.context(format!(
                "creating database {}",
                database.target_name
            )));
            // Unblock buffered table jobs; they will fail fast with their
            // own errors instead of stranding the pipeline.
            ctx.schema.mark_created_and_drain(database);
        },
        SchemaJob::CreateTable { table, .. } => {
            tracing::error!(
                table = %table.qualified_name(),
                "giving up on table creation: {error:#}",
            );
            ctx.shutdown
                .signal(error.context(format!("creating table {}", table.qualified_name())));
            Stats::bump(&ctx.stats.tables_failed);
            let mut table_state = table.state();
            table_state.advance(TableSchemaState::Failed);
            table.notify_schema();
        },
    }
}

async fn execute_schema_job(
    ctx: &Arc<RestoreContext>,
    session: &mut Option<WorkerSession>,
    job: &SchemaJob,
) -> anyhow::Result<()> {
    match job {
        SchemaJob::CreateDatabase {
            database,
            path,
            compression,
            ..
        } => {
            {
                let mut db_state = database.state();
                if db_state.schema_state < DbSchemaState::Creating {
                    db_state.advance(DbSchemaState::Creating);
                }
            }
            if !ctx.options.no_schemas {
                let session = ensure_session(session, ctx.factory.as_ref()).await?;
                for statement in database_create_statements(ctx, database, path, *compression).await?
                {
                    ctx.execute_statement(session, &statement).await?;
                }
            }
            ctx.schema.mark_created_and_drain(database);
            Stats::bump(&ctx.stats.databases_created);
            Ok(())
        },
        SchemaJob::CreateTable {
            table,
            path,
            compression,
            ..
        } => {
            {
                let mut table_state = table.state();
                if table_state.schema_state < TableSchemaState::Creating {
                    table_state.advance(TableSchemaState::Creating);
                }
            }
            if ctx.options.no_schemas {
                mark_table_created(ctx, table);
                return Ok(());
            }
            let statements = read_statements(ctx, path, *compression).await?;
            let session = ensure_session(session, ctx.factory.as_ref()).await?;
            session.use_database(&table.database.target_name).await?;

            let (is_view, is_sequence) = {
                let table_state = table.state();
                (table_state.is_view, table_state.is_sequence)
            };
            if !is_view && !is_sequence && ctx.options.overwrite_tables {
                match apply_purge(ctx, session, table).await? {
                    PurgeOutcome::SchemaInPlace => {
                        mark_table_created(ctx, table);
                        return Ok(());
                    },
                    PurgeOutcome::Proceed => {},
                }
            }

            // A retried job must not leave stale deferred keys behind.
            table.state().index_statements.clear();
            for statement in &statements {
                if ctx.options.optimize_keys
                    && statement.trim_start().starts_with("CREATE TABLE")
                {
                    let qualified = format!(
                        "`{}`.`{}`",
                        table.database.target_name, table.target_table_name
                    );
                    if let Some((create, alter)) = split_indexes(statement, &qualified) {
                        ctx.execute_statement(session, &create).await?;
                        table.state().index_statements.push(alter);
                        continue;
                    }
                }
                match ctx.execute_statement(session, statement).await {
                    Ok(_) => {},
                    Err(e)
                        if ctx.options.purge_mode == PurgeMode::Skip
                            && e.code == Some(ER_TABLE_EXISTS_ERROR) =>
                    {
                        skip_existing_table(ctx, table);
                        return Ok(());
                    },
                    Err(e) => return Err(e.into()),
                }
            }
            mark_table_created(ctx, table);
            Ok(())
        },
    }
}

enum PurgeOutcome {
    /// The existing schema was kept (and purged of data); skip the CREATE.
    SchemaInPlace,
    Proceed,
}

async fn apply_purge(
    ctx: &Arc<RestoreContext>,
    session: &mut WorkerSession,
    table: &Arc<TableDescriptor>,
) -> anyhow::Result<PurgeOutcome> {
    match ctx.options.purge_mode {
        PurgeMode::Truncate => {
            let truncate = format!("TRUNCATE TABLE `{}`", table.target_table_name);
            match ctx.execute_statement(session, &truncate).await {
                Ok(_) => Ok(PurgeOutcome::SchemaInPlace),
                // Nothing to truncate: proceed to CREATE.
                Err(e) if e.is_object_missing() => Ok(PurgeOutcome::Proceed),
                Err(e) => Err(e.into()),
            }
        },
        PurgeMode::Drop => {
            let drop_table = format!("DROP TABLE IF EXISTS `{}`", table.target_table_name);
            ctx.execute_statement(session, &drop_table).await?;
            Ok(PurgeOutcome::Proceed)
        },
        PurgeMode::Fail | PurgeMode::None | PurgeMode::Skip => Ok(PurgeOutcome::Proceed),
    }
}

/// `purge_mode = skip` and the table pre-exists: drop its schema and data
/// work entirely.
fn skip_existing_table(ctx: &Arc<RestoreContext>, table: &Arc<TableDescriptor>) {
    tracing::info!(
        table = %table.qualified_name(),
        "table already exists, skipping per purge mode",
    );
    let mut table_state = table.state();
    table_state.no_data = true;
    let discarded = table_state.jobs.len();
    table_state.jobs.clear();
    table.discard_remaining_jobs(discarded as i64);
    table_state.advance(TableSchemaState::Created);
    table_state.advance(TableSchemaState::AllDone);
    Stats::bump(&ctx.stats.tables_all_done);
    table.notify_schema();
}

/// The `Created` transition: broadcast waiters and enqueue into the ready
/// queue before the table mutex is released. Views and sequences carry no
/// data or index work and short-circuit to `AllDone`.
pub fn mark_table_created(ctx: &Arc<RestoreContext>, table: &Arc<TableDescriptor>) {
    let mut table_state = table.state();
    table_state.advance(TableSchemaState::Created);
    if table_state.is_view || table_state.is_sequence {
        table_state.advance(TableSchemaState::AllDone);
        Stats::bump(&ctx.stats.tables_all_done);
    } else {
        ctx.ready_queue
            .try_enqueue(table, &mut table_state, &ctx.control);
    }
    table.notify_schema();
    drop(table_state);
    Stats::bump(&ctx.stats.tables_created);
}

async fn database_create_statements(
    ctx: &Arc<RestoreContext>,
    database: &Arc<DatabaseDescriptor>,
    path: &std::path::Path,
    compression: Compression,
) -> anyhow::Result<Vec<String>> {
    let renamed = ctx.options.source_db.is_some()
        && ctx.options.target_db.as_deref() == Some(database.target_name.as_str())
        && ctx.options.source_db != ctx.options.target_db;
    if renamed {
        // The dump file creates the source-named database; synthesize the
        // target-named CREATE instead.
        return Ok(vec![format!(
            "CREATE DATABASE IF NOT EXISTS `{}`",
            database.target_name
        )]);
    }
    read_statements(ctx, path, compression).await
}

/// Read a (small) schema file, through the decompression pool if needed, and
/// split it into statements.
pub async fn read_statements(
    ctx: &Arc<RestoreContext>,
    path: &std::path::Path,
    compression: Compression,
) -> anyhow::Result<Vec<String>> {
    let mut stream = ctx.decompress.open(path, compression).await?;
    let mut contents = Vec::new();
    stream.reader().read_to_end(&mut contents).await?;
    stream.finish().await?;
    let mut splitter = StatementSplitter::new();
    let mut statements = Vec::new();
    splitter.feed(&contents, &mut statements);
    statements.extend(splitter.finish());
    Ok(statements)
}
