//! Data workers: replay INSERT batch files into their target tables.
//!
//! Each worker owns one session for its lifetime. The dispatcher only hands
//! out jobs for `Created` tables, but the schema barrier at the top of every
//! job also covers jobs arriving through retry paths. Visibility
//! failures (`ObjectMissing`) retry with capped backoff, resetting the
//! session on every third attempt to drop any stale metadata view.

use std::sync::Arc;

use common::{
    backoff::RetryDelay,
    knobs::{
        OBJECT_MISSING_MAX_RETRIES,
        RECONNECT_EVERY_N_RETRIES,
        RETRY_INITIAL_BACKOFF,
        RETRY_MAX_BACKOFF,
        TRANSIENT_MAX_RECONNECTS,
    },
};
use rand::{
    rngs::StdRng,
    SeedableRng,
};
use tokio::io::{
    AsyncReadExt,
    AsyncSeekExt,
};

use crate::{
    client::{
        ensure_session,
        WorkerSession,
    },
    context::RestoreContext,
    control::ControlEvent,
    jobs::{
        DataJob,
        DataMessage,
    },
    metrics::Stats,
    registry::TableSchemaState,
    sql::StatementSplitter,
};

const READ_CHUNK: usize = 64 * 1024;

pub async fn run_data_worker(worker_id: usize, ctx: Arc<RestoreContext>) {
    let rx = ctx.data_rx.clone();
    let mut session: Option<WorkerSession> = None;
    let mut rng = StdRng::from_entropy();
    tracing::debug!(worker_id, "data worker started");
    // Prime the dispatcher: this worker is ready for a job.
    ctx.control.send(ControlEvent::RequestJob);
    loop {
        match rx.recv().await {
            None | Some(DataMessage::Shutdown) => break,
            Some(DataMessage::Job(job)) => {
                process_data_job(&ctx, &mut session, &mut rng, job).await;
                ctx.control.send(ControlEvent::RequestJob);
            },
        }
    }
    tracing::debug!(worker_id, "data worker finished");
}

async fn process_data_job(
    ctx: &Arc<RestoreContext>,
    session: &mut Option<WorkerSession>,
    rng: &mut StdRng,
    job: DataJob,
) {
    wait_for_schema(&job).await;

    let skip = {
        let table_state = job.table.state();
        table_state.no_data
            || matches!(
                table_state.schema_state,
                TableSchemaState::Failed | TableSchemaState::NotFound2
            )
    };
    if !skip {
        match replay_data_file(ctx, session, rng, &job).await {
            Ok(rows) => {
                Stats::bump(&ctx.stats.data_jobs_completed);
                ctx.stats
                    .rows_affected
                    .fetch_add(rows, std::sync::atomic::Ordering::Relaxed);
                tracing::debug!(
                    table = %job.table.qualified_name(),
                    file = %job.path.display(),
                    rows,
                    "data job finished",
                );
            },
            Err(e) => {
                // Failed jobs are reported through counters and logs, never
                // as panics, and count as completed so the drain cannot
                // hang on them.
                Stats::bump(&ctx.stats.data_jobs_failed);
                Stats::bump(&ctx.stats.fatal_errors);
                ctx.shutdown.signal(e.context(format!(
                    "loading {} into {}",
                    job.path.display(),
                    job.table.qualified_name()
                )));
            },
        }
    }

    {
        let mut table_state = job.table.state();
        table_state.current_threads -= 1;
        job.table.finish_remaining_job();
        ctx.ready_queue
            .try_enqueue(&job.table, &mut table_state, &ctx.control);
    }
}

/// Block until the table's schema is at least `Created` (or terminally
/// failed). The dispatcher's readiness check makes this a no-op on the
/// normal path.
async fn wait_for_schema(job: &DataJob) {
    loop {
        let listener = {
            let table_state = job.table.state();
            match table_state.schema_state {
                state if state >= TableSchemaState::Created => return,
                TableSchemaState::NotFound2 => return,
                _ => job.table.listen_schema(),
            }
        };
        listener.await;
    }
}

async fn replay_data_file(
    ctx: &Arc<RestoreContext>,
    session: &mut Option<WorkerSession>,
    rng: &mut StdRng,
    job: &DataJob,
) -> anyhow::Result<u64> {
    let mut stream = ctx.decompress.open(&job.path, job.compression).await?;
    if job.offset > 0 {
        anyhow::ensure!(
            !stream.is_decoded(),
            "offsets into compressed files are not supported",
        );
        stream
            .reader()
            .seek(std::io::SeekFrom::Start(job.offset))
            .await?;
    }

    let mut retry = RetryState::new();
    let mut splitter = StatementSplitter::new();
    let mut statements = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut rows = 0u64;
    loop {
        let read = stream.reader().read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        splitter.feed(&chunk[..read], &mut statements);
        for statement in statements.drain(..) {
            rows += execute_with_retry(ctx, session, rng, job, &mut retry, &statement).await?;
        }
    }
    if let Some(last) = splitter.finish() {
        rows += execute_with_retry(ctx, session, rng, job, &mut retry, &last).await?;
    }
    stream.finish().await?;
    Ok(rows)
}

struct RetryState {
    object_missing_attempts: u32,
    reconnect_attempts: u32,
    delay: RetryDelay,
}

impl RetryState {
    fn new() -> Self {
        Self {
            object_missing_attempts: 0,
            reconnect_attempts: 0,
            delay: RetryDelay::new(*RETRY_INITIAL_BACKOFF, *RETRY_MAX_BACKOFF),
        }
    }
}

async fn execute_with_retry(
    ctx: &Arc<RestoreContext>,
    session: &mut Option<WorkerSession>,
    rng: &mut StdRng,
    job: &DataJob,
    retry: &mut RetryState,
    statement: &str,
) -> anyhow::Result<u64> {
    loop {
        let result = async {
            let active = ensure_session(session, ctx.factory.as_ref()).await?;
            active
                .use_database(&job.table.database.target_name)
                .await?;
            ctx.execute_statement(active, statement).await
        }
        .await;
        let error = match result {
            Ok(rows) => return Ok(rows),
            Err(e) => e,
        };

        if error.is_object_missing()
            && retry.object_missing_attempts < *OBJECT_MISSING_MAX_RETRIES
        {
            retry.object_missing_attempts += 1;
            Stats::bump(&ctx.stats.data_retries);
            if retry.object_missing_attempts % *RECONNECT_EVERY_N_RETRIES == 0 {
                reset_session(ctx, session).await;
            }
            let delay = retry.delay.next_delay(rng);
            tracing::warn!(
                table = %job.table.qualified_name(),
                attempt = retry.object_missing_attempts,
                "object not visible on this connection yet, retrying in {delay:?}",
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        if error.is_transient() && retry.reconnect_attempts < *TRANSIENT_MAX_RECONNECTS {
            retry.reconnect_attempts += 1;
            Stats::bump(&ctx.stats.data_retries);
            // Force a fresh session on the next attempt.
            *session = None;
            let delay = retry.delay.next_delay(rng);
            tracing::warn!(
                table = %job.table.qualified_name(),
                attempt = retry.reconnect_attempts,
                "connection failure, reconnecting in {delay:?}",
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        let exhausted = error.is_object_missing() || error.is_transient();
        let error = if exhausted {
            error.retry_exhausted()
        } else {
            error
        };
        return Err(error.into());
    }
}

/// Reset the session in place; a reset that fails falls back to a fresh
/// connect on the next attempt.
async fn reset_session(ctx: &Arc<RestoreContext>, session: &mut Option<WorkerSession>) {
    let reset_ok = match session.as_mut() {
        Some(s) => s.reset().await.is_ok(),
        None => false,
    };
    if reset_ok {
        Stats::bump(&ctx.stats.reconnects);
    } else {
        *session = None;
    }
}
