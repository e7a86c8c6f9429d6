//! Index workers: build the deferred secondary keys and run post-data
//! statements once a table's data jobs are complete, then finalize the
//! table.

use std::sync::Arc;

use crate::{
    client::{
        ensure_session,
        WorkerSession,
    },
    context::RestoreContext,
    jobs::{
        IndexJob,
        IndexMessage,
    },
    metrics::Stats,
    registry::TableSchemaState,
};

pub async fn run_index_worker(worker_id: usize, ctx: Arc<RestoreContext>) {
    let rx = ctx.index_rx.clone();
    let mut session: Option<WorkerSession> = None;
    tracing::debug!(worker_id, "index worker started");
    loop {
        match rx.recv().await {
            None | Some(IndexMessage::Shutdown) => break,
            Some(IndexMessage::Job(job)) => {
                process_index_job(&ctx, &mut session, job).await;
            },
        }
    }
    tracing::debug!(worker_id, "index worker finished");
}

async fn process_index_job(
    ctx: &Arc<RestoreContext>,
    session: &mut Option<WorkerSession>,
    job: IndexJob,
) {
    let mut failed = false;
    for statement in &job.statements {
        let result = async {
            let active = ensure_session(session, ctx.factory.as_ref()).await?;
            active
                .use_database(&job.table.database.target_name)
                .await?;
            ctx.execute_statement(active, statement).await
        }
        .await;
        if let Err(e) = result {
            failed = true;
            Stats::bump(&ctx.stats.fatal_errors);
            ctx.shutdown.signal(anyhow::Error::from(e).context(format!(
                "building indexes for {}",
                job.table.qualified_name()
            )));
        }
    }

    {
        let mut table_state = job.table.state();
        if failed {
            table_state.advance(TableSchemaState::Failed);
            Stats::bump(&ctx.stats.tables_failed);
        } else {
            table_state.advance(TableSchemaState::AllDone);
            Stats::bump(&ctx.stats.tables_all_done);
        }
    }
    tracing::debug!(
        table = %job.table.qualified_name(),
        statements = job.statements.len(),
        failed,
        "index job finished",
    );
}
