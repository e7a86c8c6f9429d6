//! The dispatcher: a single task consuming the control-event bus, pairing
//! ready tables with idle data workers.
//!
//! Fast path: pop the ready queue, revalidate under the table mutex, detach
//! the head job. Slow path: insertion-order scan of the cached table list,
//! performing the same lock-protected readiness check and sweeping tables
//! into their terminal states along the way. The scan cache is rebuilt on a
//! counter and force-refreshed when producers announce the end of data
//! files, so a late-registered table is always scanned once before the
//! dispatcher may conclude there is nothing left to do.

use std::sync::Arc;

use common::knobs::TABLE_REFRESH_INTERVAL;
use tokio::sync::mpsc;

use crate::{
    context::RestoreContext,
    control::ControlEvent,
    jobs::{
        DataJob,
        DataMessage,
        IndexJob,
        IndexMessage,
    },
    metrics::Stats,
    ready_queue::revalidate_popped,
    registry::{
        DbSchemaState,
        TableDescriptor,
        TableSchemaState,
        TableState,
    },
};

pub struct Dispatcher {
    ctx: Arc<RestoreContext>,
    rx: mpsc::UnboundedReceiver<ControlEvent>,
    /// Cached snapshot of the registry's table list for the slow path.
    scan_list: Vec<Arc<TableDescriptor>>,
    scans_since_refresh: usize,
    all_data_jobs_enqueued: bool,
}

impl Dispatcher {
    pub fn new(ctx: Arc<RestoreContext>, rx: mpsc::UnboundedReceiver<ControlEvent>) -> Self {
        let scans_since_refresh = *TABLE_REFRESH_INTERVAL;
        Self {
            ctx,
            rx,
            scan_list: Vec::new(),
            scans_since_refresh,
            all_data_jobs_enqueued: false,
        }
    }

    pub async fn run(mut self) {
        tracing::debug!("dispatcher started");
        while let Some(event) = self.rx.recv().await {
            match event {
                ControlEvent::RequestJob => {
                    if !self.handle_request_job() {
                        break;
                    }
                },
                ControlEvent::WakeData => self.ctx.control.wake_all_waiting(),
                ControlEvent::FileTypeEnded => {
                    // Forced refresh: catch tables registered after the last
                    // rebuild before any give-up decision.
                    self.refresh_scan_list();
                    self.sweep_missing_schemas();
                    self.all_data_jobs_enqueued = true;
                    self.sweep_terminal_tables();
                    self.ctx.control.send(ControlEvent::RequestJob);
                },
                ControlEvent::SchemaPhaseEnded => self.ctx.control.wake_all_waiting(),
                ControlEvent::Shutdown => break,
            }
        }
        // Every data worker gets exactly one sentinel, whether we drained
        // normally or were shut down outright.
        for _ in 0..self.ctx.options.threads {
            self.ctx.data_tx.send(DataMessage::Shutdown);
        }
        tracing::debug!("dispatcher finished");
    }

    /// Returns false once the drain is complete and the dispatcher should
    /// exit.
    fn handle_request_job(&mut self) -> bool {
        self.ctx.stats.note_dispatch_iteration();
        match self.next_data_job() {
            (Some(job), _) => {
                self.ctx.data_tx.send(DataMessage::Job(job));
                true
            },
            (None, giveup) => {
                if giveup && self.all_data_jobs_enqueued {
                    tracing::info!(
                        dispatched = Stats::get(&self.ctx.stats.jobs_dispatched),
                        hit_rate = self.ctx.stats.hit_rate(),
                        "all data jobs drained",
                    );
                    false
                } else {
                    self.ctx
                        .control
                        .note_waiting(self.ctx.options.threads as u32);
                    true
                }
            },
        }
    }

    fn next_data_job(&mut self) -> (Option<DataJob>, bool) {
        // Fast path: tables already judged ready.
        while let Some(table) = self.ctx.ready_queue.try_pop() {
            let mut table_state = table.state();
            if !revalidate_popped(&mut table_state, &self.ctx.stats) {
                // Stale entry; this is also where idle tables are swept into
                // DATA_DONE.
                self.finish_table_if_done(&table, &mut table_state);
                continue;
            }
            if let Some(job) = self.dispatch_from(&table, &mut table_state) {
                return (Some(job), false);
            }
        }
        self.slow_scan()
    }

    /// Detach the head job under the table mutex. The caller has verified
    /// readiness; the table is re-enqueued right away if it still has work.
    fn dispatch_from(
        &self,
        table: &Arc<TableDescriptor>,
        table_state: &mut TableState,
    ) -> Option<DataJob> {
        let pending = table_state.jobs.pop_front()?;
        table_state.current_threads += 1;
        let dispatched = Stats::bump(&self.ctx.stats.jobs_dispatched);
        tracing::trace!(
            table = %table.qualified_name(),
            dispatched,
            threads = table_state.current_threads,
            jobs_left = table_state.jobs.len(),
            "dispatching data job",
        );
        self.ctx
            .ready_queue
            .try_enqueue(table, table_state, &self.ctx.control);
        Some(DataJob::dispatch(table.clone(), pending))
    }

    /// Fallback scan in insertion order, sweeping terminal transitions as it
    /// goes. Returns the first dispatched job plus the give-up verdict: true
    /// only if every table is terminally done (or a view/sequence already
    /// applied).
    fn slow_scan(&mut self) -> (Option<DataJob>, bool) {
        self.maybe_refresh_scan_list();
        let mut giveup = true;
        for table in &self.scan_list {
            // Cheap pre-check without the table mutex; never hold the table
            // mutex while reading database state.
            if table.database.schema_state() == DbSchemaState::NotFound {
                continue;
            }
            let mut table_state = table.state();
            let state = table_state.schema_state;
            if state == TableSchemaState::NotFound2
                || state >= TableSchemaState::DataDone
                || (state == TableSchemaState::Created
                    && (table_state.is_view || table_state.is_sequence))
            {
                continue;
            }
            if state != TableSchemaState::Created {
                // Schema still in flight somewhere.
                giveup = false;
                continue;
            }
            if !table_state.jobs.is_empty() {
                if table_state.no_data {
                    discard_jobs(table, &mut table_state);
                    table_state.advance(TableSchemaState::AllDone);
                    Stats::bump(&self.ctx.stats.tables_all_done);
                    continue;
                }
                if table_state.current_threads >= table_state.max_threads {
                    giveup = false;
                    continue;
                }
                if let Some(job) = self.dispatch_from(table, &mut table_state) {
                    return (Some(job), false);
                }
            } else if self.all_data_jobs_enqueued
                && table_state.current_threads == 0
                && table.remaining_jobs() == 0
            {
                table_state.advance(TableSchemaState::DataDone);
                self.enqueue_index_locked(table, &mut table_state);
            } else {
                // Loads in flight, or producers may still append jobs.
                giveup = false;
            }
        }
        (None, giveup)
    }

    /// Terminal sweep for a table popped stale off the ready queue.
    fn finish_table_if_done(&self, table: &Arc<TableDescriptor>, table_state: &mut TableState) {
        if table_state.schema_state != TableSchemaState::Created
            || table_state.is_view
            || table_state.is_sequence
        {
            return;
        }
        if table_state.no_data && !table_state.jobs.is_empty() {
            discard_jobs(table, table_state);
            table_state.advance(TableSchemaState::AllDone);
            Stats::bump(&self.ctx.stats.tables_all_done);
            return;
        }
        if self.all_data_jobs_enqueued
            && table_state.jobs.is_empty()
            && table_state.current_threads == 0
            && table.remaining_jobs() == 0
        {
            table_state.advance(TableSchemaState::DataDone);
            self.enqueue_index_locked(table, table_state);
        }
    }

    fn enqueue_index_locked(&self, table: &Arc<TableDescriptor>, table_state: &mut TableState) {
        enqueue_index_for(&self.ctx, table, table_state);
    }

    /// Tables referenced only by data files have no schema to wait for once
    /// producers are done; their jobs are discarded.
    fn sweep_missing_schemas(&self) {
        for table in &self.scan_list {
            let mut table_state = table.state();
            if table_state.schema_state == TableSchemaState::NotFound {
                tracing::warn!(
                    table = %table.qualified_name(),
                    "no schema file in dump, discarding its data jobs",
                );
                discard_jobs(table, &mut table_state);
                table_state.advance(TableSchemaState::NotFound2);
                Stats::bump(&self.ctx.stats.tables_failed);
                table.notify_schema();
            }
        }
    }

    /// Sweep every table that already has nothing left to load, so index
    /// jobs for them are enqueued even if no worker ever asks again.
    fn sweep_terminal_tables(&self) {
        for table in &self.scan_list {
            let mut table_state = table.state();
            self.finish_table_if_done(table, &mut table_state);
        }
    }

    fn maybe_refresh_scan_list(&mut self) {
        self.scans_since_refresh += 1;
        if self.scans_since_refresh >= *TABLE_REFRESH_INTERVAL {
            self.refresh_scan_list();
        }
    }

    fn refresh_scan_list(&mut self) {
        self.scan_list = self.ctx.registry.snapshot_table_list();
        self.scans_since_refresh = 0;
    }
}

fn discard_jobs(table: &Arc<TableDescriptor>, table_state: &mut TableState) {
    let discarded = table_state.jobs.len();
    table_state.jobs.clear();
    table.discard_remaining_jobs(discarded as i64);
}

/// `DataDone` reached: hand the table's deferred index and post-data
/// statements to the index pool, or finalize outright if there are none.
/// Also used by the coordinator to finalize tables in schema-only runs.
pub(crate) fn enqueue_index_for(
    ctx: &RestoreContext,
    table: &Arc<TableDescriptor>,
    table_state: &mut TableState,
) {
    let mut statements: Vec<String> = table_state.index_statements.drain(..).collect();
    statements.append(&mut table_state.post_statements);
    if statements.is_empty() {
        table_state.advance(TableSchemaState::AllDone);
        Stats::bump(&ctx.stats.tables_all_done);
    } else {
        table_state.advance(TableSchemaState::IndexEnqueued);
        ctx.index_tx.send(IndexMessage::Job(IndexJob {
            table: table.clone(),
            statements,
        }));
        tracing::debug!(table = %table.qualified_name(), "index jobs enqueued");
    }
}
