//! The shared restore context handed to every worker and the dispatcher. All
//! cross-thread state lives here behind `Arc`; there are no process-level
//! singletons.

use std::sync::Arc;

use common::{
    fifo_queue::{
        fifo_queue,
        QueueReceiver,
        QueueSender,
    },
    shutdown::ShutdownSignal,
};
use tokio::sync::mpsc;

use crate::{
    client::ConnectionFactory,
    config::RestoreOptions,
    control::{
        control_bus,
        ControlEvent,
        ControlHandle,
    },
    decompress::DecompressPool,
    errors::ClientError,
    jobs::{
        DataMessage,
        IndexMessage,
    },
    metrics::Stats,
    ready_queue::ReadyQueue,
    registry::Registry,
    schema::SchemaPipeline,
};

pub struct RestoreContext {
    pub options: RestoreOptions,
    pub registry: Arc<Registry>,
    pub ready_queue: ReadyQueue,
    pub control: ControlHandle,
    pub stats: Arc<Stats>,
    pub decompress: DecompressPool,
    pub factory: Arc<dyn ConnectionFactory>,
    pub shutdown: ShutdownSignal,
    pub schema: SchemaPipeline,
    pub data_tx: QueueSender<DataMessage>,
    pub data_rx: QueueReceiver<DataMessage>,
    pub index_tx: QueueSender<IndexMessage>,
    pub index_rx: QueueReceiver<IndexMessage>,
}

impl RestoreContext {
    /// Builds the context and the dispatcher's receiving end of the control
    /// bus. Every synchronization primitive is constructed here, before any
    /// worker spawns.
    pub fn new(
        options: RestoreOptions,
        factory: Arc<dyn ConnectionFactory>,
        shutdown: ShutdownSignal,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ControlEvent>) {
        let (control, control_rx) = control_bus();
        let (data_tx, data_rx) = fifo_queue();
        let (index_tx, index_rx) = fifo_queue();
        let decompress = DecompressPool::new(
            options.decompressors(),
            std::env::temp_dir(),
        );
        let context = Arc::new(Self {
            registry: Arc::new(Registry::new()),
            ready_queue: ReadyQueue::new(),
            control,
            stats: Stats::new(),
            decompress,
            factory,
            shutdown,
            schema: SchemaPipeline::new(),
            data_tx,
            data_rx,
            index_tx,
            index_rx,
            options,
        });
        (context, control_rx)
    }

    /// Execute one statement, translating codes in the operator's ignore set
    /// into success. All worker statement execution funnels through here.
    pub async fn execute_statement(
        &self,
        session: &mut crate::client::WorkerSession,
        sql: &str,
    ) -> Result<u64, ClientError> {
        match session.execute(sql).await {
            Ok(affected) => {
                Stats::bump(&self.stats.statements_executed);
                Ok(affected)
            },
            Err(e) if self.options.ignores(e.code) => {
                Stats::bump(&self.stats.ignored_errors);
                tracing::warn!(
                    code = e.code,
                    "ignoring error by configuration: {}",
                    e.message,
                );
                Ok(0)
            },
            Err(e) => Err(e),
        }
    }
}
