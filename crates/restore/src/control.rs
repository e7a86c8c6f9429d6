//! The control-event bus: a single queue of coarse events consumed by the
//! dispatcher, plus the ledger of data workers currently parked waiting for
//! work.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// A data worker asks for work or just completed a job.
    RequestJob,
    /// Producer side observed newly ready work.
    WakeData,
    /// Producers have emitted all data jobs.
    FileTypeEnded,
    /// Schema producers are done.
    SchemaPhaseEnded,
    /// Final termination.
    Shutdown,
}

#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlEvent>,
    threads_waiting: Arc<Mutex<u32>>,
}

impl ControlHandle {
    pub fn send(&self, event: ControlEvent) {
        // The dispatcher dropping its receiver means shutdown is already
        // under way; late events are irrelevant then.
        _ = self.tx.send(event);
    }

    /// Wake one waiting data worker if any is parked. Called after a table
    /// is pushed onto the ready queue.
    pub fn wake_data(&self) {
        let threads_waiting = self.threads_waiting.lock();
        if *threads_waiting > 0 {
            self.send(ControlEvent::WakeData);
        }
    }

    /// Park the calling request: the dispatcher found no job for it. Capped
    /// at the pool size so spurious requests cannot inflate the ledger.
    pub fn note_waiting(&self, pool_size: u32) {
        let mut threads_waiting = self.threads_waiting.lock();
        if *threads_waiting < pool_size {
            *threads_waiting += 1;
        }
    }

    /// Convert every parked worker back into a `RequestJob` event.
    pub fn wake_all_waiting(&self) {
        let mut threads_waiting = self.threads_waiting.lock();
        while *threads_waiting > 0 {
            self.send(ControlEvent::RequestJob);
            *threads_waiting -= 1;
        }
    }

    pub fn waiting(&self) -> u32 {
        *self.threads_waiting.lock()
    }
}

pub fn control_bus() -> (ControlHandle, mpsc::UnboundedReceiver<ControlEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ControlHandle {
            tx,
            threads_waiting: Arc::new(Mutex::new(0)),
        },
        rx,
    )
}
