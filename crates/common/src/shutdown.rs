use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Used by workers to report the first fatal error to the coordinator.
/// Subsequent signals are dropped; workers keep draining their queues after
/// signaling so the restore can finish partially.
#[derive(Clone)]
pub struct ShutdownSignal {
    shutdown_tx: Arc<Mutex<Option<mpsc::UnboundedSender<anyhow::Error>>>>,
}

impl ShutdownSignal {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<anyhow::Error>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                shutdown_tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn signal(&self, fatal_error: anyhow::Error) {
        tracing::error!("Fatal error: {fatal_error:#}");
        let Some(shutdown_tx) = self.shutdown_tx.lock().take() else {
            // A fatal error has already been reported. Do nothing.
            return;
        };
        _ = shutdown_tx.send(fatal_error);
    }
}

#[cfg(test)]
mod tests {
    use super::ShutdownSignal;

    #[tokio::test]
    async fn test_only_first_signal_is_delivered() {
        let (signal, mut rx) = ShutdownSignal::new();
        signal.signal(anyhow::anyhow!("first"));
        signal.signal(anyhow::anyhow!("second"));
        assert_eq!(rx.recv().await.unwrap().to_string(), "first");
        assert!(rx.recv().await.is_none());
    }
}
