//! Restore-wide counters and the periodic progress line. Counters are plain
//! atomics; they feed the dispatch-statistics log lines and the final
//! summary.

use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::Relaxed,
    },
    Arc,
};

use common::knobs::{
    DISPATCH_STATS_INTERVAL,
    PROGRESS_INTERVAL,
};
use tokio::task::JoinHandle;

use crate::registry::Registry;

#[derive(Default)]
pub struct Stats {
    pub dispatch_iterations: AtomicU64,
    pub jobs_dispatched: AtomicU64,
    pub queue_hits: AtomicU64,
    pub queue_misses: AtomicU64,

    pub databases_created: AtomicU64,
    pub tables_created: AtomicU64,
    pub tables_all_done: AtomicU64,
    pub tables_failed: AtomicU64,

    pub statements_executed: AtomicU64,
    pub rows_affected: AtomicU64,
    pub data_jobs_completed: AtomicU64,
    pub data_jobs_failed: AtomicU64,

    pub schema_retries: AtomicU64,
    pub data_retries: AtomicU64,
    pub reconnects: AtomicU64,
    pub ignored_errors: AtomicU64,
    pub fatal_errors: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Relaxed) + 1
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Relaxed)
    }

    /// Fraction of dispatches served by the ready queue's fast path.
    pub fn hit_rate(&self) -> f64 {
        let hits = Self::get(&self.queue_hits);
        let misses = Self::get(&self.queue_misses);
        if hits + misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64
    }

    /// Called from the dispatcher; logs on a bounded cadence.
    pub fn note_dispatch_iteration(&self) {
        let iterations = Self::bump(&self.dispatch_iterations);
        if iterations % *DISPATCH_STATS_INTERVAL == 0 {
            tracing::debug!(
                iterations,
                dispatched = Self::get(&self.jobs_dispatched),
                hits = Self::get(&self.queue_hits),
                misses = Self::get(&self.queue_misses),
                "dispatch statistics",
            );
        }
    }
}

/// Periodic progress line; aborted by the coordinator on completion.
pub fn spawn_progress_task(stats: Arc<Stats>, registry: Arc<Registry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(*PROGRESS_INTERVAL);
        // The immediate first tick would log all zeros.
        interval.tick().await;
        loop {
            interval.tick().await;
            tracing::info!(
                tables = registry.table_count(),
                tables_created = Stats::get(&stats.tables_created),
                tables_done = Stats::get(&stats.tables_all_done),
                data_jobs_completed = Stats::get(&stats.data_jobs_completed),
                rows = Stats::get(&stats.rows_affected),
                ready_queue_hit_rate = stats.hit_rate(),
                "restore progress",
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::Stats;

    #[test]
    fn test_hit_rate() {
        let stats = Stats::new();
        assert_eq!(stats.hit_rate(), 0.0);
        for _ in 0..95 {
            Stats::bump(&stats.queue_hits);
        }
        for _ in 0..5 {
            Stats::bump(&stats.queue_misses);
        }
        assert!((stats.hit_rate() - 0.95).abs() < f64::EPSILON);
    }
}
