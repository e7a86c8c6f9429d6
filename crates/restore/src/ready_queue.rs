//! The ready queue: a FIFO of table descriptors deemed immediately
//! dispatchable, giving the dispatcher O(1) work selection in steady state.
//!
//! A table has at most one logical occurrence in the queue, tracked by the
//! `in_ready_queue` flag on its state; both the flag and the readiness check
//! are only touched under the table mutex, which `try_enqueue` enforces by
//! taking the locked state.

use std::{
    collections::VecDeque,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    control::ControlHandle,
    metrics::Stats,
    registry::{
        TableDescriptor,
        TableState,
    },
};

pub struct ReadyQueue {
    queue: Mutex<VecDeque<Arc<TableDescriptor>>>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue `table` if it is ready and not already queued. `state` must be
    /// the locked state of `table`. On a push, one waiting data worker is
    /// woken.
    pub fn try_enqueue(
        &self,
        table: &Arc<TableDescriptor>,
        state: &mut TableState,
        control: &ControlHandle,
    ) -> bool {
        if !state.is_ready() || state.in_ready_queue {
            return false;
        }
        state.in_ready_queue = true;
        self.queue.lock().push_back(table.clone());
        tracing::trace!(
            table = %table.qualified_name(),
            jobs = state.jobs.len(),
            threads = state.current_threads,
            "enqueued ready table",
        );
        control.wake_data();
        true
    }

    /// Pop the oldest entry. The caller must clear `in_ready_queue` and
    /// re-validate readiness under the table mutex; the entry may have gone
    /// stale since it was pushed.
    pub fn try_pop(&self) -> Option<Arc<TableDescriptor>> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatcher-side bookkeeping for a popped entry: clears the flag and
/// revalidates under the table mutex, counting a hit or miss.
pub fn revalidate_popped(state: &mut TableState, stats: &Stats) -> bool {
    state.in_ready_queue = false;
    if state.is_ready() {
        Stats::bump(&stats.queue_hits);
        true
    } else {
        Stats::bump(&stats.queue_misses);
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ReadyQueue;
    use crate::{
        control::control_bus,
        jobs::{
            Compression,
            PendingDataJob,
        },
        metrics::Stats,
        ready_queue::revalidate_popped,
        registry::{
            Registry,
            TableSchemaState,
        },
    };

    fn pending_job() -> PendingDataJob {
        PendingDataJob {
            path: "t.00000.sql".into(),
            offset: 0,
            compression: Compression::None,
        }
    }

    #[test]
    fn test_enqueue_requires_readiness() {
        let registry = Registry::new();
        let db = registry.database("shop");
        let table = registry.table(&db, "orders", "orders", 4);
        let queue = ReadyQueue::new();
        let (control, _rx) = control_bus();

        let mut st = table.state();
        assert!(!queue.try_enqueue(&table, &mut st, &control), "not ready");
        st.advance(TableSchemaState::Created);
        st.jobs.push_back(pending_job());
        assert!(queue.try_enqueue(&table, &mut st, &control));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_no_duplicate_occurrence() {
        let registry = Registry::new();
        let db = registry.database("shop");
        let table = registry.table(&db, "orders", "orders", 4);
        let queue = ReadyQueue::new();
        let (control, _rx) = control_bus();

        let mut st = table.state();
        st.advance(TableSchemaState::Created);
        st.jobs.push_back(pending_job());
        assert!(queue.try_enqueue(&table, &mut st, &control));
        assert!(!queue.try_enqueue(&table, &mut st, &control));
        assert!(!queue.try_enqueue(&table, &mut st, &control));
        assert_eq!(queue.len(), 1, "exactly one logical occurrence");
    }

    #[test]
    fn test_pop_revalidate_and_reenqueue_cycle() {
        let registry = Registry::new();
        let db = registry.database("shop");
        let table = registry.table(&db, "orders", "orders", 4);
        let queue = ReadyQueue::new();
        let (control, _rx) = control_bus();
        let stats = Stats::new();

        {
            let mut st = table.state();
            st.advance(TableSchemaState::Created);
            st.jobs.push_back(pending_job());
            st.jobs.push_back(pending_job());
            queue.try_enqueue(&table, &mut st, &control);
        }

        let popped = queue.try_pop().unwrap();
        assert!(Arc::ptr_eq(&popped, &table));
        let mut st = popped.state();
        assert!(revalidate_popped(&mut st, &stats));
        // Dispatch one job; the table still has one left and must re-enter
        // the queue exactly once.
        st.jobs.pop_front();
        st.current_threads += 1;
        assert!(queue.try_enqueue(&popped, &mut st, &control));
        assert!(st.in_ready_queue);
        assert_eq!(queue.len(), 1);
        assert_eq!(Stats::get(&stats.queue_hits), 1);
    }

    #[test]
    fn test_stale_pop_counts_a_miss() {
        let registry = Registry::new();
        let db = registry.database("shop");
        let table = registry.table(&db, "orders", "orders", 4);
        let queue = ReadyQueue::new();
        let (control, _rx) = control_bus();
        let stats = Stats::new();

        {
            let mut st = table.state();
            st.advance(TableSchemaState::Created);
            st.jobs.push_back(pending_job());
            queue.try_enqueue(&table, &mut st, &control);
            // Goes stale while queued.
            st.jobs.clear();
        }
        let popped = queue.try_pop().unwrap();
        let mut st = popped.state();
        assert!(!revalidate_popped(&mut st, &stats));
        assert!(!st.in_ready_queue);
        assert_eq!(Stats::get(&stats.queue_misses), 1);
    }
}
