//! Async multi-producer/multi-consumer FIFO queue.
//!
//! Restore jobs must never be dropped once enqueued, so unlike a
//! latency-shedding queue this one is a plain FIFO: items come out in push
//! order, and the queue only ends once every sender is dropped and the
//! buffer is drained.

use std::{
    collections::VecDeque,
    sync::Arc,
};

use event_listener::Event;
use parking_lot::Mutex;

struct Inner<T> {
    buffer: VecDeque<T>,
    event: Event,
    senders: usize,
}

pub fn fifo_queue<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    let inner = Arc::new(Mutex::new(Inner {
        buffer: VecDeque::new(),
        event: Event::new(),
        senders: 1,
    }));
    (
        QueueSender {
            inner: inner.clone(),
        },
        QueueReceiver { inner },
    )
}

pub struct QueueSender<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        self.inner.lock().senders += 1;
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for QueueSender<T> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.senders -= 1;
        if inner.senders == 0 {
            // Queue is closed. Wake up all receivers so they observe the end.
            inner.event.notify(usize::MAX);
        }
    }
}

impl<T> QueueSender<T> {
    pub fn send(&self, item: T) {
        let mut inner = self.inner.lock();
        inner.buffer.push_back(item);
        inner.event.notify_additional(1);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct QueueReceiver<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Returns the next item in FIFO order, or `None` once all senders are
    /// dropped and the buffer is drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            // The listener is registered under the lock, so a push after the
            // failed pop below is guaranteed to notify it.
            let listener = {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.buffer.pop_front() {
                    return Some(item);
                }
                if inner.senders == 0 {
                    return None;
                }
                inner.event.listen()
            };
            listener.await;
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.inner.lock().buffer.pop_front()
    }
}
