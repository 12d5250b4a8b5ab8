//! Bounded FIFO work queue between the Rx/sweeper producers and the Tx worker
//!
//! `push` never waits: it fails fast when the queue is full or closed.
//! `pop` suspends until an item arrives or the queue is shut down, and keeps
//! handing out queued items after shutdown until the queue is drained.

use crate::error::QueueError;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Thread-safe bounded FIFO with suspending pop
pub struct CommandQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> CommandQueue<T> {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item and wake one waiter
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.items.len() >= self.capacity {
                return Err(QueueError::Full(self.capacity));
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the oldest item, waiting for one if the queue is empty
    pub async fn pop(&self) -> Result<T, QueueError> {
        loop {
            // Register interest before checking, so a push or shutdown
            // between the check and the await is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    return Ok(item);
                }
                if state.closed {
                    return Err(QueueError::Closed);
                }
            }

            notified.await;
        }
    }

    /// Take the oldest item without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Close the queue and wake every waiter. Idempotent.
    pub fn shutdown(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
