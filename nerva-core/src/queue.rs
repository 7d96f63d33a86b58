use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::dispatch::DispatchOptions;
use crate::error::KernelError;
use crate::message::Message;

/// Default per-subsystem queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// A message waiting in a subsystem queue, together with the options it was
/// accepted with.
#[derive(Clone, Debug)]
pub struct QueuedMessage {
    pub message: Message,
    pub options: DispatchOptions,
}

/// Bounded FIFO of pending messages for one subsystem.
///
/// Ordering is strict FIFO; priority handling lives in the global
/// scheduler's strategy, never here. `is_full` is advisory — the authoritative
/// signal is [`enqueue`](Self::enqueue) failing with `queue_full`.
pub struct MessageQueue {
    inner: Mutex<VecDeque<QueuedMessage>>,
    capacity: usize,
    rejected: AtomicU64,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            rejected: AtomicU64::new(0),
        }
    }

    /// Append a message. Returns the post-enqueue size, or `queue_full`
    /// when at capacity (the caller may retry or drop).
    pub fn enqueue(
        &self,
        message: Message,
        options: DispatchOptions,
    ) -> Result<usize, KernelError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if inner.len() >= self.capacity {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(KernelError::queue_full(format!(
                "queue at capacity ({})",
                self.capacity
            )));
        }
        inner.push_back(QueuedMessage { message, options });
        Ok(inner.len())
    }

    /// Pop the oldest queued message, if any.
    pub fn select_next_message(&self) -> Option<QueuedMessage> {
        self.inner.lock().expect("queue poisoned").pop_front()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("queue poisoned").len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity
    }

    /// How many enqueues have been rejected since construction.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
