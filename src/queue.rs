//! Bounded inbound message queue.
//!
//! Decouples the receive loop from the consumer's processing rate. The queue
//! deliberately outlives individual connections: messages buffered before a
//! reconnect remain available to the consumer afterwards, and the same
//! consumer handle keeps working across reconnects.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::error::QueueFull;
use crate::{Error, Result};

/// What `push` does when the queue is at capacity.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room
    #[default]
    DropOldest,
    /// Reject the new message with [`QueueFull`]
    RejectNew,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO between the receive loop and the application consumer.
///
/// `push` is non-blocking; `pop` suspends until a message arrives or the
/// queue is closed. The drop counter is independent of the manager's traffic
/// statistics.
pub struct MessageQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl<T> MessageQueue<T> {
    /// Create a queue holding at most `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a message, applying the overflow policy when full.
    ///
    /// Under [`OverflowPolicy::RejectNew`] a full queue fails with
    /// [`QueueFull`] carrying the queue size and cumulative drop count.
    /// Messages pushed after [`close`](Self::close) are discarded.
    pub fn push(&self, item: T) -> Result<()> {
        let mut inner = self.lock();

        if inner.closed {
            return Ok(());
        }

        if inner.items.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    inner.items.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                OverflowPolicy::RejectNew => {
                    let dropped_count = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    return Err(Error::from(QueueFull {
                        queue_size: inner.items.len(),
                        dropped_count,
                    }));
                }
            }
        }

        inner.items.push_back(item);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the next message, waiting until one arrives.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            // Arm the notification before checking, so a push between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Dequeue without waiting.
    #[must_use]
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Messages dropped or rejected so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Close the queue, waking all pending consumers. Queued messages remain
    /// poppable until drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    // A poisoned lock cannot leave the VecDeque inconsistent, so recover.
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T> std::fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::{Kind, QueueFull};

    #[test]
    fn reject_policy_surfaces_queue_full() {
        let queue = MessageQueue::new(2, OverflowPolicy::RejectNew);

        queue.push(1_u32).expect("first push");
        queue.push(2).expect("second push");
        let err = queue.push(3).expect_err("third push must overflow");

        assert_eq!(err.kind(), Kind::Backpressure);
        let full = err.downcast_ref::<QueueFull>().expect("downcast");
        assert_eq!(full.queue_size, 2);
        assert_eq!(full.dropped_count, 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drop_oldest_keeps_newest() {
        let queue = MessageQueue::new(2, OverflowPolicy::DropOldest);

        queue.push(1_u32).expect("push");
        queue.push(2).expect("push");
        queue.push(3).expect("push over capacity");

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = std::sync::Arc::new(MessageQueue::new(4, OverflowPolicy::RejectNew));

        let consumer = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("hello").expect("push");

        let received = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should finish")
            .expect("join");
        assert_eq!(received, Some("hello"));
    }

    #[tokio::test]
    async fn close_wakes_pending_pop() {
        let queue = std::sync::Arc::new(MessageQueue::<u32>::new(4, OverflowPolicy::RejectNew));

        let consumer = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let received = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should finish")
            .expect("join");
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn closed_queue_drains_remaining_items() {
        let queue = MessageQueue::new(4, OverflowPolicy::RejectNew);

        queue.push(1_u32).expect("push");
        queue.push(2).expect("push");
        queue.close();
        queue.push(3).expect("push after close is discarded");

        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, None);
    }
}
