//! External event queues.
//!
//! The interpreter pulls external messages through this seam, so a durable
//! host can back it with persistent delivery. The in-memory implementation
//! is a FIFO with multi-producer send and a single consuming driver.

use crate::error::CoreError;
use crate::event::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Appends a message. Fails once the queue is closed.
    async fn send(&self, msg: Message) -> Result<(), CoreError>;

    /// Waits for the next message. None once closed and drained.
    async fn recv(&self) -> Option<Message>;

    /// Takes the next message without waiting.
    fn try_recv(&self) -> Option<Message>;

    fn has_pending(&self) -> bool;

    /// Closes the queue, waking any pending `recv`.
    fn close(&self);
}

/// FIFO queue backed by process memory.
#[derive(Default)]
pub struct InMemoryEventQueue {
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
    closed: AtomicBool,
}

impl InMemoryEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

#[async_trait]
impl EventQueue for InMemoryEventQueue {
    async fn send(&self, msg: Message) -> Result<(), CoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::QueueClosed);
        }
        self.messages.lock().push_back(msg);
        self.notify.notify_one();
        Ok(())
    }

    async fn recv(&self) -> Option<Message> {
        loop {
            // Register for a wakeup before checking, so a send between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            if let Some(msg) = self.try_recv() {
                return Some(msg);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    fn try_recv(&self) -> Option<Message> {
        self.messages.lock().pop_front()
    }

    fn has_pending(&self) -> bool {
        !self.messages.lock().is_empty()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InMemoryEventQueue::new();
        queue.send(Message::external("first", Value::Null)).await.unwrap();
        queue.send(Message::external("second", Value::Null)).await.unwrap();

        assert_eq!(queue.recv().await.unwrap().name, "first");
        assert_eq!(queue.recv().await.unwrap().name, "second");
        assert!(!queue.has_pending());
    }

    #[tokio::test]
    async fn test_recv_waits_for_send() {
        let queue = Arc::new(InMemoryEventQueue::new());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::task::yield_now().await;

        queue.send(Message::external("go", Value::Null)).await.unwrap();
        let msg = consumer.await.unwrap().unwrap();
        assert_eq!(msg.name, "go");
    }

    #[tokio::test]
    async fn test_close_wakes_receiver() {
        let queue = Arc::new(InMemoryEventQueue::new());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::task::yield_now().await;

        queue.close();
        assert!(consumer.await.unwrap().is_none());
        assert!(matches!(
            queue.send(Message::cancel()).await,
            Err(CoreError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_drains_remaining() {
        let queue = InMemoryEventQueue::new();
        queue.send(Message::external("go", Value::Null)).await.unwrap();
        queue.close();

        // Already queued messages still come out.
        assert_eq!(queue.recv().await.unwrap().name, "go");
        assert!(queue.recv().await.is_none());
    }

    #[test]
    fn test_try_recv_empty() {
        let queue = InMemoryEventQueue::new();
        assert!(queue.try_recv().is_none());
    }
}
