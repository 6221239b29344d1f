//! Bounded FIFO between producers and the single delivery worker.
//!
//! A full queue suspends producers until the worker frees a slot; nothing
//! is dropped silently. `try_enqueue` is the fail-fast alternative.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::SubmitError;
use crate::message::QueuedMessage;

/// Consumer end shared between successive workers. A worker holds the lock
/// for its whole lifetime, so only one consumer is ever active.
pub type SharedReceiver = Arc<Mutex<QueueReceiver>>;

/// Create a queue holding at most `capacity` messages.
///
/// # Panics
/// When `capacity` is zero; settings validation rejects that earlier.
pub fn channel(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender { tx }, QueueReceiver { rx })
}

// ─── Producer side ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<QueuedMessage>,
}

impl QueueSender {
    /// Queue a message, waiting for space when the queue is full.
    pub async fn enqueue(&self, item: QueuedMessage) -> Result<(), SubmitError> {
        self.tx
            .send(item)
            .await
            .map_err(|mpsc::error::SendError(item)| SubmitError::Closed(item.message))
    }

    /// [`enqueue`](Self::enqueue) for plain OS threads. Panics when called
    /// from inside the async runtime.
    pub fn blocking_enqueue(&self, item: QueuedMessage) -> Result<(), SubmitError> {
        self.tx
            .blocking_send(item)
            .map_err(|mpsc::error::SendError(item)| SubmitError::Closed(item.message))
    }

    /// Queue a message or fail at once with [`SubmitError::Full`].
    pub fn try_enqueue(&self, item: QueuedMessage) -> Result<(), SubmitError> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(item) => SubmitError::Full(item.message),
            mpsc::error::TrySendError::Closed(item) => SubmitError::Closed(item.message),
        })
    }

    /// Free slots right now.
    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }

    pub fn max_capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ─── Consumer side ──────────────────────────────────────────────────

#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<QueuedMessage>,
}

impl QueueReceiver {
    /// Wait for the next message. `None` once every sender is gone and the
    /// backlog is drained.
    pub async fn dequeue(&mut self) -> Option<QueuedMessage> {
        self.rx.recv().await
    }

    /// Next message if one is ready. A closed queue reads as empty here;
    /// the following [`dequeue`](Self::dequeue) reports the closure.
    pub fn try_dequeue(&mut self) -> Option<QueuedMessage> {
        self.rx.try_recv().ok()
    }

    pub fn into_shared(self) -> SharedReceiver {
        Arc::new(Mutex::new(self))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
