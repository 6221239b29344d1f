//! Outbound message value object and its completion channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{ReceiptError, SendError};

/// Outcome written to a message's receipt.
pub type DeliveryResult = Result<(), SendError>;

// ─── Message ────────────────────────────────────────────────────────

/// One outbound plain-text message.
///
/// Addresses are kept as strings and only parsed when the worker sends
/// the message, so a malformed address surfaces on the receipt rather
/// than at submission. An empty `from` is replaced by the configured
/// default sender when the message is submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Overlaid onto the default header set; names compare
    /// case-insensitively and later entries win.
    #[serde(default)]
    pub additional_headers: Vec<(String, String)>,
}

impl Message {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: String::new(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            additional_headers: Vec::new(),
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_headers.push((name.into(), value.into()));
        self
    }
}

// ─── Completion channel ─────────────────────────────────────────────

/// Write half of a message's result slot. Consumed on use, so a message
/// can be answered at most once.
#[derive(Debug)]
pub struct Notifier {
    id: Uuid,
    tx: oneshot::Sender<DeliveryResult>,
}

impl Notifier {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Deliver the outcome. A producer that stopped listening is not an error.
    pub fn notify(self, result: DeliveryResult) {
        if self.tx.send(result).is_err() {
            log::debug!("Receipt {} was dropped before its result arrived", self.id);
        }
    }
}

/// Read half of a message's result slot, held by the producer.
#[derive(Debug)]
pub struct Receipt {
    id: Uuid,
    rx: oneshot::Receiver<DeliveryResult>,
}

impl Receipt {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the worker to attempt the message.
    pub async fn wait(self) -> Result<(), ReceiptError> {
        match self.rx.await {
            Ok(result) => result.map_err(ReceiptError::Send),
            Err(_) => Err(ReceiptError::Abandoned),
        }
    }

    /// Blocking variant for plain OS threads. Panics when called from
    /// inside an async context, like every tokio blocking receive.
    pub fn wait_blocking(self) -> Result<(), ReceiptError> {
        match self.rx.blocking_recv() {
            Ok(result) => result.map_err(ReceiptError::Send),
            Err(_) => Err(ReceiptError::Abandoned),
        }
    }
}

/// Create a linked notifier/receipt pair.
pub fn receipt_channel() -> (Notifier, Receipt) {
    let id = Uuid::new_v4();
    let (tx, rx) = oneshot::channel();
    (Notifier { id, tx }, Receipt { id, rx })
}

// ─── Queue item ─────────────────────────────────────────────────────

/// A message owned by the queue, together with its result slot.
#[derive(Debug)]
pub struct QueuedMessage {
    pub message: Message,
    pub notifier: Notifier,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(message: Message, notifier: Notifier) -> Self {
        Self {
            message,
            notifier,
            enqueued_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.notifier.id()
    }

    /// Write the outcome to the producer's receipt, consuming the item.
    pub fn complete(self, result: DeliveryResult) {
        self.notifier.notify(result);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
