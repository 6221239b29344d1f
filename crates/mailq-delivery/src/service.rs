//! Startup and submission.

use std::sync::Arc;

use log::{debug, info};

use crate::error::{SettingsError, SubmitError};
use crate::message::{receipt_channel, Message, Notifier, QueuedMessage, Receipt};
use crate::queue::{self, QueueSender};
use crate::session::{Connector, SmtpConnector};
use crate::settings::DeliverySettings;
use crate::supervisor::{DeliveryStats, Supervisor};
use crate::worker::DeliveryContext;

/// Validate settings, build the shared context and spawn the supervised
/// worker against real SMTP servers. Must run inside a tokio runtime.
pub fn start(settings: DeliverySettings) -> Result<(DeliveryService, Supervisor), SettingsError> {
    start_with_connector(settings, SmtpConnector)
}

/// [`start`] with any [`Connector`].
pub fn start_with_connector<C: Connector>(
    settings: DeliverySettings,
    connector: C,
) -> Result<(DeliveryService, Supervisor), SettingsError> {
    settings.validate()?;
    let settings = Arc::new(settings);
    let (sender, receiver) = queue::channel(settings.queue_capacity);

    let ctx = Arc::new(DeliveryContext {
        settings: Arc::clone(&settings),
        connector: Arc::new(connector),
        receiver: receiver.into_shared(),
        stats: Arc::new(DeliveryStats::default()),
    });
    let supervisor = Supervisor::spawn(ctx);
    info!(
        "Mail delivery started for {}:{} (queue capacity {})",
        settings.host, settings.port, settings.queue_capacity
    );

    Ok((DeliveryService { sender, settings }, supervisor))
}

/// Producer handle. Cheap to clone; the queue closes once every clone is
/// dropped.
#[derive(Debug, Clone)]
pub struct DeliveryService {
    sender: QueueSender,
    settings: Arc<DeliverySettings>,
}

impl DeliveryService {
    /// Queue a message, waiting for space if the queue is full.
    pub async fn submit(&self, message: Message) -> Result<Receipt, SubmitError> {
        let (notifier, receipt) = receipt_channel();
        self.submit_with_notifier(message, notifier).await?;
        Ok(receipt)
    }

    /// Queue a message whose result slot the caller created with
    /// [`receipt_channel`](crate::receipt_channel).
    pub async fn submit_with_notifier(&self, message: Message, notifier: Notifier) -> Result<(), SubmitError> {
        let item = self.prepare(message, notifier);
        self.sender.enqueue(item).await
    }

    /// Fail with [`SubmitError::Full`] instead of waiting.
    pub fn try_submit(&self, message: Message) -> Result<Receipt, SubmitError> {
        let (notifier, receipt) = receipt_channel();
        self.sender.try_enqueue(self.prepare(message, notifier))?;
        Ok(receipt)
    }

    /// For producers on plain OS threads. Panics inside the async runtime.
    pub fn submit_blocking(&self, message: Message) -> Result<Receipt, SubmitError> {
        let (notifier, receipt) = receipt_channel();
        self.sender.blocking_enqueue(self.prepare(message, notifier))?;
        Ok(receipt)
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    pub fn remaining_capacity(&self) -> usize {
        self.sender.remaining_capacity()
    }

    fn prepare(&self, mut message: Message, notifier: Notifier) -> QueuedMessage {
        if message.from.trim().is_empty() {
            message.from = self.settings.from.clone();
        }
        debug!("Queueing message {} to {}", notifier.id(), message.to);
        QueuedMessage::new(message, notifier)
    }
}
