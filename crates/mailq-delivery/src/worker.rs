//! The delivery worker: sole consumer of the queue and owner of the session.
//!
//! ```text
//!            dequeue → open ok
//!   ┌──────┐ ─────────────────────▶ ┌─────────────┐ ─┐ try_dequeue: message
//!   │ Idle │                        │ SessionOpen │  │ → pace, send
//!   └──────┘ ◀───────────────────── └─────────────┘ ◀┘
//!            queue empty / transport fault → close
//! ```
//!
//! A failed open ends the worker with that error; the message that
//! triggered it is dropped and its receipt reads `Abandoned`.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::error::WorkerError;
use crate::message::QueuedMessage;
use crate::queue::{QueueReceiver, SharedReceiver};
use crate::session::{Connector, MailSession};
use crate::settings::DeliverySettings;
use crate::supervisor::DeliveryStats;

/// Process-scoped state shared by the supervisor and every worker.
pub(crate) struct DeliveryContext {
    pub settings: Arc<DeliverySettings>,
    pub connector: Arc<dyn Connector>,
    pub receiver: SharedReceiver,
    pub stats: Arc<DeliveryStats>,
}

/// Run one worker until the session cannot be opened or the queue closes.
pub(crate) async fn run_worker(ctx: Arc<DeliveryContext>) -> Result<(), WorkerError> {
    let mut queue = Arc::clone(&ctx.receiver).lock_owned().await;
    debug!("Delivery worker attached to queue");

    loop {
        // Idle
        let first = match queue.dequeue().await {
            Some(item) => item,
            None => return Err(WorkerError::QueueClosed),
        };

        let mut session = match ctx.connector.open(&ctx.settings).await {
            Ok(session) => session,
            Err(e) => {
                error!(
                    "Could not open mail session; message {} to {} is dropped: {}",
                    first.id(),
                    first.message.to,
                    e
                );
                return Err(e.into());
            }
        };
        ctx.stats.record_session();

        // SessionOpen
        let mut usable = deliver(session.as_mut(), first, &ctx).await;
        while usable {
            let Some(item) = next_ready(&mut queue) else {
                break;
            };
            sleep(ctx.settings.pacing_interval()).await;
            usable = deliver(session.as_mut(), item, &ctx).await;
        }
        if !usable {
            warn!("Mail session unusable after transport fault, reconnecting on next message");
        }

        session.close().await;
        debug!("Delivery worker idle");
    }
}

fn next_ready(queue: &mut QueueReceiver) -> Option<QueuedMessage> {
    let item = queue.try_dequeue();
    if item.is_none() {
        info!("Delivery queue drained, closing mail session");
    }
    item
}

/// Attempt one message and answer its receipt. Returns whether the
/// session can carry another message.
async fn deliver(session: &mut dyn MailSession, item: QueuedMessage, ctx: &DeliveryContext) -> bool {
    ctx.stats.record_attempt();
    let waited = chrono::Utc::now() - item.enqueued_at;
    debug!(
        "Sending message {} to {} after {} ms in queue",
        item.id(),
        item.message.to,
        waited.num_milliseconds()
    );

    let result = session.send_one(&item.message).await;
    let keep = match &result {
        Ok(()) => {
            ctx.stats.record_delivered();
            true
        }
        Err(e) => {
            ctx.stats.record_failed();
            error!("Failed to send message {} to {}: {}", item.id(), item.message.to, e);
            !e.is_session_fatal()
        }
    };
    item.complete(result);
    keep && session.is_reusable()
}
