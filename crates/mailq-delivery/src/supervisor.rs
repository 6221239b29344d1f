//! Keeps exactly one delivery worker alive.
//!
//! Whatever ends a worker (open failure, panic, unexpected return) is
//! logged, then a fresh worker is spawned after the fixed cooldown. There
//! is no backoff growth and no retry cap. The only way out is the queue
//! closing, which means every producer handle is gone.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;

use crate::error::WorkerError;
use crate::worker::{run_worker, DeliveryContext};

// ─── Counters ───────────────────────────────────────────────────────

/// Lifetime counters shared by the supervisor and its workers.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    workers_started: AtomicU64,
    sessions_opened: AtomicU64,
    messages_attempted: AtomicU64,
    messages_delivered: AtomicU64,
    messages_failed: AtomicU64,
}

impl DeliveryStats {
    pub(crate) fn record_worker(&self) {
        self.workers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt(&self) {
        self.messages_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            workers_started: self.workers_started.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            messages_attempted: self.messages_attempted.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub workers_started: u64,
    pub sessions_opened: u64,
    pub messages_attempted: u64,
    pub messages_delivered: u64,
    pub messages_failed: u64,
}

// ─── Supervisor ─────────────────────────────────────────────────────

/// Handle to the running supervisor task.
pub struct Supervisor {
    handle: JoinHandle<()>,
    stats: Arc<DeliveryStats>,
}

impl Supervisor {
    pub(crate) fn spawn(ctx: Arc<DeliveryContext>) -> Self {
        let stats = Arc::clone(&ctx.stats);
        let handle = tokio::spawn(supervise(ctx));
        Self { handle, stats }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait until the supervisor stops, which happens once the queue has
    /// closed and drained.
    pub async fn join(self) -> Result<(), JoinError> {
        self.handle.await
    }

    /// Stop supervising. A worker mid-send is left to finish on its own
    /// task; it is not restarted afterwards.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn supervise(ctx: Arc<DeliveryContext>) {
    let cooldown = ctx.settings.restart_cooldown();
    loop {
        ctx.stats.record_worker();
        let worker = tokio::spawn(run_worker(Arc::clone(&ctx)));

        match worker.await {
            Ok(Err(WorkerError::QueueClosed)) => {
                info!("Delivery queue closed, supervisor stopping");
                return;
            }
            Ok(Err(e)) => error!("Delivery worker terminated: {}", e),
            Ok(Ok(())) => warn!("Delivery worker returned unexpectedly"),
            Err(e) if e.is_panic() => {
                error!("Delivery worker panicked: {}", panic_message(e.into_panic()))
            }
            Err(e) => warn!("Delivery worker cancelled: {}", e),
        }

        warn!("Restarting delivery worker in {}s", cooldown.as_secs());
        sleep(cooldown).await;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = DeliveryStats::default();
        stats.record_worker();
        stats.record_session();
        stats.record_attempt();
        stats.record_attempt();
        stats.record_delivered();
        stats.record_failed();
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                workers_started: 1,
                sessions_opened: 1,
                messages_attempted: 2,
                messages_delivered: 1,
                messages_failed: 1,
            }
        );
    }

    #[test]
    fn panic_payloads() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic payload");
    }
}
