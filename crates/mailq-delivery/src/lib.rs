//! **mailq-delivery** — crash-resilient outbound mail queue.
//!
//! Producers [`submit`](DeliveryService::submit) messages and get a
//! [`Receipt`] back at once. A single supervised worker drains the queue
//! over one SMTP session at a time, pacing consecutive sends, and answers
//! every attempted message exactly once.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`message`] | Message value, notifier/receipt pair |
//! | [`settings`] | Server, security and queue settings |
//! | [`queue`] | Bounded FIFO with backpressure |
//! | [`session`] | `Connector` / `MailSession` seam and the SMTP implementation |
//! | `worker` | Idle / SessionOpen state machine (crate-private) |
//! | [`supervisor`] | Restart-after-cooldown loop, counters |
//! | [`service`] | `start`, `DeliveryService` |
//! | [`error`] | Error taxonomy |

pub mod error;
pub mod message;
pub mod queue;
pub mod service;
pub mod session;
pub mod settings;
pub mod supervisor;
mod worker;

pub use error::{ReceiptError, SendError, SessionOpenError, SettingsError, SubmitError, WorkerError};
pub use message::{receipt_channel, DeliveryResult, Message, Notifier, Receipt};
pub use service::{start, start_with_connector, DeliveryService};
pub use session::{Connector, MailSession, SmtpConnector};
pub use settings::{DeliverySettings, TransportSecurity};
pub use supervisor::{StatsSnapshot, Supervisor};
