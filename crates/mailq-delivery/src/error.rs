//! Error taxonomy of the delivery queue.

use mailq_smtp::{SmtpError, SmtpErrorKind};

use crate::message::Message;

// ─── Session open ───────────────────────────────────────────────────

/// Why a transport session could not be opened. Always fatal to the
/// attempt; no partial session survives.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionOpenError {
    #[error("could not reach mail server: {0}")]
    Connect(SmtpError),

    #[error("TLS negotiation failed: {0}")]
    SecurityNegotiation(SmtpError),

    #[error("authentication rejected: {0}")]
    Authentication(SmtpError),
}

impl SessionOpenError {
    pub fn cause(&self) -> &SmtpError {
        match self {
            Self::Connect(e) | Self::SecurityNegotiation(e) | Self::Authentication(e) => e,
        }
    }
}

// ─── Per-message send ───────────────────────────────────────────────

/// Failure of one message. Only [`SendError::Transport`] ends the session.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// `from` or `to` is not a valid mailbox.
    #[error("invalid address: {0}")]
    Address(SmtpError),

    /// A header name or value would corrupt the header block.
    #[error("invalid message content: {0}")]
    Content(SmtpError),

    /// The server answered 4xx/5xx.
    #[error("rejected by server: {0}")]
    Rejected(SmtpError),

    #[error("transport failure: {0}")]
    Transport(SmtpError),
}

impl SendError {
    /// Sort an engine error into the per-message taxonomy.
    pub fn from_smtp(err: SmtpError) -> Self {
        match err.kind {
            SmtpErrorKind::InvalidAddress => Self::Address(err),
            SmtpErrorKind::MessageError => Self::Content(err),
            _ if err.is_connection_fault() => Self::Transport(err),
            _ => Self::Rejected(err),
        }
    }

    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn cause(&self) -> &SmtpError {
        match self {
            Self::Address(e) | Self::Content(e) | Self::Rejected(e) | Self::Transport(e) => e,
        }
    }

    /// Reply code of a server rejection, if any.
    pub fn code(&self) -> Option<u16> {
        self.cause().code
    }
}

// ─── Submission ─────────────────────────────────────────────────────

/// The queue refused a message; it is handed back untouched.
#[derive(thiserror::Error, Debug)]
pub enum SubmitError {
    #[error("delivery queue is closed")]
    Closed(Message),

    #[error("delivery queue is full")]
    Full(Message),
}

impl SubmitError {
    pub fn into_message(self) -> Message {
        match self {
            Self::Closed(m) | Self::Full(m) => m,
        }
    }
}

/// What a producer observes on its receipt.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiptError {
    #[error(transparent)]
    Send(#[from] SendError),

    /// The worker dropped the message without attempting it, which
    /// happens when opening the session for it failed.
    #[error("message was abandoned before a send was attempted")]
    Abandoned,
}

// ─── Startup ────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("mail server host must not be empty")]
    MissingHost,

    #[error("mail server port must be non-zero")]
    InvalidPort,

    #[error("queue capacity must be non-zero")]
    ZeroCapacity,
}

// ─── Worker ─────────────────────────────────────────────────────────

/// Why a worker iteration ended.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error(transparent)]
    Open(#[from] SessionOpenError),

    /// Every producer handle is gone and the backlog is drained.
    #[error("delivery queue closed")]
    QueueClosed,
}
