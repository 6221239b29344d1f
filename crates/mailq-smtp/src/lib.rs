//! **mailq-smtp** — SMTP submission engine.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Error type, configuration, addresses, replies, EHLO capabilities |
//! | [`client`] | Protocol engine (EHLO, STARTTLS, MAIL/RCPT/DATA, RSET, QUIT) |
//! | [`auth`] | AUTH PLAIN / AUTH LOGIN |
//! | [`message`] | Header block, RFC 2047 encoding, body encoding |

pub mod auth;
pub mod client;
pub mod message;
pub mod types;

pub use client::SmtpClient;
pub use message::{encode_body, encode_header_value, render_message, HeaderMap, TransferEncoding};
pub use types::*;
