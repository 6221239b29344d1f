//! **mailq** — application shell around [`mailq_delivery`].
//!
//! | Module | Purpose |
//! |---|---|
//! | [`config`] | YAML configuration, password override |
//! | [`logging`] | `tracing-subscriber` setup |
//! | [`cli`] | `send` / `check-config` commands |

pub mod cli;
pub mod config;
pub mod logging;
