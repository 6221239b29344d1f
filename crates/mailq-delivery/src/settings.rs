//! Process-wide delivery settings.

use std::time::Duration;

use mailq_smtp::{SmtpAuthMethod, SmtpConfig, SmtpCredentials, SmtpSecurity};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// How the session is protected. There is no plaintext mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportSecurity {
    /// Plain connect, then upgrade with STARTTLS (port 587).
    #[default]
    #[serde(rename = "starttls")]
    StartTls,
    /// TLS from the first byte (port 465).
    #[serde(rename = "implicit_tls")]
    ImplicitTls,
}

impl From<TransportSecurity> for SmtpSecurity {
    fn from(value: TransportSecurity) -> Self {
        match value {
            TransportSecurity::StartTls => SmtpSecurity::StartTls,
            TransportSecurity::ImplicitTls => SmtpSecurity::ImplicitTls,
        }
    }
}

/// Mail server connection and queue behaviour. Set once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Authentication is skipped when empty.
    #[serde(default)]
    pub username: String,
    #[serde(default = "empty_secret")]
    pub password: Secret<String>,
    /// Sender used when a submitted message has an empty `from`.
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub security: TransportSecurity,
    #[serde(default = "default_ehlo_domain")]
    pub ehlo_domain: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    /// Extra PEM bundle trusted on top of the webpki roots.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Pause between two sends on the same session.
    #[serde(default = "default_pacing_interval")]
    pub pacing_interval_ms: u64,
    /// Wait before a terminated worker is replaced.
    #[serde(default = "default_restart_cooldown")]
    pub restart_cooldown_secs: u64,
    #[serde(default)]
    pub auth_method: Option<SmtpAuthMethod>,
}

fn default_port() -> u16 {
    587
}
fn empty_secret() -> Secret<String> {
    Secret::new(String::new())
}
fn default_ehlo_domain() -> String {
    "localhost".into()
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_io_timeout() -> u64 {
    60
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_pacing_interval() -> u64 {
    2000
}
fn default_restart_cooldown() -> u64 {
    30
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: empty_secret(),
            from: String::new(),
            security: TransportSecurity::default(),
            ehlo_domain: default_ehlo_domain(),
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
            ca_cert_path: None,
            queue_capacity: default_queue_capacity(),
            pacing_interval_ms: default_pacing_interval(),
            restart_cooldown_secs: default_restart_cooldown(),
            auth_method: None,
        }
    }
}

impl DeliverySettings {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: Secret<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password,
            from: from.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.host.trim().is_empty() {
            return Err(SettingsError::MissingHost);
        }
        if self.port == 0 {
            return Err(SettingsError::InvalidPort);
        }
        if self.queue_capacity == 0 {
            return Err(SettingsError::ZeroCapacity);
        }
        Ok(())
    }

    pub fn pacing_interval(&self) -> Duration {
        Duration::from_millis(self.pacing_interval_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }

    /// Connection parameters for the SMTP engine.
    pub fn smtp_config(&self) -> SmtpConfig {
        SmtpConfig {
            host: self.host.clone(),
            port: self.port,
            security: self.security.into(),
            connect_timeout_secs: self.connect_timeout_secs,
            io_timeout_secs: self.io_timeout_secs,
            ehlo_domain: self.ehlo_domain.clone(),
            ca_cert_path: self.ca_cert_path.clone(),
        }
    }

    /// `None` when no username is configured.
    pub fn credentials(&self) -> Option<SmtpCredentials> {
        if self.username.is_empty() {
            return None;
        }
        Some(SmtpCredentials {
            username: self.username.clone(),
            password: self.password.expose_secret().clone(),
            method: self.auth_method,
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
