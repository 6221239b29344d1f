//! YAML configuration for the `mailq` binary.
//!
//! ```yaml
//! email:
//!   host: smtp.example.com
//!   port: 587
//!   username: mailer@example.com
//!   password: app-password        # or MAILQ_SMTP_PASSWORD
//!   from: "Example <noreply@example.com>"
//! log:
//!   level: info
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use mailq_delivery::DeliverySettings;
use secrecy::Secret;
use serde::Deserialize;

/// Environment variable that overrides `email.password`.
pub const PASSWORD_ENV: &str = "MAILQ_SMTP_PASSWORD";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub email: DeliverySettings,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".into()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Read, parse and validate a configuration file, applying the
    /// password override from the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_yaml(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.override_password(std::env::var(PASSWORD_ENV).ok());
        config
            .email
            .validate()
            .with_context(|| format!("Invalid email settings in {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Replace the configured password when `value` is non-empty.
    pub fn override_password(&mut self, value: Option<String>) {
        if let Some(password) = value.filter(|p| !p.is_empty()) {
            self.email.password = Secret::new(password);
        }
    }
}
