//! Shared vocabulary of the SMTP engine: errors, connection settings,
//! mailboxes, server replies and EHLO extensions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::encode_header_value;

// ─── Failures ───────────────────────────────────────────────────────

/// What went wrong, coarse enough for callers to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpErrorKind {
    /// A 4xx or 5xx answer to a command.
    ServerReply,
    /// The server refused the credentials.
    AuthFailure,
    /// STARTTLS unavailable or refused, or the handshake failed.
    TlsError,
    /// TCP connect failed or hit the connect timeout.
    ConnectionError,
    /// I/O error during socket read/write, or the peer went away.
    IoError,
    /// A sender or recipient address could not be parsed.
    InvalidAddress,
    /// The message itself is malformed (bad header name or value).
    MessageError,
    /// Unusable local settings, e.g. an unreadable CA bundle.
    ConfigError,
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error returned by every fallible engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpError {
    pub kind: SmtpErrorKind,
    pub message: String,
    /// Reply code when the failure came from the server.
    pub code: Option<u16>,
    /// RFC 3463 status such as `5.1.1`, when the server sent one.
    pub enhanced_code: Option<String>,
}

impl SmtpError {
    pub fn new(kind: SmtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            enhanced_code: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_enhanced(mut self, ec: Option<String>) -> Self {
        self.enhanced_code = ec;
        self
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConnectionError, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::AuthFailure, msg)
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TlsError, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::IoError, msg)
    }

    pub fn address(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidAddress, msg)
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::MessageError, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigError, msg)
    }

    /// Build an error from a negative server reply, keeping its codes.
    pub fn reply(reply: &SmtpReply, context: &str) -> Self {
        Self::new(
            SmtpErrorKind::ServerReply,
            format!("{}: {}", context, reply.text()),
        )
        .with_code(reply.code)
        .with_enhanced(reply.enhanced_code.clone())
    }

    /// Whether the underlying connection should be considered dead.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self.kind,
            SmtpErrorKind::IoError | SmtpErrorKind::ConnectionError | SmtpErrorKind::TlsError
        ) || self.code == Some(421)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} ({}): {}", self.kind, code, self.message)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for SmtpError {}

pub type SmtpResult<T> = Result<T, SmtpError>;

// ─── Modes ──────────────────────────────────────────────────────────

/// How the connection gets encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmtpSecurity {
    /// Unencrypted. Only meaningful for local relays and tests.
    None,
    /// STARTTLS upgrade after the greeting (port 587).
    #[default]
    StartTls,
    /// Implicit TLS from the first byte (SMTPS, port 465).
    ImplicitTls,
}

/// SASL mechanisms the engine can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpAuthMethod {
    Plain,
    Login,
}

impl fmt::Display for SmtpAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "PLAIN"),
            Self::Login => write!(f, "LOGIN"),
        }
    }
}

// ─── Connection settings ────────────────────────────────────────────

/// Where and how to reach the server.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// Hostname or IP of the SMTP server. Also the TLS server name.
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub connect_timeout_secs: u64,
    /// Bound on each read or write, in seconds.
    pub io_timeout_secs: u64,
    /// Name announced in EHLO/HELO.
    pub ehlo_domain: String,
    /// PEM bundle trusted in addition to the webpki roots.
    pub ca_cert_path: Option<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 587,
            security: SmtpSecurity::StartTls,
            connect_timeout_secs: 30,
            io_timeout_secs: 60,
            ehlo_domain: "localhost".into(),
            ca_cert_path: None,
        }
    }
}

/// Login for AUTH. `Debug` masks the password.
#[derive(Clone, Default)]
pub struct SmtpCredentials {
    pub username: String,
    pub password: String,
    /// Force a mechanism instead of picking one from the EHLO reply.
    pub method: Option<SmtpAuthMethod>,
}

impl fmt::Debug for SmtpCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("method", &self.method)
            .finish()
    }
}

// ─── Mailboxes ──────────────────────────────────────────────────────

/// A mailbox: bare `addr-spec` plus optional display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub name: Option<String>,
    /// `local@domain`, without angle brackets.
    pub address: String,
}

impl EmailAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    pub fn with_name(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
        }
    }

    /// Format as an RFC 5322 mailbox for the `From` / `To` headers.
    /// Non-ASCII display names are RFC 2047 encoded.
    pub fn to_mailbox(&self) -> String {
        match &self.name {
            Some(n) if !n.is_ascii() => format!("{} <{}>", encode_header_value(n), self.address),
            Some(n) => format!("\"{}\" <{}>", n.replace('\\', "\\\\").replace('"', "\\\""), self.address),
            None => format!("<{}>", self.address),
        }
    }

    /// Parse a mailbox string like `"Name" <addr>`, `Name <addr>` or `addr`.
    pub fn parse(input: &str) -> SmtpResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SmtpError::address("Empty address"));
        }

        let (name, address) = match (input.rfind('<'), input.rfind('>')) {
            (Some(lt), Some(gt)) if lt < gt && input[gt + 1..].trim().is_empty() => {
                let name_part = input[..lt].trim().trim_matches('"').trim();
                let name = if name_part.is_empty() {
                    None
                } else {
                    Some(name_part.replace("\\\"", "\"").replace("\\\\", "\\"))
                };
                (name, input[lt + 1..gt].trim())
            }
            (None, None) => (None, input),
            _ => {
                return Err(SmtpError::address(format!(
                    "Unbalanced angle brackets in address: {}",
                    input
                )))
            }
        };

        if !Self::is_valid_addr_spec(address) {
            return Err(SmtpError::address(format!("Invalid email address: {}", input)));
        }

        Ok(Self {
            name,
            address: address.to_string(),
        })
    }

    /// `local@domain`, one `@`, no whitespace, controls or brackets.
    fn is_valid_addr_spec(addr: &str) -> bool {
        let Some((local, domain)) = addr.split_once('@') else {
            return false;
        };
        let clean = |s: &str| {
            !s.is_empty()
                && !s.chars().any(|c| {
                    c.is_whitespace() || c.is_control() || matches!(c, '<' | '>' | '@' | ',' | ';')
                })
        };
        clean(local) && clean(domain) && !domain.starts_with('.') && !domain.ends_with('.')
    }

    /// Text after the `@`.
    pub fn domain(&self) -> Option<&str> {
        self.address.split_once('@').map(|(_, d)| d)
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_mailbox())
    }
}

// ─── Replies ────────────────────────────────────────────────────────

/// One complete server reply, all continuation lines joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    /// Leading RFC 3463 status of the first line, if present.
    pub enhanced_code: Option<String>,
    /// Text of each line with the code and separator stripped.
    pub lines: Vec<String>,
}

impl SmtpReply {
    /// 2xx.
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx, e.g. 354 after DATA or 334 during AUTH.
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// All lines joined for logs and error messages.
    pub fn text(&self) -> String {
        self.lines.join(" / ")
    }

    /// Parse `NNN text` / `NNN-text` lines. All lines must share one code.
    pub fn parse(raw: &str) -> SmtpResult<Self> {
        let mut code: Option<u16> = None;
        let mut lines = Vec::new();

        for line in raw.lines() {
            if line.len() < 3 {
                continue;
            }
            let c: u16 = line
                .get(..3)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| SmtpError::io(format!("Invalid reply code in: {}", line)))?;
            match code {
                None => code = Some(c),
                Some(first) if first != c => {
                    return Err(SmtpError::io(format!(
                        "Inconsistent reply codes {} and {}",
                        first, c
                    )))
                }
                _ => {}
            }
            lines.push(line.get(4..).unwrap_or("").to_string());
        }

        let code = code.ok_or_else(|| SmtpError::io("Empty SMTP reply"))?;
        let enhanced_code = lines.first().and_then(|l| Self::enhanced_prefix(l));
        Ok(SmtpReply {
            code,
            enhanced_code,
            lines,
        })
    }

    /// Extract a leading `d.d.d` enhanced status code (RFC 3463).
    fn enhanced_prefix(text: &str) -> Option<String> {
        let first = text.split_whitespace().next()?;
        let segments: Vec<&str> = first.split('.').collect();
        let well_formed = segments.len() == 3
            && segments
                .iter()
                .all(|s| !s.is_empty() && s.len() <= 3 && s.chars().all(|ch| ch.is_ascii_digit()))
            && matches!(segments[0], "2" | "4" | "5");
        well_formed.then(|| first.to_string())
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text())
    }
}

// ─── Extensions ─────────────────────────────────────────────────────

/// What the server advertised in its EHLO reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EhloCapabilities {
    /// First word of the first EHLO line.
    pub server_name: String,
    /// SIZE limit in bytes.
    pub max_size: Option<u64>,
    /// Supported auth mechanisms, upper-cased.
    pub auth_mechanisms: Vec<String>,
    pub starttls: bool,
    /// Every advertised keyword, upper-cased, in reply order.
    pub keywords: Vec<String>,
}

impl EhloCapabilities {
    pub fn parse(reply: &SmtpReply) -> Self {
        let mut caps = Self::default();
        let mut lines = reply.lines.iter();
        if let Some(first) = lines.next() {
            caps.server_name = first.split_whitespace().next().unwrap_or("").to_string();
        }
        for line in lines {
            let upper = line.to_uppercase();
            let (keyword, param) = upper.split_once(' ').unwrap_or((upper.as_str(), ""));
            caps.keywords.push(keyword.to_string());
            match keyword {
                "SIZE" => caps.max_size = param.trim().parse().ok(),
                // Some servers still announce the pre-RFC "AUTH=" form.
                "AUTH" => caps.auth_mechanisms = param.split_whitespace().map(str::to_string).collect(),
                k if k.starts_with("AUTH=") && caps.auth_mechanisms.is_empty() => {
                    caps.auth_mechanisms = k[5..]
                        .split_whitespace()
                        .chain(param.split_whitespace())
                        .map(str::to_string)
                        .collect();
                }
                "STARTTLS" => caps.starttls = true,
                _ => {}
            }
        }
        caps
    }

    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.auth_mechanisms.iter().any(|m| m.eq_ignore_ascii_case(mechanism))
    }

    pub fn advertises(&self, keyword: &str) -> bool {
        self.keywords.iter().any(|k| k.eq_ignore_ascii_case(keyword))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
