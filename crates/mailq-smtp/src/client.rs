//! SMTP submission client.
//!
//! Drives one connection from greeting to QUIT: EHLO negotiation, the
//! STARTTLS upgrade (or TLS from the first byte), the MAIL/RCPT/DATA
//! transaction and RSET. Every read and write is bounded by the
//! configured I/O timeout.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::types::*;

// ─── Wire ───────────────────────────────────────────────────────────

/// The socket under the client, before or after the TLS upgrade.
enum Wire {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

impl Wire {
    async fn read_line(&mut self, buf: &mut String) -> std::io::Result<usize> {
        match self {
            Self::Plain(r) => r.read_line(buf).await,
            Self::Tls(r) => r.read_line(buf).await,
        }
    }

    async fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(r) => {
                let w = r.get_mut();
                w.write_all(data).await?;
                w.flush().await
            }
            Self::Tls(r) => {
                let w = r.get_mut();
                w.write_all(data).await?;
                w.flush().await
            }
        }
    }
}

// ─── SmtpClient ─────────────────────────────────────────────────────

/// One SMTP connection and its negotiated state.
pub struct SmtpClient {
    wire: Option<Wire>,
    config: SmtpConfig,
    capabilities: Option<EhloCapabilities>,
    tls_active: bool,
    authenticated: bool,
    messages_sent: u64,
}

impl fmt::Debug for SmtpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpClient")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connected", &self.wire.is_some())
            .field("tls_active", &self.tls_active)
            .field("authenticated", &self.authenticated)
            .field("messages_sent", &self.messages_sent)
            .finish()
    }
}

impl SmtpClient {
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            wire: None,
            config,
            capabilities: None,
            tls_active: false,
            authenticated: false,
            messages_sent: 0,
        }
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Capabilities from the latest EHLO, cleared by a TLS upgrade.
    pub fn capabilities(&self) -> Option<&EhloCapabilities> {
        self.capabilities.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.wire.is_some()
    }

    pub fn is_tls_active(&self) -> bool {
        self.tls_active
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Messages accepted by the server on this connection.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    // ── Session setup ───────────────────────────────────────────

    /// Open the TCP connection and read the 220 greeting.
    ///
    /// For [`SmtpSecurity::ImplicitTls`] the handshake happens before the
    /// greeting and its failure is a `TlsError`.
    pub async fn connect(&mut self) -> SmtpResult<SmtpReply> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        debug!("Connecting to {}", addr);

        let limit = Duration::from_secs(self.config.connect_timeout_secs);
        let tcp = match tokio::time::timeout(limit, TcpStream::connect(&addr)).await {
            Err(_) => return Err(SmtpError::connection(format!("Timed out connecting to {}", addr))),
            Ok(Err(e)) => return Err(SmtpError::connection(format!("Cannot connect to {}: {}", addr, e))),
            Ok(Ok(tcp)) => tcp,
        };

        self.wire = Some(if self.config.security == SmtpSecurity::ImplicitTls {
            let tls = self.tls_handshake(tcp).await?;
            self.tls_active = true;
            Wire::Tls(Box::new(BufReader::new(tls)))
        } else {
            Wire::Plain(BufReader::new(tcp))
        });

        let greeting = self.read_reply().await?;
        if !greeting.is_positive() {
            self.wire = None;
            self.tls_active = false;
            return Err(SmtpError::reply(&greeting, "Greeting refused"));
        }
        info!("Connected to {} ({})", addr, greeting.text());
        Ok(greeting)
    }

    /// Say EHLO and record the advertised extensions. Servers that reject
    /// EHLO get HELO and an empty capability set.
    pub async fn ehlo(&mut self) -> SmtpResult<EhloCapabilities> {
        let hello = format!("EHLO {}", self.config.ehlo_domain);
        let reply = self.command(&hello).await?;
        let caps = if reply.is_positive() {
            EhloCapabilities::parse(&reply)
        } else {
            debug!("EHLO refused with {}, falling back to HELO", reply.code);
            let hello = format!("HELO {}", self.config.ehlo_domain);
            let reply = self.command(&hello).await?;
            if !reply.is_positive() {
                return Err(SmtpError::reply(&reply, "HELO refused"));
            }
            EhloCapabilities {
                server_name: reply.lines.first().cloned().unwrap_or_default(),
                ..Default::default()
            }
        };
        self.capabilities = Some(caps.clone());
        Ok(caps)
    }

    /// Upgrade a plain connection with STARTTLS and repeat EHLO over the
    /// encrypted channel (RFC 3207 §4.2). A no-op once TLS is active.
    pub async fn starttls(&mut self) -> SmtpResult<()> {
        if self.tls_active {
            return Ok(());
        }
        let reply = self.command("STARTTLS").await?;
        if !reply.is_positive() {
            return Err(SmtpError::tls(format!("STARTTLS refused: {}", reply)).with_code(reply.code));
        }

        let tcp = match self.wire.take() {
            Some(Wire::Plain(reader)) => {
                // Bytes already buffered here were sent before the handshake
                // and must not be trusted as part of the TLS session.
                if !reader.buffer().is_empty() {
                    return Err(SmtpError::tls("Unexpected data before TLS handshake"));
                }
                reader.into_inner()
            }
            Some(tls @ Wire::Tls(_)) => {
                self.wire = Some(tls);
                self.tls_active = true;
                return Ok(());
            }
            None => return Err(SmtpError::io("Not connected")),
        };

        let tls = self.tls_handshake(tcp).await?;
        self.wire = Some(Wire::Tls(Box::new(BufReader::new(tls))));
        self.tls_active = true;
        self.capabilities = None;
        info!("Connection to {} upgraded to TLS", self.config.host);

        self.ehlo().await?;
        Ok(())
    }

    /// Send QUIT and drop the socket. Calling it again does nothing.
    pub async fn quit(&mut self) -> SmtpResult<()> {
        let outcome = match self.wire {
            Some(_) => self.command("QUIT").await.map(|_| ()),
            None => Ok(()),
        };
        self.disconnect();
        outcome
    }

    /// Drop the socket without QUIT, for connections that stopped answering.
    pub fn disconnect(&mut self) {
        self.wire = None;
        self.tls_active = false;
        self.authenticated = false;
        self.capabilities = None;
    }

    /// Refuse payloads over the server's SIZE limit (RFC 1870) before any
    /// envelope command is sent. A limit of 0 means none.
    pub fn check_size(&self, payload_len: usize) -> SmtpResult<()> {
        match self.capabilities.as_ref().and_then(|c| c.max_size) {
            Some(limit) if limit > 0 && payload_len as u64 > limit => Err(SmtpError::message(format!(
                "Message of {} bytes exceeds the server limit of {} bytes",
                payload_len, limit
            ))),
            _ => Ok(()),
        }
    }

    // ── Envelope and content ────────────────────────────────────

    pub async fn mail_from(&mut self, sender: &str) -> SmtpResult<SmtpReply> {
        let reply = self.command(&format!("MAIL FROM:<{}>", sender)).await?;
        expect_positive(reply, || format!("MAIL FROM <{}> refused", sender))
    }

    pub async fn rcpt_to(&mut self, recipient: &str) -> SmtpResult<SmtpReply> {
        let reply = self.command(&format!("RCPT TO:<{}>", recipient)).await?;
        expect_positive(reply, || format!("RCPT TO <{}> refused", recipient))
    }

    /// DATA, then the dot-stuffed payload and the lone `.` terminator.
    /// Resolves with the server's final verdict on the message.
    pub async fn data(&mut self, payload: &str) -> SmtpResult<SmtpReply> {
        let reply = self.command("DATA").await?;
        if !reply.is_intermediate() {
            return Err(SmtpError::reply(&reply, "DATA refused"));
        }

        let mut stream = dot_stuff(payload);
        stream.push_str(".\r\n");
        self.write_raw(stream.as_bytes()).await?;

        let verdict = expect_positive(self.read_reply().await?, || "Message refused".to_string())?;
        self.messages_sent += 1;
        Ok(verdict)
    }

    /// Abort the current transaction so the next MAIL FROM starts clean.
    pub async fn reset(&mut self) -> SmtpResult<SmtpReply> {
        let reply = self.command("RSET").await?;
        expect_positive(reply, || "RSET refused".to_string())
    }

    pub async fn noop(&mut self) -> SmtpResult<SmtpReply> {
        self.command("NOOP").await
    }

    pub(crate) fn set_authenticated(&mut self, auth: bool) {
        self.authenticated = auth;
    }

    // ── Wire ────────────────────────────────────────────────────

    /// Write one command line and wait for its reply.
    pub async fn command(&mut self, cmd: &str) -> SmtpResult<SmtpReply> {
        self.secret_command(cmd, cmd).await
    }

    /// Like [`command`](Self::command) but logs `shown` instead of the
    /// real line, for AUTH payloads.
    pub(crate) async fn secret_command(&mut self, cmd: &str, shown: &str) -> SmtpResult<SmtpReply> {
        debug!("C: {}", shown);
        self.write_raw(format!("{}\r\n", cmd).as_bytes()).await?;
        self.read_reply().await
    }

    /// Collect reply lines until one without the `-` continuation mark.
    pub async fn read_reply(&mut self) -> SmtpResult<SmtpReply> {
        let limit = Duration::from_secs(self.config.io_timeout_secs);
        let wire = self.wire.as_mut().ok_or_else(|| SmtpError::io("Not connected"))?;

        let mut raw = String::new();
        loop {
            let mut line = String::new();
            let read = match tokio::time::timeout(limit, wire.read_line(&mut line)).await {
                Err(_) => return Err(SmtpError::io("Timed out waiting for server reply")),
                Ok(Err(e)) => return Err(SmtpError::io(format!("Reading reply failed: {}", e))),
                Ok(Ok(n)) => n,
            };
            if read == 0 {
                return Err(SmtpError::io("Connection closed by server"));
            }
            debug!("S: {}", line.trim_end());
            let last = line.as_bytes().get(3) != Some(&b'-');
            raw.push_str(&line);
            if last {
                break;
            }
        }
        SmtpReply::parse(&raw)
    }

    /// Write bytes and flush, bounded by the I/O timeout.
    pub async fn write_raw(&mut self, data: &[u8]) -> SmtpResult<()> {
        let limit = Duration::from_secs(self.config.io_timeout_secs);
        let wire = self.wire.as_mut().ok_or_else(|| SmtpError::io("Not connected"))?;
        match tokio::time::timeout(limit, wire.send(data)).await {
            Err(_) => Err(SmtpError::io("Timed out writing to server")),
            Ok(Err(e)) => Err(SmtpError::io(format!("Writing to server failed: {}", e))),
            Ok(Ok(())) => Ok(()),
        }
    }

    // ── TLS ─────────────────────────────────────────────────────

    /// Trust store: webpki roots plus the optional PEM bundle.
    async fn root_store(&self) -> SmtpResult<rustls::RootCertStore> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let Some(path) = self.config.ca_cert_path.as_deref() else {
            return Ok(roots);
        };
        let pem = tokio::fs::read(path)
            .await
            .map_err(|e| SmtpError::config(format!("Cannot read CA bundle {}: {}", path, e)))?;
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut Cursor::new(pem)) {
            let cert = cert.map_err(|e| SmtpError::config(format!("Malformed certificate in {}: {}", path, e)))?;
            roots
                .add(cert)
                .map_err(|e| SmtpError::config(format!("Rejected certificate in {}: {}", path, e)))?;
            added += 1;
        }
        if added == 0 {
            warn!("CA bundle {} holds no certificates", path);
        }
        Ok(roots)
    }

    async fn tls_handshake(&self, tcp: TcpStream) -> SmtpResult<TlsStream<TcpStream>> {
        let roots = self.root_store().await?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| SmtpError::tls(format!("Unusable TLS configuration: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = rustls::pki_types::ServerName::try_from(self.config.host.clone())
            .map_err(|e| SmtpError::tls(format!("{} is not a valid TLS server name: {}", self.config.host, e)))?;

        let limit = Duration::from_secs(self.config.connect_timeout_secs);
        let connector = TlsConnector::from(Arc::new(tls_config));
        match tokio::time::timeout(limit, connector.connect(server_name, tcp)).await {
            Err(_) => Err(SmtpError::tls("Timed out during TLS handshake")),
            Ok(Err(e)) => Err(SmtpError::tls(format!("TLS handshake with {} failed: {}", self.config.host, e))),
            Ok(Ok(tls)) => Ok(tls),
        }
    }
}

fn expect_positive(reply: SmtpReply, context: impl FnOnce() -> String) -> SmtpResult<SmtpReply> {
    if reply.is_positive() {
        Ok(reply)
    } else {
        Err(SmtpError::reply(&reply, &context()))
    }
}

// ─── Dot-stuffing ───────────────────────────────────────────────────

/// CRLF-terminate every line and double a leading `.` (RFC 5321 §4.5.2).
fn dot_stuff(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len() + 64);
    for line in payload.lines() {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

// ─── Tests ──────────────────────────────────────────────────────────
