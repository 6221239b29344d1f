//! Transport session: one live, secured, authenticated SMTP connection.
//!
//! The worker only sees the [`Connector`] / [`MailSession`] pair, so the
//! queue machinery runs the same against a real server or a scripted fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use mailq_smtp::auth::authenticate;
use mailq_smtp::{
    encode_body, encode_header_value, render_message, EmailAddress, HeaderMap, SmtpClient,
    SmtpConfig, SmtpCredentials, SmtpError, SmtpErrorKind, SmtpSecurity, TransferEncoding,
};
use uuid::Uuid;

use crate::error::{SendError, SessionOpenError};
use crate::message::Message;
use crate::settings::DeliverySettings;

// ─── Seam ───────────────────────────────────────────────────────────

/// Opens transport sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect, secure and authenticate. Either a fully usable session or
    /// an error; a half-open connection is never returned.
    async fn open(&self, settings: &DeliverySettings) -> Result<Box<dyn MailSession>, SessionOpenError>;
}

/// A session able to carry any number of messages, one at a time.
#[async_trait]
pub trait MailSession: Send {
    /// Run one complete mail transaction.
    async fn send_one(&mut self, message: &Message) -> Result<(), SendError>;

    /// Whether further messages may go through this session. Turns false
    /// once the connection is known to be dead.
    fn is_reusable(&self) -> bool {
        true
    }

    /// QUIT and drop the connection, or just drop it once it is known to be
    /// dead. Idempotent; never fails.
    async fn close(&mut self);
}

// ─── SMTP implementation ────────────────────────────────────────────

/// The production connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmtpConnector;

#[async_trait]
impl Connector for SmtpConnector {
    async fn open(&self, settings: &DeliverySettings) -> Result<Box<dyn MailSession>, SessionOpenError> {
        let client = establish(settings.smtp_config(), settings.credentials()).await?;
        Ok(Box::new(SmtpSession::new(client)))
    }
}

/// Connect, read the greeting, EHLO, secure the channel and authenticate.
/// Credentials are only sent once TLS is up (or on an explicitly plain
/// engine configuration, which settings never produce).
pub(crate) async fn establish(
    config: SmtpConfig,
    credentials: Option<SmtpCredentials>,
) -> Result<SmtpClient, SessionOpenError> {
    let security = config.security;
    let mut client = SmtpClient::new(config);

    client.connect().await.map_err(|e| match e.kind {
        SmtpErrorKind::TlsError => SessionOpenError::SecurityNegotiation(e),
        _ => SessionOpenError::Connect(e),
    })?;
    let caps = client.ehlo().await.map_err(SessionOpenError::Connect)?;

    if security == SmtpSecurity::StartTls {
        if !caps.starttls {
            return Err(SessionOpenError::SecurityNegotiation(SmtpError::tls(
                "Server does not advertise STARTTLS",
            )));
        }
        client
            .starttls()
            .await
            .map_err(SessionOpenError::SecurityNegotiation)?;
    }

    if let Some(creds) = credentials {
        authenticate(&mut client, &creds)
            .await
            .map_err(SessionOpenError::Authentication)?;
    }

    info!(
        "Mail session open to {}:{} (tls: {}, authenticated: {})",
        client.config().host,
        client.config().port,
        client.is_tls_active(),
        client.is_authenticated()
    );
    Ok(client)
}

/// A session over a live [`SmtpClient`].
pub struct SmtpSession {
    client: SmtpClient,
    broken: bool,
}

impl SmtpSession {
    pub(crate) fn new(client: SmtpClient) -> Self {
        Self {
            client,
            broken: false,
        }
    }

    pub fn messages_sent(&self) -> u64 {
        self.client.messages_sent()
    }

    async fn transaction(&mut self, from: &str, to: &str, payload: &str) -> Result<(), SmtpError> {
        self.client.mail_from(from).await?;
        self.client.rcpt_to(to).await?;
        self.client.data(payload).await?;
        Ok(())
    }
}

#[async_trait]
impl MailSession for SmtpSession {
    async fn send_one(&mut self, message: &Message) -> Result<(), SendError> {
        let from = EmailAddress::parse(&message.from).map_err(SendError::Address)?;
        let to = EmailAddress::parse(&message.to).map_err(SendError::Address)?;

        let (body, encoding) = encode_body(&message.body);
        let message_id = message_id_for(&from, &self.client.config().ehlo_domain);
        let headers = compose_headers(message, &from, &to, encoding, Utc::now(), &message_id)?;
        let payload = render_message(&headers, &body);
        self.client.check_size(payload.len()).map_err(SendError::Content)?;

        let err = match self.transaction(&from.address, &to.address, &payload).await {
            Ok(()) => {
                debug!("Sent {} to {}", message_id, to.address);
                return Ok(());
            }
            Err(e) => SendError::from_smtp(e),
        };

        match &err {
            SendError::Rejected(_) => {
                if let Err(reset) = self.client.reset().await {
                    warn!("RSET after rejection failed: {}", reset);
                    if reset.is_connection_fault() {
                        self.broken = true;
                    }
                }
            }
            SendError::Transport(_) => self.broken = true,
            _ => {}
        }
        Err(err)
    }

    fn is_reusable(&self) -> bool {
        !self.broken && self.client.is_connected()
    }

    async fn close(&mut self) {
        if !self.client.is_connected() {
            return;
        }
        let sent = self.client.messages_sent();
        if self.broken {
            self.client.disconnect();
            info!("Dropped broken mail session after {} message(s)", sent);
            return;
        }
        match self.client.quit().await {
            Ok(()) => info!("Mail session closed after {} message(s)", sent),
            Err(e) => debug!("QUIT failed while closing mail session: {}", e),
        }
    }
}

// ─── Header composition ─────────────────────────────────────────────

fn message_id_for(from: &EmailAddress, fallback_domain: &str) -> String {
    let domain = from.domain().unwrap_or(fallback_domain);
    format!("<{}@{}>", Uuid::new_v4(), domain)
}

/// Default header set overlaid with the message's own headers.
///
/// Explicit headers replace defaults of the same name (case-insensitive)
/// and keep their position; non-colliding defaults always survive.
pub(crate) fn compose_headers(
    message: &Message,
    from: &EmailAddress,
    to: &EmailAddress,
    encoding: TransferEncoding,
    date: DateTime<Utc>,
    message_id: &str,
) -> Result<HeaderMap, SendError> {
    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", "text/plain; charset=\"utf-8\"");
    headers.insert("To", to.to_mailbox());
    headers.insert("From", from.to_mailbox());
    headers.insert("Subject", encode_header_value(&message.subject));
    headers.insert("MIME-Version", "1.0");
    headers.insert("Content-Transfer-Encoding", encoding.to_string());
    headers.insert("Date", date.to_rfc2822());
    headers.insert("Message-ID", message_id);

    for (name, value) in &message.additional_headers {
        headers.insert(name.as_str(), encode_header_value(value));
    }

    headers.validate().map_err(SendError::Content)?;
    Ok(headers)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    // ── Header composition ─────────────────────────────────────

    fn compose(message: &Message) -> Result<HeaderMap, SendError> {
        let from = EmailAddress::parse(&message.from).unwrap();
        let to = EmailAddress::parse(&message.to).unwrap();
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        compose_headers(message, &from, &to, TransferEncoding::SevenBit, date, "<id@x.com>")
    }

    #[test]
    fn default_headers() {
        let msg = Message::new("b@x.com", "Hi", "Hello").with_from("a@x.com");
        let headers = compose(&msg).unwrap();
        assert_eq!(headers.get("content-type"), Some("text/plain; charset=\"utf-8\""));
        assert_eq!(headers.get("To"), Some("<b@x.com>"));
        assert_eq!(headers.get("From"), Some("<a@x.com>"));
        assert_eq!(headers.get("Subject"), Some("Hi"));
        assert_eq!(headers.get("MIME-Version"), Some("1.0"));
        assert_eq!(headers.get("Content-Transfer-Encoding"), Some("7bit"));
        assert_eq!(headers.get("Date"), Some("Fri, 1 Mar 2024 12:00:00 +0000"));
        assert_eq!(headers.get("Message-ID"), Some("<id@x.com>"));
        assert_eq!(headers.len(), 8);
    }

    #[test]
    fn additional_header_overrides_default_by_name() {
        let msg = Message::new("b@x.com", "Hi", "Hello")
            .with_from("a@x.com")
            .with_header("content-type", "text/html; charset=\"utf-8\"")
            .with_header("X-Campaign", "spring");
        let headers = compose(&msg).unwrap();
        assert_eq!(headers.get("Content-Type"), Some("text/html; charset=\"utf-8\""));
        assert_eq!(headers.get("X-Campaign"), Some("spring"));
        assert_eq!(headers.get("Subject"), Some("Hi"));
        assert_eq!(headers.len(), 9);
        let rendered = headers.to_string();
        assert_eq!(rendered.matches("ontent-").count(), 2, "{}", rendered);
    }

    #[test]
    fn later_additional_header_wins() {
        let msg = Message::new("b@x.com", "Hi", "Hello")
            .with_from("a@x.com")
            .with_header("Reply-To", "first@x.com")
            .with_header("reply-to", "second@x.com");
        let headers = compose(&msg).unwrap();
        assert_eq!(headers.get("Reply-To"), Some("second@x.com"));
    }

    #[test]
    fn header_injection_is_a_content_error() {
        let msg = Message::new("b@x.com", "Hi", "Hello")
            .with_from("a@x.com")
            .with_header("X-Evil", "x\r\nBcc: victim@x.com");
        assert!(matches!(compose(&msg), Err(SendError::Content(_))));

        let msg = Message::new("b@x.com", "Hi", "Hello")
            .with_from("a@x.com")
            .with_header("Bad Name:", "x");
        assert!(matches!(compose(&msg), Err(SendError::Content(_))));
    }

    #[test]
    fn non_ascii_subject_is_encoded() {
        let msg = Message::new("b@x.com", "Grüße", "Hello").with_from("a@x.com");
        let headers = compose(&msg).unwrap();
        let subject = headers.get("Subject").unwrap();
        assert!(subject.starts_with("=?UTF-8?B?"));
        assert!(subject.is_ascii());
    }

    #[test]
    fn message_id_uses_sender_domain() {
        let from = EmailAddress::parse("a@mail.x.com").unwrap();
        let id = message_id_for(&from, "localhost");
        assert!(id.starts_with('<') && id.ends_with("@mail.x.com>"));
    }

    // ── Wire level against a plain-text peer ───────────────────

    #[derive(Clone, Copy)]
    struct Peer {
        ehlo: &'static str,
        starttls: &'static str,
        auth: &'static str,
        reject_rcpt: Option<&'static str>,
    }

    impl Default for Peer {
        fn default() -> Self {
            Self {
                ehlo: "250-peer.test\r\n250-AUTH PLAIN LOGIN\r\n250 8BITMIME",
                starttls: "454 4.7.0 TLS not available",
                auth: "235 2.7.0 Authentication successful",
                reject_rcpt: None,
            }
        }
    }

    /// Answers by verb until QUIT or hangup; returns every line received.
    async fn spawn_peer(peer: Peer) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut reader = BufReader::new(read);
            let mut seen = Vec::new();
            let mut in_data = false;
            if write.write_all(b"220 peer.test ESMTP\r\n").await.is_err() {
                return seen;
            }
            loop {
                let mut raw = Vec::new();
                match reader.read_until(b'\n', &mut raw).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let line = String::from_utf8_lossy(&raw).trim_end().to_string();
                seen.push(line.clone());
                let reply = if in_data {
                    if line != "." {
                        continue;
                    }
                    in_data = false;
                    "250 2.0.0 queued".to_string()
                } else {
                    let verb = line.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
                    match verb.as_str() {
                        "EHLO" => peer.ehlo.to_string(),
                        "HELO" => "250 peer.test".into(),
                        "STARTTLS" => peer.starttls.to_string(),
                        "AUTH" => peer.auth.to_string(),
                        "MAIL" | "RSET" | "NOOP" => "250 2.0.0 Ok".into(),
                        "RCPT" => match peer.reject_rcpt {
                            Some(addr) if line.contains(addr) => "550 5.1.1 No such user".into(),
                            _ => "250 2.1.5 Ok".into(),
                        },
                        "DATA" => {
                            in_data = true;
                            "354 go ahead".into()
                        }
                        "QUIT" => {
                            let _ = write.write_all(b"221 2.0.0 Bye\r\n").await;
                            break;
                        }
                        _ => "502 5.5.2 Unknown command".into(),
                    }
                };
                if write.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                    break;
                }
            }
            seen
        });
        (port, handle)
    }

    fn plain_config(port: u16) -> SmtpConfig {
        SmtpConfig {
            host: "127.0.0.1".into(),
            port,
            security: SmtpSecurity::None,
            connect_timeout_secs: 5,
            io_timeout_secs: 5,
            ehlo_domain: "client.test".into(),
            ca_cert_path: None,
        }
    }

    fn creds() -> Option<SmtpCredentials> {
        Some(SmtpCredentials {
            username: "mailer".into(),
            password: "hunter2".into(),
            method: None,
        })
    }

    #[tokio::test]
    async fn batch_over_one_session() {
        let (port, peer) = spawn_peer(Peer::default()).await;
        let client = establish(plain_config(port), creds()).await.unwrap();
        assert!(client.is_authenticated());
        let mut session = SmtpSession::new(client);

        let first = Message::new("b@x.com", "Hi", "Hello\n.dot").with_from("Alice <a@x.com>");
        let second = Message::new("c@x.com", "Again", "Hello again").with_from("a@x.com");
        session.send_one(&first).await.unwrap();
        session.send_one(&second).await.unwrap();
        assert_eq!(session.messages_sent(), 2);
        assert!(session.is_reusable());

        session.close().await;
        session.close().await;
        assert!(!session.is_reusable());

        let seen = peer.await.unwrap();
        assert!(seen.iter().any(|l| l == "MAIL FROM:<a@x.com>"));
        assert!(seen.iter().any(|l| l == "RCPT TO:<b@x.com>"));
        assert!(seen.iter().any(|l| l == "RCPT TO:<c@x.com>"));
        assert!(seen.iter().any(|l| l == "From: \"Alice\" <a@x.com>"));
        assert!(seen.iter().any(|l| l == "..dot"));
        assert_eq!(seen.iter().filter(|l| l.starts_with("AUTH")).count(), 1);
        assert_eq!(seen.last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn rejection_resets_and_keeps_session() {
        let (port, peer) = spawn_peer(Peer {
            reject_rcpt: Some("nobody@x.com"),
            ..Default::default()
        })
        .await;
        let client = establish(plain_config(port), None).await.unwrap();
        let mut session = SmtpSession::new(client);

        let bad = Message::new("nobody@x.com", "Hi", "Hello").with_from("a@x.com");
        let err = session.send_one(&bad).await.unwrap_err();
        assert!(matches!(err, SendError::Rejected(_)));
        assert_eq!(err.code(), Some(550));
        assert!(session.is_reusable());

        let good = Message::new("b@x.com", "Hi", "Hello").with_from("a@x.com");
        session.send_one(&good).await.unwrap();
        session.close().await;

        let seen = peer.await.unwrap();
        let rcpt = seen.iter().position(|l| l == "RCPT TO:<nobody@x.com>").unwrap();
        assert_eq!(seen[rcpt + 1], "RSET");
    }

    #[tokio::test]
    async fn bad_address_never_reaches_the_wire() {
        let (port, peer) = spawn_peer(Peer::default()).await;
        let client = establish(plain_config(port), None).await.unwrap();
        let mut session = SmtpSession::new(client);

        let msg = Message::new("not-an-address", "Hi", "Hello").with_from("a@x.com");
        let err = session.send_one(&msg).await.unwrap_err();
        assert!(matches!(err, SendError::Address(_)));
        assert!(session.is_reusable());
        session.close().await;

        let seen = peer.await.unwrap();
        assert!(!seen.iter().any(|l| l.starts_with("MAIL")));
    }

    #[tokio::test]
    async fn oversized_message_is_refused_before_the_envelope() {
        let (port, peer) = spawn_peer(Peer {
            ehlo: "250-peer.test\r\n250 SIZE 1024",
            ..Default::default()
        })
        .await;
        let client = establish(plain_config(port), None).await.unwrap();
        let mut session = SmtpSession::new(client);

        let big = Message::new("b@x.com", "Hi", "x".repeat(4096)).with_from("a@x.com");
        let err = session.send_one(&big).await.unwrap_err();
        assert!(matches!(err, SendError::Content(_)));
        assert!(session.is_reusable());

        let small = Message::new("b@x.com", "Hi", "Hello").with_from("a@x.com");
        session.send_one(&small).await.unwrap();
        session.close().await;

        let seen = peer.await.unwrap();
        assert_eq!(seen.iter().filter(|l| l.starts_with("MAIL")).count(), 1);
    }

    #[tokio::test]
    async fn silent_server_is_dropped_without_quit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut reader = BufReader::new(read);
            write.write_all(b"220 peer.test ESMTP\r\n").await.unwrap();
            let mut seen = Vec::new();
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let line = line.trim_end().to_string();
                if line.starts_with("EHLO") {
                    write.write_all(b"250 peer.test\r\n").await.unwrap();
                }
                seen.push(line);
            }
            seen
        });

        let config = SmtpConfig {
            io_timeout_secs: 1,
            ..plain_config(port)
        };
        let client = establish(config, None).await.unwrap();
        let mut session = SmtpSession::new(client);

        let msg = Message::new("b@x.com", "Hi", "Hello").with_from("a@x.com");
        let err = session.send_one(&msg).await.unwrap_err();
        assert!(matches!(err, SendError::Transport(_)));
        assert!(!session.is_reusable());

        tokio::time::timeout(std::time::Duration::from_millis(500), session.close())
            .await
            .expect("closing a dead session must not wait for a reply");

        let seen = peer.await.unwrap();
        assert!(seen.iter().any(|l| l == "MAIL FROM:<a@x.com>"));
        assert!(!seen.iter().any(|l| l == "QUIT"));
    }

    struct PlainPeerConnector(u16);

    #[async_trait]
    impl Connector for PlainPeerConnector {
        async fn open(&self, _settings: &DeliverySettings) -> Result<Box<dyn MailSession>, SessionOpenError> {
            let client = establish(plain_config(self.0), None).await?;
            Ok(Box::new(SmtpSession::new(client)))
        }
    }

    #[tokio::test]
    async fn queued_message_reaches_the_wire_with_default_sender() {
        let (port, peer) = spawn_peer(Peer::default()).await;
        let settings = DeliverySettings::new("127.0.0.1", port, "", secrecy::Secret::new(String::new()), "a@x.com");
        let (service, _supervisor) =
            crate::service::start_with_connector(settings, PlainPeerConnector(port)).unwrap();

        let message = Message::new("b@x.com", "Hi", "Hello").with_header("Content-Type", "text/html; charset=\"utf-8\"");
        let receipt = service.submit(message).await.unwrap();
        receipt.wait().await.unwrap();

        let seen = peer.await.unwrap();
        assert!(seen.iter().any(|l| l == "MAIL FROM:<a@x.com>"));
        assert!(seen.iter().any(|l| l == "RCPT TO:<b@x.com>"));
        assert!(seen.iter().any(|l| l == "From: <a@x.com>"));
        assert!(seen.iter().any(|l| l == "Content-Type: text/html; charset=\"utf-8\""));
        assert!(!seen.iter().any(|l| l.starts_with("Content-Type: text/plain")));
        assert!(seen.iter().any(|l| l == "Hello"));
    }

    #[tokio::test]
    async fn missing_starttls_is_a_security_failure() {
        let (port, peer) = spawn_peer(Peer::default()).await;
        let config = SmtpConfig {
            security: SmtpSecurity::StartTls,
            ..plain_config(port)
        };
        let err = establish(config, creds()).await.unwrap_err();
        assert!(matches!(err, SessionOpenError::SecurityNegotiation(_)));
        let seen = peer.await.unwrap();
        assert!(!seen.iter().any(|l| l.starts_with("AUTH")));
    }

    #[tokio::test]
    async fn refused_starttls_is_a_security_failure() {
        let (port, peer) = spawn_peer(Peer {
            ehlo: "250-peer.test\r\n250-STARTTLS\r\n250 AUTH PLAIN",
            ..Default::default()
        })
        .await;
        let config = SmtpConfig {
            security: SmtpSecurity::StartTls,
            ..plain_config(port)
        };
        let err = establish(config, creds()).await.unwrap_err();
        assert!(matches!(err, SessionOpenError::SecurityNegotiation(_)));
        let seen = peer.await.unwrap();
        assert!(!seen.iter().any(|l| l.starts_with("AUTH")));
    }

    #[tokio::test]
    async fn implicit_tls_against_plain_server_fails_negotiation() {
        let (port, _peer) = spawn_peer(Peer::default()).await;
        let config = SmtpConfig {
            security: SmtpSecurity::ImplicitTls,
            ..plain_config(port)
        };
        let err = establish(config, creds()).await.unwrap_err();
        assert!(matches!(err, SessionOpenError::SecurityNegotiation(_)));
    }

    #[tokio::test]
    async fn rejected_credentials() {
        let (port, _peer) = spawn_peer(Peer {
            auth: "535 5.7.8 Authentication credentials invalid",
            ..Default::default()
        })
        .await;
        let err = establish(plain_config(port), creds()).await.unwrap_err();
        match err {
            SessionOpenError::Authentication(cause) => assert_eq!(cause.code, Some(535)),
            other => panic!("expected Authentication, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connect_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = establish(plain_config(port), None).await.unwrap_err();
        assert!(matches!(err, SessionOpenError::Connect(_)));
    }
}
