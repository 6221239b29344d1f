//! SMTP authentication (PLAIN and LOGIN).
//!
//! Payloads are base64 encoded and never logged; the debug log only shows
//! the mechanism name.

use base64::Engine;
use log::debug;

use crate::client::SmtpClient;
use crate::types::*;

/// Authenticate with the SMTP server using the given credentials.
/// Picks the mechanism from the EHLO capabilities unless `creds.method`
/// is set.
pub async fn authenticate(client: &mut SmtpClient, creds: &SmtpCredentials) -> SmtpResult<()> {
    let method = select_auth_method(client.capabilities(), creds);
    debug!("Authenticating as {} with {}", creds.username, method);

    match method {
        SmtpAuthMethod::Plain => auth_plain(client, creds).await,
        SmtpAuthMethod::Login => auth_login(client, creds).await,
    }
}

/// Explicit choice first, then PLAIN, then LOGIN; PLAIN when the server
/// advertises nothing usable.
fn select_auth_method(caps: Option<&EhloCapabilities>, creds: &SmtpCredentials) -> SmtpAuthMethod {
    if let Some(m) = creds.method {
        return m;
    }
    match caps {
        Some(c) if !c.supports_auth("PLAIN") && c.supports_auth("LOGIN") => SmtpAuthMethod::Login,
        _ => SmtpAuthMethod::Plain,
    }
}

// ── AUTH PLAIN ──────────────────────────────────────────────────────

async fn auth_plain(client: &mut SmtpClient, creds: &SmtpCredentials) -> SmtpResult<()> {
    let payload = build_plain_payload(&creds.username, &creds.password);
    let reply = client
        .secret_command(&format!("AUTH PLAIN {}", payload), "AUTH PLAIN ****")
        .await?;
    finish(client, reply, "AUTH PLAIN failed")
}

// ── AUTH LOGIN ──────────────────────────────────────────────────────

/// Challenge-response: base64 username, then base64 password.
async fn auth_login(client: &mut SmtpClient, creds: &SmtpCredentials) -> SmtpResult<()> {
    let reply = client.command("AUTH LOGIN").await?;
    if !reply.is_intermediate() {
        return Err(rejected(&reply, "AUTH LOGIN rejected"));
    }

    let user_b64 = b64(&creds.username);
    let reply = client.secret_command(&user_b64, "****").await?;
    if !reply.is_intermediate() {
        return Err(rejected(&reply, "AUTH LOGIN username rejected"));
    }

    let pass_b64 = b64(&creds.password);
    let reply = client.secret_command(&pass_b64, "****").await?;
    finish(client, reply, "AUTH LOGIN password rejected")
}

fn finish(client: &mut SmtpClient, reply: SmtpReply, context: &str) -> SmtpResult<()> {
    if reply.is_positive() {
        client.set_authenticated(true);
        Ok(())
    } else {
        Err(rejected(&reply, context))
    }
}

fn rejected(reply: &SmtpReply, context: &str) -> SmtpError {
    SmtpError::auth(format!("{}: {}", context, reply))
        .with_code(reply.code)
        .with_enhanced(reply.enhanced_code.clone())
}

fn b64(value: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
}

/// Build the AUTH PLAIN initial response (`\0user\0password`, base64).
pub fn build_plain_payload(username: &str, password: &str) -> String {
    b64(&format!("\0{}\0{}", username, password))
}

// ─── Tests ──────────────────────────────────────────────────────────
