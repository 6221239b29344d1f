//! Command-line front end.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mailq_delivery::{start, Message, ReceiptError};
use tracing::{error, info};

use crate::config::AppConfig;
use crate::logging;

#[derive(Parser, Debug)]
#[command(name = "mailq")]
#[command(about = "Queue outbound mail through a supervised SMTP worker")]
pub struct Cli {
    #[arg(long, short, default_value = "mailq.yaml", help = "Config file path")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Queue one message and wait for the delivery result.
    Send(SendArgs),
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[arg(long, help = "Recipient address")]
    pub to: String,

    #[arg(long, help = "Subject line")]
    pub subject: String,

    #[arg(long, help = "Sender address (defaults to email.from)")]
    pub from: Option<String>,

    #[arg(
        long = "header",
        value_name = "NAME:VALUE",
        value_parser = parse_header,
        help = "Extra header, repeatable"
    )]
    pub headers: Vec<(String, String)>,

    #[arg(long, help = "Message body (read from stdin when omitted)")]
    pub body: Option<String>,

    #[arg(long, default_value_t = 120, help = "Give up waiting for the result after this many seconds")]
    pub timeout_secs: u64,
}

impl SendArgs {
    /// Build the message, reading the body from `stdin` when `--body` is absent.
    pub fn into_message(self, stdin: impl Read) -> Result<Message> {
        let body = match self.body {
            Some(body) => body,
            None => read_body(stdin)?,
        };
        let mut message = Message::new(self.to, self.subject, body);
        if let Some(from) = self.from {
            message = message.with_from(from);
        }
        message.additional_headers = self.headers;
        Ok(message)
    }
}

fn read_body(mut stdin: impl Read) -> Result<String> {
    let mut body = String::new();
    stdin
        .read_to_string(&mut body)
        .context("Failed to read message body from stdin")?;
    Ok(body)
}

/// Parse `Name: Value` (the space after the colon is optional).
pub fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got {:?}", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {:?}", raw));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Entry point shared by `main`.
pub async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(&cli.config)?;
    logging::init(&config.log)?;

    match cli.command {
        Command::CheckConfig => {
            let email = &config.email;
            println!(
                "Configuration OK: {}:{} ({:?}), queue capacity {}, pacing {} ms, restart cooldown {} s",
                email.host,
                email.port,
                email.security,
                email.queue_capacity,
                email.pacing_interval_ms,
                email.restart_cooldown_secs
            );
            Ok(())
        }
        Command::Send(args) => {
            let timeout = Duration::from_secs(args.timeout_secs);
            let message = args.into_message(std::io::stdin().lock())?;
            send(config, message, timeout).await
        }
    }
}

async fn send(config: AppConfig, message: Message, timeout: Duration) -> Result<()> {
    let to = message.to.clone();
    let (service, supervisor) = start(config.email)?;
    let receipt = service
        .submit(message)
        .await
        .map_err(|e| anyhow!("Could not queue message: {}", e))?;
    info!(receipt = %receipt.id(), "Message to {} queued", to);

    let outcome = tokio::time::timeout(timeout, receipt.wait()).await;
    let stats = supervisor.stats();
    info!(stats = %serde_json::to_string(&stats)?, "Delivery finished");

    match outcome {
        Ok(Ok(())) => {
            println!("Delivered to {}", to);
            Ok(())
        }
        Ok(Err(ReceiptError::Send(e))) => {
            error!("Delivery to {} failed: {}", to, e);
            bail!("Delivery to {} failed: {}", to, e)
        }
        Ok(Err(ReceiptError::Abandoned)) => {
            bail!("Message to {} was dropped: the mail session could not be opened", to)
        }
        Err(_) => bail!("No delivery result for {} after {} s", to, timeout.as_secs()),
    }
}
