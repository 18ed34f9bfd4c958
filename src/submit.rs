//! Outbound mail over implicit-TLS SMTP.

use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MessageBuilder};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::info;

use crate::config::Account;
use crate::error::SubmitError;

const DEFAULT_SMTP_PORT: u16 = 465;
const SMTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

/// Send a plain-text message from `account`.
pub async fn send_mail(account: &Account, req: SendRequest) -> Result<(), SubmitError> {
    let message = build_message(account, &req)?;
    let (host, port) = smtp_host_port(&account.smtp_host);
    let creds = Credentials::new(
        account.email.clone(),
        account.auth_token.expose_secret().to_string(),
    );
    let recipients = req.to.len() + req.cc.len();
    let from = account.email.clone();

    tokio::task::spawn_blocking(move || {
        let transport = SmtpTransport::relay(&host)
            .map_err(|e| SubmitError::Transport(format!("SMTP relay error: {e}")))?
            .port(port)
            .credentials(creds)
            .timeout(Some(SMTP_TIMEOUT))
            .build();
        transport
            .send(&message)
            .map_err(|e| SubmitError::Transport(e.to_string()))
    })
    .await
    .map_err(|e| SubmitError::Join(e.to_string()))??;

    info!(from = %from, recipients, "email sent");
    Ok(())
}

/// Validate the request and assemble the RFC 5322 message.
pub fn build_message(account: &Account, req: &SendRequest) -> Result<Message, SubmitError> {
    let to = mailboxes(&req.to)?;
    if to.is_empty() {
        return Err(SubmitError::NoRecipients);
    }
    if !account.has_smtp_credentials() {
        return Err(SubmitError::IncompleteAccount {
            email: account.email.clone(),
        });
    }

    let mut builder: MessageBuilder = Message::builder()
        .from(parse_mailbox(&account.email)?)
        .subject(req.subject.as_str())
        .header(ContentType::TEXT_PLAIN);
    for mailbox in to {
        builder = builder.to(mailbox);
    }
    for mailbox in mailboxes(&req.cc)? {
        builder = builder.cc(mailbox);
    }

    builder
        .body(req.body.clone())
        .map_err(|e| SubmitError::Build(e.to_string()))
}

fn mailboxes(addrs: &[String]) -> Result<Vec<Mailbox>, SubmitError> {
    addrs
        .iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .map(parse_mailbox)
        .collect()
}

fn parse_mailbox(addr: &str) -> Result<Mailbox, SubmitError> {
    addr.trim()
        .parse()
        .map_err(|e: lettre::address::AddressError| SubmitError::InvalidAddress {
            address: addr.to_string(),
            reason: e.to_string(),
        })
}

fn smtp_host_port(addr: &str) -> (String, u16) {
    let addr = addr.trim();
    if let Some((host, port)) = addr.rsplit_once(':')
        && let Ok(port) = port.parse::<u16>()
    {
        return (host.to_string(), port);
    }
    (addr.to_string(), DEFAULT_SMTP_PORT)
}
