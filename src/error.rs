//! Error types for mail-watch.

use std::path::PathBuf;

/// Configuration and account-directory errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Could not resolve home directory")]
    NoHomeDir,

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to serialize configuration: {0}")]
    SerializeError(String),

    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Account already exists: {0}")]
    AccountExists(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// IMAP transport, authentication and protocol errors.
///
/// Every variant is retryable from the point of view of a monitoring session.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Login failed: {0}")]
    Auth(String),

    #[error("Mailbox selection failed: {0}")]
    Select(String),

    #[error("Command {command} failed: {status}")]
    Command { command: String, status: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed by server")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-message parse errors. Recovered locally by skipping the message.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Message {uid} has no body")]
    EmptyBody { uid: u32 },
}

/// Webhook delivery errors. Reported, never retried.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Webhook not configured: {0}")]
    NotConfigured(String),

    #[error("Webhook request failed: {0}")]
    Request(String),

    #[error("Webhook returned status {status}")]
    Status { status: u16 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced synchronously by the monitor manager's on-demand paths.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("IMAP connection info is incomplete for {email}")]
    IncompleteAccount { email: String },

    #[error(transparent)]
    Mail(#[from] MailError),
}

/// Outbound SMTP submission errors.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Recipient list is empty")]
    NoRecipients,

    #[error("SMTP account info is incomplete for {email}")]
    IncompleteAccount { email: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("SMTP send failed: {0}")]
    Transport(String),

    #[error("SMTP task panicked: {0}")]
    Join(String),
}
