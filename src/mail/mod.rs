//! Mail retrieval: wire types, the connector/session seam, IMAP and parsing.

pub mod imap;
pub mod parser;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Account;
use crate::error::MailError;

pub use imap::{ImapClient, ImapConnector, ImapSession};
pub use parser::parse_message;

/// Mailbox metadata reported by SELECT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    /// `* n EXISTS`
    pub messages: u32,
    /// `[UIDNEXT n]`, 0 when the server did not report it.
    pub uid_next: u32,
}

/// One message as delivered by a FETCH response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedMessage {
    pub uid: u32,
    /// Full RFC 822 bytes (`BODY[]`).
    pub raw: Vec<u8>,
}

/// Outcome of a single FETCH command.
///
/// `items` is everything the server delivered before the command ended;
/// `completion` says how it ended. Consumers handle every item before
/// looking at `completion`.
#[derive(Debug)]
pub struct FetchBatch {
    pub items: Vec<FetchedMessage>,
    pub completion: Result<(), MailError>,
}

impl FetchBatch {
    pub fn complete(items: Vec<FetchedMessage>) -> Self {
        Self {
            items,
            completion: Ok(()),
        }
    }

    pub fn failed(items: Vec<FetchedMessage>, err: MailError) -> Self {
        Self {
            items,
            completion: Err(err),
        }
    }

    /// All-or-nothing view used by on-demand queries.
    pub fn into_result(self) -> Result<Vec<FetchedMessage>, MailError> {
        self.completion.map(|()| self.items)
    }
}

/// A parsed message, shared by the dispatcher, the history log and queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredMessage {
    pub account: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    #[serde(rename = "date")]
    pub timestamp: Option<DateTime<Utc>>,
    pub body: String,
    #[serde(skip)]
    pub summary: String,
    pub uid: u32,
}

/// Opens connections to a mail server.
#[async_trait]
pub trait MailConnector: Send + Sync {
    /// Connect and consume the server greeting.
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailSession>, MailError>;
}

/// One open, stateful connection.
#[async_trait]
pub trait MailSession: Send {
    async fn login(&mut self, account: &Account) -> Result<(), MailError>;

    /// Announce the client (IMAP ID). Some providers refuse SELECT without it.
    async fn identify(&mut self) -> Result<(), MailError>;

    async fn select_inbox(&mut self) -> Result<MailboxStatus, MailError>;

    /// UID of the message at sequence number `seq`, if any.
    async fn uid_at(&mut self, seq: u32) -> Result<Option<u32>, MailError>;

    /// Messages with UID strictly greater than `after` (`1:*` when 0).
    async fn fetch_after_uid(&mut self, after: u32) -> FetchBatch;

    /// Messages with sequence numbers `start..=end`.
    async fn fetch_sequence(&mut self, start: u32, end: u32) -> FetchBatch;

    /// Best-effort LOGOUT.
    async fn logout(&mut self);
}
