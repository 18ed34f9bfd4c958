//! In-memory mail server and dispatcher shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mail_watch::config::Account;
use mail_watch::error::{DispatchError, MailError};
use mail_watch::mail::{
    FetchBatch, FetchedMessage, MailConnector, MailSession, MailboxStatus, StructuredMessage,
};
use mail_watch::notify::Dispatcher;

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// RFC 822 text with an optional `Date:` header.
pub fn raw_mail(subject: &str, date: Option<DateTime<Utc>>) -> Vec<u8> {
    let date = date
        .map(|d| format!("Date: {}\r\n", d.to_rfc2822()))
        .unwrap_or_default();
    format!(
        "From: Sender <sender@example.com>\r\nTo: me@example.com\r\nSubject: {subject}\r\n{date}\r\n{subject} body\r\n"
    )
    .into_bytes()
}

#[derive(Default)]
pub struct FakeMailbox {
    pub messages: Vec<FetchedMessage>,
    pub uid_next: u32,
    pub reject_login: bool,
}

/// Mailboxes keyed by lowercased account email.
#[derive(Default)]
pub struct FakeServer {
    mailboxes: Mutex<HashMap<String, Arc<Mutex<FakeMailbox>>>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_mailbox(&self, email: &str, mailbox: FakeMailbox) {
        self.mailboxes
            .lock()
            .unwrap()
            .insert(email.to_lowercase(), Arc::new(Mutex::new(mailbox)));
    }

    /// Deliver a new message; assigns and returns the next UID.
    pub fn deliver(&self, email: &str, raw: Vec<u8>) -> u32 {
        let mailbox = self.mailboxes.lock().unwrap()[&email.to_lowercase()].clone();
        let mut mailbox = mailbox.lock().unwrap();
        let uid = mailbox.uid_next.max(1);
        mailbox.uid_next = uid + 1;
        mailbox.messages.push(FetchedMessage { uid, raw });
        uid
    }
}

#[async_trait]
impl MailConnector for FakeServer {
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailSession>, MailError> {
        let mailbox = self
            .mailboxes
            .lock()
            .unwrap()
            .get(&account.email.to_lowercase())
            .cloned()
            .ok_or_else(|| MailError::Connect {
                host: account.imap_host.clone(),
                reason: "connection refused".into(),
            })?;
        Ok(Box::new(FakeSession { mailbox }))
    }
}

struct FakeSession {
    mailbox: Arc<Mutex<FakeMailbox>>,
}

#[async_trait]
impl MailSession for FakeSession {
    async fn login(&mut self, _account: &Account) -> Result<(), MailError> {
        if self.mailbox.lock().unwrap().reject_login {
            return Err(MailError::Auth("NO [AUTHENTICATIONFAILED] invalid credentials".into()));
        }
        Ok(())
    }

    async fn identify(&mut self) -> Result<(), MailError> {
        Ok(())
    }

    async fn select_inbox(&mut self) -> Result<MailboxStatus, MailError> {
        let mailbox = self.mailbox.lock().unwrap();
        Ok(MailboxStatus {
            messages: mailbox.messages.len() as u32,
            uid_next: mailbox.uid_next,
        })
    }

    async fn uid_at(&mut self, seq: u32) -> Result<Option<u32>, MailError> {
        let mailbox = self.mailbox.lock().unwrap();
        Ok(mailbox
            .messages
            .get(seq.saturating_sub(1) as usize)
            .map(|m| m.uid))
    }

    async fn fetch_after_uid(&mut self, after: u32) -> FetchBatch {
        let mailbox = self.mailbox.lock().unwrap();
        FetchBatch::complete(
            mailbox
                .messages
                .iter()
                .filter(|m| m.uid > after)
                .cloned()
                .collect(),
        )
    }

    async fn fetch_sequence(&mut self, start: u32, end: u32) -> FetchBatch {
        let mailbox = self.mailbox.lock().unwrap();
        let start = start.saturating_sub(1) as usize;
        let end = (end as usize).min(mailbox.messages.len());
        FetchBatch::complete(mailbox.messages[start..end].to_vec())
    }

    async fn logout(&mut self) {}
}

/// Records every dispatched message.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub sent: Mutex<Vec<StructuredMessage>>,
}

impl RecordingDispatcher {
    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.subject.clone())
            .collect()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: &StructuredMessage) -> Result<(), DispatchError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// An enabled account with IMAP details filled in.
pub fn account(email: &str, enabled: bool) -> Account {
    let mut account = Account::new("qq", email, "token");
    account.imap_host = "imap.example.com:993".into();
    account.smtp_host = "smtp.example.com:465".into();
    account.enabled = enabled;
    account
}

/// Poll `cond` every 10ms until it holds.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
