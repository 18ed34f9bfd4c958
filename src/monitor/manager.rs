//! Registry of running sessions plus the on-demand mailbox queries.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::history::{HistoryEntry, HistoryLog};
use super::session::{SessionSettings, run_session};
use crate::accounts::AccountBook;
use crate::config::{Account, identity_key};
use crate::error::{MailError, MonitorError};
use crate::mail::{MailConnector, MailSession, StructuredMessage, parse_message};
use crate::notify::Dispatcher;

/// How many extra messages "since" queries fetch before filtering. A
/// heuristic: a busy mailbox can still push in-window mail past the cut.
pub const OVERFETCH_FACTOR: usize = 2;

struct RunningSession {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct MonitorManager {
    accounts: Arc<AccountBook>,
    connector: Arc<dyn MailConnector>,
    dispatcher: Arc<dyn Dispatcher>,
    history: Arc<HistoryLog>,
    settings: SessionSettings,
    running: Mutex<HashMap<String, RunningSession>>,
}

impl MonitorManager {
    pub fn new(
        accounts: Arc<AccountBook>,
        connector: Arc<dyn MailConnector>,
        dispatcher: Arc<dyn Dispatcher>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            accounts,
            connector,
            dispatcher,
            history: Arc::new(HistoryLog::default()),
            settings,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, RunningSession>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start every enabled account.
    pub fn start_all(&self, parent: &CancellationToken) {
        for account in self.accounts.enabled() {
            self.start_account(parent, account);
        }
    }

    /// Spawn a session for `account` unless one is already registered.
    pub fn start_account(&self, parent: &CancellationToken, account: Account) -> bool {
        if !account.has_imap_credentials() {
            warn!(email = %account.email, "imap connection info is incomplete, not monitoring");
            return false;
        }

        let key = account.identity();
        let mut running = self.registry();
        if running.contains_key(&key) {
            debug!(email = %account.email, "already monitoring");
            return false;
        }

        info!(email = %account.email, "monitoring starting");
        let token = parent.child_token();
        let task = tokio::spawn(run_session(
            account,
            Arc::clone(&self.connector),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.history),
            self.settings,
            token.clone(),
        ));
        running.insert(key, RunningSession { token, task });
        true
    }

    /// Cancel the session for `email`, if any.
    pub fn stop_account(&self, email: &str) {
        let removed = self.registry().remove(&identity_key(email));
        if let Some(session) = removed {
            info!(email = %email, "monitoring stopping");
            session.token.cancel();
        }
    }

    pub fn is_monitoring(&self, email: &str) -> bool {
        self.registry().contains_key(&identity_key(email))
    }

    pub fn monitoring_count(&self) -> usize {
        self.registry().len()
    }

    /// Recent history plus the total stored.
    pub fn logs(&self, limit: usize) -> (Vec<HistoryEntry>, usize) {
        (self.history.list(limit), self.history.total())
    }

    /// Cancel every session and wait for them to exit.
    pub async fn shutdown(&self) {
        let sessions: Vec<RunningSession> = self.registry().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "stopping all monitoring sessions");
        for session in &sessions {
            session.token.cancel();
        }
        for session in sessions {
            if let Err(e) = session.task.await {
                warn!(error = %e, "monitoring task ended abnormally");
            }
        }
    }

    /// Connect, log in and announce the client on a fresh connection.
    async fn open(&self, account: &Account) -> Result<Box<dyn MailSession>, MailError> {
        let mut session = self.connector.connect(account).await?;
        session.login(account).await?;
        if let Err(e) = session.identify().await {
            warn!(email = %account.email, error = %e, "imap id command failed");
        }
        Ok(session)
    }

    /// The last `count` messages in INBOX, in mailbox order.
    pub async fn get_latest_emails(
        &self,
        account: &Account,
        count: usize,
    ) -> Result<Vec<StructuredMessage>, MonitorError> {
        ensure_complete(account)?;
        let mut session = self.open(account).await?;
        let result = latest_from(session.as_mut(), account, count).await;
        session.logout().await;
        Ok(result?)
    }

    /// Newest-first messages no older than `window` (zero means any age).
    pub async fn get_latest_emails_since(
        &self,
        account: &Account,
        count: usize,
        window: Duration,
    ) -> Result<Vec<StructuredMessage>, MonitorError> {
        let count = count.max(1);
        let mut emails = self
            .get_latest_emails(account, count.saturating_mul(OVERFETCH_FACTOR))
            .await?;
        sort_emails(&mut emails);
        filter_by_since(&mut emails, window);
        emails.truncate(count);
        Ok(emails)
    }

    /// Newest-first merge across every enabled account. Failing accounts are
    /// logged and left out.
    pub async fn get_latest_emails_all(&self, count: usize) -> Vec<StructuredMessage> {
        let count = count.max(1);
        let per_account = count.saturating_mul(OVERFETCH_FACTOR);
        let accounts = self.accounts.enabled();

        let results = join_all(
            accounts
                .iter()
                .map(|account| self.get_latest_emails(account, per_account)),
        )
        .await;

        let mut combined = Vec::new();
        for (account, result) in accounts.iter().zip(results) {
            match result {
                Ok(emails) => combined.extend(emails),
                Err(e) => warn!(email = %account.email, error = %e, "fetch latest emails failed"),
            }
        }

        sort_emails(&mut combined);
        combined.truncate(count);
        combined
    }

    pub async fn get_latest_emails_all_since(
        &self,
        count: usize,
        window: Duration,
    ) -> Vec<StructuredMessage> {
        let count = count.max(1);
        let mut emails = self
            .get_latest_emails_all(count.saturating_mul(OVERFETCH_FACTOR))
            .await;
        filter_by_since(&mut emails, window);
        emails.truncate(count);
        emails
    }

    /// Time to connect, log in and select INBOX.
    pub async fn test_connection(&self, account: &Account) -> Result<Duration, MonitorError> {
        ensure_complete(account)?;
        let start = Instant::now();
        let mut session = self.open(account).await.inspect_err(|e| {
            warn!(email = %account.email, error = %e, "imap test login failed");
        })?;

        if let Err(e) = session.select_inbox().await {
            warn!(email = %account.email, error = %e, "imap test select failed");
            session.logout().await;
            return Err(e.into());
        }
        let latency = start.elapsed();
        session.logout().await;

        info!(
            email = %account.email,
            latency_ms = latency.as_millis() as u64,
            "imap test connection ok"
        );
        Ok(latency)
    }
}

fn ensure_complete(account: &Account) -> Result<(), MonitorError> {
    if account.has_imap_credentials() {
        Ok(())
    } else {
        Err(MonitorError::IncompleteAccount {
            email: account.email.clone(),
        })
    }
}

async fn latest_from(
    session: &mut dyn MailSession,
    account: &Account,
    count: usize,
) -> Result<Vec<StructuredMessage>, MailError> {
    let status = session.select_inbox().await?;
    if status.messages == 0 || count == 0 {
        debug!(email = %account.email, messages = status.messages, "no emails found");
        return Ok(Vec::new());
    }

    let count = count.min(status.messages as usize) as u32;
    let start = status.messages - count + 1;
    debug!(
        email = %account.email,
        start_seq = start,
        end_seq = status.messages,
        "fetching emails by sequence"
    );

    let items = session.fetch_sequence(start, status.messages).await.into_result()?;
    Ok(items
        .iter()
        .filter_map(|item| match parse_message(&account.email, item) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(email = %account.email, uid = item.uid, error = %e, "parse email failed");
                None
            }
        })
        .collect())
}

/// Newest first; undated messages last, ordered by descending UID.
pub fn sort_emails(emails: &mut [StructuredMessage]) {
    emails.sort_by(|a, b| match (a.timestamp, b.timestamp) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.uid.cmp(&a.uid),
    });
}

/// Keep only dated messages no older than `window`. Zero keeps everything.
pub fn filter_by_since(emails: &mut Vec<StructuredMessage>, window: Duration) {
    if window.is_zero() {
        return;
    }
    let cutoff = chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| Utc::now().checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    emails.retain(|e| e.timestamp.is_some_and(|t| t >= cutoff));
}
