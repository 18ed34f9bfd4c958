//! One account's monitoring loop.
//!
//! A session connects, logs in, selects INBOX, picks a baseline UID and then
//! polls for anything newer until its token is cancelled. Any transport
//! failure drops the connection, waits `retry_delay` and starts over with a
//! fresh baseline. Every await point races the cancellation token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::history::{HistoryEntry, HistoryLog};
use crate::config::{Account, DEFAULT_POLL_INTERVAL};
use crate::error::MailError;
use crate::mail::{FetchBatch, MailConnector, MailSession, MailboxStatus, parse_message};
use crate::notify::Dispatcher;

/// Fixed pause before reconnecting after a failure.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Highest UID this session has handled. Never moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint(u32);

impl Checkpoint {
    pub fn new(uid: u32) -> Self {
        Self(uid)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn advance(&mut self, uid: u32) {
        self.0 = self.0.max(uid);
    }
}

/// Outcome of one cancellable step.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    Retryable(MailError),
    Cancelled,
}

impl<T> From<Result<T, MailError>> for Attempt<T> {
    fn from(res: Result<T, MailError>) -> Self {
        match res {
            Ok(v) => Attempt::Success(v),
            Err(e) => Attempt::Retryable(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    SelectingMailbox,
    EstablishingBaseline,
    Polling,
    Sleeping,
    Backoff,
    Terminated,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub retry_delay: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Counters for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub fetched: usize,
    pub parsed: usize,
    pub delivered: usize,
    pub skipped: usize,
}

/// Run `fut` unless `token` fires first.
async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Attempt<T>
where
    F: Future<Output = Result<T, MailError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Attempt::Cancelled,
        res = fut => res.into(),
    }
}

/// Sleep for `duration`; false when cancelled first.
async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Last UID that counts as already seen when the session starts.
pub async fn establish_baseline(
    session: &mut dyn MailSession,
    status: MailboxStatus,
) -> Result<u32, MailError> {
    if status.uid_next > 1 {
        return Ok(status.uid_next - 1);
    }
    if status.messages == 0 {
        return Ok(0);
    }
    Ok(session.uid_at(status.messages).await?.unwrap_or(0))
}

/// Handle every item of a fetch, then report how the fetch ended.
///
/// Items are processed in UID order. Anything at or below the checkpoint is
/// skipped; a message that fails to parse is skipped without advancing.
pub async fn process_batch(
    account: &str,
    checkpoint: &mut Checkpoint,
    batch: FetchBatch,
    dispatcher: &dyn Dispatcher,
    history: &HistoryLog,
) -> Result<BatchSummary, MailError> {
    let FetchBatch {
        mut items,
        completion,
    } = batch;
    items.sort_by_key(|item| item.uid);

    let mut summary = BatchSummary::default();
    for item in &items {
        if item.uid == 0 {
            continue;
        }
        summary.fetched += 1;
        if item.uid <= checkpoint.get() {
            debug!(email = %account, uid = item.uid, last_uid = checkpoint.get(), "skip old message");
            summary.skipped += 1;
            continue;
        }

        let mut msg = match parse_message(account, item) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(email = %account, uid = item.uid, error = %e, "parse email failed");
                continue;
            }
        };
        summary.parsed += 1;
        let received_at = *msg.timestamp.get_or_insert_with(Utc::now);

        info!(
            email = %account,
            uid = msg.uid,
            from = %msg.from,
            subject = %msg.subject,
            "new email received"
        );

        match dispatcher.dispatch(&msg).await {
            Ok(()) => {
                debug!(email = %account, uid = msg.uid, "notification delivered");
                summary.delivered += 1;
            }
            Err(e) => warn!(email = %account, uid = msg.uid, error = %e, "notification failed"),
        }

        history.add(HistoryEntry {
            from: msg.from,
            subject: msg.subject,
            received_at,
            summary: msg.summary,
        });
        checkpoint.advance(item.uid);
    }

    if summary.fetched > 0 {
        info!(
            email = %account,
            fetched = summary.fetched,
            parsed = summary.parsed,
            delivered = summary.delivered,
            skipped = summary.skipped,
            last_uid = checkpoint.get(),
            "fetch summary"
        );
    }

    completion.map(|()| summary)
}

/// Monitor `account` until `token` is cancelled.
pub async fn run_session(
    account: Account,
    connector: Arc<dyn MailConnector>,
    dispatcher: Arc<dyn Dispatcher>,
    history: Arc<HistoryLog>,
    settings: SessionSettings,
    token: CancellationToken,
) {
    let email = account.email.clone();
    info!(email = %email, "monitoring started");

    let mut state = SessionState::Connecting;
    let mut conn: Option<Box<dyn MailSession>> = None;
    let mut mailbox = MailboxStatus::default();
    // Set once per session; reconnects resume from it.
    let mut checkpoint: Option<Checkpoint> = None;

    loop {
        debug!(email = %email, state = ?state, "session step");
        state = match state {
            SessionState::Connecting => match cancellable(&token, connector.connect(&account)).await
            {
                Attempt::Success(session) => {
                    conn = Some(session);
                    SessionState::Authenticating
                }
                Attempt::Retryable(e) => {
                    warn!(email = %email, host = %account.imap_host, error = %e, "connect failed");
                    SessionState::Backoff
                }
                Attempt::Cancelled => SessionState::Terminated,
            },

            SessionState::Authenticating => {
                let Some(session) = conn.as_deref_mut() else {
                    state = SessionState::Connecting;
                    continue;
                };
                let login = async {
                    session.login(&account).await?;
                    if let Err(e) = session.identify().await {
                        warn!(email = %email, error = %e, "imap id command failed");
                    }
                    Ok::<(), MailError>(())
                };
                match cancellable(&token, login).await {
                    Attempt::Success(()) => SessionState::SelectingMailbox,
                    Attempt::Retryable(e) => {
                        warn!(email = %email, error = %e, "login failed");
                        SessionState::Backoff
                    }
                    Attempt::Cancelled => SessionState::Terminated,
                }
            }

            SessionState::SelectingMailbox => {
                let Some(session) = conn.as_deref_mut() else {
                    state = SessionState::Connecting;
                    continue;
                };
                match cancellable(&token, session.select_inbox()).await {
                    Attempt::Success(status) => {
                        info!(email = %email, host = %account.imap_host, "imap connected");
                        mailbox = status;
                        if checkpoint.is_some() {
                            SessionState::Polling
                        } else {
                            SessionState::EstablishingBaseline
                        }
                    }
                    Attempt::Retryable(e) => {
                        warn!(email = %email, error = %e, "select inbox failed");
                        SessionState::Backoff
                    }
                    Attempt::Cancelled => SessionState::Terminated,
                }
            }

            SessionState::EstablishingBaseline => {
                let Some(session) = conn.as_deref_mut() else {
                    state = SessionState::Connecting;
                    continue;
                };
                match cancellable(&token, establish_baseline(session, mailbox)).await {
                    Attempt::Success(uid) => {
                        info!(
                            email = %email,
                            uidnext = mailbox.uid_next,
                            messages = mailbox.messages,
                            baseline_uid = uid,
                            "baseline established"
                        );
                        checkpoint = Some(Checkpoint::new(uid));
                        SessionState::Polling
                    }
                    Attempt::Retryable(e) => {
                        warn!(email = %email, error = %e, "baseline lookup failed, starting from 0");
                        checkpoint = Some(Checkpoint::default());
                        SessionState::Polling
                    }
                    Attempt::Cancelled => SessionState::Terminated,
                }
            }

            SessionState::Polling => {
                let Some(session) = conn.as_deref_mut() else {
                    state = SessionState::Connecting;
                    continue;
                };
                let Some(cp) = checkpoint.as_mut() else {
                    state = SessionState::EstablishingBaseline;
                    continue;
                };
                let after = cp.get();
                debug!(
                    email = %email,
                    last_uid = after,
                    start_uid = after.saturating_add(1),
                    "fetch start"
                );
                let poll = async {
                    let batch = session.fetch_after_uid(after).await;
                    process_batch(
                        &email,
                        cp,
                        batch,
                        dispatcher.as_ref(),
                        &history,
                    )
                    .await
                };
                match cancellable(&token, poll).await {
                    Attempt::Success(_) => SessionState::Sleeping,
                    Attempt::Retryable(e) => {
                        warn!(email = %email, error = %e, "fetch failed");
                        SessionState::Backoff
                    }
                    Attempt::Cancelled => SessionState::Terminated,
                }
            }

            SessionState::Sleeping => {
                debug!(email = %email, interval = ?settings.poll_interval, "waiting for next poll");
                if pause(&token, settings.poll_interval).await {
                    SessionState::Polling
                } else {
                    SessionState::Terminated
                }
            }

            SessionState::Backoff => {
                conn = None;
                info!(email = %email, after = ?settings.retry_delay, "monitoring retry");
                if pause(&token, settings.retry_delay).await {
                    SessionState::Connecting
                } else {
                    SessionState::Terminated
                }
            }

            SessionState::Terminated => break,
        };
    }

    // Dropping the session closes the socket without waiting on LOGOUT.
    drop(conn);
    info!(email = %email, "monitoring stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::mail::{FetchedMessage, StructuredMessage};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn raw(uid: u32) -> Vec<u8> {
        format!("From: sender@x.com\r\nSubject: mail {uid}\r\n\r\nbody {uid}\r\n").into_bytes()
    }

    fn item(uid: u32) -> FetchedMessage {
        FetchedMessage { uid, raw: raw(uid) }
    }

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<StructuredMessage>>,
        fail: bool,
    }

    impl Recorder {
        fn uids(&self) -> Vec<u32> {
            self.messages.lock().unwrap().iter().map(|m| m.uid).collect()
        }
    }

    #[async_trait]
    impl Dispatcher for Recorder {
        async fn dispatch(&self, message: &StructuredMessage) -> Result<(), DispatchError> {
            self.messages.lock().unwrap().push(message.clone());
            if self.fail {
                Err(DispatchError::Status { status: 500 })
            } else {
                Ok(())
            }
        }
    }

    /// Scripted session: each fetch pops the next batch; an empty script
    /// returns an empty batch.
    struct FakeSession {
        status: MailboxStatus,
        uid_at: Option<u32>,
        batches: Arc<Mutex<VecDeque<FetchBatch>>>,
        ranges: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl MailSession for FakeSession {
        async fn login(&mut self, _account: &Account) -> Result<(), MailError> {
            Ok(())
        }
        async fn identify(&mut self) -> Result<(), MailError> {
            Ok(())
        }
        async fn select_inbox(&mut self) -> Result<MailboxStatus, MailError> {
            Ok(self.status)
        }
        async fn uid_at(&mut self, _seq: u32) -> Result<Option<u32>, MailError> {
            Ok(self.uid_at)
        }
        async fn fetch_after_uid(&mut self, after: u32) -> FetchBatch {
            self.ranges.lock().unwrap().push(after.saturating_add(1));
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| FetchBatch::complete(Vec::new()))
        }
        async fn fetch_sequence(&mut self, _start: u32, _end: u32) -> FetchBatch {
            FetchBatch::complete(Vec::new())
        }
        async fn logout(&mut self) {}
    }

    struct FakeConnector {
        status: MailboxStatus,
        status_after_reconnect: Option<MailboxStatus>,
        uid_at: Option<u32>,
        batches: Arc<Mutex<VecDeque<FetchBatch>>>,
        ranges: Arc<Mutex<Vec<u32>>>,
        connects: Mutex<u32>,
    }

    impl FakeConnector {
        fn new(status: MailboxStatus, batches: Vec<FetchBatch>) -> Self {
            Self {
                status,
                status_after_reconnect: None,
                uid_at: None,
                batches: Arc::new(Mutex::new(batches.into())),
                ranges: Arc::new(Mutex::new(Vec::new())),
                connects: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl MailConnector for FakeConnector {
        async fn connect(&self, _account: &Account) -> Result<Box<dyn MailSession>, MailError> {
            let mut connects = self.connects.lock().unwrap();
            *connects += 1;
            let status = match self.status_after_reconnect {
                Some(later) if *connects > 1 => later,
                _ => self.status,
            };
            Ok(Box::new(FakeSession {
                status,
                uid_at: self.uid_at,
                batches: Arc::clone(&self.batches),
                ranges: Arc::clone(&self.ranges),
            }))
        }
    }

    fn fast() -> SessionSettings {
        SessionSettings {
            poll_interval: Duration::from_millis(10),
            retry_delay: Duration::from_millis(10),
        }
    }

    fn session_with(status: MailboxStatus, uid_at: Option<u32>) -> FakeSession {
        FakeSession {
            status,
            uid_at,
            batches: Arc::default(),
            ranges: Arc::default(),
        }
    }

    #[test]
    fn checkpoint_only_moves_forward() {
        let mut cp = Checkpoint::new(10);
        cp.advance(7);
        assert_eq!(cp.get(), 10);
        cp.advance(12);
        assert_eq!(cp.get(), 12);
    }

    #[tokio::test]
    async fn baseline_uses_uidnext() {
        let status = MailboxStatus {
            messages: 10,
            uid_next: 50,
        };
        let mut session = session_with(status, Some(999));
        assert_eq!(establish_baseline(&mut session, status).await.unwrap(), 49);
    }

    #[tokio::test]
    async fn baseline_without_uidnext_reads_last_message() {
        let status = MailboxStatus {
            messages: 5,
            uid_next: 0,
        };
        let mut session = session_with(status, Some(77));
        assert_eq!(establish_baseline(&mut session, status).await.unwrap(), 77);
    }

    #[tokio::test]
    async fn baseline_of_empty_mailbox_is_zero() {
        let status = MailboxStatus::default();
        let mut session = session_with(status, Some(77));
        assert_eq!(establish_baseline(&mut session, status).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_dispatches_new_messages_in_uid_order() {
        let recorder = Recorder::default();
        let history = HistoryLog::new(10);
        let mut cp = Checkpoint::new(10);
        let batch = FetchBatch::complete(vec![item(13), item(9), item(11), item(10), item(0)]);

        let summary = process_batch("me@x.com", &mut cp, batch, &recorder, &history)
            .await
            .unwrap();

        assert_eq!(recorder.uids(), vec![11, 13]);
        assert_eq!(cp.get(), 13);
        assert_eq!(summary.fetched, 4);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.delivered, 2);
        let subjects: Vec<_> = history.list(0).into_iter().map(|e| e.subject).collect();
        assert_eq!(subjects, ["mail 11", "mail 13"]);
    }

    #[tokio::test]
    async fn undated_message_is_stamped_with_now() {
        let recorder = Recorder::default();
        let history = HistoryLog::new(10);
        let mut cp = Checkpoint::new(0);
        let before = Utc::now();

        process_batch("me", &mut cp, FetchBatch::complete(vec![item(1)]), &recorder, &history)
            .await
            .unwrap();

        let sent = recorder.messages.lock().unwrap().clone();
        let stamped = sent[0].timestamp.expect("timestamp filled in");
        assert!(stamped >= before && stamped <= Utc::now());
        let logged = history.list(0);
        assert_eq!(logged[0].received_at, stamped);
    }

    #[tokio::test]
    async fn dispatch_failure_still_advances() {
        let recorder = Recorder {
            fail: true,
            ..Default::default()
        };
        let history = HistoryLog::new(10);
        let mut cp = Checkpoint::new(1);
        let batch = FetchBatch::complete(vec![item(2), item(3)]);

        let summary = process_batch("me", &mut cp, batch, &recorder, &history)
            .await
            .unwrap();
        assert_eq!(cp.get(), 3);
        assert_eq!(summary.delivered, 0);
        assert_eq!(history.total(), 2);
    }

    #[tokio::test]
    async fn unparseable_message_is_skipped() {
        let recorder = Recorder::default();
        let history = HistoryLog::new(10);
        let mut cp = Checkpoint::new(1);
        let blank = FetchedMessage {
            uid: 5,
            raw: b"   ".to_vec(),
        };
        let batch = FetchBatch::complete(vec![item(2), blank]);

        process_batch("me", &mut cp, batch, &recorder, &history)
            .await
            .unwrap();
        assert_eq!(recorder.uids(), vec![2]);
        assert_eq!(cp.get(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_delivered_items() {
        let recorder = Recorder::default();
        let history = HistoryLog::new(10);
        let mut cp = Checkpoint::new(0);
        let batch = FetchBatch::failed(vec![item(4), item(5)], MailError::Closed);

        let err = process_batch("me", &mut cp, batch, &recorder, &history)
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::Closed));
        assert_eq!(recorder.uids(), vec![4, 5]);
        assert_eq!(cp.get(), 5);
    }

    #[tokio::test]
    async fn session_polls_from_baseline_and_stops_on_cancel() {
        let status = MailboxStatus {
            messages: 10,
            uid_next: 50,
        };
        let connector = Arc::new(FakeConnector::new(
            status,
            vec![FetchBatch::complete(vec![item(50), item(51)])],
        ));
        let recorder = Arc::new(Recorder::default());
        let history = Arc::new(HistoryLog::new(10));
        let token = CancellationToken::new();

        let task = tokio::spawn(run_session(
            Account::new("", "me@x.com", "secret"),
            connector.clone(),
            recorder.clone(),
            history.clone(),
            fast(),
            token.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while connector.ranges.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        let ranges = connector.ranges.lock().unwrap().clone();
        assert_eq!(ranges[0], 50);
        assert_eq!(ranges[1], 52);
        assert_eq!(recorder.uids(), vec![50, 51]);
        assert_eq!(history.total(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_reconnects() {
        let status = MailboxStatus {
            messages: 1,
            uid_next: 2,
        };
        let connector = Arc::new(FakeConnector::new(
            status,
            vec![FetchBatch::failed(Vec::new(), MailError::Closed)],
        ));
        let token = CancellationToken::new();

        let task = tokio::spawn(run_session(
            Account::new("", "me@x.com", "secret"),
            connector.clone(),
            Arc::new(Recorder::default()),
            Arc::new(HistoryLog::new(10)),
            fast(),
            token.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while *connector.connects.lock().unwrap() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn mail_arriving_during_backoff_is_dispatched_after_reconnect() {
        let before = MailboxStatus {
            messages: 2,
            uid_next: 3,
        };
        let mut connector = FakeConnector::new(
            before,
            vec![
                FetchBatch::failed(Vec::new(), MailError::Closed),
                FetchBatch::complete(vec![item(3)]),
            ],
        );
        // UID 3 landed while the session was down.
        connector.status_after_reconnect = Some(MailboxStatus {
            messages: 3,
            uid_next: 4,
        });
        let connector = Arc::new(connector);
        let recorder = Arc::new(Recorder::default());
        let token = CancellationToken::new();

        let task = tokio::spawn(run_session(
            Account::new("", "me@x.com", "secret"),
            connector.clone(),
            recorder.clone(),
            Arc::new(HistoryLog::new(10)),
            fast(),
            token.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.uids().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(recorder.uids(), vec![3]);
        assert_eq!(*connector.connects.lock().unwrap(), 2);
        let ranges = connector.ranges.lock().unwrap().clone();
        assert_eq!(&ranges[..2], &[3, 3]);
    }

    #[tokio::test]
    async fn session_at_max_uid_keeps_polling() {
        let status = MailboxStatus {
            messages: 1,
            uid_next: 0,
        };
        let mut connector = FakeConnector::new(status, Vec::new());
        connector.uid_at = Some(u32::MAX);
        let connector = Arc::new(connector);
        let token = CancellationToken::new();

        let task = tokio::spawn(run_session(
            Account::new("", "me@x.com", "secret"),
            connector.clone(),
            Arc::new(Recorder::default()),
            Arc::new(HistoryLog::new(10)),
            fast(),
            token.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while connector.ranges.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connector.ranges.lock().unwrap()[0], u32::MAX);
    }

    #[tokio::test]
    async fn cancel_interrupts_long_sleep() {
        let connector = Arc::new(FakeConnector::new(MailboxStatus::default(), Vec::new()));
        let token = CancellationToken::new();
        let settings = SessionSettings {
            poll_interval: Duration::from_secs(3600),
            retry_delay: Duration::from_secs(3600),
        };

        let task = tokio::spawn(run_session(
            Account::new("", "me@x.com", "secret"),
            connector.clone(),
            Arc::new(Recorder::default()),
            Arc::new(HistoryLog::new(10)),
            settings,
            token.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while connector.ranges.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
