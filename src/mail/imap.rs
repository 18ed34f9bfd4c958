//! Minimal async IMAP4rev1 client over TLS.
//!
//! Supports only what the monitor needs: LOGIN, ID, SELECT, FETCH, UID FETCH
//! and LOGOUT. Literals (`{n}`) are read as raw bytes so message bodies
//! survive untouched. The client is generic over its stream so tests can
//! drive it through an in-memory pipe.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use super::{FetchBatch, FetchedMessage, MailConnector, MailSession, MailboxStatus};
use crate::config::Account;
use crate::error::MailError;

const DEFAULT_IMAP_PORT: u16 = 993;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const IO_TIMEOUT: Duration = Duration::from_secs(60);
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_NAME: &str = "mail-watch";

static UID_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bUID (\d+)").expect("uid regex is valid"));
static FETCH_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\* \d+ FETCH\b").expect("fetch regex is valid"));
static EXISTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\* (\d+) EXISTS\b").expect("exists regex is valid"));
static UIDNEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[UIDNEXT (\d+)\]").expect("uidnext regex is valid"));
static LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\d+)\}$").expect("literal regex is valid"));

/// A TLS-backed IMAP session as produced by [`ImapConnector`].
pub type ImapSession = ImapClient<TlsStream<TcpStream>>;

/// One untagged response line plus any literals embedded in it.
#[derive(Debug, Default)]
struct Response {
    text: String,
    literals: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

/// IMAP client over any async byte stream.
pub struct ImapClient<S> {
    stream: BufReader<S>,
    tag_counter: u32,
}

impl<S> ImapClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            tag_counter: 0,
        }
    }

    /// Consume the server greeting (`* OK`, `* PREAUTH`).
    pub async fn read_greeting(&mut self) -> Result<(), MailError> {
        let line = self.read_line().await?;
        let upper = line.to_uppercase();
        if upper.starts_with("* OK") || upper.starts_with("* PREAUTH") {
            debug!(greeting = %line, "IMAP greeting");
            Ok(())
        } else if upper.starts_with("* BYE") {
            Err(MailError::Closed)
        } else {
            Err(MailError::Protocol(format!("unexpected greeting: {line}")))
        }
    }

    pub async fn login(&mut self, user: &str, password: &str) -> Result<(), MailError> {
        let command = format!("LOGIN {} {}", quote(user), quote(password));
        let (_, status, text) = self.run(&command).await?;
        match status {
            Status::Ok => Ok(()),
            _ => Err(MailError::Auth(text)),
        }
    }

    /// RFC 2971 ID.
    pub async fn id(&mut self, name: &str, version: &str) -> Result<(), MailError> {
        let command = format!("ID (\"name\" {} \"version\" {})", quote(name), quote(version));
        let (_, status, text) = self.run(&command).await?;
        match status {
            Status::Ok => Ok(()),
            _ => Err(MailError::Command {
                command: "ID".into(),
                status: text,
            }),
        }
    }

    pub async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus, MailError> {
        let (untagged, status, text) = self.run(&format!("SELECT {}", quote(mailbox))).await?;
        if status != Status::Ok {
            return Err(MailError::Select(text));
        }

        let mut mailbox_status = MailboxStatus::default();
        for resp in &untagged {
            if let Some(n) = capture_u32(&EXISTS, &resp.text) {
                mailbox_status.messages = n;
            }
            if let Some(n) = capture_u32(&UIDNEXT, &resp.text) {
                mailbox_status.uid_next = n;
            }
        }
        Ok(mailbox_status)
    }

    pub async fn uid_at(&mut self, seq: u32) -> Result<Option<u32>, MailError> {
        if seq == 0 {
            return Ok(None);
        }
        let (untagged, status, text) = self.run(&format!("FETCH {seq} (UID)")).await?;
        if status != Status::Ok {
            return Err(MailError::Command {
                command: "FETCH".into(),
                status: text,
            });
        }
        Ok(untagged
            .iter()
            .filter(|r| FETCH_LINE.is_match(&r.text))
            .find_map(|r| capture_u32(&UID_ATTR, &r.text)))
    }

    /// `UID FETCH after+1:* (UID BODY.PEEK[])`
    pub async fn uid_fetch_after(&mut self, after: u32) -> FetchBatch {
        let start = after.saturating_add(1);
        self.fetch(&format!("UID FETCH {start}:* (UID BODY.PEEK[])"))
            .await
    }

    /// `FETCH start:end (UID BODY.PEEK[])`
    pub async fn fetch_range(&mut self, start: u32, end: u32) -> FetchBatch {
        self.fetch(&format!("FETCH {start}:{end} (UID BODY.PEEK[])"))
            .await
    }

    pub async fn logout(&mut self) {
        match timeout(LOGOUT_TIMEOUT, self.run("LOGOUT")).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(error = %e, "IMAP logout failed"),
            Err(_) => debug!("IMAP logout timed out"),
        }
    }

    /// Run a FETCH-family command, keeping every item delivered before the
    /// command ended (successfully or not).
    async fn fetch(&mut self, command: &str) -> FetchBatch {
        let tag = match self.send_command(command).await {
            Ok(tag) => tag,
            Err(e) => return FetchBatch::failed(Vec::new(), e),
        };

        let mut items = Vec::new();
        loop {
            let resp = match self.read_response().await {
                Ok(resp) => resp,
                Err(e) => return FetchBatch::failed(items, e),
            };

            if let Some((status, text)) = tagged_status(&tag, &resp.text) {
                return match status {
                    Status::Ok => FetchBatch::complete(items),
                    _ => FetchBatch::failed(
                        items,
                        MailError::Command {
                            command: command_name(command),
                            status: text,
                        },
                    ),
                };
            }

            if let Some(item) = fetched_message(resp) {
                items.push(item);
            }
        }
    }

    /// Send a command and read until its tagged completion.
    async fn run(&mut self, command: &str) -> Result<(Vec<Response>, Status, String), MailError> {
        let tag = self.send_command(command).await?;
        let mut untagged = Vec::new();
        loop {
            let resp = self.read_response().await?;
            if let Some((status, text)) = tagged_status(&tag, &resp.text) {
                return Ok((untagged, status, text));
            }
            untagged.push(resp);
        }
    }

    async fn send_command(&mut self, command: &str) -> Result<String, MailError> {
        self.tag_counter += 1;
        let tag = format!("A{:04}", self.tag_counter);
        debug!(tag = %tag, command = %command_name(command), "IMAP command");

        let line = format!("{tag} {command}\r\n");
        let writer = self.stream.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(tag)
    }

    /// Read one logical response, following `{n}` literal continuations.
    async fn read_response(&mut self) -> Result<Response, MailError> {
        let mut resp = Response::default();
        loop {
            let line = self.read_line().await?;
            let literal = capture_u32(&LITERAL, &line);
            resp.text.push_str(&line);
            match literal {
                Some(n) => {
                    let bytes = self.read_literal(n as usize).await?;
                    resp.literals.push(bytes);
                }
                None => return Ok(resp),
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        let n = timeout(IO_TIMEOUT, self.stream.read_until(b'\n', &mut buf))
            .await
            .map_err(|_| timed_out())??;
        if n == 0 {
            return Err(MailError::Closed);
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn read_literal(&mut self, len: usize) -> Result<Vec<u8>, MailError> {
        let mut buf = vec![0u8; len];
        timeout(IO_TIMEOUT, self.stream.read_exact(&mut buf))
            .await
            .map_err(|_| timed_out())??;
        Ok(buf)
    }
}

#[async_trait]
impl<S> MailSession for ImapClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn login(&mut self, account: &Account) -> Result<(), MailError> {
        ImapClient::login(self, &account.email, account.auth_token.expose_secret()).await
    }

    async fn identify(&mut self) -> Result<(), MailError> {
        self.id(CLIENT_NAME, env!("CARGO_PKG_VERSION")).await
    }

    async fn select_inbox(&mut self) -> Result<MailboxStatus, MailError> {
        self.select("INBOX").await
    }

    async fn uid_at(&mut self, seq: u32) -> Result<Option<u32>, MailError> {
        ImapClient::uid_at(self, seq).await
    }

    async fn fetch_after_uid(&mut self, after: u32) -> FetchBatch {
        self.uid_fetch_after(after).await
    }

    async fn fetch_sequence(&mut self, start: u32, end: u32) -> FetchBatch {
        self.fetch_range(start, end).await
    }

    async fn logout(&mut self) {
        ImapClient::logout(self).await
    }
}

/// Opens implicit-TLS IMAP connections (port 993 unless the host says otherwise).
#[derive(Clone)]
pub struct ImapConnector {
    tls: TlsConnector,
}

impl ImapConnector {
    pub fn new() -> Result<Self, MailError> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| MailError::Tls(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailSession>, MailError> {
        let (host, port) = split_host_port(&account.imap_host);
        let connect_err = |reason: String| MailError::Connect {
            host: account.imap_host.clone(),
            reason,
        };

        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| connect_err("timed out".into()))?
            .map_err(|e| connect_err(e.to_string()))?;

        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| MailError::Tls(format!("invalid server name '{host}': {e}")))?;
        let tls = timeout(CONNECT_TIMEOUT, self.tls.connect(server_name, tcp))
            .await
            .map_err(|_| MailError::Tls("handshake timed out".into()))?
            .map_err(|e| MailError::Tls(e.to_string()))?;

        let mut client = ImapClient::new(tls);
        client.read_greeting().await?;
        debug!(host = %account.imap_host, "IMAP connected");
        Ok(Box::new(client))
    }
}

/// Split `host:port`, defaulting to 993.
pub fn split_host_port(addr: &str) -> (String, u16) {
    let addr = addr.trim();
    if let Some((host, port)) = addr.rsplit_once(':')
        && let Ok(port) = port.parse::<u16>()
    {
        return (host.to_string(), port);
    }
    (addr.to_string(), DEFAULT_IMAP_PORT)
}

/// Quote an IMAP string argument.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn command_name(command: &str) -> String {
    let mut words = command.split_whitespace();
    match (words.next(), words.next()) {
        (Some(first), Some(second)) if first.eq_ignore_ascii_case("UID") => {
            format!("{first} {second}")
        }
        (Some(first), _) => first.to_string(),
        _ => String::new(),
    }
}

fn tagged_status(tag: &str, line: &str) -> Option<(Status, String)> {
    let rest = line.strip_prefix(tag)?.strip_prefix(' ')?;
    let word = rest.split_whitespace().next().unwrap_or_default();
    let status = match word.to_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        _ => Status::Bad,
    };
    Some((status, rest.to_string()))
}

fn fetched_message(resp: Response) -> Option<FetchedMessage> {
    if !FETCH_LINE.is_match(&resp.text) || !resp.text.to_uppercase().contains("BODY[") {
        return None;
    }
    let uid = capture_u32(&UID_ATTR, &resp.text).unwrap_or(0);
    let raw = resp.literals.into_iter().next().unwrap_or_default();
    Some(FetchedMessage { uid, raw })
}

fn capture_u32(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

fn timed_out() -> MailError {
    MailError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "IMAP read timed out",
    ))
}
