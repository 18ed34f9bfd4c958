//! Webhook notifications for new mail.
//!
//! One POST per message, 10s timeout, no retry. A failed delivery is the
//! caller's to log; it never holds up the poll loop.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::WebhookConfig;
use crate::error::DispatchError;
use crate::mail::StructuredMessage;

const DEFAULT_NAME: &str = "EmailMonitor";
const DEFAULT_CHANNEL: &str = "feishu";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers one new-mail event somewhere.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, message: &StructuredMessage) -> Result<(), DispatchError>;
}

#[derive(Debug, Serialize)]
struct Payload<'a> {
    message: &'a str,
    name: &'a str,
    deliver: bool,
    channel: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    to: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    session_key: &'a str,
}

/// HTTP webhook client.
pub struct WebhookClient {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookClient {
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "webhook client builder failed, using defaults");
                reqwest::Client::new()
            });
        Self { config, client }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enable
    }

    /// Request body: the custom payload if it is valid JSON, else the default.
    pub fn build_body(&self, message: &str) -> Result<Vec<u8>, DispatchError> {
        let custom = self.config.custom_payload.trim();
        if !custom.is_empty() {
            if serde_json::from_str::<serde_json::Value>(custom).is_ok() {
                return Ok(custom.as_bytes().to_vec());
            }
            warn!("invalid custom webhook payload, falling back to default");
        }

        let payload = Payload {
            message,
            name: DEFAULT_NAME,
            deliver: true,
            channel: DEFAULT_CHANNEL,
            to: &self.config.to,
            session_key: &self.config.session_key,
        };
        Ok(serde_json::to_vec(&payload)?)
    }

    /// POST `message` to the configured URL. A no-op when disabled.
    pub async fn send_notification(&self, message: &str) -> Result<(), DispatchError> {
        if !self.config.enable {
            return Ok(());
        }
        let url = self.config.url.trim();
        if url.is_empty() {
            return Err(DispatchError::NotConfigured("webhook url is empty".into()));
        }

        let body = self.build_body(message)?;
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if !self.config.token.is_empty() {
            request = request.bearer_auth(&self.config.token);
        }

        let start = Instant::now();
        let response = request.send().await.map_err(|e| {
            warn!(error = %e, "webhook request failed");
            DispatchError::Request(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "webhook response error");
            return Err(DispatchError::Status {
                status: status.as_u16(),
            });
        }

        info!(
            status = %status,
            latency_ms = start.elapsed().as_millis() as u64,
            "webhook request ok"
        );
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for WebhookClient {
    async fn dispatch(&self, message: &StructuredMessage) -> Result<(), DispatchError> {
        self.send_notification(&format_notification(message)).await
    }
}

/// Markdown text announcing a new message.
pub fn format_notification(mail: &StructuredMessage) -> String {
    let time = mail
        .timestamp
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "-".to_string());

    [
        "## 📧 New mail".to_string(),
        String::new(),
        format!("**From:** {}", mail.from),
        format!("**To:** {}", mail.to),
        format!("**Subject:** {}", mail.subject),
        format!("**Time:** {time}"),
        String::new(),
        "---".to_string(),
        String::new(),
        "### Summary".to_string(),
        String::new(),
        mail.summary.clone(),
        String::new(),
        "---".to_string(),
        "*sent by mail-watch*".to_string(),
    ]
    .join("\n")
}
