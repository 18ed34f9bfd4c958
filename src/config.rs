//! Configuration types, YAML loading and duration parsing.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "MAIL_WATCH_CONFIG";

/// Poll interval used when none (or an invalid one) is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

const APP_DIR: &str = "mail-watch";
const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Root configuration, one YAML document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Where this config was loaded from (and will be saved to).
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

/// A monitored mail account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub provider: String,
    pub email: String,
    #[serde(
        serialize_with = "serialize_secret",
        deserialize_with = "deserialize_secret"
    )]
    pub auth_token: SecretString,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub imap_host: String,
    #[serde(default)]
    pub smtp_host: String,
}

impl Account {
    pub fn new(provider: &str, email: &str, auth_token: &str) -> Self {
        Self {
            provider: provider.trim().to_string(),
            email: email.trim().to_string(),
            auth_token: SecretString::from(auth_token.trim().to_string()),
            enabled: true,
            imap_host: String::new(),
            smtp_host: String::new(),
        }
    }

    /// Registry key: emails compare case-insensitively.
    pub fn identity(&self) -> String {
        identity_key(&self.email)
    }

    /// True when an IMAP connection can be attempted.
    pub fn has_imap_credentials(&self) -> bool {
        !self.email.trim().is_empty()
            && !self.imap_host.trim().is_empty()
            && !self.auth_token.expose_secret().trim().is_empty()
    }

    /// True when an SMTP submission can be attempted.
    pub fn has_smtp_credentials(&self) -> bool {
        !self.email.trim().is_empty()
            && !self.smtp_host.trim().is_empty()
            && !self.auth_token.expose_secret().trim().is_empty()
    }
}

/// Normalize an email into the key used by the monitor registry.
pub fn identity_key(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Outbound webhook settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub session_key: String,
    /// Raw JSON body sent verbatim instead of the default payload.
    #[serde(default)]
    pub custom_payload: String,
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Go-style duration string, e.g. `30s` or `1m30s`.
    #[serde(default)]
    pub poll_interval: String,
}

impl MonitoringConfig {
    /// Parsed poll interval, falling back to 30s with a warning.
    pub fn poll_interval(&self) -> Duration {
        let raw = self.poll_interval.trim();
        if raw.is_empty() {
            return DEFAULT_POLL_INTERVAL;
        }
        match parse_duration(raw) {
            Some(d) if !d.is_zero() => d,
            _ => {
                tracing::warn!(
                    value = %raw,
                    "invalid poll interval, falling back to {}s",
                    DEFAULT_POLL_INTERVAL.as_secs()
                );
                DEFAULT_POLL_INTERVAL
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub file: String,
}

impl Config {
    /// Load from `$MAIL_WATCH_CONFIG` or `~/.config/mail-watch/config.yaml`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = resolve_config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut cfg = Self::from_yaml(&data)?;
        cfg.config_path = Some(path.to_path_buf());
        Ok(cfg)
    }

    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(data).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Write the config back to where it came from (or the default path).
    pub fn save(&mut self) -> Result<(), ConfigError> {
        let path = match &self.config_path {
            Some(path) => path.clone(),
            None => resolve_config_path()?,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let data =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(&path, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        self.config_path = Some(path);
        Ok(())
    }

    /// Fill missing hosts from the built-in provider table.
    pub fn apply_defaults(account: &mut Account) {
        if !account.imap_host.is_empty() && !account.smtp_host.is_empty() {
            return;
        }
        if let Some((imap, smtp)) = provider_hosts(&account.provider) {
            if account.imap_host.is_empty() {
                account.imap_host = imap.to_string();
            }
            if account.smtp_host.is_empty() {
                account.smtp_host = smtp.to_string();
            }
        }
    }
}

/// Known providers: (imap host:port, smtp host:port).
pub fn provider_hosts(provider: &str) -> Option<(&'static str, &'static str)> {
    match provider.trim().to_lowercase().as_str() {
        "qq" => Some(("imap.qq.com:993", "smtp.qq.com:465")),
        "163" => Some(("imap.163.com:993", "smtp.163.com:465")),
        "gmail" => Some(("imap.gmail.com:993", "smtp.gmail.com:465")),
        _ => None,
    }
}

pub fn resolve_config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    let home = home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(".config").join(APP_DIR).join(DEFAULT_CONFIG_FILE))
}

/// Expand a leading `~` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    let Some(rest) = path.strip_prefix('~') else {
        return PathBuf::from(path);
    };
    match home_dir() {
        Some(home) => home.join(rest.trim_start_matches(['/', '\\'])),
        None => PathBuf::from(path),
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|ms|s|m|h)").expect("duration regex is valid")
});

/// Parse a Go-style duration string (`300ms`, `30s`, `1m30s`, `1.5h`).
///
/// A bare `0` is accepted. Negative durations are rejected.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let mut pos = 0;
    let mut nanos = 0f64;
    for caps in DURATION_PART.captures_iter(s) {
        let whole = caps.get(0)?;
        if whole.start() != pos {
            return None;
        }
        pos = whole.end();

        let value: f64 = caps[1].parse().ok()?;
        let unit = match &caps[2] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        nanos += value * unit;
    }

    if pos == 0 || pos != s.len() || !nanos.is_finite() || nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}

fn serialize_secret<S: Serializer>(secret: &SecretString, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(secret.expose_secret())
}

fn deserialize_secret<'de, D: Deserializer<'de>>(d: D) -> Result<SecretString, D::Error> {
    String::deserialize(d).map(SecretString::from)
}
