use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use mail_watch::accounts::AccountBook;
use mail_watch::api::{self, ApiState};
use mail_watch::config::{Config, resolve_config_path};
use mail_watch::error::ConfigError;
use mail_watch::logging;
use mail_watch::mail::ImapConnector;
use mail_watch::monitor::{MonitorManager, SessionSettings};
use mail_watch::notify::WebhookClient;

const LISTEN_ENV: &str = "MAIL_WATCH_LISTEN";
const POLL_INTERVAL_ENV: &str = "MAIL_WATCH_POLL_INTERVAL";
const DEFAULT_LISTEN: &str = "127.0.0.1:14630";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let mut config = load_config()?;
    if let Ok(interval) = std::env::var(POLL_INTERVAL_ENV)
        && !interval.trim().is_empty()
    {
        config.monitoring.poll_interval = interval.trim().to_string();
    }

    let _log_guard = logging::init(&config.logging);

    let listen = std::env::var(LISTEN_ENV).unwrap_or_else(|_| DEFAULT_LISTEN.to_string());
    let settings = SessionSettings {
        poll_interval: config.monitoring.poll_interval(),
        ..Default::default()
    };

    eprintln!("📬 mail-watch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Accounts: {}", config.accounts.len());
    eprintln!("   Poll interval: {:?}", settings.poll_interval);
    eprintln!("   HTTP API: http://{listen}");

    let dispatcher = Arc::new(WebhookClient::new(config.webhook.clone()));
    if !dispatcher.is_enabled() {
        tracing::warn!("webhook disabled, new mail will only be logged");
    }
    let connector = Arc::new(ImapConnector::new().context("building IMAP TLS connector")?);
    let accounts = Arc::new(AccountBook::new(config));
    let manager = Arc::new(MonitorManager::new(
        Arc::clone(&accounts),
        connector,
        dispatcher,
        settings,
    ));

    let root = CancellationToken::new();
    manager.start_all(&root);

    let app = api::router(ApiState {
        manager: Arc::clone(&manager),
        accounts,
        root: root.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(addr = %listen, "http server starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(root.clone()))
        .await
        .context("http server")?;

    root.cancel();
    manager.shutdown().await;
    tracing::info!("mail-watch stopped");
    Ok(())
}

/// Load the config file, or start empty when it does not exist yet.
fn load_config() -> anyhow::Result<Config> {
    match Config::load() {
        Ok(config) => Ok(config),
        Err(ConfigError::NotFound(path)) => {
            eprintln!(
                "Warning: no config at {}, starting with no accounts",
                path.display()
            );
            Ok(Config {
                config_path: Some(path),
                ..Default::default()
            })
        }
        Err(e) => {
            let path = resolve_config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            Err(e).with_context(|| format!("loading config {path}"))
        }
    }
}

/// Resolves on Ctrl-C, SIGTERM, or when `root` is cancelled elsewhere.
async fn shutdown_signal(root: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = root.cancelled() => {},
    }
    tracing::info!("shutdown signal received");
}
