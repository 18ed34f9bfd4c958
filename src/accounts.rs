//! Account directory backed by the shared config.
//!
//! Reads hand out clones; writes go through one lock and are persisted to the
//! config file before the lock is released.

use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use secrecy::ExposeSecret;
use tracing::info;

use crate::config::{Account, Config, identity_key};
use crate::error::ConfigError;

pub struct AccountBook {
    config: RwLock<Config>,
    persist: bool,
}

impl AccountBook {
    /// A book that saves every change back to the config file.
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(config),
            persist: true,
        }
    }

    /// A book that never touches disk.
    pub fn in_memory(config: Config) -> Self {
        Self {
            config: RwLock::new(config),
            persist: false,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Config> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Config> {
        self.config.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn list(&self) -> Vec<Account> {
        self.read().accounts.clone()
    }

    pub fn len(&self) -> usize {
        self.read().accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Case-insensitive lookup by email.
    pub fn find(&self, email: &str) -> Option<Account> {
        let key = identity_key(email);
        self.read()
            .accounts
            .iter()
            .find(|a| a.identity() == key)
            .cloned()
    }

    pub fn enabled(&self) -> Vec<Account> {
        self.read()
            .accounts
            .iter()
            .filter(|a| a.enabled)
            .cloned()
            .collect()
    }

    pub fn first_enabled(&self) -> Option<Account> {
        self.read().accounts.iter().find(|a| a.enabled).cloned()
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        self.read().config_path.clone()
    }

    pub fn log_file(&self) -> String {
        self.read().logging.file.clone()
    }

    /// Validate, complete and store a new account. Returns the stored copy.
    pub fn add(&self, mut account: Account) -> Result<Account, ConfigError> {
        account.email = account.email.trim().to_string();
        account.provider = account.provider.trim().to_string();
        if account.email.is_empty() {
            return Err(missing("email"));
        }
        if account.auth_token.expose_secret().trim().is_empty() {
            return Err(missing("auth_token"));
        }
        if account.provider.is_empty() {
            return Err(missing("provider"));
        }

        let key = account.identity();
        let mut cfg = self.write();
        if cfg.accounts.iter().any(|a| a.identity() == key) {
            return Err(ConfigError::AccountExists(account.email));
        }

        account.enabled = true;
        Config::apply_defaults(&mut account);
        if account.imap_host.trim().is_empty() {
            return Err(missing("imap_host"));
        }
        if account.smtp_host.trim().is_empty() {
            return Err(missing("smtp_host"));
        }

        cfg.accounts.push(account.clone());
        if let Err(e) = self.persist(&mut cfg) {
            cfg.accounts.pop();
            return Err(e);
        }

        info!(email = %account.email, provider = %account.provider, "account added");
        Ok(account)
    }

    /// Remove an account by email. Returns the removed entry.
    pub fn remove(&self, email: &str) -> Result<Account, ConfigError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(missing("email"));
        }

        let key = identity_key(email);
        let mut cfg = self.write();
        let idx = cfg
            .accounts
            .iter()
            .position(|a| a.identity() == key)
            .ok_or_else(|| ConfigError::AccountNotFound(email.to_string()))?;

        let removed = cfg.accounts.remove(idx);
        if let Err(e) = self.persist(&mut cfg) {
            cfg.accounts.insert(idx, removed);
            return Err(e);
        }

        info!(email = %removed.email, "account removed");
        Ok(removed)
    }

    fn persist(&self, cfg: &mut Config) -> Result<(), ConfigError> {
        if self.persist { cfg.save() } else { Ok(()) }
    }
}

fn missing(key: &str) -> ConfigError {
    ConfigError::MissingRequired {
        key: key.to_string(),
    }
}
