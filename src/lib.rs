//! mail-watch: IMAP mailbox monitoring with webhook notifications.

pub mod accounts;
pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod mail;
pub mod monitor;
pub mod notify;
pub mod submit;
