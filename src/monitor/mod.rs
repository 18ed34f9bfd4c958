//! Mailbox monitoring: per-account sessions, their registry and the shared
//! history log.

pub mod history;
pub mod manager;
pub mod session;

pub use history::{DEFAULT_HISTORY_CAPACITY, HistoryEntry, HistoryLog};
pub use manager::{MonitorManager, OVERFETCH_FACTOR, filter_by_since, sort_emails};
pub use session::{
    Attempt, BatchSummary, Checkpoint, DEFAULT_RETRY_DELAY, SessionSettings, SessionState,
    establish_baseline, process_batch, run_session,
};
