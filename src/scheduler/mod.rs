//! Trigger scheduling seam
//!
//! The subscription manager and journal register named [`Job`]s with a
//! [`Scheduler`]; the host fires them. [`LocalScheduler`] is the in-process
//! implementation driven by the daemon's tick loop.

mod local;

pub use local::{LocalScheduler, Trigger, TriggerKind};

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Named callbacks a trigger can fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    /// Replace the notification channel before it expires
    RenewSubscription,
    /// Run the configured calendar pair
    SyncCalendars,
    /// Retry delivering pending journal entries
    FlushJournal,
}

impl Job {
    pub fn as_str(&self) -> &'static str {
        match self {
            Job::RenewSubscription => "renew_subscription",
            Job::SyncCalendars => "sync_calendars",
            Job::FlushJournal => "flush_journal",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registers and cancels triggers; every method returns or takes a trigger id
pub trait Scheduler: Send + Sync {
    /// Fire `job` once after `delay`
    fn schedule_once(&self, delay: Duration, job: Job) -> Result<String>;

    /// Fire `job` at `at_hour:00` UTC every `every_n_days` days
    fn schedule_recurring_daily(&self, at_hour: u32, every_n_days: u32, job: Job) -> Result<String>;

    /// Fire `job` whenever `calendar_id` changes
    fn schedule_on_calendar_change(&self, calendar_id: &str, job: Job) -> Result<String>;

    /// Remove a trigger; returns whether it existed
    fn cancel(&self, trigger_id: &str) -> Result<bool>;

    fn exists(&self, trigger_id: &str) -> Result<bool>;
}
