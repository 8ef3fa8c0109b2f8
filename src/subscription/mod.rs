//! Change-notification subscription lifecycle
//!
//! A watcher is either a push-notification channel pointed at an external endpoint
//! (renewed before it expires) or, when no endpoint is configured, a change
//! trigger on the source calendar. [`SubscriptionManager`] owns the persisted
//! record of the active watcher; no other component touches it.

mod manager;

pub use manager::{ActivateOutcome, SubscriptionManager};

use crate::calendar::Channel;
use crate::{MirrorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Store key for [`WatcherSettings`]
pub const SETTINGS_KEY: &str = "watcher/settings";

/// Store key for the active [`WatcherRecord`]
pub const RECORD_KEY: &str = "watcher/active";

/// Store key for the one-shot trigger retrying a failed renewal
pub const RETRY_KEY: &str = "watcher/renewal_retry";

/// Delay before a failed renewal is attempted again
pub const RENEWAL_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Which calendars to mirror and where notifications should be delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherSettings {
    pub source_calendar_id: String,
    pub target_calendar_id: String,
    #[serde(default)]
    pub channel_endpoint: Option<String>,
}

impl WatcherSettings {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_calendar_id: source.into(),
            target_calendar_id: target.into(),
            channel_endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.channel_endpoint = Some(endpoint.into());
        self
    }

    /// Configured endpoint, treating an empty string as absent
    pub fn endpoint(&self) -> Option<&str> {
        self.channel_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_calendar_id.trim().is_empty() {
            return Err(MirrorError::Config("Source calendar id is required".into()));
        }
        if self.target_calendar_id.trim().is_empty() {
            return Err(MirrorError::Config("Target calendar id is required".into()));
        }
        if let Some(endpoint) = self.endpoint() {
            reqwest::Url::parse(endpoint).map_err(|e| {
                MirrorError::Config(format!("Invalid channel endpoint {}: {}", endpoint, e))
            })?;
        }
        Ok(())
    }
}

/// How change notifications reach the mirror; fixed for the life of a watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatcherMode {
    /// Push notifications delivered to an external endpoint
    Channel { endpoint: String },
    /// Change trigger on the source calendar
    Poll,
}

/// Persisted reference to the active watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherRecord {
    pub mode: WatcherMode,
    #[serde(default)]
    pub channel: Option<Channel>,
    /// Renewal trigger (channel mode) or change trigger (poll mode)
    #[serde(default)]
    pub trigger_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubscriptionState {
    Inactive,
    ActiveChannel {
        channel: Channel,
        renewal_trigger_id: Option<String>,
    },
    ActivePoll {
        trigger_id: String,
    },
}

impl SubscriptionState {
    pub fn is_active(&self) -> bool {
        !matches!(self, SubscriptionState::Inactive)
    }
}

/// When to replace a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalPlan {
    /// Daily trigger at `at_hour:00` UTC every `every_n_days` days
    Daily { at_hour: u32, every_n_days: u32 },
    /// One-shot trigger after `after`
    Once { after: Duration },
}

const DAY_SECS: i64 = 86_400;

impl RenewalPlan {
    /// Plan that renews strictly before `channel` expires
    ///
    /// With a lifetime of `d` whole days (rounded up), channels living two days
    /// or more renew at midnight every `d - 1` days; shorter ones renew once after
    /// half of their remaining lifetime.
    pub fn for_channel(channel: &Channel, now: DateTime<Utc>) -> Self {
        let remaining = channel.remaining(now);
        let secs = remaining.num_seconds();
        let days = (secs + DAY_SECS - 1) / DAY_SECS;

        if days >= 2 {
            RenewalPlan::Daily {
                at_hour: 0,
                every_n_days: u32::try_from(days - 1).unwrap_or(u32::MAX),
            }
        } else {
            let half = remaining.to_std().unwrap_or_default() / 2;
            RenewalPlan::Once { after: half }
        }
    }
}
