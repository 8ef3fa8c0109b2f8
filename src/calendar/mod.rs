//! Calendar provider seam
//!
//! The sync engine and the subscription manager talk to the calendar provider
//! only through [`CalendarClient`]. Events are modelled with just the fields the
//! mirror inspects (`id`, `status`, `sequence`); everything else the provider
//! sends is kept in an opaque payload so nothing is lost on the way to the target.
//!
//! # Implementations
//!
//! - [`GoogleCalendarClient`]: Google Calendar v3 REST API over reqwest
//! - [`InMemoryCalendar`]: in-process provider with a real change feed
//! - [`TimeoutClient`]: decorator bounding every call with a deadline

mod google;
mod memory;

pub use google::{GoogleCalendarClient, GoogleConfig, DEFAULT_API_BASE_URL};
pub use memory::{InMemoryCalendar, Operation, WriteCall};

use crate::{MirrorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;

/// Default channel time-to-live used by the provider (7 days)
pub const DEFAULT_CHANNEL_TTL: Duration = Duration::from_secs(604_800);

/// Event status as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Confirmed,
    Tentative,
    Cancelled,
}

/// A calendar event
///
/// The target event sharing `id` with a source event is that event's mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,

    #[serde(default)]
    pub status: EventStatus,

    /// Optimistic-concurrency counter maintained by the provider
    #[serde(default)]
    pub sequence: i64,

    /// Every other provider field (times, recurrence, attendees, ...)
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Create a confirmed event with an empty payload
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: EventStatus::Confirmed,
            sequence: 0,
            payload: Map::new(),
        }
    }

    /// Set the status
    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the sequence counter
    pub fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Set a passthrough payload field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Read a passthrough payload field
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == EventStatus::Cancelled
    }

    /// Copy of this event without its attendee list, so writing it to the
    /// target calendar does not send invitations
    pub fn without_attendees(&self) -> Self {
        let mut event = self.clone();
        event.payload.remove("attendees");
        event
    }
}

/// Optional bounds for a full sync, `[start, end)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// Build a window; when both bounds are given, start must precede end
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<Self> {
        let window = Self { start, end };
        window.validate()?;
        Ok(window)
    }

    /// A window with no bounds
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start >= end {
                return Err(MirrorError::Config(format!(
                    "Time window start ({}) must come before end ({})",
                    start.to_rfc3339(),
                    end.to_rfc3339()
                )));
            }
        }
        Ok(())
    }

    /// Whether an instant falls inside the window
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at < e)
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// What to ask the provider for when listing events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListQuery {
    /// Changes since the position marked by `sync_token`
    Incremental {
        sync_token: String,
        page_token: Option<String>,
    },
    /// Current state, optionally bounded by a time window
    Full {
        page_token: Option<String>,
        window: TimeWindow,
    },
}

impl ListQuery {
    pub fn page_token(&self) -> Option<&str> {
        match self {
            ListQuery::Incremental { page_token, .. } | ListQuery::Full { page_token, .. } => {
                page_token.as_deref()
            }
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, ListQuery::Full { .. })
    }
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    pub items: Vec<Event>,
    /// Present while more pages remain
    pub next_page_token: Option<String>,
    /// Present only on the final page
    pub next_sync_token: Option<String>,
}

/// Request to open a push-notification channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Caller-generated unique id
    pub id: String,
    /// Webhook address the provider will POST to
    pub address: String,
    pub ttl: Duration,
}

impl ChannelRequest {
    /// Request with a fresh v4 UUID as channel id
    pub fn new(address: impl Into<String>, ttl: Duration) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            address: address.into(),
            ttl,
        }
    }
}

/// A provider-managed change-notification channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,

    /// Provider id of the watched resource (required to stop the channel)
    #[serde(default)]
    pub resource_id: Option<String>,

    #[serde(default)]
    pub resource_uri: Option<String>,

    #[serde(default)]
    pub address: Option<String>,

    pub expiration: DateTime<Utc>,
}

impl Channel {
    /// Remaining lifetime relative to `now` (zero once expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.expiration - now).max(chrono::Duration::zero())
    }
}

/// Typed operations the mirror needs from a calendar provider
///
/// Implementations must surface HTTP 410 as [`MirrorError::TokenInvalid`],
/// HTTP 404 as [`MirrorError::NotFound`] and malformed-id write rejections as
/// [`MirrorError::InvalidResource`].
#[async_trait]
pub trait CalendarClient: Send + Sync {
    async fn list_events(&self, calendar_id: &str, query: &ListQuery) -> Result<EventPage>;

    async fn get_event(&self, calendar_id: &str, event_id: &str) -> Result<Event>;

    async fn create_event(&self, calendar_id: &str, event: &Event) -> Result<Event>;

    async fn update_event(&self, calendar_id: &str, event_id: &str, event: &Event)
        -> Result<Event>;

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<()>;

    async fn create_channel(&self, calendar_id: &str, request: &ChannelRequest)
        -> Result<Channel>;

    async fn stop_channel(&self, channel: &Channel) -> Result<()>;
}

/// Decorator that bounds every call of the wrapped client with a deadline
///
/// An elapsed deadline becomes [`MirrorError::Timeout`], which is transient and
/// distinct from token invalidation.
pub struct TimeoutClient<C> {
    inner: C,
    timeout: Duration,
}

impl<C: CalendarClient> TimeoutClient<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, timeout_secs = self.timeout.as_secs_f64(), "Calendar call timed out");
                Err(MirrorError::Timeout {
                    operation: operation.to_string(),
                    after: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl<C: CalendarClient> CalendarClient for TimeoutClient<C> {
    async fn list_events(&self, calendar_id: &str, query: &ListQuery) -> Result<EventPage> {
        self.bounded("list_events", self.inner.list_events(calendar_id, query))
            .await
    }

    async fn get_event(&self, calendar_id: &str, event_id: &str) -> Result<Event> {
        self.bounded("get_event", self.inner.get_event(calendar_id, event_id))
            .await
    }

    async fn create_event(&self, calendar_id: &str, event: &Event) -> Result<Event> {
        self.bounded("create_event", self.inner.create_event(calendar_id, event))
            .await
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        event: &Event,
    ) -> Result<Event> {
        self.bounded(
            "update_event",
            self.inner.update_event(calendar_id, event_id, event),
        )
        .await
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<()> {
        self.bounded("delete_event", self.inner.delete_event(calendar_id, event_id))
            .await
    }

    async fn create_channel(
        &self,
        calendar_id: &str,
        request: &ChannelRequest,
    ) -> Result<Channel> {
        self.bounded(
            "create_channel",
            self.inner.create_channel(calendar_id, request),
        )
        .await
    }

    async fn stop_channel(&self, channel: &Channel) -> Result<()> {
        self.bounded("stop_channel", self.inner.stop_channel(channel))
            .await
    }
}
