//! In-process calendar provider
//!
//! Behaves like a change-feed calendar API: every write advances a per-calendar
//! change position, sync tokens remember a position, incremental listings return
//! everything changed after it (deletions included as cancelled events), and
//! pages are cut at a configurable size. Used for dry runs and as the test double
//! for the sync engine and subscription manager.

use super::{
    CalendarClient, Channel, ChannelRequest, Event, EventPage, EventStatus, ListQuery, TimeWindow,
};
use crate::{MirrorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default number of events per page
pub const DEFAULT_PAGE_SIZE: usize = 250;

/// Provider operations, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListEvents,
    GetEvent,
    CreateEvent,
    UpdateEvent,
    DeleteEvent,
    CreateChannel,
    StopChannel,
}

/// A write issued through the [`CalendarClient`] interface
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCall {
    Create {
        calendar_id: String,
        event: Event,
    },
    Update {
        calendar_id: String,
        event_id: String,
        event: Event,
    },
    Delete {
        calendar_id: String,
        event_id: String,
    },
}

impl WriteCall {
    pub fn event_id(&self) -> &str {
        match self {
            WriteCall::Create { event, .. } => &event.id,
            WriteCall::Update { event_id, .. } | WriteCall::Delete { event_id, .. } => event_id,
        }
    }
}

struct StoredEvent {
    event: Event,
    changed_at: u64,
}

#[derive(Default)]
struct CalendarData {
    events: BTreeMap<String, StoredEvent>,
    /// Last change position handed out
    position: u64,
    /// Bumped to invalidate every outstanding token
    epoch: u64,
}

impl CalendarData {
    fn touch(&mut self, event: Event) {
        self.position += 1;
        let changed_at = self.position;
        self.events
            .insert(event.id.clone(), StoredEvent { event, changed_at });
    }
}

/// Decoded page token: everything needed to continue a listing
struct Cursor {
    epoch: u64,
    since: u64,
    snapshot: u64,
    after: Option<(u64, String)>,
}

impl Cursor {
    fn encode(&self) -> String {
        let (pos, id) = self
            .after
            .as_ref()
            .map(|(p, id)| (*p, id.as_str()))
            .unwrap_or((0, ""));
        format!("{}:{}:{}:{}:{}", self.epoch, self.since, self.snapshot, pos, id)
    }

    fn decode(token: &str) -> Option<Self> {
        let mut parts = token.splitn(5, ':');
        let epoch = parts.next()?.parse().ok()?;
        let since = parts.next()?.parse().ok()?;
        let snapshot = parts.next()?.parse().ok()?;
        let pos: u64 = parts.next()?.parse().ok()?;
        let id = parts.next()?.to_string();
        let after = if pos == 0 && id.is_empty() {
            None
        } else {
            Some((pos, id))
        };
        Some(Self {
            epoch,
            since,
            snapshot,
            after,
        })
    }
}

#[derive(Default)]
struct State {
    calendars: HashMap<String, CalendarData>,
    page_size: usize,
    failures: HashMap<Operation, VecDeque<MirrorError>>,
    writes: Vec<WriteCall>,
    list_queries: Vec<(String, ListQuery)>,
    channels: HashMap<String, Channel>,
    stopped_channels: Vec<Channel>,
    next_resource: u64,
}

/// In-memory calendar provider
pub struct InMemoryCalendar {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
}

impl Default for InMemoryCalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                page_size: DEFAULT_PAGE_SIZE,
                ..State::default()
            }),
            latency: Mutex::new(None),
        }
    }

    /// Set the maximum number of events per page
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state().page_size = page_size.max(1);
        self
    }

    /// Delay every call, to exercise deadlines
    pub fn set_latency(&self, latency: Duration) {
        *self
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(latency);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Direct manipulation (simulates changes made by calendar users)
    // ------------------------------------------------------------------

    /// Insert or replace an event as a user edit, recording a change
    pub fn insert(&self, calendar_id: &str, event: Event) {
        self.state()
            .calendars
            .entry(calendar_id.to_string())
            .or_default()
            .touch(event);
    }

    /// Edit an existing event as a user would: apply `edit`, bump the sequence
    pub fn edit(&self, calendar_id: &str, event_id: &str, edit: impl FnOnce(&mut Event)) -> bool {
        let mut state = self.state();
        let Some(calendar) = state.calendars.get_mut(calendar_id) else {
            return false;
        };
        let Some(stored) = calendar.events.get(event_id) else {
            return false;
        };
        let mut event = stored.event.clone();
        edit(&mut event);
        event.sequence += 1;
        calendar.touch(event);
        true
    }

    /// Cancel an event as a user deletion
    pub fn cancel(&self, calendar_id: &str, event_id: &str) -> bool {
        self.edit(calendar_id, event_id, |e| e.status = EventStatus::Cancelled)
    }

    /// Make every outstanding sync and page token invalid (HTTP 410 on next use)
    pub fn invalidate_sync_tokens(&self, calendar_id: &str) {
        self.state()
            .calendars
            .entry(calendar_id.to_string())
            .or_default()
            .epoch += 1;
    }

    /// Fail the next call of `operation` with `error`; queued errors are consumed in order
    pub fn fail_next(&self, operation: Operation, error: MirrorError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Stored event, including cancelled ones
    pub fn event(&self, calendar_id: &str, event_id: &str) -> Option<Event> {
        self.state()
            .calendars
            .get(calendar_id)
            .and_then(|c| c.events.get(event_id))
            .map(|s| s.event.clone())
    }

    /// Events that are not cancelled, ordered by id
    pub fn active_events(&self, calendar_id: &str) -> Vec<Event> {
        self.state()
            .calendars
            .get(calendar_id)
            .map(|c| {
                c.events
                    .values()
                    .filter(|s| !s.event.is_cancelled())
                    .map(|s| s.event.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every write issued through the client interface, in order
    pub fn writes(&self) -> Vec<WriteCall> {
        self.state().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    /// Every listing request, in order
    pub fn list_queries(&self) -> Vec<(String, ListQuery)> {
        self.state().list_queries.clone()
    }

    /// Channels created and not yet stopped
    pub fn active_channels(&self) -> Vec<Channel> {
        self.state().channels.values().cloned().collect()
    }

    /// Channels that were stopped, in order
    pub fn stopped_channels(&self) -> Vec<Channel> {
        self.state().stopped_channels.clone()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn enter(&self, operation: Operation) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self
            .state()
            .failures
            .get_mut(&operation)
            .and_then(|q| q.pop_front())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn token_gone() -> MirrorError {
    MirrorError::TokenInvalid("Sync token is no longer valid, a full sync is required.".to_string())
}

fn not_found(calendar_id: &str, event_id: &str) -> MirrorError {
    MirrorError::NotFound(format!("Not Found: event {} in calendar {}", event_id, calendar_id))
}

/// Provider event ids use the base32hex alphabet (lowercase a-v and digits)
fn valid_event_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| matches!(c, 'a'..='v' | '0'..='9'))
}

/// Start of an event, from `start.dateTime` or an all-day `start.date`
fn event_start(event: &Event) -> Option<DateTime<Utc>> {
    let start = event.field("start")?;
    if let Some(dt) = start.get("dateTime").and_then(|v| v.as_str()) {
        return DateTime::parse_from_rfc3339(dt)
            .ok()
            .map(|d| d.with_timezone(&Utc));
    }
    let date = start.get("date").and_then(|v| v.as_str())?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

fn in_window(event: &Event, window: &TimeWindow) -> bool {
    event_start(event).map_or(true, |start| window.contains(start))
}

#[async_trait]
impl CalendarClient for InMemoryCalendar {
    async fn list_events(&self, calendar_id: &str, query: &ListQuery) -> Result<EventPage> {
        self.enter(Operation::ListEvents).await?;

        let mut state = self.state();
        state
            .list_queries
            .push((calendar_id.to_string(), query.clone()));
        let page_size = state.page_size;
        let calendar = state
            .calendars
            .entry(calendar_id.to_string())
            .or_default();

        let cursor = match query.page_token() {
            Some(token) => Cursor::decode(token).ok_or_else(token_gone)?,
            None => {
                let since = match query {
                    ListQuery::Incremental { sync_token, .. } => {
                        let (epoch, position) = sync_token
                            .split_once(':')
                            .and_then(|(e, p)| Some((e.parse::<u64>().ok()?, p.parse::<u64>().ok()?)))
                            .ok_or_else(token_gone)?;
                        if epoch != calendar.epoch || position > calendar.position {
                            return Err(token_gone());
                        }
                        position
                    }
                    ListQuery::Full { .. } => 0,
                };
                Cursor {
                    epoch: calendar.epoch,
                    since,
                    snapshot: calendar.position,
                    after: None,
                }
            }
        };
        if cursor.epoch != calendar.epoch {
            return Err(token_gone());
        }

        let mut matching: Vec<(u64, &Event)> = calendar
            .events
            .values()
            .filter(|s| s.changed_at > cursor.since && s.changed_at <= cursor.snapshot)
            .filter(|s| match query {
                ListQuery::Incremental { .. } => true,
                ListQuery::Full { window, .. } => {
                    !s.event.is_cancelled() && in_window(&s.event, window)
                }
            })
            .map(|s| (s.changed_at, &s.event))
            .collect();
        matching.sort_by(|a, b| (a.0, &a.1.id).cmp(&(b.0, &b.1.id)));

        let remaining: Vec<(u64, &Event)> = matching
            .into_iter()
            .filter(|(pos, event)| match &cursor.after {
                Some((after_pos, after_id)) => (*pos, &event.id) > (*after_pos, after_id),
                None => true,
            })
            .collect();

        let has_more = remaining.len() > page_size;
        let page: Vec<(u64, &Event)> = remaining.into_iter().take(page_size).collect();
        let items: Vec<Event> = page.iter().map(|(_, e)| (*e).clone()).collect();

        let (next_page_token, next_sync_token) = if has_more {
            let last = page.last().map(|(pos, e)| (*pos, e.id.clone()));
            let next = Cursor {
                after: last,
                ..cursor
            };
            (Some(next.encode()), None)
        } else {
            (None, Some(format!("{}:{}", cursor.epoch, cursor.snapshot)))
        };

        Ok(EventPage {
            items,
            next_page_token,
            next_sync_token,
        })
    }

    async fn get_event(&self, calendar_id: &str, event_id: &str) -> Result<Event> {
        self.enter(Operation::GetEvent).await?;
        self.event(calendar_id, event_id)
            .ok_or_else(|| not_found(calendar_id, event_id))
    }

    async fn create_event(&self, calendar_id: &str, event: &Event) -> Result<Event> {
        self.enter(Operation::CreateEvent).await?;
        if !valid_event_id(&event.id) {
            return Err(MirrorError::InvalidResource(format!(
                "Invalid resource id value: {}",
                event.id
            )));
        }

        let mut state = self.state();
        let calendar = state
            .calendars
            .entry(calendar_id.to_string())
            .or_default();
        if calendar.events.contains_key(&event.id) {
            return Err(MirrorError::provider(
                409,
                "The requested identifier already exists.",
            ));
        }
        calendar.touch(event.clone());
        state.writes.push(WriteCall::Create {
            calendar_id: calendar_id.to_string(),
            event: event.clone(),
        });
        Ok(event.clone())
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        event: &Event,
    ) -> Result<Event> {
        self.enter(Operation::UpdateEvent).await?;
        if !valid_event_id(event_id) {
            return Err(MirrorError::InvalidResource(format!(
                "Invalid resource id value: {}",
                event_id
            )));
        }

        let mut state = self.state();
        let calendar = state
            .calendars
            .get_mut(calendar_id)
            .ok_or_else(|| not_found(calendar_id, event_id))?;
        let current = calendar
            .events
            .get(event_id)
            .map(|s| s.event.sequence)
            .ok_or_else(|| not_found(calendar_id, event_id))?;
        if event.sequence != current {
            return Err(MirrorError::provider(
                400,
                format!(
                    "Invalid sequence value: expected {}, got {}",
                    current, event.sequence
                ),
            ));
        }

        let mut stored = event.clone();
        stored.id = event_id.to_string();
        stored.sequence = current + 1;
        calendar.touch(stored.clone());
        state.writes.push(WriteCall::Update {
            calendar_id: calendar_id.to_string(),
            event_id: event_id.to_string(),
            event: event.clone(),
        });
        Ok(stored)
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<()> {
        self.enter(Operation::DeleteEvent).await?;

        let mut state = self.state();
        let calendar = state
            .calendars
            .get_mut(calendar_id)
            .ok_or_else(|| not_found(calendar_id, event_id))?;
        let mut event = calendar
            .events
            .get(event_id)
            .filter(|s| !s.event.is_cancelled())
            .map(|s| s.event.clone())
            .ok_or_else(|| not_found(calendar_id, event_id))?;
        event.status = EventStatus::Cancelled;
        calendar.touch(event);
        state.writes.push(WriteCall::Delete {
            calendar_id: calendar_id.to_string(),
            event_id: event_id.to_string(),
        });
        Ok(())
    }

    async fn create_channel(
        &self,
        calendar_id: &str,
        request: &ChannelRequest,
    ) -> Result<Channel> {
        self.enter(Operation::CreateChannel).await?;

        let ttl = chrono::Duration::from_std(request.ttl)
            .map_err(|e| MirrorError::Config(format!("Invalid channel ttl: {}", e)))?;
        let mut state = self.state();
        state.next_resource += 1;
        let channel = Channel {
            id: request.id.clone(),
            resource_id: Some(format!("resource-{}", state.next_resource)),
            resource_uri: Some(format!("memory://calendars/{}/events", calendar_id)),
            address: Some(request.address.clone()),
            expiration: Utc::now() + ttl,
        };
        state.channels.insert(channel.id.clone(), channel.clone());
        Ok(channel)
    }

    async fn stop_channel(&self, channel: &Channel) -> Result<()> {
        self.enter(Operation::StopChannel).await?;

        let mut state = self.state();
        let stopped = state
            .channels
            .remove(&channel.id)
            .ok_or_else(|| MirrorError::NotFound(format!("Channel {} not found", channel.id)))?;
        state.stopped_channels.push(stopped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> ListQuery {
        ListQuery::Full {
            page_token: None,
            window: TimeWindow::unbounded(),
        }
    }

    #[tokio::test]
    async fn test_full_listing_pages_and_ends_with_sync_token() {
        let calendar = InMemoryCalendar::new().with_page_size(2);
        for id in ["a1", "a2", "a3"] {
            calendar.insert("src", Event::new(id));
        }

        let first = calendar.list_events("src", &full()).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.next_page_token.is_some());
        assert!(first.next_sync_token.is_none());

        let second = calendar
            .list_events(
                "src",
                &ListQuery::Full {
                    page_token: first.next_page_token,
                    window: TimeWindow::unbounded(),
                },
            )
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].id, "a3");
        assert!(second.next_page_token.is_none());
        assert!(second.next_sync_token.is_some());
    }

    #[tokio::test]
    async fn test_incremental_listing_returns_only_changes() {
        let calendar = InMemoryCalendar::new();
        calendar.insert("src", Event::new("a1"));
        calendar.insert("src", Event::new("a2"));
        let sync_token = calendar
            .list_events("src", &full())
            .await
            .unwrap()
            .next_sync_token
            .unwrap();

        calendar.cancel("src", "a1");

        let page = calendar
            .list_events(
                "src",
                &ListQuery::Incremental {
                    sync_token,
                    page_token: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "a1");
        assert!(page.items[0].is_cancelled());
    }

    #[tokio::test]
    async fn test_full_listing_skips_cancelled_and_applies_window() {
        let calendar = InMemoryCalendar::new();
        calendar.insert(
            "src",
            Event::new("early").with_field("start", serde_json::json!({"date": "2023-06-01"})),
        );
        calendar.insert(
            "src",
            Event::new("late")
                .with_field("start", serde_json::json!({"dateTime": "2024-06-01T10:00:00Z"})),
        );
        calendar.insert("src", Event::new("gone").with_status(EventStatus::Cancelled));

        let start = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let page = calendar
            .list_events(
                "src",
                &ListQuery::Full {
                    page_token: None,
                    window: TimeWindow::new(Some(start), None).unwrap(),
                },
            )
            .await
            .unwrap();

        let ids: Vec<&str> = page.items.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["late"]);
    }

    #[tokio::test]
    async fn test_invalidated_tokens_return_gone() {
        let calendar = InMemoryCalendar::new();
        calendar.insert("src", Event::new("a1"));
        let sync_token = calendar
            .list_events("src", &full())
            .await
            .unwrap()
            .next_sync_token
            .unwrap();

        calendar.invalidate_sync_tokens("src");

        let err = calendar
            .list_events(
                "src",
                &ListQuery::Incremental {
                    sync_token,
                    page_token: None,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_token_invalid());
    }

    #[tokio::test]
    async fn test_update_requires_current_sequence() {
        let calendar = InMemoryCalendar::new();
        calendar.insert("dst", Event::new("e1").with_sequence(3));

        let stale = Event::new("e1").with_sequence(9);
        let err = calendar.update_event("dst", "e1", &stale).await.unwrap_err();
        assert!(matches!(err, MirrorError::Provider { status: 400, .. }));

        let current = Event::new("e1").with_sequence(3);
        let updated = calendar.update_event("dst", "e1", &current).await.unwrap();
        assert_eq!(updated.sequence, 4);
    }

    #[tokio::test]
    async fn test_create_rejects_malformed_ids() {
        let calendar = InMemoryCalendar::new();
        let err = calendar
            .create_event("dst", &Event::new("Bad_ID_20240101T100000Z"))
            .await
            .unwrap_err();
        assert!(err.is_invalid_resource());
        assert!(calendar.writes().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let calendar = InMemoryCalendar::new();
        calendar.insert("src", Event::new("a1"));
        calendar.fail_next(Operation::GetEvent, MirrorError::provider(500, "backend"));

        assert!(calendar.get_event("src", "a1").await.is_err());
        assert!(calendar.get_event("src", "a1").await.is_ok());
    }

    #[tokio::test]
    async fn test_channels_are_tracked_until_stopped() {
        let calendar = InMemoryCalendar::new();
        let request = ChannelRequest::new("https://example.com/hook", Duration::from_secs(3600));
        let channel = calendar.create_channel("src", &request).await.unwrap();

        assert_eq!(channel.id, request.id);
        assert_eq!(calendar.active_channels().len(), 1);

        calendar.stop_channel(&channel).await.unwrap();
        assert!(calendar.active_channels().is_empty());
        assert!(calendar.stop_channel(&channel).await.unwrap_err().is_not_found());
    }
}
