//! Google Calendar v3 REST client
//!
//! Implements [`CalendarClient`] over `events.list/get/insert/update/delete/watch`
//! and `channels.stop`, mapping provider statuses onto the mirror's error classes.

use super::{CalendarClient, Channel, ChannelRequest, Event, EventPage, ListQuery};
use crate::error::extract_retry_after;
use crate::{MirrorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Public Google Calendar API endpoint
pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";

/// Environment variable consulted when no access token is configured
pub const ACCESS_TOKEN_ENV: &str = "CALMIRROR_ACCESS_TOKEN";

/// Connection settings for [`GoogleCalendarClient`]
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    /// Transport-level timeout for a single request
    pub request_timeout: Duration,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            access_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl GoogleConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Google Calendar API client
pub struct GoogleCalendarClient {
    client: Client,
    base_url: String,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventList {
    #[serde(default)]
    items: Vec<Event>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct WatchParams {
    ttl: String,
}

#[derive(Debug, Serialize)]
struct WatchRequest<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    address: &'a str,
    params: WatchParams,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    id: String,
    resource_id: Option<String>,
    resource_uri: Option<String>,
    /// Milliseconds since the epoch, sent as a string
    expiration: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_id: Option<&'a str>,
}

impl GoogleCalendarClient {
    /// Create a client; the access token falls back to `CALMIRROR_ACCESS_TOKEN`
    pub fn new(config: GoogleConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        let access_token = config
            .access_token
            .or_else(|| std::env::var(ACCESS_TOKEN_ENV).ok())
            .filter(|t| !t.is_empty());

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!(
            "{}/calendars/{}/events",
            self.base_url,
            urlencoding::encode(calendar_id)
        )
    }

    fn event_url(&self, calendar_id: &str, event_id: &str) -> String {
        format!(
            "{}/{}",
            self.events_url(calendar_id),
            urlencoding::encode(event_id)
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.access_token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, listing: bool) -> Result<Response> {
        let response = self.authorized(request).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body, retry_after, listing))
    }
}

/// Query parameters for a listing request
fn list_params(query: &ListQuery) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    match query {
        ListQuery::Incremental {
            sync_token,
            page_token,
        } => {
            params.push(("syncToken", sync_token.clone()));
            if let Some(token) = page_token {
                params.push(("pageToken", token.clone()));
            }
        }
        ListQuery::Full { page_token, window } => {
            if let Some(token) = page_token {
                params.push(("pageToken", token.clone()));
            }
            if let Some(start) = window.start {
                params.push(("timeMin", start.to_rfc3339_opts(SecondsFormat::Secs, true)));
            }
            if let Some(end) = window.end {
                params.push(("timeMax", end.to_rfc3339_opts(SecondsFormat::Secs, true)));
            }
        }
    }
    params
}

/// Map a non-success response onto the mirror's error classes
///
/// 410 means an invalidated cursor only for listings; on single-event calls it
/// means the event was deleted, which reconciliation treats like a 404.
fn status_error(
    status: StatusCode,
    body: &str,
    retry_after: Option<u64>,
    listing: bool,
) -> MirrorError {
    let message = provider_message(body);
    match status {
        StatusCode::GONE if listing => MirrorError::TokenInvalid(message),
        StatusCode::GONE | StatusCode::NOT_FOUND => MirrorError::NotFound(message),
        StatusCode::BAD_REQUEST if message.contains("Invalid resource id") => {
            MirrorError::InvalidResource(message)
        }
        StatusCode::TOO_MANY_REQUESTS => MirrorError::RateLimited(
            retry_after
                .or_else(|| extract_retry_after(&message))
                .unwrap_or(60),
        ),
        StatusCode::FORBIDDEN if body.contains("RateLimitExceeded") || body.contains("rateLimitExceeded") => {
            MirrorError::RateLimited(retry_after.unwrap_or(60))
        }
        status => MirrorError::provider(status.as_u16(), message),
    }
}

/// Pull `error.message` out of a Google error body, falling back to the raw text
fn provider_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Parse the millisecond `expiration` string of a watch response
fn parse_expiration(raw: Option<&str>) -> Result<DateTime<Utc>> {
    let raw = raw.ok_or_else(|| MirrorError::Other("Watch response has no expiration".into()))?;
    let millis: i64 = raw
        .parse()
        .map_err(|_| MirrorError::Other(format!("Invalid channel expiration: {}", raw)))?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| MirrorError::Other(format!("Channel expiration out of range: {}", raw)))
}

#[async_trait]
impl CalendarClient for GoogleCalendarClient {
    async fn list_events(&self, calendar_id: &str, query: &ListQuery) -> Result<EventPage> {
        let params = list_params(query);
        debug!(calendar = %calendar_id, full = query.is_full(), "Listing events");

        let request = self.client.get(self.events_url(calendar_id)).query(&params);
        let list: EventList = self.send(request, true).await?.json().await?;

        Ok(EventPage {
            items: list.items,
            next_page_token: list.next_page_token,
            next_sync_token: list.next_sync_token,
        })
    }

    async fn get_event(&self, calendar_id: &str, event_id: &str) -> Result<Event> {
        let request = self.client.get(self.event_url(calendar_id, event_id));
        Ok(self.send(request, false).await?.json().await?)
    }

    async fn create_event(&self, calendar_id: &str, event: &Event) -> Result<Event> {
        let request = self.client.post(self.events_url(calendar_id)).json(event);
        Ok(self.send(request, false).await?.json().await?)
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        event: &Event,
    ) -> Result<Event> {
        let request = self
            .client
            .put(self.event_url(calendar_id, event_id))
            .json(event);
        Ok(self.send(request, false).await?.json().await?)
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<()> {
        let request = self.client.delete(self.event_url(calendar_id, event_id));
        self.send(request, false).await?;
        Ok(())
    }

    async fn create_channel(
        &self,
        calendar_id: &str,
        request: &ChannelRequest,
    ) -> Result<Channel> {
        let body = WatchRequest {
            id: &request.id,
            kind: "web_hook",
            address: &request.address,
            params: WatchParams {
                ttl: request.ttl.as_secs().to_string(),
            },
        };
        let url = format!("{}/watch", self.events_url(calendar_id));
        let watch: WatchResponse = self
            .send(self.client.post(url).json(&body), false)
            .await?
            .json()
            .await?;

        let channel = Channel {
            expiration: parse_expiration(watch.expiration.as_deref())?,
            id: watch.id,
            resource_id: watch.resource_id,
            resource_uri: watch.resource_uri,
            address: Some(request.address.clone()),
        };
        info!(
            channel_id = %channel.id,
            calendar = %calendar_id,
            expiration = %channel.expiration,
            "Created notification channel"
        );
        Ok(channel)
    }

    async fn stop_channel(&self, channel: &Channel) -> Result<()> {
        let body = StopRequest {
            id: &channel.id,
            resource_id: channel.resource_id.as_deref(),
        };
        let url = format!("{}/channels/stop", self.base_url);
        self.send(self.client.post(url).json(&body), false).await?;
        info!(channel_id = %channel.id, "Stopped notification channel");
        Ok(())
    }
}
