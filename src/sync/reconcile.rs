//! Per-event reconciliation against the target calendar
//!
//! Decision table, evaluated in order:
//!
//! | target event | source   | target    | action |
//! |--------------|----------|-----------|--------|
//! | absent       | cancelled| -         | NoOp   |
//! | absent       | active   | -         | Create |
//! | present      | cancelled| cancelled | NoOp   |
//! | present      | cancelled| active    | Delete |
//! | present      | active   | any       | Update (target's sequence) |
//!
//! Attendee lists are stripped from every write so the mirror never sends
//! invitations on behalf of the source.

use crate::calendar::{CalendarClient, Event};
use crate::Result;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of reconciling one source event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Updated,
    Deleted,
    NoOp,
    /// The write was rejected as an invalid resource and skipped
    Skipped,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
            Action::NoOp => "noop",
            Action::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The write a source event calls for, before it is issued
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Create(Event),
    Update(Event),
    Delete,
    NoOp,
}

/// Decide what to do with `source` given the current mirror, if any
pub fn decide(source: &Event, target: Option<&Event>) -> Decision {
    match target {
        None if source.is_cancelled() => Decision::NoOp,
        None => Decision::Create(source.without_attendees()),
        Some(target) if source.is_cancelled() && target.is_cancelled() => Decision::NoOp,
        Some(_) if source.is_cancelled() => Decision::Delete,
        Some(target) => Decision::Update(source.without_attendees().with_sequence(target.sequence)),
    }
}

/// Applies [`decide`] to the target calendar through a [`CalendarClient`]
#[derive(Clone)]
pub struct ReconciliationPolicy {
    client: Arc<dyn CalendarClient>,
}

impl ReconciliationPolicy {
    pub fn new(client: Arc<dyn CalendarClient>) -> Self {
        Self { client }
    }

    /// Reconcile one source event, issuing at most one write
    ///
    /// A missing target event is a normal outcome. Writes rejected as invalid
    /// resources are logged and reported as [`Action::Skipped`]; every other error
    /// propagates.
    pub async fn reconcile(&self, target_calendar_id: &str, source: &Event) -> Result<Action> {
        let existing = match self.client.get_event(target_calendar_id, &source.id).await {
            Ok(event) => Some(event),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let result = match decide(source, existing.as_ref()) {
            Decision::NoOp => return Ok(Action::NoOp),
            Decision::Create(event) => self
                .client
                .create_event(target_calendar_id, &event)
                .await
                .map(|_| Action::Created),
            Decision::Update(event) => self
                .client
                .update_event(target_calendar_id, &source.id, &event)
                .await
                .map(|_| Action::Updated),
            Decision::Delete => self
                .client
                .delete_event(target_calendar_id, &source.id)
                .await
                .map(|_| Action::Deleted),
        };

        match result {
            Ok(action) => {
                debug!(event_id = %source.id, action = %action, "Reconciled event");
                Ok(action)
            }
            Err(e) if e.is_invalid_resource() => {
                warn!(
                    event_id = %source.id,
                    target = %target_calendar_id,
                    error = %e,
                    "Skipping event rejected by the target calendar"
                );
                Ok(Action::Skipped)
            }
            Err(e) => Err(e),
        }
    }
}
