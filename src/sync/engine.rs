//! Paginated incremental sync with invalidation recovery

use super::reconcile::{Action, ReconciliationPolicy};
use super::state::{PairKey, SyncState};
use crate::calendar::{CalendarClient, TimeWindow};
use crate::store::TokenStore;
use crate::{MirrorError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What one run did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub source: String,
    pub target: String,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub skipped: Vec<String>,
    pub unchanged: usize,
    pub pages: usize,
    /// At least one page was listed without a sync token
    pub full_sync: bool,
    /// The provider invalidated the cursor and the run restarted from a full sync
    pub resynced: bool,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl SyncReport {
    fn new(key: &PairKey) -> Self {
        Self {
            source: key.source.clone(),
            target: key.target.clone(),
            ..Self::default()
        }
    }

    fn record(&mut self, event_id: &str, action: Action) {
        match action {
            Action::Created => self.created.push(event_id.to_string()),
            Action::Updated => self.updated.push(event_id.to_string()),
            Action::Deleted => self.deleted.push(event_id.to_string()),
            Action::Skipped => self.skipped.push(event_id.to_string()),
            Action::NoOp => self.unchanged += 1,
        }
    }

    /// Number of create, update and delete calls issued
    pub fn writes(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    /// Count of events per action
    pub fn action_counts(&self) -> [(Action, usize); 5] {
        [
            (Action::Created, self.created.len()),
            (Action::Updated, self.updated.len()),
            (Action::Deleted, self.deleted.len()),
            (Action::NoOp, self.unchanged),
            (Action::Skipped, self.skipped.len()),
        ]
    }
}

/// Mirrors changes from a source calendar into a target calendar
///
/// Runs for the same pair are serialized; runs for different pairs proceed
/// independently.
pub struct SyncEngine {
    client: Arc<dyn CalendarClient>,
    store: Arc<dyn TokenStore>,
    policy: ReconciliationPolicy,
    pair_locks: Mutex<HashMap<PairKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(client: Arc<dyn CalendarClient>, store: Arc<dyn TokenStore>) -> Self {
        Self {
            policy: ReconciliationPolicy::new(client.clone()),
            client,
            store,
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Persisted cursors of a pair
    pub fn state(&self, source: &str, target: &str) -> Result<SyncState> {
        SyncState::load(self.store.as_ref(), &PairKey::new(source, target))
    }

    /// Forget a pair's cursors so its next run is a full sync
    pub fn reset(&self, source: &str, target: &str) -> Result<()> {
        SyncState::clear(self.store.as_ref(), &PairKey::new(source, target))
    }

    /// Mirror every change since the last completed run
    ///
    /// Without a saved sync token the source is listed in full, bounded by
    /// `window`. If the provider invalidates the cursor, both tokens are cleared
    /// and the run restarts once from a full sync with the same window; a second
    /// invalidation propagates. Any other error leaves the tokens at the last
    /// fully processed page.
    pub async fn run(&self, source: &str, target: &str, window: &TimeWindow) -> Result<SyncReport> {
        if source.trim().is_empty() {
            return Err(MirrorError::Config("Source calendar id is required".into()));
        }
        if target.trim().is_empty() {
            return Err(MirrorError::Config("Target calendar id is required".into()));
        }
        window.validate()?;

        let key = PairKey::new(source, target);
        let pair_lock = self.pair_lock(&key);
        let _guard = pair_lock.lock().await;

        let started = Instant::now();
        let mut report = SyncReport::new(&key);

        match self.drain(&key, window, &mut report).await {
            Ok(()) => {}
            Err(e) if e.is_token_invalid() => {
                warn!(
                    source = %source,
                    target = %target,
                    error = %e,
                    "Sync token invalidated, restarting with a full sync"
                );
                SyncState::clear(self.store.as_ref(), &key)?;
                report.resynced = true;
                self.drain(&key, window, &mut report).await?;
            }
            Err(e) => return Err(e),
        }

        report.elapsed = started.elapsed();
        info!(
            source = %source,
            target = %target,
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            skipped = report.skipped.len(),
            unchanged = report.unchanged,
            pages = report.pages,
            full_sync = report.full_sync,
            "Sync run complete"
        );
        Ok(report)
    }

    /// Process pages until the provider stops returning page tokens
    async fn drain(&self, key: &PairKey, window: &TimeWindow, report: &mut SyncReport) -> Result<()> {
        let store = self.store.as_ref();
        let mut state = SyncState::load(store, key)?;

        loop {
            let query = state.query(window);
            if query.is_full() {
                report.full_sync = true;
            }

            let page = self.client.list_events(&key.source, &query).await?;
            report.pages += 1;
            debug!(
                source = %key.source,
                items = page.items.len(),
                more = page.next_page_token.is_some(),
                "Fetched page"
            );

            for event in &page.items {
                let action = self.policy.reconcile(&key.target, event).await?;
                report.record(&event.id, action);
            }

            state.advance(store, key, &page)?;
            if state.page_token.is_none() {
                return Ok(());
            }
        }
    }

    fn pair_lock(&self, key: &PairKey) -> Arc<tokio::sync::Mutex<()>> {
        self.pair_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }
}
