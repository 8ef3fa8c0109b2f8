//! Composition root for the mirror
//!
//! Wires the sync engine, subscription manager and journal to one calendar
//! client, token store and scheduler, and exposes the entry points the hosting
//! layer calls: notification delivery, scheduled jobs, start/stop and status.

use crate::calendar::{CalendarClient, TimeWindow, DEFAULT_CHANNEL_TTL};
use crate::daemon::metrics;
use crate::journal::{Journal, JournalSink};
use crate::lock::TriggerLock;
use crate::scheduler::{Job, Scheduler};
use crate::store::TokenStore;
use crate::subscription::{ActivateOutcome, SubscriptionManager, SubscriptionState, WatcherSettings};
use crate::sync::{SyncEngine, SyncReport, SyncState};
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Snapshot reported by `calmirror status`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub settings: Option<WatcherSettings>,
    pub subscription: SubscriptionState,
    pub sync_state: Option<SyncState>,
    pub pending_journal_entries: usize,
}

pub struct MirrorService {
    engine: SyncEngine,
    subscriptions: SubscriptionManager,
    journal: Journal,
    window: TimeWindow,
}

impl MirrorService {
    pub fn new(
        client: Arc<dyn CalendarClient>,
        store: Arc<dyn TokenStore>,
        scheduler: Arc<dyn Scheduler>,
        sink: Arc<dyn JournalSink>,
        lock: Arc<TriggerLock>,
    ) -> Self {
        Self {
            engine: SyncEngine::new(client.clone(), store.clone()),
            subscriptions: SubscriptionManager::new(client, store.clone(), scheduler.clone(), lock.clone())
                .with_channel_ttl(DEFAULT_CHANNEL_TTL),
            journal: Journal::new(sink, store, scheduler, lock),
            window: TimeWindow::unbounded(),
        }
    }

    /// Window applied to every full sync
    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_channel_ttl(mut self, ttl: Duration) -> Self {
        self.subscriptions = self.subscriptions.with_channel_ttl(ttl);
        self
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    /// Mirror `source` into `target` in response to a notification or tick
    pub async fn on_notification(&self, source: &str, target: &str) -> Result<SyncReport> {
        self.sync_with_window(source, target, &self.window).await
    }

    /// Run one pair with an explicit full-sync window
    pub async fn sync_with_window(
        &self,
        source: &str,
        target: &str,
        window: &TimeWindow,
    ) -> Result<SyncReport> {
        let result = self.engine.run(source, target, window).await;

        match &result {
            Ok(report) => {
                metrics::record_sync(report);
                if report.resynced {
                    self.journal
                        .warn(format!("Sync token for {} was invalidated, ran a full sync", source));
                }
                if !report.skipped.is_empty() {
                    self.journal.warn(format!(
                        "Skipped {} event(s) rejected by {}: {}",
                        report.skipped.len(),
                        target,
                        report.skipped.join(", ")
                    ));
                }
                self.journal.info(format!(
                    "Synced {} -> {}: {} created, {} updated, {} deleted, {} unchanged",
                    source,
                    target,
                    report.created.len(),
                    report.updated.len(),
                    report.deleted.len(),
                    report.unchanged
                ));
            }
            Err(e) => {
                metrics::record_error("sync", e);
                self.journal
                    .error(format!("Sync {} -> {} failed: {}", source, target, e));
            }
        }

        self.commit_journal().await;
        result
    }

    /// Run the pair named in the saved settings
    pub async fn sync_configured(&self) -> Result<SyncReport> {
        let settings = self.subscriptions.settings()?;
        self.on_notification(&settings.source_calendar_id, &settings.target_calendar_id)
            .await
    }

    /// Execute a job fired by the scheduler
    pub async fn handle_job(&self, job: Job) -> Result<()> {
        info!(job = %job, "Running scheduled job");
        match job {
            Job::SyncCalendars => self.sync_configured().await.map(|_| ()),
            Job::RenewSubscription => {
                let result = self.subscriptions.renew().await;
                metrics::record_renewal(result.is_ok());
                match &result {
                    Ok(outcome) => self.journal.info(format!("Renewed watcher: {}", describe(outcome.state()))),
                    Err(e) => {
                        metrics::record_error("renew", e);
                        self.journal.error(format!("Watcher renewal failed: {}", e));
                    }
                }
                self.commit_journal().await;
                result.map(|_| ())
            }
            Job::FlushJournal => self.journal.flush_pending().await.map(|_| ()),
        }
    }

    /// Save settings and (re)create the watcher
    pub async fn start(&self, settings: &WatcherSettings) -> Result<ActivateOutcome> {
        let outcome = self.subscriptions.start(settings).await?;
        self.journal.info(format!(
            "Mirroring {} -> {} ({})",
            settings.source_calendar_id,
            settings.target_calendar_id,
            describe(outcome.state())
        ));
        self.commit_journal().await;
        Ok(outcome)
    }

    /// Tear down the watcher, keeping settings
    pub async fn stop(&self) -> Result<bool> {
        let stopped = self.subscriptions.stop().await?;
        if stopped {
            self.journal.info("Watcher stopped");
            self.commit_journal().await;
        }
        Ok(stopped)
    }

    pub fn status(&self) -> Result<ServiceStatus> {
        let settings = self.subscriptions.try_settings()?;
        let sync_state = match &settings {
            Some(s) => Some(self.engine.state(&s.source_calendar_id, &s.target_calendar_id)?),
            None => None,
        };
        Ok(ServiceStatus {
            subscription: self.subscriptions.state()?,
            pending_journal_entries: self.journal.pending()?.len(),
            settings,
            sync_state,
        })
    }

    async fn commit_journal(&self) {
        if let Err(e) = self.journal.commit().await {
            warn!(error = %e, "Journal commit failed");
        }
    }
}

fn describe(state: &SubscriptionState) -> String {
    match state {
        SubscriptionState::Inactive => "inactive".to_string(),
        SubscriptionState::ActiveChannel { channel, .. } => {
            format!("channel {} until {}", channel.id, channel.expiration.to_rfc3339())
        }
        SubscriptionState::ActivePoll { .. } => "polling".to_string(),
    }
}
