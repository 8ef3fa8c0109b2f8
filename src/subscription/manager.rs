//! Watcher activation, renewal and teardown

use super::{
    RenewalPlan, SubscriptionState, WatcherMode, WatcherRecord, WatcherSettings, RECORD_KEY,
    RENEWAL_RETRY_DELAY, RETRY_KEY, SETTINGS_KEY,
};
use crate::calendar::{CalendarClient, Channel, ChannelRequest, DEFAULT_CHANNEL_TTL};
use crate::lock::TriggerLock;
use crate::scheduler::{Job, Scheduler};
use crate::store::{TokenStore, TokenStoreExt};
use crate::{MirrorError, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of [`SubscriptionManager::activate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivateOutcome {
    /// A new watcher was created
    Activated(SubscriptionState),
    /// A watcher already existed and was left untouched
    AlreadyActive(SubscriptionState),
}

impl ActivateOutcome {
    pub fn state(&self) -> &SubscriptionState {
        match self {
            ActivateOutcome::Activated(state) | ActivateOutcome::AlreadyActive(state) => state,
        }
    }
}

/// Owns the persisted watcher record
///
/// Every state change runs under the shared [`TriggerLock`], so two concurrent
/// activations cannot both conclude that no watcher exists.
pub struct SubscriptionManager {
    client: Arc<dyn CalendarClient>,
    store: Arc<dyn TokenStore>,
    scheduler: Arc<dyn Scheduler>,
    lock: Arc<TriggerLock>,
    channel_ttl: Duration,
}

impl SubscriptionManager {
    pub fn new(
        client: Arc<dyn CalendarClient>,
        store: Arc<dyn TokenStore>,
        scheduler: Arc<dyn Scheduler>,
        lock: Arc<TriggerLock>,
    ) -> Self {
        Self {
            client,
            store,
            scheduler,
            lock,
            channel_ttl: DEFAULT_CHANNEL_TTL,
        }
    }

    /// Time-to-live requested for new channels
    pub fn with_channel_ttl(mut self, ttl: Duration) -> Self {
        self.channel_ttl = ttl;
        self
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Validate and persist settings without touching the active watcher
    pub fn update_settings(&self, settings: &WatcherSettings) -> Result<()> {
        settings.validate()?;
        self.store.set_json(SETTINGS_KEY, settings)
    }

    pub fn clear_settings(&self) -> Result<()> {
        self.store.delete(SETTINGS_KEY)
    }

    /// Persisted settings; missing settings are a configuration error
    pub fn settings(&self) -> Result<WatcherSettings> {
        self.store
            .get_json::<WatcherSettings>(SETTINGS_KEY)?
            .ok_or_else(|| MirrorError::Config("Watcher settings are not configured".into()))
    }

    /// Persisted settings, if any
    pub fn try_settings(&self) -> Result<Option<WatcherSettings>> {
        self.store.get_json(SETTINGS_KEY)
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn record(&self) -> Result<Option<WatcherRecord>> {
        self.store.get_json(RECORD_KEY)
    }

    /// Current state derived from the persisted record
    ///
    /// A channel past its expiration, a poll record whose trigger no longer
    /// exists, or a record referencing neither is reported as inactive.
    pub fn state(&self) -> Result<SubscriptionState> {
        let Some(record) = self.record()? else {
            return Ok(SubscriptionState::Inactive);
        };

        if let Some(channel) = record.channel {
            if channel.remaining(Utc::now()) <= chrono::Duration::zero() {
                debug!(channel_id = %channel.id, expiration = %channel.expiration, "Recorded channel has expired");
                return Ok(SubscriptionState::Inactive);
            }
            return Ok(SubscriptionState::ActiveChannel {
                channel,
                renewal_trigger_id: record.trigger_id,
            });
        }
        if let Some(trigger_id) = record.trigger_id {
            if self.scheduler.exists(&trigger_id)? {
                return Ok(SubscriptionState::ActivePoll { trigger_id });
            }
        }
        Ok(SubscriptionState::Inactive)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create a watcher unless one is already active
    ///
    /// Calling this while a watcher exists logs a warning and changes nothing.
    pub async fn activate(&self) -> Result<ActivateOutcome> {
        let _guard = self.lock.acquire("activate watcher").await?;
        self.activate_locked().await
    }

    /// Replace the watcher with a fresh one
    ///
    /// The replacement is created and recorded before the old channel and
    /// trigger are retired, so a failed renewal leaves the current watcher in
    /// place and schedules a one-shot retry after [`RENEWAL_RETRY_DELAY`].
    pub async fn renew(&self) -> Result<ActivateOutcome> {
        let _guard = self.lock.acquire("renew watcher").await?;
        let settings = self.settings()?;
        info!(source = %settings.source_calendar_id, "Renewing watcher");

        match self.replace_locked(&settings).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(error = %e, retry_in_secs = RENEWAL_RETRY_DELAY.as_secs(), "Renewal failed, keeping current watcher");
                if let Err(retry_err) = self.ensure_retry() {
                    warn!(error = %retry_err, "Failed to schedule renewal retry");
                }
                Err(e)
            }
        }
    }

    /// Tear down the watcher; returns whether one was recorded
    ///
    /// The persisted record is removed even when the provider refuses to stop
    /// the channel.
    pub async fn stop(&self) -> Result<bool> {
        let _guard = self.lock.acquire("stop watcher").await?;
        self.teardown_locked().await
    }

    /// Apply new settings: validate, stop the old watcher, save, activate
    pub async fn start(&self, settings: &WatcherSettings) -> Result<ActivateOutcome> {
        settings.validate()?;
        let _guard = self.lock.acquire("start watcher").await?;
        self.teardown_locked().await?;
        self.store.set_json(SETTINGS_KEY, settings)?;
        self.activate_locked().await
    }

    /// Forget the settings and stop the watcher
    pub async fn shutdown(&self) -> Result<bool> {
        let _guard = self.lock.acquire("shutdown watcher").await?;
        self.clear_settings()?;
        self.teardown_locked().await
    }

    async fn activate_locked(&self) -> Result<ActivateOutcome> {
        let state = self.state()?;
        if state.is_active() {
            warn!(state = ?state, "Watcher already active, not creating another");
            return Ok(ActivateOutcome::AlreadyActive(state));
        }
        if self.record()?.is_some() {
            // Stale reference: clear whatever it still points at first
            self.teardown_locked().await?;
        }

        let settings = self.settings()?;
        let record = self.create_watcher(&settings).await?;
        if let Err(e) = self.store.set_json(RECORD_KEY, &record) {
            self.retire(&record).await;
            return Err(e);
        }
        self.cancel_retry();
        Ok(ActivateOutcome::Activated(self.state()?))
    }

    /// Swap in a new watcher, then retire the previous one
    async fn replace_locked(&self, settings: &WatcherSettings) -> Result<ActivateOutcome> {
        let previous = self.record()?;
        let record = self.create_watcher(settings).await?;
        if let Err(e) = self.store.set_json(RECORD_KEY, &record) {
            self.retire(&record).await;
            return Err(e);
        }

        if let Some(previous) = previous {
            self.retire(&previous).await;
            info!(mode = ?previous.mode, "Retired previous watcher");
        }
        self.cancel_retry();
        Ok(ActivateOutcome::Activated(self.state()?))
    }

    /// Create a channel or poll trigger for `settings` without recording it
    async fn create_watcher(&self, settings: &WatcherSettings) -> Result<WatcherRecord> {
        let source = settings.source_calendar_id.as_str();

        match settings.endpoint() {
            Some(endpoint) => {
                let request = ChannelRequest::new(endpoint, self.channel_ttl);
                let channel = self.client.create_channel(source, &request).await?;

                let trigger_id = match self.schedule_renewal(&channel) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(channel_id = %channel.id, error = %e, "Renewal trigger failed, stopping new channel");
                        self.stop_channel_best_effort(&channel).await;
                        return Err(e);
                    }
                };

                info!(
                    source = %source,
                    channel_id = %channel.id,
                    expiration = %channel.expiration,
                    trigger_id = %trigger_id,
                    "Activated channel watcher"
                );
                Ok(WatcherRecord {
                    mode: WatcherMode::Channel {
                        endpoint: endpoint.to_string(),
                    },
                    channel: Some(channel),
                    trigger_id: Some(trigger_id),
                    created_at: Utc::now(),
                })
            }
            None => {
                let trigger_id = self
                    .scheduler
                    .schedule_on_calendar_change(source, Job::SyncCalendars)?;
                info!(source = %source, trigger_id = %trigger_id, "Activated poll watcher");
                Ok(WatcherRecord {
                    mode: WatcherMode::Poll,
                    channel: None,
                    trigger_id: Some(trigger_id),
                    created_at: Utc::now(),
                })
            }
        }
    }

    fn schedule_renewal(&self, channel: &Channel) -> Result<String> {
        match RenewalPlan::for_channel(channel, Utc::now()) {
            RenewalPlan::Daily {
                at_hour,
                every_n_days,
            } => self
                .scheduler
                .schedule_recurring_daily(at_hour, every_n_days, Job::RenewSubscription),
            RenewalPlan::Once { after } => {
                self.scheduler.schedule_once(after, Job::RenewSubscription)
            }
        }
    }

    async fn teardown_locked(&self) -> Result<bool> {
        self.cancel_retry();
        let Some(record) = self.record()? else {
            return Ok(false);
        };

        self.retire(&record).await;
        self.store.delete(RECORD_KEY)?;
        info!(mode = ?record.mode, "Stopped watcher");
        Ok(true)
    }

    /// Stop the channel and cancel the trigger a record points at, best-effort
    async fn retire(&self, record: &WatcherRecord) {
        if let Some(channel) = &record.channel {
            self.stop_channel_best_effort(channel).await;
        }
        if let Some(trigger_id) = &record.trigger_id {
            if let Err(e) = self.scheduler.cancel(trigger_id) {
                warn!(trigger_id = %trigger_id, error = %e, "Failed to cancel watcher trigger");
            }
        }
    }

    /// Keep exactly one pending renewal retry
    fn ensure_retry(&self) -> Result<String> {
        if let Some(trigger_id) = self.store.get(RETRY_KEY)? {
            if self.scheduler.exists(&trigger_id)? {
                return Ok(trigger_id);
            }
        }
        let trigger_id = self
            .scheduler
            .schedule_once(RENEWAL_RETRY_DELAY, Job::RenewSubscription)?;
        self.store.set(RETRY_KEY, &trigger_id)?;
        Ok(trigger_id)
    }

    fn cancel_retry(&self) {
        let result = self.store.get(RETRY_KEY).and_then(|retry| match retry {
            Some(trigger_id) => {
                self.scheduler.cancel(&trigger_id)?;
                self.store.delete(RETRY_KEY)
            }
            None => Ok(()),
        });
        if let Err(e) = result {
            warn!(error = %e, "Failed to cancel renewal retry");
        }
    }

    async fn stop_channel_best_effort(&self, channel: &Channel) {
        if let Err(e) = self.client.stop_channel(channel).await {
            warn!(channel_id = %channel.id, error = %e, "Failed to stop channel, leaving it to expire");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{InMemoryCalendar, Operation};
    use crate::scheduler::{LocalScheduler, TriggerKind};
    use crate::store::MemoryTokenStore;

    struct Harness {
        calendar: Arc<InMemoryCalendar>,
        scheduler: Arc<LocalScheduler>,
        store: Arc<MemoryTokenStore>,
        manager: SubscriptionManager,
    }

    fn harness() -> Harness {
        let calendar = Arc::new(InMemoryCalendar::new());
        let scheduler = Arc::new(LocalScheduler::new());
        let store = Arc::new(MemoryTokenStore::new());
        let manager = SubscriptionManager::new(
            calendar.clone(),
            store.clone(),
            scheduler.clone(),
            Arc::new(TriggerLock::new(Duration::from_millis(200))),
        );
        Harness {
            calendar,
            scheduler,
            store,
            manager,
        }
    }

    fn channel_settings() -> WatcherSettings {
        WatcherSettings::new("src", "dst").with_endpoint("https://mirror.example.com/notifications")
    }

    #[tokio::test]
    async fn test_channel_activation_schedules_renewal() {
        let h = harness();
        h.manager.update_settings(&channel_settings()).unwrap();

        let outcome = h.manager.activate().await.unwrap();
        let SubscriptionState::ActiveChannel {
            channel,
            renewal_trigger_id,
        } = outcome.state().clone()
        else {
            panic!("expected channel watcher, got {:?}", outcome);
        };

        assert_eq!(h.calendar.active_channels(), vec![channel]);
        let trigger = h.scheduler.get(&renewal_trigger_id.unwrap()).unwrap();
        assert_eq!(trigger.job, Job::RenewSubscription);
        assert!(matches!(
            trigger.kind,
            TriggerKind::Daily {
                at_hour: 0,
                every_n_days: 6,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_poll_activation_without_endpoint() {
        let h = harness();
        h.manager
            .update_settings(&WatcherSettings::new("src", "dst"))
            .unwrap();

        let outcome = h.manager.activate().await.unwrap();
        assert!(matches!(outcome.state(), SubscriptionState::ActivePoll { .. }));
        assert!(h.calendar.active_channels().is_empty());
        assert_eq!(h.scheduler.calendar_changed("src").len(), 1);
    }

    #[tokio::test]
    async fn test_double_activate_creates_one_watcher() {
        let h = harness();
        h.manager.update_settings(&channel_settings()).unwrap();

        let first = h.manager.activate().await.unwrap();
        let second = h.manager.activate().await.unwrap();

        assert!(matches!(first, ActivateOutcome::Activated(_)));
        assert!(matches!(second, ActivateOutcome::AlreadyActive(_)));
        assert_eq!(h.calendar.active_channels().len(), 1);
        assert_eq!(h.scheduler.triggers().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_activations_create_one_watcher() {
        let h = harness();
        h.manager.update_settings(&channel_settings()).unwrap();

        let (a, b) = tokio::join!(h.manager.activate(), h.manager.activate());
        let outcomes = [a.unwrap(), b.unwrap()];

        let activated = outcomes
            .iter()
            .filter(|o| matches!(o, ActivateOutcome::Activated(_)))
            .count();
        assert_eq!(activated, 1);
        assert_eq!(h.calendar.active_channels().len(), 1);
    }

    #[tokio::test]
    async fn test_activate_without_settings_is_config_error() {
        let h = harness();
        let err = h.manager.activate().await.unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
    }

    #[tokio::test]
    async fn test_renew_replaces_channel_and_trigger() {
        let h = harness();
        h.manager.update_settings(&channel_settings()).unwrap();
        let first = h.manager.activate().await.unwrap().state().clone();

        let renewed = h.manager.renew().await.unwrap();
        assert!(matches!(renewed, ActivateOutcome::Activated(_)));
        assert_ne!(renewed.state(), &first);

        assert_eq!(h.calendar.active_channels().len(), 1);
        assert_eq!(h.calendar.stopped_channels().len(), 1);
        assert_eq!(h.scheduler.triggers().len(), 1);
    }

    #[tokio::test]
    async fn test_renew_survives_failed_channel_stop() {
        let h = harness();
        h.manager.update_settings(&channel_settings()).unwrap();
        h.manager.activate().await.unwrap();
        h.calendar.fail_next(
            Operation::StopChannel,
            MirrorError::provider(500, "backend"),
        );

        let renewed = h.manager.renew().await.unwrap();
        assert!(matches!(renewed.state(), SubscriptionState::ActiveChannel { .. }));
        // The old channel leaked but the new one is the only recorded watcher
        assert_eq!(h.calendar.active_channels().len(), 2);
        assert_eq!(h.scheduler.triggers().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_watcher_and_schedules_retry() {
        let h = harness();
        h.manager.update_settings(&channel_settings()).unwrap();
        let before = h.manager.activate().await.unwrap().state().clone();
        let SubscriptionState::ActiveChannel { channel: original, .. } = before.clone() else {
            panic!("expected channel watcher");
        };

        h.calendar.fail_next(
            Operation::CreateChannel,
            MirrorError::provider(503, "backend unavailable"),
        );
        let err = h.manager.renew().await.unwrap_err();
        assert!(matches!(err, MirrorError::Provider { status: 503, .. }));

        assert_eq!(h.manager.state().unwrap(), before);
        assert_eq!(h.calendar.active_channels(), vec![original.clone()]);
        let retries: Vec<_> = h
            .scheduler
            .triggers()
            .into_iter()
            .filter(|t| matches!(t.kind, TriggerKind::Once { .. }))
            .collect();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].job, Job::RenewSubscription);

        // A second failure reuses the pending retry
        h.calendar.fail_next(
            Operation::CreateChannel,
            MirrorError::provider(503, "backend unavailable"),
        );
        assert!(h.manager.renew().await.is_err());
        assert_eq!(h.scheduler.triggers().len(), 2);

        let renewed = h.manager.renew().await.unwrap();
        assert!(matches!(renewed.state(), SubscriptionState::ActiveChannel { .. }));
        assert_eq!(h.calendar.stopped_channels(), vec![original]);
        assert_eq!(h.scheduler.triggers().len(), 1);
        assert!(h.store.get(RETRY_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_renewal_retry() {
        let h = harness();
        h.manager.update_settings(&channel_settings()).unwrap();
        h.manager.activate().await.unwrap();
        h.calendar.fail_next(
            Operation::CreateChannel,
            MirrorError::provider(500, "backend"),
        );
        assert!(h.manager.renew().await.is_err());

        assert!(h.manager.stop().await.unwrap());
        assert!(h.scheduler.triggers().is_empty());
        assert!(h.store.get(RETRY_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_channel_is_inactive_and_replaced() {
        let h = harness();
        h.manager.update_settings(&channel_settings()).unwrap();
        h.manager.activate().await.unwrap();

        let mut record = h.manager.record().unwrap().unwrap();
        let expired = {
            let channel = record.channel.as_mut().unwrap();
            channel.expiration = Utc::now() - chrono::Duration::hours(1);
            channel.id.clone()
        };
        h.store.set_json(RECORD_KEY, &record).unwrap();
        assert_eq!(h.manager.state().unwrap(), SubscriptionState::Inactive);

        let outcome = h.manager.activate().await.unwrap();
        let SubscriptionState::ActiveChannel { channel, .. } = outcome.state().clone() else {
            panic!("expected channel watcher, got {:?}", outcome);
        };
        assert_ne!(channel.id, expired);
        assert_eq!(h.calendar.active_channels(), vec![channel]);
        assert_eq!(h.scheduler.triggers().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_clears_record_even_when_provider_fails() {
        let h = harness();
        h.manager.update_settings(&channel_settings()).unwrap();
        h.manager.activate().await.unwrap();
        h.calendar
            .fail_next(Operation::StopChannel, MirrorError::NotFound("gone".into()));

        assert!(h.manager.stop().await.unwrap());
        assert_eq!(h.manager.state().unwrap(), SubscriptionState::Inactive);
        assert!(h.manager.record().unwrap().is_none());
        assert!(h.scheduler.triggers().is_empty());
        assert!(!h.manager.stop().await.unwrap());
    }

    #[tokio::test]
    async fn test_start_with_new_endpoint_replaces_watcher() {
        let h = harness();
        h.manager.start(&channel_settings()).await.unwrap();

        let moved = WatcherSettings::new("src", "dst").with_endpoint("https://other.example.com/hook");
        let outcome = h.manager.start(&moved).await.unwrap();

        match outcome.state() {
            SubscriptionState::ActiveChannel { channel, .. } => {
                assert_eq!(channel.address.as_deref(), Some("https://other.example.com/hook"))
            }
            other => panic!("expected channel watcher, got {:?}", other),
        }
        assert_eq!(h.calendar.active_channels().len(), 1);
        assert_eq!(h.manager.settings().unwrap(), moved);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_settings_before_stopping() {
        let h = harness();
        h.manager.start(&channel_settings()).await.unwrap();

        let err = h
            .manager
            .start(&WatcherSettings::new("", "dst"))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
        assert!(h.manager.state().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_stale_poll_record_is_inactive_and_replaced() {
        let h = harness();
        h.manager
            .update_settings(&WatcherSettings::new("src", "dst"))
            .unwrap();
        let outcome = h.manager.activate().await.unwrap();
        let SubscriptionState::ActivePoll { trigger_id } = outcome.state().clone() else {
            panic!("expected poll watcher");
        };

        h.scheduler.cancel(&trigger_id).unwrap();
        assert_eq!(h.manager.state().unwrap(), SubscriptionState::Inactive);

        let again = h.manager.activate().await.unwrap();
        assert!(matches!(again, ActivateOutcome::Activated(_)));
        assert_eq!(h.scheduler.triggers().len(), 1);
    }

    /// Scheduler whose trigger table refuses new entries
    struct FullScheduler;

    impl Scheduler for FullScheduler {
        fn schedule_once(&self, _delay: Duration, _job: Job) -> Result<String> {
            Err(MirrorError::Storage("trigger quota exceeded".into()))
        }

        fn schedule_recurring_daily(&self, _at_hour: u32, _every_n_days: u32, _job: Job) -> Result<String> {
            Err(MirrorError::Storage("trigger quota exceeded".into()))
        }

        fn schedule_on_calendar_change(&self, _calendar_id: &str, _job: Job) -> Result<String> {
            Err(MirrorError::Storage("trigger quota exceeded".into()))
        }

        fn cancel(&self, _trigger_id: &str) -> Result<bool> {
            Ok(false)
        }

        fn exists(&self, _trigger_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_failed_renewal_schedule_stops_new_channel() {
        let calendar = Arc::new(InMemoryCalendar::new());
        let store = Arc::new(MemoryTokenStore::new());
        let manager = SubscriptionManager::new(
            calendar.clone(),
            store,
            Arc::new(FullScheduler),
            Arc::new(TriggerLock::default()),
        );
        manager.update_settings(&channel_settings()).unwrap();

        let err = manager.activate().await.unwrap_err();
        assert!(matches!(err, MirrorError::Storage(_)));
        assert!(calendar.active_channels().is_empty());
        assert_eq!(calendar.stopped_channels().len(), 1);
        assert!(manager.record().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_lived_channel_gets_one_shot_renewal() {
        let h = harness();
        let manager = SubscriptionManager::new(
            h.calendar.clone(),
            h.store.clone(),
            h.scheduler.clone(),
            Arc::new(TriggerLock::default()),
        )
        .with_channel_ttl(Duration::from_secs(3_600));
        manager.update_settings(&channel_settings()).unwrap();

        manager.activate().await.unwrap();
        let triggers = h.scheduler.triggers();
        assert_eq!(triggers.len(), 1);
        assert!(matches!(triggers[0].kind, TriggerKind::Once { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_forgets_settings() {
        let h = harness();
        h.manager.start(&channel_settings()).await.unwrap();

        assert!(h.manager.shutdown().await.unwrap());
        assert!(h.manager.try_settings().unwrap().is_none());
        assert!(h.calendar.active_channels().is_empty());
        assert!(h.store.keys().is_empty());
    }
}
