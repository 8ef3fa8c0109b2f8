//! Mirror daemon
//!
//! Runs as a tokio event loop that plays the scheduler's role for a local host:
//! a tick interval fires due one-shot and daily triggers, a poll interval fires
//! calendar-change triggers, and a command channel accepts manual requests.
//! Transient job failures are retried with backoff here, never inside a sync run.

pub mod metrics;
pub mod server;

use crate::retry::{with_retry, RetryConfig};
use crate::scheduler::{Job, LocalScheduler};
use crate::service::MirrorService;
use crate::sync::SyncReport;
use crate::{MirrorError, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Default interval for firing time-based triggers (30 seconds)
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval for firing calendar-change triggers (60 seconds)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub tick_interval: Duration,
    pub poll_interval: Duration,
    /// Event broadcast channel capacity
    pub event_channel_capacity: usize,
    /// Backoff for transient job failures
    pub retry: RetryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            event_channel_capacity: 100,
            retry: RetryConfig::for_sync_runs(),
        }
    }
}

impl DaemonConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Events emitted by the daemon
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    Started,
    Stopped,
    /// A sync run finished
    Synced(SyncReport),
    /// A scheduled job finished successfully
    JobCompleted(Job),
    /// A job failed after retries
    Error { job: Job, message: String },
}

/// Commands accepted by a running daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonCommand {
    /// Run the configured pair now
    SyncNow,
    /// Replace the watcher now
    Renew,
    Shutdown,
}

enum CommandResult {
    Continue,
    Stop,
}

pub struct MirrorDaemon {
    config: DaemonConfig,
    service: Arc<MirrorService>,
    scheduler: Arc<LocalScheduler>,
    event_tx: broadcast::Sender<DaemonEvent>,
    command_rx: Option<mpsc::Receiver<DaemonCommand>>,
    command_tx: mpsc::Sender<DaemonCommand>,
}

impl MirrorDaemon {
    pub fn new(
        config: DaemonConfig,
        service: Arc<MirrorService>,
        scheduler: Arc<LocalScheduler>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(10);
        Self {
            config,
            service,
            scheduler,
            event_tx,
            command_rx: Some(command_rx),
            command_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    pub fn command_sender(&self) -> mpsc::Sender<DaemonCommand> {
        self.command_tx.clone()
    }

    fn send_event(&self, event: DaemonEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Run the event loop until a shutdown command or SIGTERM/SIGINT
    pub async fn run(&mut self) -> Result<()> {
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| MirrorError::Config("Daemon already running".to_string()))?;

        metrics::set_health_status(true);
        self.send_event(DaemonEvent::Started);
        tracing::info!(
            tick_secs = self.config.tick_interval.as_secs_f64(),
            poll_secs = self.config.poll_interval.as_secs_f64(),
            "Mirror daemon started"
        );

        let mut tick = tokio::time::interval(self.config.tick_interval);
        let mut poll = tokio::time::interval(self.config.poll_interval);

        #[cfg(unix)]
        self.run_with_signals(&mut tick, &mut poll, &mut command_rx)
            .await?;

        #[cfg(not(unix))]
        self.run_without_signals(&mut tick, &mut poll, &mut command_rx)
            .await;

        // Deliver whatever the journal still holds
        if let Err(e) = self.service.journal().commit().await {
            tracing::warn!(error = %e, "Final journal commit failed");
        }

        metrics::set_health_status(false);
        self.send_event(DaemonEvent::Stopped);
        tracing::info!("Mirror daemon stopped");
        Ok(())
    }

    #[cfg(unix)]
    async fn run_with_signals(
        &self,
        tick: &mut tokio::time::Interval,
        poll: &mut tokio::time::Interval,
        command_rx: &mut mpsc::Receiver<DaemonCommand>,
    ) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| MirrorError::Other(format!("Failed to set up SIGTERM handler: {}", e)))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| MirrorError::Other(format!("Failed to set up SIGINT handler: {}", e)))?;

        loop {
            tokio::select! {
                _ = tick.tick() => self.fire_due().await,
                _ = poll.tick() => self.fire_calendar_changes().await,
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let CommandResult::Stop = self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                    break;
                }
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn run_without_signals(
        &self,
        tick: &mut tokio::time::Interval,
        poll: &mut tokio::time::Interval,
        command_rx: &mut mpsc::Receiver<DaemonCommand>,
    ) {
        loop {
            tokio::select! {
                _ = tick.tick() => self.fire_due().await,
                _ = poll.tick() => self.fire_calendar_changes().await,
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let CommandResult::Stop = self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_command(&self, cmd: DaemonCommand) -> CommandResult {
        match cmd {
            DaemonCommand::SyncNow => self.run_job(Job::SyncCalendars).await,
            DaemonCommand::Renew => self.run_job(Job::RenewSubscription).await,
            DaemonCommand::Shutdown => {
                tracing::info!("Received shutdown command");
                return CommandResult::Stop;
            }
        }
        CommandResult::Continue
    }

    /// Fire one-shot and daily triggers whose time has come
    async fn fire_due(&self) {
        let due = match self.scheduler.due(Utc::now()) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read trigger table");
                return;
            }
        };
        for job in unique_jobs(due) {
            self.run_job(job).await;
        }
    }

    /// Fire change triggers for every watched calendar
    ///
    /// An incremental run over an unchanged calendar issues no writes, so
    /// polling stands in for provider-side change events.
    async fn fire_calendar_changes(&self) {
        let mut fired = Vec::new();
        for calendar_id in self.scheduler.watched_calendars() {
            fired.extend(self.scheduler.calendar_changed(&calendar_id));
        }
        for job in unique_jobs(fired) {
            self.run_job(job).await;
        }
    }

    async fn run_job(&self, job: Job) {
        let service = self.service.as_ref();

        let result = match job {
            Job::SyncCalendars => {
                with_retry(&self.config.retry, job.as_str(), move || service.sync_configured())
                    .await
                    .map(|report| self.send_event(DaemonEvent::Synced(report)))
            }
            _ => with_retry(&self.config.retry, job.as_str(), move || service.handle_job(job)).await,
        };

        match result {
            Ok(()) => self.send_event(DaemonEvent::JobCompleted(job)),
            Err(e) => {
                tracing::error!(job = %job, error = %e, "Scheduled job failed");
                self.send_event(DaemonEvent::Error {
                    job,
                    message: e.to_string(),
                });
            }
        }
    }
}

/// Jobs in first-seen order without repeats
fn unique_jobs(fired: Vec<(String, Job)>) -> Vec<Job> {
    let mut jobs = Vec::new();
    for (_, job) in fired {
        if !jobs.contains(&job) {
            jobs.push(job);
        }
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{Event, InMemoryCalendar};
    use crate::journal::JsonlSink;
    use crate::lock::TriggerLock;
    use crate::scheduler::Scheduler;
    use crate::store::MemoryTokenStore;
    use crate::subscription::WatcherSettings;
    use tempfile::TempDir;

    fn daemon(dir: &TempDir) -> (Arc<InMemoryCalendar>, Arc<MirrorService>, MirrorDaemon) {
        let calendar = Arc::new(InMemoryCalendar::new());
        let scheduler = Arc::new(LocalScheduler::new());
        let service = Arc::new(MirrorService::new(
            calendar.clone(),
            Arc::new(MemoryTokenStore::new()),
            scheduler.clone(),
            Arc::new(JsonlSink::new(dir.path().join("journal.jsonl"))),
            Arc::new(TriggerLock::default()),
        ));
        let config = DaemonConfig::default()
            .with_tick_interval(Duration::from_millis(10))
            .with_poll_interval(Duration::from_millis(10))
            .with_retry(RetryConfig::none());
        let daemon = MirrorDaemon::new(config, service.clone(), scheduler);
        (calendar, service, daemon)
    }

    #[test]
    fn test_unique_jobs_keeps_order() {
        let fired = vec![
            ("t1".to_string(), Job::SyncCalendars),
            ("t2".to_string(), Job::FlushJournal),
            ("t3".to_string(), Job::SyncCalendars),
        ];
        assert_eq!(unique_jobs(fired), vec![Job::SyncCalendars, Job::FlushJournal]);
    }

    #[tokio::test]
    async fn test_poll_tick_mirrors_changes() {
        let dir = TempDir::new().unwrap();
        let (calendar, service, mut daemon) = daemon(&dir);
        calendar.insert("src", Event::new("e1"));
        service
            .start(&WatcherSettings::new("src", "dst"))
            .await
            .unwrap();

        let commands = daemon.command_sender();
        let mut events = daemon.subscribe();
        let handle = tokio::spawn(async move { daemon.run().await });

        let synced = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(DaemonEvent::Synced(report)) = events.recv().await {
                    return report;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(synced.source, "src");
        assert!(calendar.event("dst", "e1").is_some());

        commands.send(DaemonCommand::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_job_emits_error_event() {
        let dir = TempDir::new().unwrap();
        let (_, _, mut daemon) = daemon(&dir);

        let commands = daemon.command_sender();
        let mut events = daemon.subscribe();
        let handle = tokio::spawn(async move { daemon.run().await });

        // No settings saved yet, so a manual sync is a configuration error
        commands.send(DaemonCommand::SyncNow).await.unwrap();
        let error = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(DaemonEvent::Error { job, message }) = events.recv().await {
                    return (job, message);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(error.0, Job::SyncCalendars);
        assert!(error.1.contains("not configured"));

        commands.send(DaemonCommand::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_due_flush_trigger_runs() {
        let dir = TempDir::new().unwrap();
        let calendar = Arc::new(InMemoryCalendar::new());
        let scheduler = Arc::new(LocalScheduler::new());
        let service = Arc::new(MirrorService::new(
            calendar,
            Arc::new(MemoryTokenStore::new()),
            scheduler.clone(),
            Arc::new(JsonlSink::new(dir.path().join("journal.jsonl"))),
            Arc::new(TriggerLock::default()),
        ));
        scheduler
            .schedule_once(Duration::from_millis(1), Job::FlushJournal)
            .unwrap();
        let mut daemon = MirrorDaemon::new(
            DaemonConfig::default()
                .with_tick_interval(Duration::from_millis(10))
                .with_retry(RetryConfig::none()),
            service,
            scheduler.clone(),
        );

        let commands = daemon.command_sender();
        let mut events = daemon.subscribe();
        let handle = tokio::spawn(async move { daemon.run().await });

        let job = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(DaemonEvent::JobCompleted(job)) = events.recv().await {
                    return job;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(job, Job::FlushJournal);
        assert!(scheduler.triggers().is_empty());

        commands.send(DaemonCommand::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
