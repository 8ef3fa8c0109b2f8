//! calmirror - one-way calendar mirroring
//!
//! Main entry point for the calmirror CLI.

use anyhow::{bail, Context};
use calmirror::calendar::{GoogleCalendarClient, GoogleConfig, TimeWindow, TimeoutClient};
use calmirror::config::MirrorConfig;
use calmirror::daemon::server::WebhookServer;
use calmirror::daemon::{DaemonConfig, DaemonEvent, MirrorDaemon};
use calmirror::journal::JsonlSink;
use calmirror::lock::TriggerLock;
use calmirror::scheduler::LocalScheduler;
use calmirror::service::MirrorService;
use calmirror::store::{SqliteTokenStore, TokenStore};
use calmirror::subscription::{ActivateOutcome, SubscriptionState, WatcherSettings};
use calmirror::sync::SyncReport;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// calmirror - mirror one calendar onto another
#[derive(Parser, Debug)]
#[command(name = "calmirror")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/calmirror/config.yaml)
    #[arg(short, long, env = "CALMIRROR_CONFIG")]
    config: Option<PathBuf>,

    /// Log progress at info level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Save the calendar pair and create the watcher
    Start {
        /// Calendar to copy from
        #[arg(long)]
        source: String,

        /// Calendar to copy into
        #[arg(long)]
        target: String,

        /// Public webhook URL; the watcher polls when omitted
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Tear down the watcher, keeping the saved pair
    Stop,

    /// Run one sync now
    Sync {
        /// Calendar to copy from (default: the saved pair)
        #[arg(long, requires = "target")]
        source: Option<String>,

        /// Calendar to copy into
        #[arg(long, requires = "source")]
        target: Option<String>,

        /// Earliest event start for a full sync (RFC 3339)
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// Latest event start for a full sync (RFC 3339)
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },

    /// Show the saved pair, watcher and token state
    Status,

    /// Replace the watcher with a fresh one
    Renew,

    /// Run the webhook endpoint and background scheduler
    Serve,
}

/// Everything a command needs, built from the config file
struct Runtime {
    config: MirrorConfig,
    service: Arc<MirrorService>,
    scheduler: Arc<LocalScheduler>,
}

impl Runtime {
    fn build(config: MirrorConfig) -> anyhow::Result<Self> {
        let mut google_config = GoogleConfig::default()
            .with_base_url(config.api_base_url.clone())
            .with_request_timeout(config.call_timeout());
        if let Some(token) = &config.access_token {
            google_config = google_config.with_access_token(token.clone());
        }
        let google = GoogleCalendarClient::new(google_config)?;
        if !google.is_authenticated() {
            tracing::warn!("No access token configured, calendar calls will be rejected");
        }
        let client = Arc::new(TimeoutClient::new(google, config.call_timeout()));

        let store: Arc<dyn TokenStore> = Arc::new(
            SqliteTokenStore::open(&config.database)
                .with_context(|| format!("Failed to open {}", config.database.display()))?,
        );
        let scheduler = Arc::new(LocalScheduler::persistent(store.clone())?);
        let lock = Arc::new(TriggerLock::new(config.lock_timeout()));
        let sink = Arc::new(JsonlSink::new(config.journal.clone()));

        let service = MirrorService::new(client, store, scheduler.clone(), sink, lock)
            .with_window(config.sync_window()?)
            .with_channel_ttl(config.channel_ttl());

        Ok(Self {
            config,
            service: Arc::new(service),
            scheduler,
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    if let Err(e) = calmirror::logging::init(cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.unwrap_or_else(MirrorConfig::default_path);
    let config = MirrorConfig::load_or_default(&config_path)?;
    let runtime = Runtime::build(config)?;
    let service = runtime.service.clone();

    match cli.command {
        Commands::Start {
            source,
            target,
            endpoint,
        } => {
            let mut settings = WatcherSettings::new(source, target);
            if let Some(endpoint) = endpoint {
                settings = settings.with_endpoint(endpoint);
            }
            let outcome = service.start(&settings).await?;
            println!(
                "Mirroring {} -> {}",
                settings.source_calendar_id, settings.target_calendar_id
            );
            print_outcome(&outcome);
        }

        Commands::Stop => {
            if service.stop().await? {
                println!("Watcher stopped");
            } else {
                println!("No watcher was active");
            }
        }

        Commands::Sync {
            source,
            target,
            start,
            end,
        } => {
            let window = if start.is_some() || end.is_some() {
                TimeWindow::new(start, end)?
            } else {
                *service.window()
            };
            let (source, target) = match (source, target) {
                (Some(source), Some(target)) => (source, target),
                _ => {
                    let settings = match service.subscriptions().try_settings()? {
                        Some(settings) => settings,
                        None => match runtime.config.watcher_settings() {
                            Some(settings) => settings,
                            None => bail!(
                                "No calendar pair configured. Run `calmirror start` or pass --source and --target"
                            ),
                        },
                    };
                    (settings.source_calendar_id, settings.target_calendar_id)
                }
            };
            let report = service.sync_with_window(&source, &target, &window).await?;
            print_report(&report);
        }

        Commands::Status => {
            let status = service.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Renew => {
            let outcome = service.subscriptions().renew().await?;
            print_outcome(&outcome);
        }

        Commands::Serve => serve(runtime).await?,
    }

    Ok(())
}

async fn serve(runtime: Runtime) -> anyhow::Result<()> {
    let Runtime {
        config,
        service,
        scheduler,
    } = runtime;

    // Pair from the config file wins over a stale stored one
    if let Some(settings) = config.watcher_settings() {
        if service.subscriptions().try_settings()?.as_ref() != Some(&settings) {
            service.start(&settings).await?;
        }
    }
    if service.subscriptions().try_settings()?.is_some() {
        let outcome = service.subscriptions().activate().await?;
        tracing::info!(state = ?outcome.state(), "Watcher ready");
    } else {
        tracing::warn!("No calendar pair configured, serving without a watcher");
    }

    let server = WebhookServer::new(service.clone());
    let listen = config.listen.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(&listen).await {
            tracing::error!(error = %e, "Webhook server stopped");
        }
    });

    let daemon_config = DaemonConfig::default()
        .with_tick_interval(config.tick_interval())
        .with_poll_interval(config.poll_interval());
    let mut daemon = MirrorDaemon::new(daemon_config, service, scheduler);

    let mut events = daemon.subscribe();
    let event_handle = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DaemonEvent::Synced(report) => print_report(&report),
                DaemonEvent::Error { job, message } => eprintln!("{} failed: {}", job, message),
                DaemonEvent::Stopped => break,
                _ => {}
            }
        }
    });

    println!("calmirror listening on {}", config.listen);
    let result = daemon.run().await;

    server_handle.abort();
    event_handle.abort();
    result?;
    Ok(())
}

fn print_outcome(outcome: &ActivateOutcome) {
    if let ActivateOutcome::AlreadyActive(_) = outcome {
        println!("Watcher already active");
    }
    match outcome.state() {
        SubscriptionState::ActiveChannel { channel, .. } => println!(
            "Channel {} expires {}",
            channel.id,
            channel.expiration.to_rfc3339()
        ),
        SubscriptionState::ActivePoll { .. } => println!("Polling for changes"),
        SubscriptionState::Inactive => println!("Watcher inactive"),
    }
}

fn print_report(report: &SyncReport) {
    println!(
        "{} -> {}: {} created, {} updated, {} deleted, {} skipped, {} unchanged ({} page(s){})",
        report.source,
        report.target,
        report.created.len(),
        report.updated.len(),
        report.deleted.len(),
        report.skipped.len(),
        report.unchanged,
        report.pages,
        if report.resynced {
            ", resynced"
        } else if report.full_sync {
            ", full sync"
        } else {
            ""
        }
    );
}
