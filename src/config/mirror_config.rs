//! calmirror configuration file

use crate::calendar::{TimeWindow, DEFAULT_API_BASE_URL};
use crate::subscription::WatcherSettings;
use crate::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn config_dir() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("calmirror");
    path
}

fn default_database() -> PathBuf {
    config_dir().join("state.db")
}

fn default_journal() -> PathBuf {
    config_dir().join("journal.jsonl")
}

fn default_channel_ttl_secs() -> u64 {
    604_800
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_lock_timeout_ms() -> u64 {
    1_000
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_listen() -> String {
    "127.0.0.1:8086".to_string()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

/// Settings loaded from `~/.config/calmirror/config.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_calendar_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_calendar_id: Option<String>,

    /// Public URL of the webhook endpoint; without one the watcher polls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_endpoint: Option<String>,

    /// SQLite file holding tokens, watcher records and triggers
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// JSON-lines run journal
    #[serde(default = "default_journal")]
    pub journal: PathBuf,

    /// Bounds applied to full syncs
    #[serde(default)]
    pub window: TimeWindow,

    #[serde(default = "default_channel_ttl_secs")]
    pub channel_ttl_secs: u64,

    /// Deadline for each calendar API call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Bounded wait for the trigger lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Webhook server bind address
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// OAuth bearer token; `CALMIRROR_ACCESS_TOKEN` is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            source_calendar_id: None,
            target_calendar_id: None,
            channel_endpoint: None,
            database: default_database(),
            journal: default_journal(),
            window: TimeWindow::unbounded(),
            channel_ttl_secs: default_channel_ttl_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            poll_interval_secs: default_poll_interval_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            listen: default_listen(),
            api_base_url: default_api_base_url(),
            access_token: None,
        }
    }
}

impl MirrorConfig {
    /// Get the default config path (~/.config/calmirror/config.yaml)
    pub fn default_path() -> PathBuf {
        config_dir().join("config.yaml")
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(MirrorError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading calmirror configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving calmirror configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        if self.channel_ttl_secs == 0 {
            return Err(MirrorError::Config("channel_ttl_secs must be positive".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(MirrorError::Config("call_timeout_secs must be positive".into()));
        }
        if self.poll_interval_secs == 0 || self.tick_interval_secs == 0 {
            return Err(MirrorError::Config("Daemon intervals must be positive".into()));
        }
        if let Some(settings) = self.watcher_settings() {
            settings.validate()?;
        }
        Ok(())
    }

    /// Watcher settings, when both calendar ids are configured
    pub fn watcher_settings(&self) -> Option<WatcherSettings> {
        let source = self.source_calendar_id.as_deref()?;
        let target = self.target_calendar_id.as_deref()?;
        Some(WatcherSettings {
            source_calendar_id: source.to_string(),
            target_calendar_id: target.to_string(),
            channel_endpoint: self.channel_endpoint.clone(),
        })
    }

    /// Window applied to full syncs
    pub fn sync_window(&self) -> Result<TimeWindow> {
        TimeWindow::new(self.window.start, self.window.end)
    }

    pub fn channel_ttl(&self) -> Duration {
        Duration::from_secs(self.channel_ttl_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}
