//! Run journal
//!
//! Buffers human-readable run entries during an operation and commits them to a
//! [`JournalSink`] at the end. Every entry is also emitted as a `tracing` event.
//! When the sink cannot be written, the entries go to a persisted pending queue
//! and a single one-shot [`Job::FlushJournal`] trigger is ensured; both steps
//! run under the [`TriggerLock`] so concurrent commits never create a second
//! flush trigger.

use crate::lock::TriggerLock;
use crate::scheduler::{Job, Scheduler};
use crate::store::{TokenStore, TokenStoreExt};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

const PENDING_KEY: &str = "journal/pending";
const FLUSH_TRIGGER_KEY: &str = "journal/flush_trigger";

/// Delay before a failed commit is retried
pub const FLUSH_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub level: JournalLevel,
    pub message: String,
}

/// Destination for committed entries
pub trait JournalSink: Send + Sync {
    fn append(&self, entries: &[JournalEntry]) -> Result<()>;
}

/// Appends entries as JSON lines to a file
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry back, skipping blank lines
    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

impl JournalSink for JsonlSink {
    fn append(&self, entries: &[JournalEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for entry in entries {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

pub struct Journal {
    buffer: Mutex<Vec<JournalEntry>>,
    sink: Arc<dyn JournalSink>,
    store: Arc<dyn TokenStore>,
    scheduler: Arc<dyn Scheduler>,
    lock: Arc<TriggerLock>,
}

impl Journal {
    pub fn new(
        sink: Arc<dyn JournalSink>,
        store: Arc<dyn TokenStore>,
        scheduler: Arc<dyn Scheduler>,
        lock: Arc<TriggerLock>,
    ) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            sink,
            store,
            scheduler,
            lock,
        }
    }

    /// Buffer an entry until the next commit
    pub fn write(&self, level: JournalLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            JournalLevel::Info => info!(journal = true, "{}", message),
            JournalLevel::Warn => warn!(journal = true, "{}", message),
            JournalLevel::Error => error!(journal = true, "{}", message),
        }
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(JournalEntry {
                at: Utc::now(),
                level,
                message,
            });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.write(JournalLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.write(JournalLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.write(JournalLevel::Error, message);
    }

    /// Entries waiting for a successful flush
    pub fn pending(&self) -> Result<Vec<JournalEntry>> {
        Ok(self.store.get_json(PENDING_KEY)?.unwrap_or_default())
    }

    /// Deliver pending and buffered entries to the sink
    ///
    /// Returns the number of entries delivered. A sink failure is not an error:
    /// the entries are queued and a flush trigger is ensured, and 0 is returned.
    pub async fn commit(&self) -> Result<usize> {
        let _guard = self.lock.acquire("commit journal").await?;
        // Buffered entries stay put until the queue has been read
        let mut entries = self.pending()?;
        let queued = entries.len();
        entries.extend(mem::take(
            &mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner),
        ));
        if entries.is_empty() {
            return Ok(0);
        }

        match self.sink.append(&entries) {
            Ok(()) => {
                self.store.delete(PENDING_KEY)?;
                if let Some(trigger_id) = self.store.get(FLUSH_TRIGGER_KEY)? {
                    self.scheduler.cancel(&trigger_id)?;
                    self.store.delete(FLUSH_TRIGGER_KEY)?;
                }
                Ok(entries.len())
            }
            Err(e) => {
                warn!(error = %e, pending = entries.len(), "Journal sink unavailable, queueing entries");
                if let Err(store_err) = self.store.set_json(PENDING_KEY, &entries) {
                    self.restore(entries.split_off(queued));
                    return Err(store_err);
                }
                self.ensure_flush_trigger()?;
                Ok(0)
            }
        }
    }

    /// Put entries taken from the buffer back ahead of anything written since
    fn restore(&self, mut entries: Vec<JournalEntry>) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        entries.append(&mut *buffer);
        *buffer = entries;
    }

    /// Retry delivering queued entries
    pub async fn flush_pending(&self) -> Result<usize> {
        self.commit().await
    }

    /// Create the flush trigger unless a live one is already recorded
    fn ensure_flush_trigger(&self) -> Result<()> {
        if let Some(trigger_id) = self.store.get(FLUSH_TRIGGER_KEY)? {
            if self.scheduler.exists(&trigger_id)? {
                return Ok(());
            }
        }
        let trigger_id = self
            .scheduler
            .schedule_once(FLUSH_RETRY_DELAY, Job::FlushJournal)?;
        self.store.set(FLUSH_TRIGGER_KEY, &trigger_id)
    }
}
