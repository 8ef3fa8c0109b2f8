//! calmirror - one-way calendar mirroring
//!
//! Copies every change made to a source calendar onto a target calendar. Changes
//! are pulled incrementally with provider sync tokens and reconciled event by
//! event; a renewable push-notification channel (or a poll trigger when no
//! public endpoint exists) tells the mirror when to run.
//!
//! # Architecture
//!
//! - **calendar**: Provider port, Google Calendar adapter, in-memory fake
//! - **store**: Durable key/value properties (SQLite, memory)
//! - **sync**: Token state, reconciliation policy, incremental engine
//! - **scheduler**: Deferred, daily and calendar-change triggers
//! - **subscription**: Watcher settings and the renewable channel lifecycle
//! - **journal**: Run journal with deferred flush
//! - **service**: Composition root used by the CLI and daemon
//! - **daemon**: Background loop, webhook endpoint, Prometheus metrics

// Core modules
pub mod calendar;
pub mod config;
pub mod error;
pub mod store;
pub mod sync;

// Lifecycle
pub mod lock;
pub mod scheduler;
pub mod subscription;

// Hosting
pub mod daemon;
pub mod journal;
pub mod logging;
pub mod retry;
pub mod service;

// Re-exports
pub use error::{MirrorError, Result};
