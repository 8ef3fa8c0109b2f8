//! Configuration system
//!
//! Loads ~/.config/calmirror/config.yaml with:
//! - The calendar pair and optional webhook endpoint
//! - State database and journal locations
//! - Full-sync window, timeouts and daemon intervals
//! - Calendar API endpoint and credentials

mod mirror_config;

pub use mirror_config::MirrorConfig;
