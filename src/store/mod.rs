//! Durable key-value storage for sync tokens and subscription records
//!
//! The sync engine and subscription manager load their state through
//! [`TokenStore`] at the start of each operation and save it at the end; nothing
//! is held in process-wide variables.

mod memory;
mod sqlite;

pub use memory::MemoryTokenStore;
#[cfg(test)]
pub(crate) use memory::FlakyTokenStore;
pub use sqlite::SqliteTokenStore;

use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// String key-value store, durable across restarts for production implementations
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key; removing a missing key is not an error
    fn delete(&self, key: &str) -> Result<()>;
}

/// Typed records stored as JSON strings
pub trait TokenStoreExt {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>>;

    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()>;
}

impl<S: TokenStore + ?Sized> TokenStoreExt for S {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, &serde_json::to_string(value)?)
    }
}
