//! In-memory token store for tests and dry runs

use super::TokenStore;
use crate::Result;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Memory store whose reads or writes can be switched to fail
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FlakyTokenStore {
    inner: MemoryTokenStore,
    pub(crate) fail_reads: std::sync::atomic::AtomicBool,
    pub(crate) fail_writes: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FlakyTokenStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn check(flag: &std::sync::atomic::AtomicBool, op: &str) -> Result<()> {
        if flag.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::MirrorError::Storage(format!("{} refused: disk unavailable", op)));
        }
        Ok(())
    }
}

#[cfg(test)]
impl TokenStore for FlakyTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Self::check(&self.fail_reads, "read")?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        Self::check(&self.fail_writes, "write")?;
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        Self::check(&self.fail_writes, "delete")?;
        self.inner.delete(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = MemoryTokenStore::new();
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", "v1").unwrap();
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));

        store.delete("k").unwrap();
        store.delete("k").unwrap();
        assert!(store.keys().is_empty());
    }
}
