//! Bounded-wait lock around trigger creation
//!
//! Guards every "check whether a trigger exists, then create one" sequence:
//! subscription activation, renewal and teardown, and the journal's pending-queue
//! append plus flush-trigger creation. Failing to acquire the lock within its
//! wait is reported as [`MirrorError::LockTimeout`], which callers may retry.
//!
//! # Example
//!
//! ```no_run
//! use calmirror::lock::TriggerLock;
//! use std::time::Duration;
//!
//! # async fn example() -> calmirror::Result<()> {
//! let lock = TriggerLock::new(Duration::from_secs(1));
//! let _guard = lock.acquire("activate").await?;
//! // check-then-create runs here
//! # Ok(())
//! # }
//! ```

use crate::{MirrorError, Result};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Default bounded wait
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct TriggerLock {
    inner: Mutex<()>,
    timeout: Duration,
}

impl Default for TriggerLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl TriggerLock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait up to the configured timeout for the lock
    ///
    /// `purpose` names the critical section in the error and logs.
    pub async fn acquire(&self, purpose: &str) -> Result<MutexGuard<'_, ()>> {
        match tokio::time::timeout(self.timeout, self.inner.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                tracing::warn!(
                    purpose,
                    wait_ms = self.timeout.as_millis() as u64,
                    "Could not acquire trigger lock"
                );
                Err(MirrorError::LockTimeout(format!(
                    "{} (waited {:?})",
                    purpose, self.timeout
                )))
            }
        }
    }
}
