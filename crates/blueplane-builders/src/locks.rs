//! Session-Keyed Locks
//!
//! Multiple workers can hold CDC records for the same session at the same
//! time. Builder updates for one session are serialized through a per-key
//! async mutex; updates across distinct sessions stay parallel. The lock is
//! held only for the duration of one update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct SessionLockMap {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one session key, creating it on first use.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("lock map poisoned");
            Arc::clone(
                map.entry(key.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub fn tracked_sessions(&self) -> usize {
        self.inner.lock().expect("lock map poisoned").len()
    }
}
