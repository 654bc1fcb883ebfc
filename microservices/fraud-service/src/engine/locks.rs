//! Per-user scoring locks
//!
//! Serializes analyze requests for the same (tenant, user) pair inside one
//! process so velocity counts see every earlier write. Entries are dropped
//! once nobody holds or waits on them.

use std::sync::Arc;

use dashmap::DashMap;
use opsdesk_core::TenantId;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockKey = (TenantId, String);

#[derive(Clone, Default)]
pub struct UserLocks {
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, tenant: TenantId, user_id: &str) -> UserLockGuard {
        let key = (tenant, user_id.to_string());
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        UserLockGuard {
            locks: Arc::clone(&self.locks),
            key,
            guard: Some(guard),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct UserLockGuard {
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLockGuard {
    fn drop(&mut self) {
        // Release first so the strong count only reflects the map and waiters
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
