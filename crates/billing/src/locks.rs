//! Per-user serialization of plan changes within one process

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Prune idle entries once the map grows past this size
const PRUNE_THRESHOLD: usize = 1024;

/// Hands out one async mutex per user. Requests for the same user queue up;
/// requests for different users never contend beyond the map lookup.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the user's billing state
    pub async fn acquire(&self, user_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() > PRUNE_THRESHOLD {
                // Only the map holds a reference: nobody is waiting on it
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(user_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn tracked_users(&self) -> usize {
        self.locks.lock().await.len()
    }
}
