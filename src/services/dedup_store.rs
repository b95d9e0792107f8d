//! Claimed-task dedup cache.
//!
//! Task ids are remembered for a fixed TTL from first offer. Push and poll
//! delivery both go through [`DedupStore::try_claim`], so a task announced
//! twice inside the window is handed to the executor once.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::domain::models::TaskId;

pub struct DedupStore {
    ttl: Duration,
    entries: Mutex<HashMap<TaskId, Instant>>,
}

impl DedupStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record `task_id` as seen. Returns `false` if it is already present and
    /// unexpired; the check and insert happen under one lock.
    pub async fn try_claim(&self, task_id: TaskId) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(&task_id) {
            Some(expires_at) if *expires_at > now => false,
            _ => {
                entries.insert(task_id, now + self.ttl);
                true
            }
        }
    }

    pub async fn contains(&self, task_id: &TaskId) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .get(task_id)
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Drop an entry early so the task can be redelivered.
    pub async fn forget(&self, task_id: &TaskId) -> bool {
        self.entries.lock().await.remove(task_id).is_some()
    }

    /// Remove expired entries, returning how many were dropped.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
