//! Deletes old terminal-state job rows.

use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default retention window and per-tick bound.
pub const DEFAULT_MAX_AGE: chrono::Duration = chrono::Duration::days(1);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_LIMIT: i64 = 10_000;

pub struct Pruner {
    store: Arc<dyn JobStore>,
    leader: watch::Receiver<bool>,
    interval: Duration,
    max_age: chrono::Duration,
    limit: i64,
}

impl Pruner {
    pub fn new(store: Arc<dyn JobStore>, leader: watch::Receiver<bool>) -> Self {
        Self {
            store,
            leader,
            interval: DEFAULT_INTERVAL,
            max_age: DEFAULT_MAX_AGE,
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_age(mut self, max_age: chrono::Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    async fn tick(&self) -> usize {
        if !*self.leader.borrow() {
            return 0;
        }
        match self.store.prune_jobs(self.max_age, self.limit).await {
            Ok(ids) => {
                if !ids.is_empty() {
                    tracing::debug!(target: "oban::pruner", pruned_count = ids.len(), "stop");
                }
                ids.len()
            }
            Err(e) => {
                tracing::warn!(target: "oban::pruner", error = %e, "prune_jobs failed");
                0
            }
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}
