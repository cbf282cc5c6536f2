//! Rescues jobs orphaned by a crashed node.
//!
//! A job stuck in `executing` past `rescue_after` with no live producer
//! behind it is either moved back to `available` (attempts remaining) or
//! `discarded` (exhausted) by a single `rescue_jobs` call.

use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default orphan threshold and poll interval.
pub const DEFAULT_RESCUE_AFTER: chrono::Duration = chrono::Duration::minutes(60);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

pub struct Lifeline {
    store: Arc<dyn JobStore>,
    leader: watch::Receiver<bool>,
    interval: Duration,
    rescue_after: chrono::Duration,
}

impl Lifeline {
    pub fn new(store: Arc<dyn JobStore>, leader: watch::Receiver<bool>) -> Self {
        Self {
            store,
            leader,
            interval: DEFAULT_INTERVAL,
            rescue_after: DEFAULT_RESCUE_AFTER,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_rescue_after(mut self, rescue_after: chrono::Duration) -> Self {
        self.rescue_after = rescue_after;
        self
    }

    async fn tick(&self) {
        if !*self.leader.borrow() {
            return;
        }
        match self.store.rescue_jobs(self.rescue_after, chrono::Utc::now()).await {
            Ok(outcome) => {
                if !outcome.rescued.is_empty() || !outcome.discarded.is_empty() {
                    tracing::info!(
                        target: "oban::lifeline",
                        rescued_count = outcome.rescued.len(),
                        discarded_count = outcome.discarded.len(),
                        "stop"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(target: "oban::lifeline", error = %e, "rescue_jobs failed");
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
