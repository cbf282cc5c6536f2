//! Periodically rebuilds the jobs table's indexes. Bloated btree indexes
//! are a known failure mode for a high-churn queue table; this is an
//! adapter-specific operation, so it's gated behind its own small trait
//! rather than living on [`crate::store::JobStore`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Implemented by adapters that can rebuild their own indexes in place
/// (e.g. `REINDEX INDEX CONCURRENTLY` for Postgres). Adapters that have
/// nothing dialect-specific to do may skip implementing it — the plugin
/// simply isn't registered in that case.
#[async_trait]
pub trait Reindexable: Send + Sync {
    async fn reindex(&self) -> Result<(), crate::error::JobStoreError>;
}

/// Default interval between reindex passes (supplemented default: 24h).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct Reindexer {
    target: Arc<dyn Reindexable>,
    leader: watch::Receiver<bool>,
    interval: Duration,
}

impl Reindexer {
    pub fn new(target: Arc<dyn Reindexable>, leader: watch::Receiver<bool>) -> Self {
        Self {
            target,
            leader,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    async fn tick(&self) {
        if !*self.leader.borrow() {
            return;
        }
        match self.target.reindex().await {
            Ok(()) => tracing::info!(target: "oban::reindexer", "stop"),
            Err(e) => tracing::warn!(target: "oban::reindexer", error = %e, "reindex failed"),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    struct CountingTarget(AtomicUsize);

    #[async_trait]
    impl Reindexable for CountingTarget {
        async fn reindex(&self) -> Result<(), crate::error::JobStoreError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn skips_when_not_leader() {
        let target = Arc::new(CountingTarget(AtomicUsize::new(0)));
        let (_tx, rx) = watch::channel(false);
        let reindexer = Reindexer::new(target.clone(), rx).with_interval(Duration::from_millis(5));
        reindexer.tick().await;
        assert_eq!(target.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reindexes_when_leader() {
        let target = Arc::new(CountingTarget(AtomicUsize::new(0)));
        let (_tx, rx) = watch::channel(true);
        let reindexer = Reindexer::new(target.clone(), rx).with_interval(Duration::from_millis(5));
        reindexer.tick().await;
        assert_eq!(target.0.load(Ordering::SeqCst), 1);
    }
}
