//! Moves due `scheduled`/`retryable` jobs to `available`.

use crate::notifier::{Notification, Notifier};
use crate::store::JobStore;
use crate::tap::{Tap, TelemetryEvent};
use std::sync::Arc;
use std::time::Duration;

/// Default tick interval and default per-tick bound.
pub const DEFAULT_STAGE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_STAGE_LIMIT: i64 = 5_000;

pub struct Stager {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    limit: i64,
    tap: Option<Tap>,
}

impl Stager {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<dyn Notifier>, interval: Duration, limit: i64, tap: Option<Tap>) -> Self {
        Self {
            store,
            notifier,
            interval,
            limit,
            tap,
        }
    }

    /// Runs one staging tick: stage due rows, then publish one
    /// `insert{queue}` per queue that received at least one staged row.
    pub async fn tick(&self) -> usize {
        let staged = match self.store.stage_jobs(None, self.limit).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(target: "oban::stager", error = %e, "stage_jobs failed");
                return 0;
            }
        };

        let mut staged_count = 0;
        for (queue, ids) in &staged {
            staged_count += ids.len();
            self.notifier
                .publish(Notification::Insert {
                    queue: queue.clone(),
                })
                .await;
            if let Some(tap) = &self.tap {
                tap.emit(TelemetryEvent::Staged {
                    queue: queue.clone(),
                    count: ids.len(),
                });
            }
        }

        tracing::debug!(target: "oban::stager", staged_count, "stop");
        staged_count
    }

    /// Runs the tick loop forever as a background task.
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
