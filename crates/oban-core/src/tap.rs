//! Telemetry event tap: an observation point tests and operators can
//! subscribe to without coupling to `tracing`'s subscriber machinery.
//!
//! A test-only hook into the handful of lifecycle events this engine
//! actually emits, so a test can assert "job 4 completed" without
//! scraping log lines.

use crate::executor::ExecutorResult;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One observable moment in a job's life, mirroring the span/log points
/// in [`crate::executor`] and [`crate::stager`].
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    JobStarted { id: i64, queue: String, worker: String, attempt: i32 },
    JobStopped { id: i64, result: ExecutorResultSummary },
    Staged { queue: String, count: usize },
    LeaderChanged { instance: String, leader: bool },
}

/// A `Clone`/`Send`-friendly summary of [`ExecutorResult`], since the
/// latter isn't `Copy` and carries no need for its `next_attempt_at`
/// precision at the telemetry layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorResultSummary {
    Completed,
    Retried,
    Discarded,
    Cancelled,
    Snoozed,
    WorkerNotFound,
}

impl From<&ExecutorResult> for ExecutorResultSummary {
    fn from(result: &ExecutorResult) -> Self {
        match result {
            ExecutorResult::Completed => Self::Completed,
            ExecutorResult::Retried { .. } => Self::Retried,
            ExecutorResult::Discarded => Self::Discarded,
            ExecutorResult::Cancelled => Self::Cancelled,
            ExecutorResult::Snoozed { .. } => Self::Snoozed,
            ExecutorResult::WorkerNotFound => Self::WorkerNotFound,
        }
    }
}

/// Cloneable publish handle, held by whichever component emits events.
#[derive(Clone)]
pub struct Tap {
    sender: Arc<broadcast::Sender<TelemetryEvent>>,
}

impl Tap {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { sender: Arc::new(tx) }
    }

    pub fn emit(&self, event: TelemetryEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }
}

impl Default for Tap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_observes_emitted_events() {
        let tap = Tap::new();
        let mut rx = tap.subscribe();
        tap.emit(TelemetryEvent::Staged {
            queue: "default".into(),
            count: 3,
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TelemetryEvent::Staged { count: 3, .. }));
    }
}
