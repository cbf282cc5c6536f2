//! User-authored work, resolved by string name.
//!
//! A single object-safe trait keyed by the job's `worker` string, since
//! the dispatch key is data (a column) rather than a Rust type.

use crate::job::Job;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a worker's `perform` returned.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// `ok`.
    Complete,
    /// `{ok, value}` — value is retained only for telemetry.
    CompleteWithValue(serde_json::Value),
    /// `{error, reason}` — retried or discarded per attempt policy.
    Error(String),
    /// `{discard, reason}` — discarded regardless of attempt count.
    Discard(String),
    /// `{cancel, reason}`.
    Cancel(String),
    /// `{snooze, seconds}`.
    Snooze(i64),
}

/// A unit of user-authored work, keyed by [`Worker::NAME`].
///
/// `perform` returns an [`Outcome`] rather than `Result<(), E>` so that
/// "this finished but the task should not be retried, or should be
/// snoozed" are first-class results instead of being encoded in error
/// variants the executor has to downcast.
#[async_trait]
pub trait Worker: Send + Sync {
    /// The `worker` string jobs dispatch to this implementation with.
    const NAME: &'static str;

    async fn perform(&self, job: &Job) -> Outcome;

    /// Overridable per-worker timeout. `None`/`Duration::ZERO` means
    /// infinity (boundary 12: `timeout=0` is `infinity`).
    fn timeout(&self, _job: &Job) -> Option<Duration> {
        None
    }

    /// Overridable per-worker backoff. `None` falls back to
    /// [`crate::backoff::exponential`].
    fn backoff(&self, _job: &Job) -> Option<Duration> {
        None
    }
}

/// Object-safe facade over [`Worker`] so the registry can hold a
/// heterogeneous collection keyed by name.
#[async_trait]
pub trait ErasedWorker: Send + Sync {
    async fn perform(&self, job: &Job) -> Outcome;
    fn timeout(&self, job: &Job) -> Option<Duration>;
    fn backoff(&self, job: &Job) -> Option<Duration>;
}

struct WorkerAdapter<W>(W);

#[async_trait]
impl<W: Worker> ErasedWorker for WorkerAdapter<W> {
    async fn perform(&self, job: &Job) -> Outcome {
        self.0.perform(job).await
    }
    fn timeout(&self, job: &Job) -> Option<Duration> {
        self.0.timeout(job)
    }
    fn backoff(&self, job: &Job) -> Option<Duration> {
        self.0.backoff(job)
    }
}

/// Maps a `worker` string to its implementation. Populated at process
/// init via [`WorkerRegistry::register`], read-only thereafter.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn ErasedWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Worker + 'static>(&mut self, worker: W) -> &mut Self {
        self.workers
            .insert(W::NAME.to_string(), Arc::new(WorkerAdapter(worker)));
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ErasedWorker>> {
        self.workers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.workers.keys().collect::<Vec<_>>())
            .finish()
    }
}
