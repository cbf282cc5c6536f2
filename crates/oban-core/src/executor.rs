//! Runs one claimed job to a terminal-or-retry decision.

use crate::backoff::BackoffPolicy;
use crate::job::Job;
use crate::store::JobStore;
use crate::tap::{Tap, TelemetryEvent};
use crate::worker::{Outcome, WorkerRegistry};
use chrono::Utc;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// What happened to the job, for telemetry (`[job, start|stop|exception]`).
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorResult {
    Completed,
    Retried { next_attempt_at: chrono::DateTime<Utc> },
    Discarded,
    Cancelled,
    Snoozed { seconds: i64 },
    WorkerNotFound,
}

/// Executes `job`: resolves the worker, applies the timeout, classifies
/// the outcome, and performs the corresponding store transition.
///
/// A panic inside `worker.perform` unwinds straight through this
/// function — it does not return `ExecutorResult` in that case. Callers
/// that spawn this as a task (see [`crate::producer`]) must join the
/// task and route a panic to [`handle_panic`] instead.
pub async fn run_job(
    job: Job,
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn JobStore>,
    default_backoff: BackoffPolicy,
    tap: Option<Tap>,
) -> ExecutorResult {
    let span = tracing::info_span!(
        "job",
        job.id = job.id,
        job.queue = %job.queue,
        job.worker = %job.worker,
        job.attempt = job.attempt,
    );
    let _enter = span.enter();
    tracing::debug!(target: "oban::executor", "start");
    emit_started(&tap, &job);

    let Some(worker) = registry.resolve(&job.worker) else {
        tracing::warn!(target: "oban::executor", worker = %job.worker, "worker_not_found");
        let _ = store
            .discard_job(job.id, format!("worker_not_found: {}", job.worker))
            .await;
        emit_stopped(&tap, &job, &ExecutorResult::WorkerNotFound);
        return ExecutorResult::WorkerNotFound;
    };

    let timeout = match worker.timeout(&job) {
        // A zero timeout means infinity.
        Some(d) if d > Duration::ZERO => Some(d),
        _ => None,
    };

    let perform = worker.perform(&job);
    let outcome = match timeout {
        Some(duration) => match tokio::time::timeout(duration, perform).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Error("timeout".to_string()),
        },
        None => perform.await,
    };

    let result = apply_outcome(&job, outcome, &*store, &worker_backoff(&worker, &job, default_backoff)).await;

    match &result {
        ExecutorResult::Completed => tracing::debug!(target: "oban::executor", "stop: completed"),
        ExecutorResult::Retried { next_attempt_at } => tracing::debug!(
            target: "oban::executor",
            next_attempt_at = %next_attempt_at,
            "stop: retryable"
        ),
        ExecutorResult::Discarded => tracing::debug!(target: "oban::executor", "stop: discarded"),
        ExecutorResult::Cancelled => tracing::debug!(target: "oban::executor", "stop: cancelled"),
        ExecutorResult::Snoozed { seconds } => {
            tracing::debug!(target: "oban::executor", seconds, "stop: snoozed")
        }
        ExecutorResult::WorkerNotFound => unreachable!("handled above"),
    }
    emit_stopped(&tap, &job, &result);

    result
}

/// Classifies a panic caught by joining the executor's task and performs
/// the same transition `run_job` would have for `Outcome::Error`. Called
/// by [`crate::producer::Producer`] once it observes a panicked
/// `JoinHandle` for a spawned executor.
pub async fn handle_panic(
    job: &Job,
    registry: &WorkerRegistry,
    store: &dyn JobStore,
    default_backoff: BackoffPolicy,
    tap: Option<Tap>,
    panic_payload: Box<dyn Any + Send>,
) -> ExecutorResult {
    let message = crate::error::WorkerError::Panicked(panic_message(panic_payload)).to_string();
    tracing::error!(target: "oban::executor", job.id = job.id, error = %message, "exception");

    let backoff = match registry.resolve(&job.worker) {
        Some(worker) => worker_backoff(&worker, job, default_backoff),
        None => BackoffDelay::Policy(default_backoff),
    };
    let result = apply_outcome(job, Outcome::Error(message), store, &backoff).await;
    emit_stopped(&tap, job, &result);
    result
}

/// Extracts a human-readable message from a caught panic's payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}

fn emit_started(tap: &Option<Tap>, job: &Job) {
    if let Some(tap) = tap {
        tap.emit(TelemetryEvent::JobStarted {
            id: job.id,
            queue: job.queue.clone(),
            worker: job.worker.clone(),
            attempt: job.attempt,
        });
    }
}

fn emit_stopped(tap: &Option<Tap>, job: &Job, result: &ExecutorResult) {
    if let Some(tap) = tap {
        tap.emit(TelemetryEvent::JobStopped {
            id: job.id,
            result: result.into(),
        });
    }
}

fn worker_backoff(
    worker: &Arc<dyn crate::worker::ErasedWorker>,
    job: &Job,
    default: BackoffPolicy,
) -> BackoffDelay {
    match worker.backoff(job) {
        Some(duration) => BackoffDelay::Fixed(duration),
        None => BackoffDelay::Policy(default),
    }
}

enum BackoffDelay {
    Fixed(Duration),
    Policy(BackoffPolicy),
}

impl BackoffDelay {
    fn seconds(&self, attempt: i32) -> f64 {
        match self {
            BackoffDelay::Fixed(d) => d.as_secs_f64(),
            BackoffDelay::Policy(p) => p.delay_seconds(attempt),
        }
    }
}

async fn apply_outcome(
    job: &Job,
    outcome: Outcome,
    store: &dyn JobStore,
    backoff: &BackoffDelay,
) -> ExecutorResult {
    match outcome {
        Outcome::Complete | Outcome::CompleteWithValue(_) => {
            let _ = store.complete_job(job.id).await;
            ExecutorResult::Completed
        }
        Outcome::Discard(reason) => {
            let _ = store.discard_job(job.id, reason).await;
            ExecutorResult::Discarded
        }
        Outcome::Cancel(_reason) => {
            let _ = store.cancel_job(job.id).await;
            ExecutorResult::Cancelled
        }
        Outcome::Snooze(seconds) => {
            let _ = store.snooze_job(job.id, seconds).await;
            ExecutorResult::Snoozed { seconds }
        }
        Outcome::Error(reason) => {
            if job.attempt >= job.max_attempts {
                let _ = store.discard_job(job.id, reason).await;
                ExecutorResult::Discarded
            } else {
                let delay_secs = backoff.seconds(job.attempt);
                let next_at = Utc::now() + chrono::Duration::milliseconds((delay_secs * 1000.0) as i64);
                let _ = store.error_job(job.id, reason, next_at).await;
                ExecutorResult::Retried {
                    next_attempt_at: next_at,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobError, JobState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_job(attempt: i32, max_attempts: i32) -> Job {
        Job {
            id: 1,
            state: JobState::Executing,
            queue: "default".into(),
            worker: "echo".into(),
            args: serde_json::json!({}),
            meta: serde_json::json!({}),
            tags: vec![],
            errors: Vec::<JobError>::new(),
            attempt,
            max_attempts,
            priority: 0,
            inserted_at: Utc::now(),
            scheduled_at: Utc::now(),
            attempted_at: Some(Utc::now()),
            attempted_by: vec!["node-a".into()],
            completed_at: None,
            cancelled_at: None,
            discarded_at: None,
        }
    }

    struct EchoWorker;

    #[async_trait]
    impl crate::worker::Worker for EchoWorker {
        const NAME: &'static str = "echo";
        async fn perform(&self, _job: &Job) -> Outcome {
            Outcome::Complete
        }
    }

    struct FailingWorker;

    #[async_trait]
    impl crate::worker::Worker for FailingWorker {
        const NAME: &'static str = "failing";
        async fn perform(&self, _job: &Job) -> Outcome {
            Outcome::Error("boom".into())
        }
    }

    struct RecordingStore {
        completed: AtomicUsize,
        discarded: AtomicUsize,
        errored: AtomicUsize,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                completed: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
                errored: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobStore for RecordingStore {
        async fn insert_job(
            &self,
            _cs: crate::job::JobChangeset,
            _opts: crate::store::InsertOpts,
        ) -> Result<crate::store::InsertedJob, crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn insert_all_jobs(
            &self,
            _cs: Vec<crate::job::JobChangeset>,
            _opts: crate::store::InsertOpts,
        ) -> Result<Vec<crate::store::InsertedJob>, crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn stage_jobs(
            &self,
            _queue_filter: Option<&str>,
            _limit: i64,
        ) -> Result<crate::store::StagedByQueue, crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn fetch_jobs(
            &self,
            _queue: &str,
            _demand: i64,
            _node: &str,
        ) -> Result<Vec<Job>, crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn complete_job(&self, _id: i64) -> Result<(), crate::error::JobStoreError> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn discard_job(&self, _id: i64, _err: String) -> Result<(), crate::error::JobStoreError> {
            self.discarded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn error_job(
            &self,
            _id: i64,
            _err: String,
            _next_at: chrono::DateTime<Utc>,
        ) -> Result<(), crate::error::JobStoreError> {
            self.errored.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn snooze_job(&self, _id: i64, _seconds: i64) -> Result<(), crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn cancel_job(&self, _id: i64) -> Result<(), crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn retry_job(&self, _id: i64) -> Result<(), crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn rescue_jobs(
            &self,
            _rescue_after: chrono::Duration,
            _now: chrono::DateTime<Utc>,
        ) -> Result<crate::store::RescueOutcome, crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn prune_jobs(
            &self,
            _max_age: chrono::Duration,
            _limit: i64,
        ) -> Result<Vec<i64>, crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn get_job(&self, _id: i64) -> Result<Option<Job>, crate::error::JobStoreError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn completed_job_marks_complete() {
        let mut registry = WorkerRegistry::new();
        registry.register(EchoWorker);
        let store = Arc::new(RecordingStore::new());
        let result = run_job(make_job(1, 3), Arc::new(registry), store.clone(), BackoffPolicy::default(), None).await;
        assert_eq!(result, ExecutorResult::Completed);
        assert_eq!(store.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_below_max_attempts_is_retryable() {
        let mut registry = WorkerRegistry::new();
        registry.register(FailingWorker);
        let store = Arc::new(RecordingStore::new());
        let result = run_job(make_job(1, 3), Arc::new(registry), store.clone(), BackoffPolicy::default(), None).await;
        assert!(matches!(result, ExecutorResult::Retried { .. }));
        assert_eq!(store.errored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_at_max_attempts_is_discarded() {
        let mut registry = WorkerRegistry::new();
        registry.register(FailingWorker);
        let store = Arc::new(RecordingStore::new());
        let result = run_job(make_job(3, 3), Arc::new(registry), store.clone(), BackoffPolicy::default(), None).await;
        assert_eq!(result, ExecutorResult::Discarded);
        assert_eq!(store.discarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_worker_is_discarded() {
        let registry = WorkerRegistry::new();
        let store = Arc::new(RecordingStore::new());
        let result = run_job(make_job(1, 3), Arc::new(registry), store.clone(), BackoffPolicy::default(), None).await;
        assert_eq!(result, ExecutorResult::WorkerNotFound);
        assert_eq!(store.discarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panic_below_max_attempts_is_retryable() {
        let registry = WorkerRegistry::new();
        let store = Arc::new(RecordingStore::new());
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        let result = handle_panic(&make_job(1, 3), &registry, store.as_ref(), BackoffPolicy::default(), None, payload).await;
        assert!(matches!(result, ExecutorResult::Retried { .. }));
        assert_eq!(store.errored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panic_at_max_attempts_is_discarded() {
        let registry = WorkerRegistry::new();
        let store = Arc::new(RecordingStore::new());
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        let result = handle_panic(&make_job(3, 3), &registry, store.as_ref(), BackoffPolicy::default(), None, payload).await;
        assert_eq!(result, ExecutorResult::Discarded);
        assert_eq!(store.discarded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_message_downcasts_known_payload_shapes() {
        let boxed_str: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed_str), "boom");
        let boxed_string: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        assert_eq!(panic_message(boxed_string), "boom");
        let boxed_other: Box<dyn std::any::Any + Send> = Box::new(42_i32);
        assert_eq!(panic_message(boxed_other), "worker panicked with a non-string payload");
    }
}
