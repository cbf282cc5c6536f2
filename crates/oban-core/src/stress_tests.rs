//! Exercises the producer/executor pipeline under load: many jobs, a
//! tight concurrency limit, and an assertion that the limit was never
//! exceeded at any instant — the property a flaky `AtomicUsize` tally
//! alone wouldn't catch if increments and decrements could race.

use crate::backoff::BackoffPolicy;
use crate::error::JobStoreError;
use crate::job::{Job, JobChangeset, JobState};
use crate::notifier::{LocalNotifier, Notifier};
use crate::producer::Producer;
use crate::store::{InsertOpts, InsertedJob, JobStore, RescueOutcome, StagedByQueue};
use crate::worker::{Outcome, Worker, WorkerRegistry};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// An in-memory store just capable enough to drive a producer through
/// many `fetch_jobs`/`complete_job` cycles.
struct QueueingStore {
    next_id: AtomicI64,
    available: Mutex<VecDeque<Job>>,
}

impl QueueingStore {
    fn seeded(queue: &str, worker: &str, count: usize) -> Self {
        let mut jobs = VecDeque::new();
        for i in 0..count {
            jobs.push_back(Job {
                id: i as i64,
                state: JobState::Available,
                queue: queue.to_string(),
                worker: worker.to_string(),
                args: serde_json::json!({}),
                meta: serde_json::json!({}),
                tags: vec![],
                errors: vec![],
                attempt: 0,
                max_attempts: 3,
                priority: 0,
                inserted_at: Utc::now(),
                scheduled_at: Utc::now(),
                attempted_at: None,
                attempted_by: vec![],
                completed_at: None,
                cancelled_at: None,
                discarded_at: None,
            });
        }
        Self {
            next_id: AtomicI64::new(count as i64),
            available: Mutex::new(jobs),
        }
    }
}

#[async_trait]
impl JobStore for QueueingStore {
    async fn insert_job(&self, _cs: JobChangeset, _opts: InsertOpts) -> Result<InsertedJob, JobStoreError> {
        unimplemented!()
    }
    async fn insert_all_jobs(&self, _cs: Vec<JobChangeset>, _opts: InsertOpts) -> Result<Vec<InsertedJob>, JobStoreError> {
        unimplemented!()
    }
    async fn stage_jobs(&self, _queue_filter: Option<&str>, _limit: i64) -> Result<StagedByQueue, JobStoreError> {
        Ok(Default::default())
    }
    async fn fetch_jobs(&self, _queue: &str, demand: i64, _node: &str) -> Result<Vec<Job>, JobStoreError> {
        let mut available = self.available.lock().await;
        let mut out = Vec::new();
        for _ in 0..demand {
            match available.pop_front() {
                Some(mut job) => {
                    job.state = JobState::Executing;
                    job.attempt += 1;
                    job.attempted_at = Some(Utc::now());
                    out.push(job);
                }
                None => break,
            }
        }
        Ok(out)
    }
    async fn complete_job(&self, _id: i64) -> Result<(), JobStoreError> {
        Ok(())
    }
    async fn discard_job(&self, _id: i64, _err: String) -> Result<(), JobStoreError> {
        Ok(())
    }
    async fn error_job(&self, _id: i64, _err: String, _next_at: chrono::DateTime<Utc>) -> Result<(), JobStoreError> {
        Ok(())
    }
    async fn snooze_job(&self, _id: i64, _seconds: i64) -> Result<(), JobStoreError> {
        Ok(())
    }
    async fn cancel_job(&self, _id: i64) -> Result<(), JobStoreError> {
        Ok(())
    }
    async fn retry_job(&self, _id: i64) -> Result<(), JobStoreError> {
        unimplemented!()
    }
    async fn rescue_jobs(&self, _rescue_after: chrono::Duration, _now: chrono::DateTime<Utc>) -> Result<RescueOutcome, JobStoreError> {
        unimplemented!()
    }
    async fn prune_jobs(&self, _max_age: chrono::Duration, _limit: i64) -> Result<Vec<i64>, JobStoreError> {
        unimplemented!()
    }
    async fn get_job(&self, _id: i64) -> Result<Option<Job>, JobStoreError> {
        let _ = &self.next_id;
        unimplemented!()
    }
}

struct PanickingWorker;

#[async_trait]
impl Worker for PanickingWorker {
    const NAME: &'static str = "panics";

    async fn perform(&self, _job: &Job) -> Outcome {
        panic!("worker exploded");
    }
}

struct ConcurrencyTrackingWorker {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for ConcurrencyTrackingWorker {
    const NAME: &'static str = "track_concurrency";

    async fn perform(&self, _job: &Job) -> Outcome {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Outcome::Complete
    }
}

#[tokio::test]
async fn producer_never_exceeds_its_concurrency_limit() {
    const JOB_COUNT: usize = 200;
    const LIMIT: usize = 8;

    let store: Arc<dyn JobStore> = Arc::new(QueueingStore::seeded("stress", "track_concurrency", JOB_COUNT));
    let notifier: Arc<dyn Notifier> = Arc::new(LocalNotifier::new());

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = WorkerRegistry::new();
    registry.register(ConcurrencyTrackingWorker {
        current: current.clone(),
        peak: peak.clone(),
    });

    let producer = Producer::new(
        "stress",
        "stress-node",
        LIMIT,
        false,
        store,
        notifier,
        Arc::new(registry),
        BackoffPolicy::default(),
        Duration::from_millis(1),
        Duration::from_millis(20),
        None,
    );

    let (handle, task) = producer.spawn();

    // Give every job time to run to completion: JOB_COUNT/LIMIT batches
    // at ~5ms each, plus generous scheduling slack.
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(peak.load(Ordering::SeqCst) <= LIMIT, "peak concurrency exceeded the configured limit");
    assert_eq!(handle.status().await.limit, LIMIT);

    task.abort();
}

#[tokio::test]
async fn a_panicking_worker_does_not_leak_an_inflight_slot() {
    const JOB_COUNT: usize = 3;

    let store: Arc<dyn JobStore> = Arc::new(QueueingStore::seeded("stress", "panics", JOB_COUNT));
    let notifier: Arc<dyn Notifier> = Arc::new(LocalNotifier::new());
    let mut registry = WorkerRegistry::new();
    registry.register(PanickingWorker);

    let producer = Producer::new(
        "stress",
        "stress-node",
        2,
        false,
        store,
        notifier,
        Arc::new(registry),
        BackoffPolicy::default(),
        Duration::from_millis(1),
        Duration::from_millis(20),
        None,
    );

    let (handle, task) = producer.spawn();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = handle.status().await;
    assert_eq!(status.running_count, 0, "a panicked executor must still free its inflight slot");

    task.abort();
}
