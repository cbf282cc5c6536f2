//! The public library surface.
//!
//! `Engine` is the handle application code holds: it owns a
//! [`crate::supervisor::Supervisor`] in every testing mode except
//! `inline`, where `insert` bypasses the store entirely and runs the
//! worker synchronously in the caller.

use crate::config::{Config, TestingMode};
use crate::error::ObanError;
use crate::job::{Job, JobChangeset};
use crate::notifier::{Channel, Notification, Notifier, Signal};
use crate::peer::Peer;
use crate::plugins::Reindexable;
use crate::producer::QueueStatus;
use crate::store::{InsertOpts, InsertedJob, JobStore};
use crate::supervisor::Supervisor;
use crate::worker::WorkerRegistry;
use serde_json::Value;
use std::sync::Arc;

/// Builds an [`Engine`], wiring together the store adapter, notifier,
/// peer election strategy, and worker registry before starting any
/// background task.
pub struct EngineBuilder {
    config: Config,
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    peer: Arc<dyn Peer>,
    registry: WorkerRegistry,
    reindex_target: Option<Arc<dyn Reindexable>>,
}

impl EngineBuilder {
    pub fn new(config: Config, store: Arc<dyn JobStore>, notifier: Arc<dyn Notifier>, peer: Arc<dyn Peer>) -> Self {
        Self {
            config,
            store,
            notifier,
            peer,
            registry: WorkerRegistry::new(),
            reindex_target: None,
        }
    }

    pub fn register<W: crate::worker::Worker + 'static>(mut self, worker: W) -> Self {
        self.registry.register(worker);
        self
    }

    /// Supplies the adapter-specific index-maintenance target the
    /// `reindexer` plugin drives (e.g. `PgJobStore`, since it's usually
    /// the same adapter as `store`, but isn't required to be).
    pub fn reindexable(mut self, target: Arc<dyn Reindexable>) -> Self {
        self.reindex_target = Some(target);
        self
    }

    pub fn build(self) -> Engine {
        let registry = Arc::new(self.registry);
        match self.config.testing {
            TestingMode::Inline => Engine {
                mode: Mode::Inline {
                    store: self.store,
                    registry,
                    backoff: self.config.backoff,
                },
                config: self.config,
            },
            TestingMode::Manual => Engine {
                mode: Mode::Manual {
                    store: self.store,
                    notifier: self.notifier,
                    registry,
                },
                config: self.config,
            },
            TestingMode::Disabled => {
                let supervisor = Supervisor::start(
                    self.config.clone(),
                    self.store,
                    self.notifier,
                    registry,
                    self.peer,
                    self.reindex_target,
                );
                Engine {
                    mode: Mode::Supervised(supervisor),
                    config: self.config,
                }
            }
        }
    }
}

enum Mode {
    Supervised(Supervisor),
    Inline {
        store: Arc<dyn JobStore>,
        registry: Arc<WorkerRegistry>,
        backoff: crate::backoff::BackoffPolicy,
    },
    Manual {
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<WorkerRegistry>,
    },
}

/// The handle application code holds and calls into ("Public
/// API").
pub struct Engine {
    config: Config,
    mode: Mode,
}

impl Engine {
    fn store(&self) -> &Arc<dyn JobStore> {
        match &self.mode {
            Mode::Supervised(s) => s.store(),
            Mode::Inline { store, .. } => store,
            Mode::Manual { store, .. } => store,
        }
    }

    fn notifier(&self) -> Option<&Arc<dyn Notifier>> {
        match &self.mode {
            Mode::Supervised(s) => Some(s.notifier()),
            Mode::Inline { .. } => None,
            Mode::Manual { notifier, .. } => Some(notifier),
        }
    }

    /// Inserts one job. In `inline` testing mode this runs the job to
    /// completion synchronously and returns once it has.
    pub async fn insert(&self, cs: JobChangeset, opts: Option<InsertOpts>) -> Result<InsertedJob, ObanError> {
        cs.validate()?;
        let opts = opts.unwrap_or_default();

        if let Mode::Inline {
            store,
            registry,
            backoff,
        } = &self.mode
        {
            let inserted = store.insert_job(cs, opts).await?;
            if !inserted.conflict {
                crate::executor::run_job(inserted.job.clone(), registry.clone(), store.clone(), *backoff, None).await;
            }
            return Ok(inserted);
        }

        let inserted = self.store().insert_job(cs, opts).await?;
        if let Some(notifier) = self.notifier() {
            notifier
                .publish(Notification::Insert {
                    queue: inserted.job.queue.clone(),
                })
                .await;
        }
        Ok(inserted)
    }

    /// Inserts many jobs in one call.
    pub async fn insert_all(
        &self,
        changesets: Vec<JobChangeset>,
        opts: Option<InsertOpts>,
    ) -> Result<Vec<InsertedJob>, ObanError> {
        for cs in &changesets {
            cs.validate()?;
        }
        let opts = opts.unwrap_or_default();

        if let Mode::Inline {
            store,
            registry,
            backoff,
        } = &self.mode
        {
            let inserted = store.insert_all_jobs(changesets, opts).await?;
            for job in &inserted {
                if !job.conflict {
                    crate::executor::run_job(job.job.clone(), registry.clone(), store.clone(), *backoff, None).await;
                }
            }
            return Ok(inserted);
        }

        let inserted = self.store().insert_all_jobs(changesets, opts).await?;
        if let Some(notifier) = self.notifier() {
            let mut queues: Vec<&str> = inserted.iter().map(|j| j.job.queue.as_str()).collect();
            queues.sort_unstable();
            queues.dedup();
            for queue in queues {
                notifier
                    .publish(Notification::Insert {
                        queue: queue.to_string(),
                    })
                    .await;
            }
        }
        Ok(inserted)
    }

    pub async fn cancel(&self, id: i64) -> Result<(), ObanError> {
        self.store().cancel_job(id).await?;
        if let Some(notifier) = self.notifier() {
            notifier
                .publish(Notification::Signal(Signal::Cancel { job_id: id }))
                .await;
        }
        Ok(())
    }

    pub async fn retry(&self, id: i64) -> Result<(), ObanError> {
        self.store().retry_job(id).await.map_err(Into::into)
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>, ObanError> {
        self.store().get_job(id).await.map_err(Into::into)
    }

    /// `local_only`: when false (the default for a clustered deployment),
    /// the signal is also broadcast so every node's producer for this
    /// queue picks it up, not just this node's.
    pub async fn pause_queue(&self, queue: impl Into<String>, local_only: bool) {
        let queue = queue.into();
        if let Mode::Supervised(s) = &self.mode {
            if let Some(handle) = s.producer(&queue) {
                handle.pause();
            }
        }
        if !local_only {
            self.broadcast_signal(Signal::Pause { queue: Some(queue) }).await;
        }
    }

    pub async fn resume_queue(&self, queue: impl Into<String>, local_only: bool) {
        let queue = queue.into();
        if let Mode::Supervised(s) = &self.mode {
            if let Some(handle) = s.producer(&queue) {
                handle.resume();
            }
        }
        if !local_only {
            self.broadcast_signal(Signal::Resume { queue: Some(queue) }).await;
        }
    }

    pub async fn scale_queue(&self, queue: impl Into<String>, limit: usize, local_only: bool) {
        let queue = queue.into();
        if let Mode::Supervised(s) = &self.mode {
            if let Some(handle) = s.producer(&queue) {
                handle.scale(limit);
            }
        }
        if !local_only {
            self.broadcast_signal(Signal::Scale { queue, limit }).await;
        }
    }

    pub async fn pause_all_queues(&self, local_only: bool) {
        if let Mode::Supervised(s) = &self.mode {
            for (_, handle) in s.producers() {
                handle.pause();
            }
        }
        if !local_only {
            self.broadcast_signal(Signal::Pause { queue: None }).await;
        }
    }

    pub async fn resume_all_queues(&self, local_only: bool) {
        if let Mode::Supervised(s) = &self.mode {
            for (_, handle) in s.producers() {
                handle.resume();
            }
        }
        if !local_only {
            self.broadcast_signal(Signal::Resume { queue: None }).await;
        }
    }

    pub async fn check_queue(&self, queue: &str) -> Option<QueueStatus> {
        match &self.mode {
            Mode::Supervised(s) => match s.producer(queue) {
                Some(handle) => Some(handle.status().await),
                None => None,
            },
            _ => None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The telemetry tap, if running supervised. `testing = inline` and
    /// `testing = manual` drive jobs synchronously and have nothing to
    /// subscribe to.
    pub fn tap(&self) -> Option<&crate::tap::Tap> {
        match &self.mode {
            Mode::Supervised(s) => Some(s.tap()),
            _ => None,
        }
    }

    /// Drains up to `limit` jobs for `queue`, running each to completion.
    /// Only meaningful in `testing = manual` mode.
    pub async fn drain_queue(&self, queue: &str, limit: i64) -> Result<usize, ObanError> {
        let Mode::Manual { store, registry, .. } = &self.mode else {
            return Err(ObanError::Config(
                "drain_queue is only available in testing = manual mode".into(),
            ));
        };
        let jobs = store.fetch_jobs(queue, limit, &self.config.node).await?;
        let count = jobs.len();
        for job in jobs {
            crate::executor::run_job(job, registry.clone(), store.clone(), self.config.backoff, None).await;
        }
        Ok(count)
    }

    async fn broadcast_signal(&self, signal: Signal) {
        if let Some(notifier) = self.notifier() {
            notifier.publish(Notification::Signal(signal)).await;
        }
    }

    pub async fn shutdown(self) {
        if let Mode::Supervised(s) = self.mode {
            s.shutdown().await;
        }
    }
}

/// Helper used by adapters/tests to build a `(JobChangeset, args)` pair
/// with `Value::Object` args from anything `Serialize`.
pub fn args(value: impl serde::Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, QueueOpts, TestingMode};
    use crate::notifier::LocalNotifier;
    use crate::peer::AlwaysLeader;
    use crate::worker::{Outcome, Worker};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWorker(Arc<AtomicUsize>);

    #[async_trait]
    impl Worker for CountingWorker {
        const NAME: &'static str = "counting";
        async fn perform(&self, _job: &Job) -> Outcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            Outcome::Complete
        }
    }

    /// Smallest possible `JobStore` for exercising `Engine::insert` in
    /// `inline` mode: one counter for ids, no actual persistence needed
    /// since inline mode never stages or dispatches.
    struct BareStore {
        next_id: std::sync::atomic::AtomicI64,
    }

    #[async_trait]
    impl JobStore for BareStore {
        async fn insert_job(
            &self,
            cs: JobChangeset,
            _opts: InsertOpts,
        ) -> Result<InsertedJob, crate::error::JobStoreError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let now = chrono::Utc::now();
            let state = cs.initial_state(now);
            let job = Job {
                id,
                state,
                queue: cs.queue,
                worker: cs.worker,
                args: cs.args,
                meta: cs.meta,
                tags: cs.tags,
                errors: Vec::new(),
                attempt: 0,
                max_attempts: cs.max_attempts,
                priority: cs.priority,
                inserted_at: now,
                scheduled_at: cs.scheduled_at.unwrap_or(now),
                attempted_at: None,
                attempted_by: Vec::new(),
                completed_at: None,
                cancelled_at: None,
                discarded_at: None,
            };
            Ok(InsertedJob { job, conflict: false })
        }
        async fn insert_all_jobs(
            &self,
            _cs: Vec<JobChangeset>,
            _opts: InsertOpts,
        ) -> Result<Vec<InsertedJob>, crate::error::JobStoreError> {
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
            Ok(())
        }
        async fn discard_job(&self, _id: i64, _err: String) -> Result<(), crate::error::JobStoreError> {
            Ok(())
        }
        async fn error_job(
            &self,
            _id: i64,
            _err: String,
            _next_at: chrono::DateTime<chrono::Utc>,
        ) -> Result<(), crate::error::JobStoreError> {
            Ok(())
        }
        async fn snooze_job(&self, _id: i64, _seconds: i64) -> Result<(), crate::error::JobStoreError> {
            Ok(())
        }
        async fn cancel_job(&self, _id: i64) -> Result<(), crate::error::JobStoreError> {
            Ok(())
        }
        async fn retry_job(&self, _id: i64) -> Result<(), crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn rescue_jobs(
            &self,
            _rescue_after: chrono::Duration,
            _now: chrono::DateTime<chrono::Utc>,
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
    async fn inline_mode_runs_synchronously() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut config = Config::builder()
            .testing(TestingMode::Manual)
            .build()
            .unwrap();
        config.testing = TestingMode::Inline;

        let store: Arc<dyn JobStore> = Arc::new(BareStore {
            next_id: std::sync::atomic::AtomicI64::new(1),
        });
        let notifier: Arc<dyn Notifier> = Arc::new(LocalNotifier::new());
        let peer: Arc<dyn Peer> = Arc::new(AlwaysLeader::new("test"));

        let engine = EngineBuilder::new(config, store, notifier, peer)
            .register(CountingWorker(counter.clone()))
            .build();

        engine
            .insert(
                JobChangeset::new("default", "counting", serde_json::json!({})),
                None,
            )
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
