//! Wires the stager, producers, peer election, and plugins into one
//! supervised instance and sequences shutdown.
//!
//! Holds one task handle per queue producer plus the shared singletons
//! (stager, peer, plugins), and sequences their shutdown in order.

use crate::config::Config;
use crate::cron::CronPlugin;
use crate::notifier::Notifier;
use crate::peer::{Peer, PeerHandle};
use crate::plugins::{Lifeline, Pruner, Reindexable, Reindexer};
use crate::producer::{Producer, ProducerHandle};
use crate::stager::Stager;
use crate::store::JobStore;
use crate::tap::Tap;
use crate::worker::WorkerRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Local-mode poll fallback used by a producer when no DB-backed notifier
/// delivers `insert` promptly.
const LOCAL_MODE_POLL: Duration = Duration::from_secs(1);

/// A running instance: holds every background task's `JoinHandle` plus
/// handles the public API needs to control queues without touching the
/// tasks directly.
pub struct Supervisor {
    config: Config,
    producers: HashMap<String, ProducerHandle>,
    producer_tasks: Vec<JoinHandle<()>>,
    stager_task: JoinHandle<()>,
    pruner_task: Option<JoinHandle<()>>,
    lifeline_task: Option<JoinHandle<()>>,
    cron_task: Option<JoinHandle<()>>,
    reindexer_task: Option<JoinHandle<()>>,
    peer: PeerHandle,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn JobStore>,
    tap: Tap,
}

impl Supervisor {
    /// Starts every configured component. Pass [`crate::peer::AlwaysLeader`]
    /// for `peer = disabled`.
    pub fn start(
        config: Config,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<WorkerRegistry>,
        peer: Arc<dyn Peer>,
        reindex_target: Option<Arc<dyn Reindexable>>,
    ) -> Self {
        let tap = Tap::new();
        let peer_handle = PeerHandle::spawn(peer, config.election_interval, config.election_boost, Some(tap.clone()));
        let leader_watch = peer_handle.watch();

        let stager = Stager::new(
            store.clone(),
            notifier.clone(),
            config.stage_interval,
            crate::stager::DEFAULT_STAGE_LIMIT,
            Some(tap.clone()),
        );
        let stager_task = stager.spawn();

        let mut producers = HashMap::new();
        let mut producer_tasks = Vec::new();
        for (queue, opts) in &config.queues {
            let producer = Producer::new(
                queue.clone(),
                config.node.clone(),
                opts.limit,
                opts.paused,
                store.clone(),
                notifier.clone(),
                registry.clone(),
                config.backoff,
                config.dispatch_cooldown,
                LOCAL_MODE_POLL,
                Some(tap.clone()),
            );
            let (handle, task) = producer.spawn();
            producers.insert(queue.clone(), handle);
            producer_tasks.push(task);
        }

        let pruner_task = config
            .plugins
            .pruner
            .as_ref()
            .map(|opts| {
                Pruner::new(store.clone(), leader_watch.clone())
                    .with_interval(opts.interval)
                    .with_max_age(opts.max_age)
                    .with_limit(opts.limit)
                    .spawn()
            });

        let lifeline_task = config
            .plugins
            .lifeline
            .as_ref()
            .map(|opts| {
                Lifeline::new(store.clone(), leader_watch.clone())
                    .with_interval(opts.interval)
                    .with_rescue_after(opts.rescue_after)
                    .spawn()
            });

        let cron_task = config.plugins.cron.as_ref().map(|opts| {
            CronPlugin::new(
                opts.entries.clone(),
                opts.timezone.unwrap_or(chrono_tz::UTC),
                store.clone(),
                notifier.clone(),
                leader_watch.clone(),
            )
            .spawn()
        });

        let reindexer_task = match (config.plugins.reindexer.as_ref(), reindex_target) {
            (Some(opts), Some(target)) => Some(
                Reindexer::new(target, leader_watch.clone())
                    .with_interval(opts.interval)
                    .spawn(),
            ),
            _ => None,
        };

        Self {
            config,
            producers,
            producer_tasks,
            stager_task,
            pruner_task,
            lifeline_task,
            cron_task,
            reindexer_task,
            peer: peer_handle,
            notifier,
            store,
            tap,
        }
    }

    /// The shared telemetry tap events flow through; subscribe for a
    /// live feed of job starts/stops, staging batches, and leadership
    /// changes.
    pub fn tap(&self) -> &Tap {
        &self.tap
    }

    pub fn is_leader(&self) -> bool {
        self.peer.is_leader()
    }

    pub fn producer(&self, queue: &str) -> Option<&ProducerHandle> {
        self.producers.get(queue)
    }

    pub fn producers(&self) -> impl Iterator<Item = (&String, &ProducerHandle)> {
        self.producers.iter()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Graceful shutdown: stop accepting new work on every
    /// producer, wait up to `shutdown_grace_period` for in-flight
    /// executors to finish, then abort whatever remains (the lifeline
    /// rescues it on next start).
    pub async fn shutdown(self) {
        for (_, handle) in self.producers.iter() {
            handle.pause();
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace_period;
        loop {
            let still_running: usize = {
                let mut total = 0;
                for (_, handle) in self.producers.iter() {
                    total += handle.status().await.running_count;
                }
                total
            };
            if still_running == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.stager_task.abort();
        if let Some(task) = self.pruner_task {
            task.abort();
        }
        if let Some(task) = self.lifeline_task {
            task.abort();
        }
        if let Some(task) = self.cron_task {
            task.abort();
        }
        if let Some(task) = self.reindexer_task {
            task.abort();
        }
        for task in self.producer_tasks {
            task.abort();
        }
        self.peer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, QueueOpts};
    use crate::notifier::LocalNotifier;

    struct NullStore;

    #[async_trait::async_trait]
    impl JobStore for NullStore {
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
            Ok(Default::default())
        }
        async fn fetch_jobs(
            &self,
            _queue: &str,
            _demand: i64,
            _node: &str,
        ) -> Result<Vec<crate::job::Job>, crate::error::JobStoreError> {
            Ok(Vec::new())
        }
        async fn complete_job(&self, _id: i64) -> Result<(), crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn discard_job(&self, _id: i64, _err: String) -> Result<(), crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn error_job(
            &self,
            _id: i64,
            _err: String,
            _next_at: chrono::DateTime<chrono::Utc>,
        ) -> Result<(), crate::error::JobStoreError> {
            unimplemented!()
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
            _now: chrono::DateTime<chrono::Utc>,
        ) -> Result<crate::store::RescueOutcome, crate::error::JobStoreError> {
            unimplemented!()
        }
        async fn prune_jobs(
            &self,
            _max_age: chrono::Duration,
            _limit: i64,
        ) -> Result<Vec<i64>, crate::error::JobStoreError> {
            Ok(Vec::new())
        }
        async fn get_job(&self, _id: i64) -> Result<Option<crate::job::Job>, crate::error::JobStoreError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn starts_and_shuts_down_cleanly() {
        let config = Config::builder()
            .queue("default", QueueOpts::new(5))
            .shutdown_grace_period(Duration::from_millis(50))
            .build()
            .unwrap();
        let store: Arc<dyn JobStore> = Arc::new(NullStore);
        let notifier: Arc<dyn Notifier> = Arc::new(LocalNotifier::new());
        let registry = Arc::new(WorkerRegistry::new());

        let peer: Arc<dyn Peer> = Arc::new(crate::peer::AlwaysLeader::new("test-node"));
        let supervisor = Supervisor::start(config, store, notifier, registry, peer, None);
        assert!(supervisor.producer("default").is_some());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(supervisor.is_leader());
        supervisor.shutdown().await;
    }
}
