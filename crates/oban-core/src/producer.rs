//! Per-queue producer: concurrency limits and fair fetch.
//!
//! An `InflightTracker`/`InflightBatch` pair tracks executor tasks
//! running claimed jobs, keyed by job id, so a `signal{cancel job_id}`
//! can abort exactly one running task.

use crate::backoff::BackoffPolicy;
use crate::executor;
use crate::notifier::{Channel, Notification, Notifier, Signal};
use crate::store::JobStore;
use crate::tap::Tap;
use crate::worker::WorkerRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

/// Minimum interval between successive `fetch_jobs` calls for one queue.
pub const DEFAULT_DISPATCH_COOLDOWN: Duration = Duration::from_millis(5);

/// Snapshot returned by the public `check_queue` API.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub limit: usize,
    pub paused: bool,
    pub running_count: usize,
    pub running_ids: Vec<i64>,
}

/// Tracks in-flight executor tasks for one producer, by job id.
#[derive(Default)]
struct InflightTracker {
    handles: HashMap<i64, AbortHandle>,
}

impl InflightTracker {
    fn insert(&mut self, job_id: i64, handle: AbortHandle) {
        self.handles.insert(job_id, handle);
    }

    fn remove(&mut self, job_id: i64) {
        self.handles.remove(job_id);
    }

    fn cancel(&mut self, job_id: i64) -> bool {
        if let Some(handle) = self.handles.remove(&job_id) {
            handle.abort();
            true
        } else {
            false
        }
    }

    fn ids(&self) -> Vec<i64> {
        self.handles.keys().copied().collect()
    }

    fn len(&self) -> usize {
        self.handles.len()
    }
}

/// Shared, cloneable handle used by the public engine API to control a
/// running producer without holding its task.
#[derive(Clone)]
pub struct ProducerHandle {
    queue: String,
    limit: Arc<AtomicUsize>,
    paused: Arc<AtomicBool>,
    inflight: Arc<Mutex<InflightTracker>>,
}

impl ProducerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn scale(&self, limit: usize) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    pub async fn cancel(&self, job_id: i64) -> bool {
        self.inflight.lock().await.cancel(job_id)
    }

    pub async fn status(&self) -> QueueStatus {
        let inflight = self.inflight.lock().await;
        QueueStatus {
            limit: self.limit.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            running_count: inflight.len(),
            running_ids: inflight.ids(),
        }
    }
}

/// Runs the per-queue producer loop as a background task. Subscribes to
/// `insert{queue=self}` and `signal` notifications; on either, or on the
/// local-mode poll tick, attempts a `dispatch` if there is demand.
pub struct Producer {
    queue: String,
    node: String,
    limit: Arc<AtomicUsize>,
    paused: Arc<AtomicBool>,
    inflight: Arc<Mutex<InflightTracker>>,
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<WorkerRegistry>,
    backoff: BackoffPolicy,
    cooldown: Duration,
    local_mode_poll: Duration,
    tap: Option<Tap>,
}

impl Producer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: impl Into<String>,
        node: impl Into<String>,
        limit: usize,
        paused: bool,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<WorkerRegistry>,
        backoff: BackoffPolicy,
        cooldown: Duration,
        local_mode_poll: Duration,
        tap: Option<Tap>,
    ) -> Self {
        Self {
            queue: queue.into(),
            node: node.into(),
            limit: Arc::new(AtomicUsize::new(limit)),
            paused: Arc::new(AtomicBool::new(paused)),
            inflight: Arc::new(Mutex::new(InflightTracker::default())),
            store,
            notifier,
            registry,
            backoff,
            cooldown,
            local_mode_poll,
            tap,
        }
    }

    pub fn handle(&self) -> ProducerHandle {
        ProducerHandle {
            queue: self.queue.clone(),
            limit: self.limit.clone(),
            paused: self.paused.clone(),
            inflight: self.inflight.clone(),
        }
    }

    /// Demand = limit - running_count, clamped to >= 0.
    async fn demand(&self) -> i64 {
        if self.paused.load(Ordering::SeqCst) {
            return 0;
        }
        let limit = self.limit.load(Ordering::SeqCst) as i64;
        let running = self.inflight.lock().await.len() as i64;
        (limit - running).max(0)
    }

    async fn dispatch(self: &Arc<Self>) {
        let demand = self.demand().await;
        if demand <= 0 {
            return;
        }
        let fetched = match self.store.fetch_jobs(&self.queue, demand, &self.node).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(target: "oban::producer", queue = %self.queue, error = %e, "fetch_jobs failed");
                return;
            }
        };
        for job in fetched {
            self.spawn_executor(job).await;
        }
    }

    async fn spawn_executor(self: &Arc<Self>, job: crate::job::Job) {
        let job_id = job.id;
        let job_snapshot = job.clone();
        let store = self.store.clone();
        let registry = self.registry.clone();
        let backoff = self.backoff;
        let tap = self.tap.clone();

        let join: tokio::task::JoinHandle<executor::ExecutorResult> =
            tokio::spawn(executor::run_job(job, registry, store, backoff, tap.clone()));
        self.inflight.lock().await.insert(job_id, join.abort_handle());

        let producer = self.clone();
        tokio::spawn(async move {
            if let Err(join_err) = join.await {
                if join_err.is_panic() {
                    tracing::error!(target: "oban::producer", job.id = job_id, "executor task panicked");
                    executor::handle_panic(
                        &job_snapshot,
                        &producer.registry,
                        producer.store.as_ref(),
                        producer.backoff,
                        tap,
                        join_err.into_panic(),
                    )
                    .await;
                }
                // A cancelled task (abort()) needs no further handling:
                // the row stays `executing` until reclaimed, or the caller
                // already transitioned it (e.g. via `signal{cancel}`).
            }
            producer.on_executor_done(job_id).await;
        });
    }

    async fn on_executor_done(self: &Arc<Self>, job_id: i64) {
        self.inflight.lock().await.remove(job_id);
        if self.demand().await > 0 {
            self.dispatch().await;
        }
    }

    /// Spawns the producer's notification-driven loop plus a local-mode
    /// poll fallback, returning a handle to control it.
    pub fn spawn(self) -> (ProducerHandle, tokio::task::JoinHandle<()>) {
        let producer = Arc::new(self);
        let handle = producer.handle();

        let mut insert_rx = producer.notifier.subscribe(Channel::Insert);
        let mut signal_rx = producer.notifier.subscribe(Channel::Signal);
        let queue_name = producer.queue.clone();
        let cooldown = producer.cooldown;
        let poll_interval = producer.local_mode_poll;

        let task = tokio::spawn(async move {
            // Initial dispatch so a producer started against already
            // available jobs doesn't wait for the next notification.
            producer.dispatch().await;

            let mut last_dispatch = tokio::time::Instant::now() - cooldown;
            let mut poll_ticker = tokio::time::interval(poll_interval);

            loop {
                tokio::select! {
                    notif = insert_rx.recv() => {
                        match notif {
                            Ok(Notification::Insert { queue }) if queue == queue_name => {
                                Self::cooldown_then_dispatch(&producer, &mut last_dispatch, cooldown).await;
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    notif = signal_rx.recv() => {
                        match notif {
                            Ok(Notification::Signal(sig)) => producer.handle_signal(sig).await,
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = poll_ticker.tick() => {
                        // Local-mode fallback: safe to run unconditionally
                        // since dispatch() is a no-op when there's no demand.
                        Self::cooldown_then_dispatch(&producer, &mut last_dispatch, cooldown).await;
                    }
                }
            }
        });

        (handle, task)
    }

    async fn cooldown_then_dispatch(
        producer: &Arc<Self>,
        last_dispatch: &mut tokio::time::Instant,
        cooldown: Duration,
    ) {
        let elapsed = last_dispatch.elapsed();
        if elapsed < cooldown {
            tokio::time::sleep(cooldown - elapsed).await;
        }
        *last_dispatch = tokio::time::Instant::now();
        producer.dispatch().await;
    }

    async fn handle_signal(self: &Arc<Self>, signal: Signal) {
        match signal {
            Signal::Pause { queue } if queue.as_deref().is_none_or_eq(&self.queue) => {
                self.paused.store(true, Ordering::SeqCst);
            }
            Signal::Resume { queue } if queue.as_deref().is_none_or_eq(&self.queue) => {
                self.paused.store(false, Ordering::SeqCst);
                self.dispatch().await;
            }
            Signal::Scale { queue, limit } if queue == self.queue => {
                self.limit.store(limit, Ordering::SeqCst);
                self.dispatch().await;
            }
            Signal::Cancel { job_id } => {
                self.inflight.lock().await.cancel(job_id);
            }
            _ => {}
        }
    }
}

/// Small helper trait to express "either the signal targets no specific
/// queue (broadcast to all) or it targets this one" without an explicit
/// `Option::map_or`.
trait OptStrEq {
    fn is_none_or_eq(&self, other: &str) -> bool;
}

impl OptStrEq for Option<&str> {
    fn is_none_or_eq(&self, other: &str) -> bool {
        match self {
            None => true,
            Some(s) => *s == other,
        }
    }
}
