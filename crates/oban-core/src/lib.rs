//! # oban-core
//!
//! A persistent, database-backed background job processing engine:
//! durable jobs survive process restarts, a store adapter claims them
//! under row-level locking, and a supervised set of per-queue producers
//! dispatches them to user-authored workers with bounded concurrency.
//!
//! ## Core Concepts
//!
//! - [`Job`] = a durable unit of work with a `state` column driving its
//!   lifecycle (`scheduled → available → executing → completed | ...`).
//! - [`Worker`] = user-authored code, resolved by the job's `worker`
//!   string and returning an [`Outcome`] (complete, retry, discard,
//!   cancel, or snooze).
//! - [`JobStore`] = the one seam every SQL dialect implements: insert,
//!   stage, fetch-under-lock, and every state transition, atomically.
//!
//! ## Architecture
//!
//! ```text
//! insert(changeset) ──► JobStore ──► jobs table
//!                                        │
//!                         Stager.tick()  │ (every 1s)
//!                     scheduled/retryable → available
//!                                        │
//!                            notifier.publish(insert{queue})
//!                                        │
//!                  ┌─────────────────────┴─────────────────────┐
//!                  ▼                                            ▼
//!          Producer(queue A)                             Producer(queue B)
//!        fetch_jobs (SKIP LOCKED)                       fetch_jobs (SKIP LOCKED)
//!                  │                                            │
//!                  ▼                                            ▼
//!         executor::run_job ──► Worker::perform ──► Outcome ──► JobStore transition
//! ```
//!
//! A leader election [`Peer`] gates the cron scheduler and the
//! pruner/lifeline/reindexer maintenance plugins so they run once
//! cluster-wide rather than once per node.
//!
//! ## Key Invariants
//!
//! 1. Every terminal state owns exactly one terminal timestamp.
//! 2. `attempt` never exceeds `max_attempts`; it only increases at
//!    `available → executing`.
//! 3. At most one row satisfies a given uniqueness fingerprint, window,
//!    and state set at insert commit time.
//! 4. At most one peer reports `leader = true` per instance name at a
//!    time (subject to partition healing).
//!
//! ## Guarantees
//!
//! - **At-most-once notification delivery**: the notifier is an
//!   optimization; correctness never depends on a message arriving —
//!   see the producer's local-mode poll fallback.
//! - **Durable by default**: every job lives in the store until pruned;
//!   only `testing = inline` bypasses persistence entirely.
//!
//! ## Example
//!
//! ```ignore
//! use oban_core::{Config, EngineBuilder, JobChangeset, Outcome, Worker};
//! use async_trait::async_trait;
//!
//! struct SendWelcomeEmail;
//!
//! #[async_trait]
//! impl Worker for SendWelcomeEmail {
//!     const NAME: &'static str = "send_welcome_email";
//!     async fn perform(&self, job: &oban_core::Job) -> Outcome {
//!         match job.args.get("user_id") {
//!             Some(_) => Outcome::Complete,
//!             None => Outcome::Discard("missing user_id".into()),
//!         }
//!     }
//! }
//!
//! let config = Config::builder().queue("default", 10).build()?;
//! let engine = EngineBuilder::new(config, store, notifier, peer)
//!     .register(SendWelcomeEmail)
//!     .build();
//!
//! engine
//!     .insert(JobChangeset::new("default", "send_welcome_email", serde_json::json!({"user_id": 1})), None)
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## What This Is Not
//!
//! `oban-core` is **not**:
//! - A message broker (no external consumers, no routing topology)
//! - A workflow/saga engine (jobs don't model multi-step transactions)
//! - A distributed lock service (leader election serves this crate's
//!   own plugins only)
//!
//! `oban-core` **is**:
//! > A durable, SQL-backed job queue with per-queue concurrency control,
//! > uniqueness, cron scheduling, and crash recovery.

// Core modules
mod backoff;
mod config;
mod cron;
mod engine;
mod error;
mod executor;
mod notifier;
mod peer;
mod producer;
mod stager;
mod supervisor;
mod tap;
mod uniqueness;
mod worker;

// Job interfaces (policy-light)
pub mod job;

// Job store adapter contract
pub mod store;

// Maintenance plugins
pub mod plugins;

// Debug auditing for invariant visibility
#[cfg(debug_assertions)]
pub mod audit;

// Testing utilities live in the separate oban-testing crate.

// Code smell tests (test-only)
#[cfg(test)]
mod codesmell_tests;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Serde round-trip tests for the wire-facing types (test-only)
#[cfg(test)]
mod serde_auto_tests;

// Re-export job types (the central entity and its lifecycle)
pub use crate::job::{
    Job, JobChangeset, JobError, JobState, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, MAX_PRIORITY,
    MIN_PRIORITY,
};

// Re-export the store adapter contract
pub use crate::store::{InsertOpts, InsertedJob, JobStore, RescueOutcome, StagedByQueue};

// Re-export uniqueness types
pub use crate::uniqueness::{
    Fingerprint, ReplaceField, UniqueField, UniqueStates, UniqueTimestamp, UniquenessOpts,
};

// Re-export error types
pub use crate::error::{
    BatchOutcome, Categorizable, JobStoreError, ObanError, SafeErrorCategory, ValidationError,
    WorkerError,
};

// Re-export worker types
pub use worker::{ErasedWorker, Outcome, Worker, WorkerRegistry};

// Re-export backoff types
pub use backoff::{BackoffPolicy, ExponentialBackoff, Jitter, JitterMode, RetryPolicy, with_retry};

// Re-export notifier types
pub use notifier::{Channel, LocalNotifier, Notification, Notifier, Signal};

// Re-export peer/leader-election types
pub use peer::{AlwaysLeader, Peer, PeerHandle, DEFAULT_BOOST, DEFAULT_ELECTION_INTERVAL};

// Re-export producer types
pub use producer::{Producer, ProducerHandle, QueueStatus, DEFAULT_DISPATCH_COOLDOWN};

// Re-export executor types
pub use executor::{run_job, ExecutorResult};

// Re-export stager types
pub use stager::{Stager, DEFAULT_STAGE_INTERVAL, DEFAULT_STAGE_LIMIT};

// Re-export cron types
pub use cron::{CronEntry, CronExpression, CronParseError, CronPlugin, CronScheduler};

// Re-export configuration types
pub use config::{
    Config, ConfigBuilder, CronOpts, LifelineOpts, PluginOpts, PrunerOpts, QueueOpts,
    ReindexerOpts, TestingMode,
};

// Re-export the supervisor (advanced: most callers go through `Engine`)
pub use supervisor::Supervisor;

// Re-export tap types (telemetry observation)
pub use tap::{ExecutorResultSummary, Tap, TelemetryEvent};

// Re-export engine types (primary entry point)
pub use engine::{args, Engine, EngineBuilder};

// Re-export commonly used external types
pub use async_trait::async_trait;
