//! The job store adapter contract.
//!
//! This is the *only* surface the rest of the engine uses to read or
//! mutate job rows. Concrete implementations (`oban-postgres::PgJobStore`,
//! `oban-testing::{InlineJobStore, ManualJobStore}`) encapsulate the SQL
//! dialect and must implement every transition atomically.

use crate::error::JobStoreError;
use crate::job::{Job, JobChangeset};
use crate::uniqueness::UniquenessOpts;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Result of `insert_job`/`insert_all_jobs`: either a freshly inserted
/// row, or a pre-existing row the uniqueness check matched.
#[derive(Debug, Clone)]
pub struct InsertedJob {
    pub job: Job,
    pub conflict: bool,
}

/// Options threaded through `insert_job`/`insert_all_jobs`.
#[derive(Debug, Clone, Default)]
pub struct InsertOpts {
    pub unique: Option<UniquenessOpts>,
}

/// Jobs staged in one `stage_jobs` call, grouped by queue so the caller
/// can publish one `insert{queue}` notification per group.
pub type StagedByQueue = HashMap<String, Vec<i64>>;

/// Outcome of `rescue_jobs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescueOutcome {
    pub rescued: Vec<i64>,
    pub discarded: Vec<i64>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(
        &self,
        cs: JobChangeset,
        opts: InsertOpts,
    ) -> Result<InsertedJob, JobStoreError>;

    async fn insert_all_jobs(
        &self,
        changesets: Vec<JobChangeset>,
        opts: InsertOpts,
    ) -> Result<Vec<InsertedJob>, JobStoreError>;

    /// Whether this adapter can evaluate uniqueness within
    /// `insert_all_jobs` — if not, batch inserts happen unconditionally.
    fn supports_batch_uniqueness(&self) -> bool {
        true
    }

    async fn stage_jobs(
        &self,
        queue_filter: Option<&str>,
        limit: i64,
    ) -> Result<StagedByQueue, JobStoreError>;

    async fn fetch_jobs(
        &self,
        queue: &str,
        demand: i64,
        node: &str,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn complete_job(&self, id: i64) -> Result<(), JobStoreError>;

    async fn discard_job(&self, id: i64, err: String) -> Result<(), JobStoreError>;

    async fn error_job(
        &self,
        id: i64,
        err: String,
        next_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    async fn snooze_job(&self, id: i64, seconds: i64) -> Result<(), JobStoreError>;

    async fn cancel_job(&self, id: i64) -> Result<(), JobStoreError>;

    /// Moves `discarded`/`cancelled` rows back to `available` (the public `retry` call).
    async fn retry_job(&self, id: i64) -> Result<(), JobStoreError>;

    async fn rescue_jobs(
        &self,
        rescue_after: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<RescueOutcome, JobStoreError>;

    async fn prune_jobs(
        &self,
        max_age: chrono::Duration,
        limit: i64,
    ) -> Result<Vec<i64>, JobStoreError>;

    async fn get_job(&self, id: i64) -> Result<Option<Job>, JobStoreError>;
}
