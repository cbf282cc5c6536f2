//! Error taxonomy.
//!
//! No SQL-specific variant lives here — adapters (e.g. `oban-postgres`)
//! translate their own driver errors into this taxonomy at the boundary,
//! keeping adapter detail out of the core crate.

use std::fmt;
use thiserror::Error;

/// Whether an error should be retried transparently by `db_retry`
/// or surfaced immediately.
pub trait Categorizable {
    fn category(&self) -> SafeErrorCategory;
}

/// The three buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeErrorCategory {
    /// Connection lost, deadlock, statement timeout — retry with backoff.
    Transient,
    /// Missing table, permission denied — the plugin/component degrades.
    Fatal,
    /// Anything else (e.g. logic errors) — never retried automatically.
    Other,
}

/// A job failed validation before ever reaching the table.
#[derive(Debug, Clone, Error)]
#[error("invalid job: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: String) -> Self {
        Self(message)
    }
}

/// Errors a [`crate::store::JobStore`] implementation returns.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("uniqueness conflict")]
    Conflict,
    #[error("job not found")]
    NotFound,
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("database unavailable: {0}")]
    DbUnavailable(String),
    #[error("fatal database error: {0}")]
    DbFatal(String),
}

impl Categorizable for JobStoreError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            JobStoreError::DbUnavailable(_) => SafeErrorCategory::Transient,
            JobStoreError::DbFatal(_) => SafeErrorCategory::Fatal,
            JobStoreError::Conflict
            | JobStoreError::NotFound
            | JobStoreError::InvalidTransition(_) => SafeErrorCategory::Other,
        }
    }
}

/// A worker either panicked, returned `{error, reason}`, or was not found.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker not found: {0}")]
    NotFound(String),
    #[error("worker returned an error: {0}")]
    Failed(String),
    #[error("worker timed out")]
    Timeout,
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Top-level error surfaced by the public engine API.
#[derive(Debug, Error)]
pub enum ObanError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("job {0} not found")]
    NotFound(i64),
    #[error("queue {0} not found")]
    UnknownQueue(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl Categorizable for ObanError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            ObanError::Store(e) => e.category(),
            _ => SafeErrorCategory::Other,
        }
    }
}

/// The outcome of a batch operation (`insert_all_jobs`) — some rows may
/// be freshly inserted, others may be pre-existing uniqueness conflicts.
/// Not itself an error.
#[derive(Debug, Clone)]
pub enum BatchOutcome<T> {
    Inserted(T),
    Conflicted(T),
    Failed(String),
}

impl<T> BatchOutcome<T> {
    pub fn into_inner(self) -> Result<T, String> {
        match self {
            BatchOutcome::Inserted(v) | BatchOutcome::Conflicted(v) => Ok(v),
            BatchOutcome::Failed(e) => Err(e),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, BatchOutcome::Conflicted(_))
    }
}

impl<T: fmt::Debug> fmt::Display for BatchOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOutcome::Inserted(v) => write!(f, "inserted({v:?})"),
            BatchOutcome::Conflicted(v) => write!(f, "conflicted({v:?})"),
            BatchOutcome::Failed(e) => write!(f, "failed({e})"),
        }
    }
}
