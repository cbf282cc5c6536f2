//! The central entity: a persisted unit of work and its lifecycle.
//!
//! A [`Job`] is shared state owned by the database. In-process code only
//! ever holds read-only snapshots of it, except during the atomic state
//! transitions implemented by a [`crate::store::JobStore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Default `max_attempts` for a job that doesn't specify one.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 20;

/// Default `priority` for a job that doesn't specify one (highest).
pub const DEFAULT_PRIORITY: i32 = 0;

/// Lowest (least urgent) priority value a job may carry.
pub const MIN_PRIORITY: i32 = 0;

/// Highest (most urgent) priority value a job may carry. Priority is
/// ascending urgency by ascending number: 0 sorts first and runs first.
pub const MAX_PRIORITY: i32 = 9;

/// The job's position in the state machine.
///
/// The only backward transition is `Executing -> Available | Retryable`,
/// performed by the lifeline rescuer — everything else moves
/// strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Available,
    Executing,
    Retryable,
    Completed,
    Discarded,
    Cancelled,
}

impl JobState {
    /// Terminal states own exactly one of `completed_at`/`cancelled_at`/`discarded_at`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Discarded | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Available => "available",
            JobState::Executing => "executing",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a job's `errors` history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub at: DateTime<Utc>,
    pub attempt: i32,
    pub error: String,
}

/// A fully materialized job row, as returned by the store adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub state: JobState,
    pub queue: String,
    pub worker: String,
    pub args: Value,
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub errors: Vec<JobError>,
    pub attempt: i32,
    pub max_attempts: i32,
    pub priority: i32,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempted_by: Vec<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Checks the invariants a job row must always satisfy. Intended for
    /// tests and for debug-only assertions at the executor/store
    /// boundary — never run in the hot path of production code.
    pub fn check_invariants(&self) -> Result<(), String> {
        let terminal_stamps = [self.completed_at, self.cancelled_at, self.discarded_at]
            .iter()
            .filter(|v| v.is_some())
            .count();

        if self.state.is_terminal() && terminal_stamps != 1 {
            return Err(format!(
                "job {} in terminal state {} must have exactly one terminal timestamp, found {}",
                self.id, self.state, terminal_stamps
            ));
        }
        if !self.state.is_terminal() && terminal_stamps != 0 {
            return Err(format!(
                "job {} in non-terminal state {} must have no terminal timestamp",
                self.id, self.state
            ));
        }
        if self.attempt > self.max_attempts {
            return Err(format!(
                "job {} attempt {} exceeds max_attempts {}",
                self.id, self.attempt, self.max_attempts
            ));
        }
        if self.state == JobState::Executing {
            if self.attempt < 1 {
                return Err(format!("job {} is executing with attempt < 1", self.id));
            }
            if self.attempted_at.is_none() {
                return Err(format!("job {} is executing without attempted_at", self.id));
            }
            if self.attempted_by.is_empty() {
                return Err(format!(
                    "job {} is executing without an attempted_by entry",
                    self.id
                ));
            }
        }
        Ok(())
    }

    /// Extracts a subset of `args`/`meta` keys for uniqueness fingerprinting.
    pub fn project(&self, keys: &[String]) -> Map<String, Value> {
        let mut out = Map::new();
        let Some(obj) = self.args.as_object() else {
            return out;
        };
        if keys.is_empty() {
            return obj.clone();
        }
        for key in keys {
            if let Some(v) = obj.get(key) {
                out.insert(key.clone(), v.clone());
            }
        }
        out
    }
}

/// The caller-supplied description of a job to insert. Mirrors the SQL
/// adapter's changeset concept without tying it to any ORM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobChangeset {
    pub queue: String,
    pub worker: String,
    pub args: Value,
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default)]
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
}

fn default_max_attempts() -> i32 {
    DEFAULT_MAX_ATTEMPTS
}

impl JobChangeset {
    pub fn new(queue: impl Into<String>, worker: impl Into<String>, args: Value) -> Self {
        Self {
            queue: queue.into(),
            worker: worker.into(),
            args,
            meta: Value::Object(Map::new()),
            tags: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: DEFAULT_PRIORITY,
            scheduled_at: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    /// Validates the changeset the way `insert_job` must before it ever
    /// reaches the table: invalid jobs never reach the table.
    pub fn validate(&self) -> Result<(), crate::error::ValidationError> {
        use crate::error::ValidationError;

        if self.queue.is_empty() || self.queue.len() > 127 {
            return Err(ValidationError::new(
                "queue must be 1-127 characters".into(),
            ));
        }
        if self.worker.is_empty() || self.worker.len() > 127 {
            return Err(ValidationError::new(
                "worker must be 1-127 characters".into(),
            ));
        }
        if !self.args.is_object() && !self.args.is_null() {
            return Err(ValidationError::new("args must be a JSON object".into()));
        }
        if self.max_attempts < 1 {
            return Err(ValidationError::new("max_attempts must be > 0".into()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(ValidationError::new(format!(
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}"
            )));
        }
        Ok(())
    }

    /// The state a freshly inserted job should start in.
    pub fn initial_state(&self, now: DateTime<Utc>) -> JobState {
        match self.scheduled_at {
            Some(at) if at > now => JobState::Scheduled,
            _ => JobState::Available,
        }
    }
}

/// Subset of `{worker, queue, args, meta}` a uniqueness check compares.
pub type FieldKeys = HashMap<String, Vec<String>>;
