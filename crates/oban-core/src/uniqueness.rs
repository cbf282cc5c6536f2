//! Uniqueness fingerprinting.
//!
//! This module computes the dialect-agnostic half of the algorithm — the
//! canonical fingerprint and the states/window predicate. The advisory
//! lock and the actual row lookup are the adapter's job, since they're
//! necessarily SQL-dialect-specific.

use crate::job::{Job, JobChangeset, JobState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Which job fields feed the fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueField {
    Worker,
    Queue,
    Args,
    Meta,
}

/// Which timestamp the `period` window is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueTimestamp {
    InsertedAt,
    ScheduledAt,
}

impl Default for UniqueTimestamp {
    fn default() -> Self {
        UniqueTimestamp::InsertedAt
    }
}

/// Named state groups a uniqueness check may search, plus an explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueStates {
    All,
    Incomplete,
    Scheduled,
    Successful,
    Explicit(Vec<JobState>),
}

impl UniqueStates {
    pub fn resolve(&self) -> Vec<JobState> {
        use JobState::*;
        match self {
            UniqueStates::All => vec![
                Scheduled, Available, Executing, Retryable, Completed, Discarded, Cancelled,
            ],
            UniqueStates::Incomplete => vec![Scheduled, Available, Executing, Retryable],
            UniqueStates::Scheduled => vec![Scheduled],
            UniqueStates::Successful => vec![Completed],
            UniqueStates::Explicit(v) => v.clone(),
        }
    }
}

/// Per-state field replacement on conflict (`replace`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceField {
    Args,
    MaxAttempts,
    Meta,
    Priority,
    Queue,
    ScheduledAt,
    Tags,
    Worker,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UniquenessOpts {
    /// `None` means infinity.
    pub period: Option<chrono::Duration>,
    pub fields: Vec<UniqueField>,
    pub keys: Vec<String>,
    pub states: Option<UniqueStates>,
    pub timestamp: UniqueTimestamp,
    pub replace: std::collections::HashMap<JobState, Vec<ReplaceField>>,
}

impl UniquenessOpts {
    pub fn new() -> Self {
        Self {
            period: None,
            fields: vec![UniqueField::Worker, UniqueField::Queue, UniqueField::Args],
            keys: Vec::new(),
            states: None,
            timestamp: UniqueTimestamp::InsertedAt,
            replace: Default::default(),
        }
    }

    pub fn with_period(mut self, period: chrono::Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_states(mut self, states: UniqueStates) -> Self {
        self.states = Some(states);
        self
    }

    pub fn with_fields(mut self, fields: Vec<UniqueField>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_replace(mut self, state: JobState, fields: Vec<ReplaceField>) -> Self {
        self.replace.insert(state, fields);
        self
    }

    /// Without an explicit `states`, a duplicate is any row that hasn't
    /// reached a terminal failure state — that includes `completed`, not
    /// just the in-flight states `Incomplete` names.
    pub fn states_or_default(&self) -> Vec<JobState> {
        match &self.states {
            Some(states) => states.resolve(),
            None => {
                use JobState::*;
                vec![Scheduled, Available, Executing, Retryable, Completed]
            }
        }
    }
}

/// Overwrites the fields `opts.replace` names for `existing.state` onto
/// `existing`, using the values from the incoming `changeset`. A no-op
/// if nothing is configured to replace for that state.
pub fn apply_replace(existing: &mut Job, changeset: &JobChangeset, opts: &UniquenessOpts) {
    let Some(fields) = opts.replace.get(&existing.state) else {
        return;
    };
    for field in fields {
        match field {
            ReplaceField::Args => existing.args = changeset.args.clone(),
            ReplaceField::MaxAttempts => existing.max_attempts = changeset.max_attempts,
            ReplaceField::Meta => existing.meta = changeset.meta.clone(),
            ReplaceField::Priority => existing.priority = changeset.priority,
            ReplaceField::Queue => existing.queue = changeset.queue.clone(),
            ReplaceField::ScheduledAt => {
                if let Some(scheduled_at) = changeset.scheduled_at {
                    existing.scheduled_at = scheduled_at;
                }
            }
            ReplaceField::Tags => existing.tags = changeset.tags.clone(),
            ReplaceField::Worker => existing.worker = changeset.worker.clone(),
        }
    }
}

/// A canonical projection of a changeset used to detect duplicates.
/// `Hash`/`Eq` so adapters can turn it into an advisory-lock key cheaply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    pub worker: Option<String>,
    pub queue: Option<String>,
    pub args: Option<Map<String, Value>>,
    pub meta: Option<Map<String, Value>>,
}

impl Fingerprint {
    pub fn compute(cs: &JobChangeset, opts: &UniquenessOpts) -> Self {
        let has = |f: UniqueField| opts.fields.contains(&f);
        let project = |v: &Value| -> Map<String, Value> {
            let Some(obj) = v.as_object() else {
                return Map::new();
            };
            if opts.keys.is_empty() {
                obj.clone()
            } else {
                let mut out = Map::new();
                for k in &opts.keys {
                    if let Some(val) = obj.get(k) {
                        out.insert(k.clone(), val.clone());
                    }
                }
                out
            }
        };

        Fingerprint {
            worker: has(UniqueField::Worker).then(|| cs.worker.clone()),
            queue: has(UniqueField::Queue).then(|| cs.queue.clone()),
            args: has(UniqueField::Args).then(|| project(&cs.args)),
            meta: has(UniqueField::Meta).then(|| project(&cs.meta)),
        }
    }

    pub fn compute_from_job(job: &Job, opts: &UniquenessOpts) -> Self {
        let cs = JobChangeset {
            queue: job.queue.clone(),
            worker: job.worker.clone(),
            args: job.args.clone(),
            meta: job.meta.clone(),
            tags: job.tags.clone(),
            max_attempts: job.max_attempts,
            priority: job.priority,
            scheduled_at: Some(job.scheduled_at),
        };
        Self::compute(&cs, opts)
    }

    /// A stable 64-bit digest suitable for a Postgres advisory lock key.
    pub fn lock_key(&self) -> i64 {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        hasher.finish() as i64
    }
}
