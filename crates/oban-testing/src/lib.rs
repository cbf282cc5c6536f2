//! Testing-mode harnesses for `oban-core`.
//!
//! [`InMemoryJobStore`] is a complete, spec-correct `JobStore` with no SQL
//! underneath: every transition from `oban_core::store::JobStore` is
//! implemented against a `Mutex<HashMap<i64, Job>>`. It replaces the
//! single-purpose `RecordingStore`/`BareStore`/`QueueingStore` fakes
//! scattered across `oban-core`'s own `#[cfg(test)]` modules with one
//! reusable store, shared wherever more than one module needs the same
//! shape.
//!
//! Wire it into `EngineBuilder` under `testing = inline` (runs workers
//! synchronously in the caller) or `testing = manual` (drained explicitly
//! via `Engine::drain_queue`) — or under `testing = disabled` with
//! `oban_core::Supervisor`, for integration tests that want the full
//! staging/dispatch pipeline without a live Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use oban_core::error::JobStoreError;
use oban_core::job::{Job, JobChangeset, JobError, JobState};
use oban_core::store::{InsertOpts, InsertedJob, JobStore, RescueOutcome, StagedByQueue};
use oban_core::uniqueness::{apply_replace, Fingerprint, UniqueTimestamp, UniquenessOpts};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;

/// An in-memory, single-process `JobStore`. Cheap to construct; each
/// instance owns its own job table, so tests that want isolation just
/// create a fresh one.
pub struct InMemoryJobStore {
    next_id: AtomicI64,
    jobs: Mutex<HashMap<i64, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of every row currently held, for assertions in tests.
    pub async fn all_jobs(&self) -> Vec<Job> {
        self.jobs.lock().await.values().cloned().collect()
    }

    fn build_job(cs: &JobChangeset, id: i64, now: DateTime<Utc>) -> Job {
        Job {
            id,
            state: cs.initial_state(now),
            queue: cs.queue.clone(),
            worker: cs.worker.clone(),
            args: cs.args.clone(),
            meta: cs.meta.clone(),
            tags: cs.tags.clone(),
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
        }
    }

    fn find_conflict(
        jobs: &HashMap<i64, Job>,
        cs: &JobChangeset,
        opts: &UniquenessOpts,
        now: DateTime<Utc>,
    ) -> Option<i64> {
        let fp = Fingerprint::compute(cs, opts);
        let states = opts.states_or_default();

        jobs.values()
            .find(|job| {
                if !states.contains(&job.state) {
                    return false;
                }
                if let Some(period) = opts.period {
                    let stamp = match opts.timestamp {
                        UniqueTimestamp::InsertedAt => job.inserted_at,
                        UniqueTimestamp::ScheduledAt => job.scheduled_at,
                    };
                    if stamp < now - period {
                        return false;
                    }
                }
                Fingerprint::compute_from_job(job, opts) == fp
            })
            .map(|job| job.id)
    }

    fn guard_transition<'a>(jobs: &'a mut HashMap<i64, Job>, id: i64) -> Result<&'a mut Job, JobStoreError> {
        jobs.get_mut(&id).ok_or(JobStoreError::NotFound)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, cs: JobChangeset, opts: InsertOpts) -> Result<InsertedJob, JobStoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        if let Some(unique) = &opts.unique {
            if let Some(existing_id) = Self::find_conflict(&jobs, &cs, unique, now) {
                let existing = jobs.get_mut(&existing_id).expect("conflict id came from the same map");
                apply_replace(existing, &cs, unique);
                return Ok(InsertedJob { job: existing.clone(), conflict: true });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let job = Self::build_job(&cs, id, now);
        jobs.insert(id, job.clone());
        Ok(InsertedJob { job, conflict: false })
    }

    async fn insert_all_jobs(
        &self,
        changesets: Vec<JobChangeset>,
        opts: InsertOpts,
    ) -> Result<Vec<InsertedJob>, JobStoreError> {
        let mut out = Vec::with_capacity(changesets.len());
        for cs in changesets {
            out.push(self.insert_job(cs, opts.clone()).await?);
        }
        Ok(out)
    }

    async fn stage_jobs(&self, queue_filter: Option<&str>, limit: i64) -> Result<StagedByQueue, JobStoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        let mut due: Vec<i64> = jobs
            .values()
            .filter(|job| {
                matches!(job.state, JobState::Scheduled | JobState::Retryable)
                    && job.scheduled_at <= now
                    && queue_filter.map_or(true, |q| q == job.queue)
            })
            .map(|job| job.id)
            .collect();
        due.sort_unstable();
        due.truncate(limit.max(0) as usize);

        let mut out: StagedByQueue = HashMap::new();
        for id in due {
            if let Some(job) = jobs.get_mut(&id) {
                job.state = JobState::Available;
                out.entry(job.queue.clone()).or_default().push(id);
            }
        }
        Ok(out)
    }

    async fn fetch_jobs(&self, queue: &str, demand: i64, node: &str) -> Result<Vec<Job>, JobStoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        let mut candidates: Vec<i64> = jobs
            .values()
            .filter(|job| job.state == JobState::Available && job.queue == queue)
            .map(|job| job.id)
            .collect();
        candidates.sort_by_key(|id| {
            let job = &jobs[id];
            (job.priority, job.scheduled_at, *id)
        });
        candidates.truncate(demand.max(0) as usize);

        let mut out = Vec::with_capacity(candidates.len());
        for id in candidates {
            let job = jobs.get_mut(&id).expect("candidate id came from the same map");
            job.state = JobState::Executing;
            job.attempt += 1;
            job.attempted_at = Some(now);
            job.attempted_by.push(node.to_string());
            out.push(job.clone());
        }
        Ok(out)
    }

    async fn complete_job(&self, id: i64) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = Self::guard_transition(&mut jobs, id)?;
        if job.state != JobState::Executing {
            return Err(JobStoreError::InvalidTransition(format!("job {id} is in state {}", job.state)));
        }
        job.state = JobState::Completed;
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn discard_job(&self, id: i64, err: String) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = Self::guard_transition(&mut jobs, id)?;
        if job.state != JobState::Executing {
            return Err(JobStoreError::InvalidTransition(format!("job {id} is in state {}", job.state)));
        }
        job.errors.push(JobError {
            at: Utc::now(),
            attempt: job.attempt,
            error: err,
        });
        job.state = JobState::Discarded;
        job.discarded_at = Some(Utc::now());
        Ok(())
    }

    async fn error_job(&self, id: i64, err: String, next_at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = Self::guard_transition(&mut jobs, id)?;
        if job.state != JobState::Executing {
            return Err(JobStoreError::InvalidTransition(format!("job {id} is in state {}", job.state)));
        }
        job.errors.push(JobError {
            at: Utc::now(),
            attempt: job.attempt,
            error: err,
        });
        job.state = JobState::Retryable;
        job.scheduled_at = next_at;
        Ok(())
    }

    async fn snooze_job(&self, id: i64, seconds: i64) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = Self::guard_transition(&mut jobs, id)?;
        if job.state != JobState::Executing {
            return Err(JobStoreError::InvalidTransition(format!("job {id} is in state {}", job.state)));
        }
        job.state = JobState::Scheduled;
        job.scheduled_at = Utc::now() + ChronoDuration::seconds(seconds);
        job.max_attempts += 1;
        Ok(())
    }

    async fn cancel_job(&self, id: i64) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = Self::guard_transition(&mut jobs, id)?;
        if job.state.is_terminal() {
            return Err(JobStoreError::InvalidTransition(format!("job {id} is already {}", job.state)));
        }
        job.state = JobState::Cancelled;
        job.cancelled_at = Some(Utc::now());
        Ok(())
    }

    async fn retry_job(&self, id: i64) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = Self::guard_transition(&mut jobs, id)?;
        if !matches!(job.state, JobState::Discarded | JobState::Cancelled) {
            return Err(JobStoreError::InvalidTransition(format!("job {id} is in state {}", job.state)));
        }
        job.state = JobState::Available;
        job.attempt = 0;
        job.scheduled_at = Utc::now();
        job.discarded_at = None;
        job.cancelled_at = None;
        Ok(())
    }

    async fn rescue_jobs(&self, rescue_after: ChronoDuration, now: DateTime<Utc>) -> Result<RescueOutcome, JobStoreError> {
        let cutoff = now - rescue_after;
        let mut jobs = self.jobs.lock().await;
        let mut outcome = RescueOutcome::default();

        for job in jobs.values_mut() {
            if job.state != JobState::Executing {
                continue;
            }
            let Some(attempted_at) = job.attempted_at else {
                continue;
            };
            if attempted_at >= cutoff {
                continue;
            }
            if job.attempt < job.max_attempts {
                job.state = JobState::Available;
                outcome.rescued.push(job.id);
            } else {
                job.state = JobState::Discarded;
                job.discarded_at = Some(now);
                outcome.discarded.push(job.id);
            }
        }
        Ok(outcome)
    }

    async fn prune_jobs(&self, max_age: ChronoDuration, limit: i64) -> Result<Vec<i64>, JobStoreError> {
        let cutoff = Utc::now() - max_age;
        let mut jobs = self.jobs.lock().await;

        let mut doomed: Vec<i64> = jobs
            .values()
            .filter(|job| {
                let terminal_at = match job.state {
                    JobState::Completed => job.completed_at,
                    JobState::Discarded => job.discarded_at,
                    JobState::Cancelled => job.cancelled_at,
                    _ => None,
                };
                terminal_at.is_some_and(|at| at < cutoff)
            })
            .map(|job| job.id)
            .collect();
        doomed.sort_unstable();
        doomed.truncate(limit.max(0) as usize);

        for id in &doomed {
            jobs.remove(id);
        }
        Ok(doomed)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }
}
