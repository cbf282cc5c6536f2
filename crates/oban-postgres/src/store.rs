//! `PgJobStore`: the `JobStore` contract implemented against
//! a single `oban_jobs` table: claim-under-lock with `FOR UPDATE SKIP
//! LOCKED`, transactional retry bookkeeping, and `QueryBuilder`-built
//! conditional predicates over the seven-state job lifecycle.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use oban_core::job::{Job, JobChangeset, JobError, JobState};
use oban_core::plugins::Reindexable;
use oban_core::store::{InsertOpts, InsertedJob, JobStore, RescueOutcome, StagedByQueue};
use oban_core::uniqueness::{Fingerprint, ReplaceField, UniqueTimestamp, UniquenessOpts};
use oban_core::error::JobStoreError;
use serde_json::Value;
use sqlx::postgres::PgQueryResult;
use sqlx::{PgExecutor, PgPool, QueryBuilder};
use std::collections::HashMap;

/// Raw column shape returned by every `RETURNING *`/`SELECT *` against
/// `oban_jobs`; kept separate from [`Job`] so the DB-facing `TEXT`
/// encoding of `state` and `errors` has one conversion point.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    state: String,
    queue: String,
    worker: String,
    args: Value,
    meta: Value,
    tags: Vec<String>,
    errors: Value,
    attempt: i32,
    max_attempts: i32,
    priority: i32,
    inserted_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    attempted_at: Option<DateTime<Utc>>,
    attempted_by: Vec<String>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    discarded_at: Option<DateTime<Utc>>,
}

fn parse_state(raw: &str) -> Result<JobState, JobStoreError> {
    Ok(match raw {
        "scheduled" => JobState::Scheduled,
        "available" => JobState::Available,
        "executing" => JobState::Executing,
        "retryable" => JobState::Retryable,
        "completed" => JobState::Completed,
        "discarded" => JobState::Discarded,
        "cancelled" => JobState::Cancelled,
        other => {
            return Err(JobStoreError::DbFatal(format!(
                "unrecognized job state in oban_jobs: {other:?}"
            )))
        }
    })
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, JobStoreError> {
        let errors: Vec<JobError> = serde_json::from_value(row.errors)
            .map_err(|e| JobStoreError::DbFatal(format!("malformed errors column: {e}")))?;

        Ok(Job {
            id: row.id,
            state: parse_state(&row.state)?,
            queue: row.queue,
            worker: row.worker,
            args: row.args,
            meta: row.meta,
            tags: row.tags,
            errors,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            priority: row.priority,
            inserted_at: row.inserted_at,
            scheduled_at: row.scheduled_at,
            attempted_at: row.attempted_at,
            attempted_by: row.attempted_by,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
            discarded_at: row.discarded_at,
        })
    }
}

/// Maps a driver error onto the shared error taxonomy, so the backoff
/// retry helper (`oban_core::backoff::with_retry`) can tell transient
/// from fatal without ever matching on a SQLSTATE outside this adapter.
fn db_err(err: sqlx::Error) -> JobStoreError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            JobStoreError::DbUnavailable(err.to_string())
        }
        _ => JobStoreError::DbFatal(err.to_string()),
    }
}

/// PostgreSQL-backed `JobStore`. Cheap to clone (wraps a pooled
/// connection handle); register one instance per `Engine`.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_row<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        cs: &JobChangeset,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let state = cs.initial_state(now);
        let scheduled_at = cs.scheduled_at.unwrap_or(now);

        let row: JobRow = sqlx::query_as(
            r#"
            INSERT INTO oban_jobs
                (state, queue, worker, args, meta, tags, max_attempts, priority, inserted_at, scheduled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(state.as_str())
        .bind(&cs.queue)
        .bind(&cs.worker)
        .bind(&cs.args)
        .bind(&cs.meta)
        .bind(&cs.tags)
        .bind(cs.max_attempts)
        .bind(cs.priority)
        .bind(now)
        .bind(scheduled_at)
        .fetch_one(exec)
        .await
        .map_err(db_err)?;

        row.try_into()
    }

    /// Looks for a row matching `opts`'s fingerprint/states/period — the
    /// half of uniqueness resolution that's necessarily SQL-dialect
    /// specific (JSONB containment, `ANY($1::text[])`).
    async fn find_conflict<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        cs: &JobChangeset,
        opts: &UniquenessOpts,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let fp = Fingerprint::compute(cs, opts);
        let states: Vec<&'static str> = opts.states_or_default().iter().map(|s| s.as_str()).collect();

        let mut qb = QueryBuilder::new("SELECT * FROM oban_jobs WHERE state = ANY(");
        qb.push_bind(states);
        qb.push(")");

        if fp.queue.is_some() {
            qb.push(" AND queue = ").push_bind(cs.queue.clone());
        }
        if fp.worker.is_some() {
            qb.push(" AND worker = ").push_bind(cs.worker.clone());
        }
        if let Some(args) = &fp.args {
            qb.push(" AND args @> ").push_bind(Value::Object(args.clone()));
        }
        if let Some(meta) = &fp.meta {
            qb.push(" AND meta @> ").push_bind(Value::Object(meta.clone()));
        }
        if let Some(period) = opts.period {
            let column = match opts.timestamp {
                UniqueTimestamp::InsertedAt => "inserted_at",
                UniqueTimestamp::ScheduledAt => "scheduled_at",
            };
            let since = now - period;
            qb.push(format!(" AND {column} >= ")).push_bind(since);
        }
        qb.push(" LIMIT 1");

        let row: Option<JobRow> = qb.build_query_as().fetch_optional(exec).await.map_err(db_err)?;
        row.map(Job::try_from).transpose()
    }

    /// Overwrites the columns `opts.replace` names for `existing`'s state,
    /// from `cs`, and returns the updated row. A no-op (returns `existing`
    /// unchanged) if nothing is configured to replace for that state.
    async fn apply_replace<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        existing: Job,
        cs: &JobChangeset,
        opts: &UniquenessOpts,
    ) -> Result<Job, JobStoreError> {
        let Some(fields) = opts.replace.get(&existing.state) else {
            return Ok(existing);
        };
        if fields.is_empty() {
            return Ok(existing);
        }

        let mut qb = QueryBuilder::new("UPDATE oban_jobs SET ");
        {
            let mut sep = qb.separated(", ");
            for field in fields {
                match field {
                    ReplaceField::Args => {
                        sep.push("args = ").push_bind_unseparated(cs.args.clone());
                    }
                    ReplaceField::MaxAttempts => {
                        sep.push("max_attempts = ").push_bind_unseparated(cs.max_attempts);
                    }
                    ReplaceField::Meta => {
                        sep.push("meta = ").push_bind_unseparated(cs.meta.clone());
                    }
                    ReplaceField::Priority => {
                        sep.push("priority = ").push_bind_unseparated(cs.priority);
                    }
                    ReplaceField::Queue => {
                        sep.push("queue = ").push_bind_unseparated(cs.queue.clone());
                    }
                    ReplaceField::ScheduledAt => {
                        if let Some(scheduled_at) = cs.scheduled_at {
                            sep.push("scheduled_at = ").push_bind_unseparated(scheduled_at);
                        }
                    }
                    ReplaceField::Tags => {
                        sep.push("tags = ").push_bind_unseparated(cs.tags.clone());
                    }
                    ReplaceField::Worker => {
                        sep.push("worker = ").push_bind_unseparated(cs.worker.clone());
                    }
                }
            }
        }
        qb.push(" WHERE id = ").push_bind(existing.id);
        qb.push(" RETURNING *");

        let row: JobRow = qb.build_query_as().fetch_one(exec).await.map_err(db_err)?;
        row.try_into()
    }

    /// `rows_affected == 0` from a guarded `UPDATE` is ambiguous — no such
    /// row, or a row in the wrong state — so re-check once to give callers
    /// the right error variant instead of collapsing both into `NotFound`.
    async fn guard_transition(&self, id: i64, result: PgQueryResult) -> Result<(), JobStoreError> {
        if result.rows_affected() > 0 {
            return Ok(());
        }
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM oban_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match state {
            None => Err(JobStoreError::NotFound),
            Some(state) => Err(JobStoreError::InvalidTransition(format!(
                "job {id} is in state {state:?}"
            ))),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, cs: JobChangeset, opts: InsertOpts) -> Result<InsertedJob, JobStoreError> {
        let now = Utc::now();

        let Some(unique) = &opts.unique else {
            let job = self.insert_row(&self.pool, &cs, now).await?;
            return Ok(InsertedJob { job, conflict: false });
        };

        let fp = Fingerprint::compute(&cs, unique);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Advisory lock scoped to this transaction: serializes racing
        // inserts that share a fingerprint without taking a table lock.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(fp.lock_key())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if let Some(existing) = self.find_conflict(&mut *tx, &cs, unique, now).await? {
            let job = self.apply_replace(&mut *tx, existing, &cs, unique).await?;
            tx.commit().await.map_err(db_err)?;
            return Ok(InsertedJob { job, conflict: true });
        }

        let job = self.insert_row(&mut *tx, &cs, now).await?;
        tx.commit().await.map_err(db_err)?;
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
        let rows: Vec<(i64, String)> = match queue_filter {
            Some(queue) => sqlx::query_as(
                r#"
                UPDATE oban_jobs SET state = 'available'
                WHERE id IN (
                    SELECT id FROM oban_jobs
                    WHERE state IN ('scheduled', 'retryable') AND scheduled_at <= now() AND queue = $1
                    ORDER BY scheduled_at ASC
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, queue
                "#,
            )
            .bind(queue)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?,
            None => sqlx::query_as(
                r#"
                UPDATE oban_jobs SET state = 'available'
                WHERE id IN (
                    SELECT id FROM oban_jobs
                    WHERE state IN ('scheduled', 'retryable') AND scheduled_at <= now()
                    ORDER BY scheduled_at ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, queue
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?,
        };

        let mut out: StagedByQueue = HashMap::new();
        for (id, queue) in rows {
            out.entry(queue).or_default().push(id);
        }
        Ok(out)
    }

    async fn fetch_jobs(&self, queue: &str, demand: i64, node: &str) -> Result<Vec<Job>, JobStoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            UPDATE oban_jobs SET
                state = 'executing',
                attempt = attempt + 1,
                attempted_at = now(),
                attempted_by = array_append(attempted_by, $3)
            WHERE id IN (
                SELECT id FROM oban_jobs
                WHERE state = 'available' AND queue = $1
                ORDER BY priority ASC, scheduled_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(demand)
        .bind(node)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn complete_job(&self, id: i64) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE oban_jobs SET state = 'completed', completed_at = now() WHERE id = $1 AND state = 'executing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.guard_transition(id, result).await
    }

    async fn discard_job(&self, id: i64, err: String) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE oban_jobs SET
                state = 'discarded',
                discarded_at = now(),
                errors = errors || jsonb_build_array(jsonb_build_object('at', now(), 'attempt', attempt, 'error', $2::text))
            WHERE id = $1 AND state = 'executing'
            "#,
        )
        .bind(id)
        .bind(&err)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.guard_transition(id, result).await
    }

    async fn error_job(&self, id: i64, err: String, next_at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE oban_jobs SET
                state = 'retryable',
                scheduled_at = $3,
                errors = errors || jsonb_build_array(jsonb_build_object('at', now(), 'attempt', attempt, 'error', $2::text))
            WHERE id = $1 AND state = 'executing'
            "#,
        )
        .bind(id)
        .bind(&err)
        .bind(next_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.guard_transition(id, result).await
    }

    async fn snooze_job(&self, id: i64, seconds: i64) -> Result<(), JobStoreError> {
        // A snooze doesn't count as an attempt: rather than rolling the
        // already-incremented `attempt` back, the ceiling moves with it
        // so the job still gets its full complement of real tries.
        let result = sqlx::query(
            r#"
            UPDATE oban_jobs SET
                state = 'scheduled',
                scheduled_at = now() + ($2 * interval '1 second'),
                max_attempts = max_attempts + 1
            WHERE id = $1 AND state = 'executing'
            "#,
        )
        .bind(id)
        .bind(seconds)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.guard_transition(id, result).await
    }

    async fn cancel_job(&self, id: i64) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE oban_jobs SET state = 'cancelled', cancelled_at = now()
            WHERE id = $1 AND state NOT IN ('completed', 'discarded', 'cancelled')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.guard_transition(id, result).await
    }

    async fn retry_job(&self, id: i64) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE oban_jobs SET
                state = 'available',
                attempt = 0,
                scheduled_at = now(),
                discarded_at = NULL,
                cancelled_at = NULL
            WHERE id = $1 AND state IN ('discarded', 'cancelled')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.guard_transition(id, result).await
    }

    async fn rescue_jobs(
        &self,
        rescue_after: ChronoDuration,
        now: DateTime<Utc>,
    ) -> Result<RescueOutcome, JobStoreError> {
        let cutoff = now - rescue_after;
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            WITH stuck AS (
                SELECT id, attempt, max_attempts FROM oban_jobs
                WHERE state = 'executing' AND attempted_at < $1
                FOR UPDATE SKIP LOCKED
            ),
            rescued AS (
                UPDATE oban_jobs SET state = 'available'
                WHERE id IN (SELECT id FROM stuck WHERE attempt < max_attempts)
                RETURNING id
            ),
            discarded AS (
                UPDATE oban_jobs SET state = 'discarded', discarded_at = now()
                WHERE id IN (SELECT id FROM stuck WHERE attempt >= max_attempts)
                RETURNING id
            )
            SELECT 'rescued' AS kind, id FROM rescued
            UNION ALL
            SELECT 'discarded' AS kind, id FROM discarded
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut outcome = RescueOutcome::default();
        for (kind, id) in rows {
            match kind.as_str() {
                "rescued" => outcome.rescued.push(id),
                _ => outcome.discarded.push(id),
            }
        }
        Ok(outcome)
    }

    async fn prune_jobs(&self, max_age: ChronoDuration, limit: i64) -> Result<Vec<i64>, JobStoreError> {
        let cutoff = Utc::now() - max_age;
        let ids: Vec<(i64,)> = sqlx::query_as(
            r#"
            DELETE FROM oban_jobs
            WHERE id IN (
                SELECT id FROM oban_jobs
                WHERE (state = 'completed' AND completed_at < $1)
                   OR (state = 'discarded' AND discarded_at < $1)
                   OR (state = 'cancelled' AND cancelled_at < $1)
                LIMIT $2
            )
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM oban_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(Job::try_from).transpose()
    }
}

/// Periodic `REINDEX` to bound bloat from the table's high update churn
/// (every state transition rewrites the row). See
/// [`oban_core::plugins::Reindexer`].
#[async_trait]
impl Reindexable for PgJobStore {
    async fn reindex(&self) -> Result<(), JobStoreError> {
        sqlx::query("REINDEX INDEX CONCURRENTLY oban_jobs_fetch_idx")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
