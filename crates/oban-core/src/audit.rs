//! Debug-only invariant auditing, compiled out of release builds.
//!
//! Checking [`crate::job::Job::check_invariants`] on every transition
//! would be wasted work in production; in debug builds it catches an
//! adapter or executor bug immediately instead of surfacing as a
//! confusing downstream symptom.

use crate::job::Job;

#[cfg(debug_assertions)]
pub fn audit_job(job: &Job) {
    if let Err(reason) = job.check_invariants() {
        tracing::error!(target: "oban::audit", job.id = job.id, reason = %reason, "invariant violated");
        debug_assert!(false, "job invariant violated: {reason}");
    }
}

#[cfg(not(debug_assertions))]
pub fn audit_job(_job: &Job) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobError, JobState};
    use chrono::Utc;

    fn base_job() -> Job {
        Job {
            id: 1,
            state: JobState::Available,
            queue: "default".into(),
            worker: "echo".into(),
            args: serde_json::json!({}),
            meta: serde_json::json!({}),
            tags: vec![],
            errors: Vec::<JobError>::new(),
            attempt: 0,
            max_attempts: 20,
            priority: 0,
            inserted_at: Utc::now(),
            scheduled_at: Utc::now(),
            attempted_at: None,
            attempted_by: vec![],
            completed_at: None,
            cancelled_at: None,
            discarded_at: None,
        }
    }

    #[test]
    fn passes_on_a_well_formed_job() {
        audit_job(&base_job());
    }
}
