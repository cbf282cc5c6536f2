//! Guards against regressions in error-handling corners that don't fit
//! neatly under any one module's own test block: things that look like
//! they'd work but quietly violate an invariant.

use crate::backoff::{with_retry, RetryPolicy};
use crate::error::{Categorizable, SafeErrorCategory};
use crate::job::JobChangeset;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
struct AlwaysFatal;

impl Categorizable for AlwaysFatal {
    fn category(&self) -> SafeErrorCategory {
        SafeErrorCategory::Fatal
    }
}

#[tokio::test]
async fn with_retry_never_sleeps_on_a_fatal_error() {
    // A naive retry helper might still sleep once before giving up.
    // Fatal errors must return on the very first attempt with no delay.
    let attempts = AtomicUsize::new(0);
    let policy = RetryPolicy {
        max_tries: 5,
        ..Default::default()
    };

    let started = tokio::time::Instant::now();
    let result: Result<(), AlwaysFatal> = with_retry(&policy, || {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(AlwaysFatal) }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < std::time::Duration::from_millis(50));
}

#[test]
fn priority_out_of_range_is_clamped_not_rejected() {
    // An out-of-range `with_priority` call is treated as a programmer
    // error to clamp defensively, not a validation failure — a
    // changeset built with `with_priority(99)` must still validate.
    let cs = JobChangeset::new("default", "noop", serde_json::json!({})).with_priority(99);
    assert_eq!(cs.priority, crate::job::MAX_PRIORITY);
    assert!(cs.validate().is_ok());
}

#[test]
fn empty_worker_name_fails_validation_rather_than_panicking() {
    let cs = JobChangeset::new("default", "", serde_json::json!({}));
    assert!(cs.validate().is_err());
}

#[test]
fn non_object_args_are_rejected() {
    let cs = JobChangeset::new("default", "noop", serde_json::json!([1, 2, 3]));
    assert!(cs.validate().is_err());
}

#[test]
fn null_args_are_accepted() {
    // Some callers pass `null` rather than `{}` for argument-less jobs;
    // the validator treats that as equivalent to an empty object.
    let cs = JobChangeset::new("default", "noop", serde_json::Value::Null);
    assert!(cs.validate().is_ok());
}
