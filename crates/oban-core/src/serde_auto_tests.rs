//! Serde round-trip tests for the wire-facing types: a job row, its
//! changeset, and the notifier payloads that cross the DB's LISTEN/NOTIFY
//! boundary in the Postgres adapter all need to survive a JSON round trip
//! with no manual `Serialize`/`Deserialize` impls — derive only.

use crate::job::{Job, JobChangeset, JobError, JobState};
use crate::notifier::{Notification, Signal};
use chrono::Utc;
use uuid::Uuid;

fn sample_job() -> Job {
    Job {
        id: 42,
        state: JobState::Retryable,
        queue: "mailers".to_string(),
        worker: "send_welcome_email".to_string(),
        args: serde_json::json!({"user_id": Uuid::new_v4().to_string()}),
        meta: serde_json::json!({"trace_id": "abc123"}),
        tags: vec!["onboarding".to_string()],
        errors: vec![JobError {
            at: Utc::now(),
            attempt: 1,
            error: "smtp timeout".to_string(),
        }],
        attempt: 2,
        max_attempts: 5,
        priority: 3,
        inserted_at: Utc::now(),
        scheduled_at: Utc::now(),
        attempted_at: Some(Utc::now()),
        attempted_by: vec!["node-a".to_string()],
        completed_at: None,
        cancelled_at: None,
        discarded_at: None,
    }
}

#[test]
fn job_round_trips_through_json() {
    let original = sample_job();
    let json = serde_json::to_value(&original).unwrap();
    let restored: Job = serde_json::from_value(json).unwrap();

    assert_eq!(restored.id, original.id);
    assert_eq!(restored.state, original.state);
    assert_eq!(restored.queue, original.queue);
    assert_eq!(restored.errors.len(), 1);
    assert_eq!(restored.errors[0].error, "smtp timeout");
}

#[test]
fn job_state_serializes_as_snake_case() {
    let json = serde_json::to_string(&JobState::Discarded).unwrap();
    assert_eq!(json, "\"discarded\"");
}

#[test]
fn changeset_omits_optional_fields_with_sane_defaults() {
    // A caller that only sends `{queue, worker, args}` should still
    // deserialize into a valid changeset via `#[serde(default)]`.
    let minimal = serde_json::json!({
        "queue": "default",
        "worker": "noop",
        "args": {}
    });
    let cs: JobChangeset = serde_json::from_value(minimal).unwrap();
    assert_eq!(cs.max_attempts, crate::job::DEFAULT_MAX_ATTEMPTS);
    assert_eq!(cs.priority, 0);
    assert!(cs.tags.is_empty());
}

#[test]
fn changeset_round_trips_through_json() {
    let original = JobChangeset::new("default", "noop", serde_json::json!({"a": 1}))
        .with_priority(2)
        .with_tags(vec!["urgent".to_string()]);

    let json = serde_json::to_value(&original).unwrap();
    let restored: JobChangeset = serde_json::from_value(json).unwrap();

    assert_eq!(restored.queue, original.queue);
    assert_eq!(restored.priority, 2);
    assert_eq!(restored.tags, vec!["urgent".to_string()]);
}

#[test]
fn notification_insert_round_trips() {
    let original = Notification::Insert {
        queue: "default".to_string(),
    };
    let json = serde_json::to_value(&original).unwrap();
    let restored: Notification = serde_json::from_value(json).unwrap();
    assert!(matches!(restored, Notification::Insert { queue } if queue == "default"));
}

#[test]
fn notification_signal_round_trips_with_tagged_action() {
    let original = Notification::Signal(Signal::Scale {
        queue: "mailers".to_string(),
        limit: 20,
    });
    let json = serde_json::to_value(&original).unwrap();
    // The `action` tag is what lets a Postgres LISTEN payload be
    // pattern-matched without a separate channel per signal kind.
    assert_eq!(json["signal"]["action"], "scale");

    let restored: Notification = serde_json::from_value(json).unwrap();
    match restored {
        Notification::Signal(Signal::Scale { queue, limit }) => {
            assert_eq!(queue, "mailers");
            assert_eq!(limit, 20);
        }
        other => panic!("unexpected variant: {other:?}"),
    }
}

#[test]
fn notification_gossip_carries_arbitrary_payload() {
    let original = Notification::Gossip {
        queue: "default".to_string(),
        payload: serde_json::json!({"queue_size": 12}),
    };
    let json = serde_json::to_value(&original).unwrap();
    let restored: Notification = serde_json::from_value(json).unwrap();
    match restored {
        Notification::Gossip { payload, .. } => assert_eq!(payload["queue_size"], 12),
        other => panic!("unexpected variant: {other:?}"),
    }
}
