//! Integration tests for core domain models.
//!
//! Tests the delivery job state machine, consumer kinds, lock records and
//! their serialized forms.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use hookrelay_core::{
    models::{Consumer, ConsumerKind, DeliveryJob, JobStatus, Lock, LockKey, Message},
    Clock, CoreError, TestClock,
};
use serde_json::json;

fn broadcast(priority: u32) -> Message {
    Message {
        id: "msg-42".into(),
        channel_id: "billing".into(),
        payload: r#"{"invoice":42}"#.to_string(),
        content_type: "application/json".to_string(),
        priority,
        received_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

fn push_consumer() -> Consumer {
    Consumer::push("ledger", "billing", "http://ledger.internal/hooks")
}

/// A job that succeeds on its first attempt walks Queued -> Dispatched ->
/// Delivered and carries exactly one attempt.
#[test]
fn job_delivered_on_first_attempt() {
    let clock = TestClock::new();
    let mut job = DeliveryJob::new(&broadcast(0), &push_consumer(), clock.now_utc());

    job.mark_dispatched("worker-1", clock.now_utc()).unwrap();
    assert_eq!(job.status, JobStatus::Dispatched);
    assert_eq!(job.lock_token.as_deref(), Some("worker-1"));

    clock.advance(Duration::from_millis(120));
    job.mark_delivered(clock.now_utc()).unwrap();

    assert_eq!(job.status, JobStatus::Delivered);
    assert_eq!(job.attempt_count, 1);
    assert!(job.lock_token.is_none());
}

/// Retrying returns the job to Queued, hidden until the scheduled instant.
#[test]
fn retry_hides_job_until_next_attempt() {
    let clock = TestClock::new();
    let mut job = DeliveryJob::new(&broadcast(0), &push_consumer(), clock.now_utc());

    job.mark_dispatched("worker-1", clock.now_utc()).unwrap();
    let retry_at = clock.now_utc() + chrono::Duration::seconds(2);
    job.schedule_retry(retry_at, clock.now_utc()).unwrap();

    assert_eq!(job.status, JobStatus::Queued);
    assert!(!job.is_due(clock.now_utc()));

    clock.advance(Duration::from_secs(2));
    assert!(job.is_due(clock.now_utc()));
}

/// Dead-lettering is refused while attempts remain.
#[test]
fn dead_letter_requires_exhausted_attempts() {
    let clock = TestClock::new();
    let mut job = DeliveryJob::new(&broadcast(0), &push_consumer(), clock.now_utc());
    job.mark_dispatched("worker-1", clock.now_utc()).unwrap();

    let err = job.mark_dead_lettered(5, clock.now_utc()).unwrap_err();
    assert!(matches!(err, CoreError::InvalidState(_)));

    for _ in 1..5 {
        job.schedule_retry(clock.now_utc(), clock.now_utc()).unwrap();
        job.mark_dispatched("worker-1", clock.now_utc()).unwrap();
    }
    job.mark_dead_lettered(5, clock.now_utc()).unwrap();

    assert_eq!(job.status, JobStatus::DeadLettered);
    assert_eq!(job.attempt_count, 5);
}

/// Requeue builds a new attempt chain and leaves the dead record alone.
#[test]
fn requeue_creates_fresh_job_and_keeps_dead_record() {
    let clock = TestClock::new();
    let mut dead = DeliveryJob::new(&broadcast(3), &push_consumer(), clock.now_utc());
    dead.mark_dispatched("worker-1", clock.now_utc()).unwrap();
    dead.mark_dead_lettered(1, clock.now_utc()).unwrap();
    let snapshot = dead.clone();

    clock.advance(Duration::from_secs(60));
    let fresh = dead.requeued(clock.now_utc()).unwrap();

    assert_eq!(dead, snapshot);
    assert_ne!(fresh.id, dead.id);
    assert_eq!(fresh.requeued_from, Some(dead.id));
    assert_eq!(fresh.status, JobStatus::Queued);
    assert_eq!(fresh.attempt_count, 0);
    assert_eq!(fresh.message_id, dead.message_id);
    assert_eq!(fresh.consumer_id, dead.consumer_id);
    assert_eq!(fresh.priority, 3);
}

/// Only dead jobs can be requeued.
#[test]
fn requeue_of_live_job_is_invalid_state() {
    let job = DeliveryJob::new(&broadcast(0), &push_consumer(), Utc::now());

    let err = job.requeued(Utc::now()).unwrap_err();
    assert!(matches!(err, CoreError::InvalidState(_)));
}

/// Pull consumers claim queued jobs directly.
#[test]
fn pull_claim_marks_job_delivered() {
    let consumer = Consumer::pull("audit", "billing");
    let mut job = DeliveryJob::new(&broadcast(0), &consumer, Utc::now());

    job.mark_consumed(Utc::now()).unwrap();

    assert_eq!(job.status, JobStatus::Delivered);
    assert_eq!(job.attempt_count, 1);
    assert!(job.mark_consumed(Utc::now()).is_err());
}

/// A crashed holder leaves the job Dispatched; the next lock owner may
/// dispatch it again and the abandoned attempt still counts.
#[test]
fn abandoned_dispatch_can_be_resumed() {
    let mut job = DeliveryJob::new(&broadcast(0), &push_consumer(), Utc::now());
    job.mark_dispatched("crashed-worker", Utc::now()).unwrap();

    job.mark_dispatched("worker-2", Utc::now()).unwrap();

    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.lock_token.as_deref(), Some("worker-2"));
}

/// Consumer kinds serialize with a type tag the API layer can read.
#[test]
fn consumer_kind_serialization() {
    let push = serde_json::to_value(push_consumer()).unwrap();
    assert_eq!(
        push["kind"],
        json!({"type": "push", "callback_url": "http://ledger.internal/hooks"})
    );

    let pull = serde_json::to_value(Consumer::pull("audit", "billing")).unwrap();
    assert_eq!(pull["kind"], json!({"type": "pull"}));

    assert_eq!(ConsumerKind::Pull.callback_url(), None);
    assert!(push_consumer().is_push());
}

/// Lock records honour the TTL they were created with.
#[test]
fn lock_validity_window() {
    let clock = TestClock::with_start_time(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
    let lock = Lock::new(
        LockKey::consumer(&"ledger".into()),
        "dlq-1",
        clock.now_utc(),
        Duration::from_secs(30),
    );

    clock.advance(Duration::from_secs(29));
    assert!(!lock.is_expired(clock.now_utc()));

    clock.advance(Duration::from_secs(1));
    assert!(lock.is_expired(clock.now_utc()));
}

/// Job status uses snake_case on the wire.
#[test]
fn job_status_serialization() {
    assert_eq!(serde_json::to_value(JobStatus::DeadLettered).unwrap(), json!("dead_lettered"));
    let parsed: JobStatus = serde_json::from_value(json!("queued")).unwrap();
    assert_eq!(parsed, JobStatus::Queued);
}
