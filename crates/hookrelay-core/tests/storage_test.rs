//! Integration tests for the PostgreSQL repositories.
//!
//! These need a live database and are ignored by default. Run them with
//! `DATABASE_URL=postgres://... cargo test -p hookrelay-core -- --ignored`.

use std::time::Duration;

use chrono::Utc;
use hookrelay_core::{
    models::{Channel, Consumer, DeliveryJob, JobStatus, Lock, LockKey, Message},
    storage::Storage,
    CoreError,
};
use uuid::Uuid;

async fn storage() -> Storage {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = sqlx::PgPool::connect(&url).await.expect("database reachable");
    let storage = Storage::new(pool);
    storage.ensure_schema().await.expect("schema created");
    storage
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

async fn seed(storage: &Storage) -> (Message, Consumer) {
    let channel = Channel { id: unique("ch").into(), name: "test".to_string() };
    storage.catalog.upsert_channel(&channel).await.unwrap();

    let consumer = Consumer::push(unique("c"), channel.id.clone(), "http://localhost:9/hook");
    storage.catalog.upsert_consumer(&consumer).await.unwrap();

    let message = Message {
        id: unique("m").into(),
        channel_id: channel.id.clone(),
        payload: "{}".to_string(),
        content_type: "application/json".to_string(),
        priority: 1,
        received_at: Utc::now(),
    };
    storage.catalog.save_message(&message).await.unwrap();

    (message, consumer)
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn storage_health_check() {
    let storage = storage().await;
    assert!(storage.health_check().await.is_ok());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn lock_is_exclusive_until_expiry() {
    let storage = storage().await;
    let key = LockKey(unique("job"));
    let now = Utc::now();

    let first = Lock::new(key.clone(), "w1", now, Duration::from_secs(5));
    storage.locks.try_lock(&first).await.unwrap();

    let rival = Lock::new(key.clone(), "w2", now, Duration::from_secs(5));
    let err = storage.locks.try_lock(&rival).await.unwrap_err();
    assert!(matches!(err, CoreError::LockContention { .. }));

    let later_at = now + chrono::Duration::seconds(6);
    let later = Lock::new(key.clone(), "w2", later_at, Duration::from_secs(5));
    storage.locks.try_lock(&later).await.unwrap();

    let err = storage.locks.release(&key, "w1").await.unwrap_err();
    assert!(matches!(err, CoreError::LockNotHeld { .. }));
    storage.locks.release(&key, "w2").await.unwrap();
    assert!(storage.locks.find(&key).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn concurrent_try_lock_has_single_winner() {
    let storage = storage().await;
    let key = LockKey(unique("job"));
    let now = Utc::now();

    let attempts = (0..16).map(|i| {
        let storage = storage.clone();
        let lock = Lock::new(key.clone(), format!("w{i}"), now, Duration::from_secs(30));
        tokio::spawn(async move { storage.locks.try_lock(&lock).await.is_ok() })
    });

    let mut winners = 0;
    for handle in attempts {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn job_round_trip_and_dead_listing() {
    let storage = storage().await;
    let (message, consumer) = seed(&storage).await;
    let now = Utc::now();

    let mut job = DeliveryJob::new(&message, &consumer, now);
    storage.delivery_jobs.create(&job).await.unwrap();

    job.mark_dispatched("w1", now).unwrap();
    job.mark_dead_lettered(1, now).unwrap();
    storage.delivery_jobs.update(&job).await.unwrap();

    let found = storage.delivery_jobs.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(found.status, JobStatus::DeadLettered);
    assert_eq!(found.attempt_count, 1);

    let dead = storage.delivery_jobs.list_dead(&consumer.id, None, 10).await.unwrap();
    assert_eq!(dead.len(), 1);

    let fresh = job.requeued(Utc::now()).unwrap();
    storage.delivery_jobs.create(&fresh).await.unwrap();

    assert!(storage.delivery_jobs.list_dead(&consumer.id, None, 10).await.unwrap().is_empty());
    let successor = storage.delivery_jobs.find_successor(job.id).await.unwrap().unwrap();
    assert_eq!(successor.id, fresh.id);
}
