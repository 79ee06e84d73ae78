//! Integration tests for workers and the per-job executor.
//!
//! Covers the running worker pool end to end, plus the executor paths that
//! only show up under contention or storage failure.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use hookrelay_core::{
    models::{Channel, Consumer, JobStatus, Lock, LockKey, Message},
    Clock, TestClock,
};
use hookrelay_delivery::{
    storage::{memory::InMemoryStorage, DeliveryStorage},
    DeliveryConfig, DeliveryEngine, DeliveryError, ExecutionOutcome,
};
use tokio::time::timeout;
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

async fn setup(worker_count: usize) -> Result<(DeliveryEngine, InMemoryStorage, TestClock)> {
    let storage = InMemoryStorage::new();
    storage.add_channel(Channel { id: "events".into(), name: "Events".into() }).await;
    let clock = TestClock::new();
    let engine = DeliveryEngine::new(
        Arc::new(storage.clone()),
        DeliveryConfig { worker_count, instance_id: "worker-test".into(), ..Default::default() },
        Arc::new(clock.clone()) as Arc<dyn Clock>,
    )?;
    Ok((engine, storage, clock))
}

fn message(id: &str) -> Message {
    Message {
        id: id.into(),
        channel_id: "events".into(),
        payload: "ping".into(),
        content_type: "text/plain".into(),
        priority: 0,
        received_at: Utc::now(),
    }
}

async fn ok_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(204)).mount(&server).await;
    server
}

#[tokio::test]
async fn worker_pool_delivers_every_job_once() -> Result<()> {
    let (mut engine, storage, _clock) = setup(4).await?;
    let server = ok_server().await;
    for n in 0..20 {
        let url = format!("{}/{n}", server.uri());
        storage.add_consumer(Consumer::push(format!("c{n:02}"), "events", url)).await;
    }

    engine.start().await?;
    engine.broadcast(message("m1")).await?;

    timeout(Duration::from_secs(10), async {
        loop {
            let jobs = storage.all_jobs().await;
            if jobs.iter().all(|job| job.status == JobStatus::Delivered) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    engine.shutdown().await?;

    for job in storage.all_jobs().await {
        assert_eq!(job.attempt_count, 1, "job {} attempted more than once", job.id);
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 20);
    assert_eq!(storage.lock_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn locked_job_waits_for_the_lock_to_expire() -> Result<()> {
    let (engine, storage, clock) = setup(1).await?;
    let server = ok_server().await;
    let consumer = Consumer::push("c1", "events", server.uri());
    storage.add_consumer(consumer.clone()).await;

    let jobs = engine.submit(message("m1"), &[consumer]).await?;
    storage
        .try_lock(Lock::new(
            LockKey::job(jobs[0].id),
            "other-process/worker-3",
            clock.now_utc(),
            Duration::from_secs(60),
        ))
        .await?;

    assert_eq!(engine.process_next().await?, Some(ExecutionOutcome::Deferred));

    let job = engine.find_job(jobs[0].id).await?;
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt_count, 0);
    assert_eq!(engine.stats().await.lock_contentions, 1);
    assert!(server.received_requests().await.unwrap().is_empty());

    // Still held by the other process until the TTL runs out.
    assert_eq!(engine.queue_len().await, 1);
    assert_eq!(engine.process_next().await?, None);

    clock.advance(Duration::from_secs(60));
    assert_eq!(engine.process_next().await?, Some(ExecutionOutcome::Delivered));
    assert_eq!(engine.find_job(jobs[0].id).await?.attempt_count, 1);
    Ok(())
}

#[tokio::test]
async fn job_held_by_crashed_process_is_delivered_after_sweep() -> Result<()> {
    let (mut engine, storage, clock) = setup(2).await?;
    let server = ok_server().await;
    let consumer = Consumer::push("c1", "events", server.uri());
    storage.add_consumer(consumer.clone()).await;

    let jobs = engine.submit(message("m1"), &[consumer]).await?;
    storage
        .try_lock(Lock::new(
            LockKey::job(jobs[0].id),
            "crashed-process/worker-0",
            clock.now_utc(),
            Duration::from_secs(60),
        ))
        .await?;
    assert_eq!(engine.process_next().await?, Some(ExecutionOutcome::Deferred));

    // The holder never comes back; the sweep removes its lock.
    clock.advance(Duration::from_secs(120));
    let cutoff = clock.now_utc() - chrono::Duration::seconds(60);
    assert_eq!(storage.timeout_locks(cutoff).await?, 1);

    engine.start().await?;
    timeout(Duration::from_secs(10), async {
        while storage.all_jobs().await[0].status != JobStatus::Delivered {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    engine.shutdown().await?;

    let job = engine.find_job(jobs[0].id).await?;
    assert_eq!(job.attempt_count, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn finished_job_is_not_delivered_again() -> Result<()> {
    let (engine, storage, clock) = setup(1).await?;
    let server = ok_server().await;
    let consumer = Consumer::push("c1", "events", server.uri());
    storage.add_consumer(consumer.clone()).await;

    let jobs = engine.submit(message("m1"), &[consumer]).await?;

    // Another process delivered it between enqueue and dispatch.
    let mut delivered = jobs[0].clone();
    delivered.mark_dispatched("other-process/worker-0", clock.now_utc())?;
    delivered.mark_delivered(clock.now_utc())?;
    storage.update_job(delivered).await?;

    assert_eq!(engine.process_next().await?, Some(ExecutionOutcome::Skipped));
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(storage.lock_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn storage_failure_keeps_lock_until_expiry() -> Result<()> {
    let (engine, storage, clock) = setup(1).await?;
    let server = ok_server().await;
    let consumer = Consumer::push("c1", "events", server.uri());
    storage.add_consumer(consumer.clone()).await;
    let jobs = engine.submit(message("m1"), &[consumer]).await?;

    storage.fail_next_updates(1);
    let err = engine.process_next().await.unwrap_err();
    assert!(matches!(err, DeliveryError::StorageError { .. }));

    let key = LockKey::job(jobs[0].id);
    assert!(storage.lock(&key).await.is_some(), "lock must outlive the failed attempt");
    assert_eq!(engine.queue_len().await, 1);
    assert_eq!(engine.process_next().await?, None);

    clock.advance(Duration::from_secs(60));
    assert_eq!(engine.process_next().await?, Some(ExecutionOutcome::Delivered));
    assert_eq!(engine.find_job(jobs[0].id).await?.attempt_count, 1);
    Ok(())
}

#[tokio::test]
async fn lock_storage_outage_defers_job() -> Result<()> {
    let (engine, storage, clock) = setup(1).await?;
    let server = ok_server().await;
    let consumer = Consumer::push("c1", "events", server.uri());
    storage.add_consumer(consumer.clone()).await;
    let jobs = engine.submit(message("m1"), &[consumer]).await?;

    storage.fail_next_lock_ops(1);
    assert!(engine.process_next().await.is_err());
    assert_eq!(engine.process_next().await?, None);

    clock.advance(Duration::from_secs(1));
    assert_eq!(engine.process_next().await?, Some(ExecutionOutcome::Delivered));
    assert_eq!(engine.find_job(jobs[0].id).await?.status, JobStatus::Delivered);
    Ok(())
}

#[tokio::test]
async fn idle_workers_stop_promptly() -> Result<()> {
    let (mut engine, _storage, _clock) = setup(16).await?;
    engine.start().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = std::time::Instant::now();
    engine.shutdown().await?;
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}
