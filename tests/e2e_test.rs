//! End-to-end tests for complete delivery workflows.
//!
//! Runs a started engine with its worker pool, dispatcher and lock sweeper
//! against in-memory storage and wiremock consumers. The test clock jumps
//! over backoff delays whenever the dispatcher waits on a delayed job, so
//! retry schedules complete in real milliseconds.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use hookrelay_core::{
    models::{Channel, Consumer, DeliveryJob, JobStatus, Message},
    Clock, TestClock,
};
use hookrelay_delivery::{
    storage::memory::InMemoryStorage, DeliveryConfig, DeliveryEngine, PageRequest, RequeueTarget,
};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

struct TestBroker {
    engine: DeliveryEngine,
    storage: InMemoryStorage,
}

async fn start_broker(channel: &str, consumers: Vec<Consumer>) -> Result<TestBroker> {
    let storage = InMemoryStorage::new();
    storage.add_channel(Channel { id: channel.into(), name: channel.to_uppercase() }).await;
    for consumer in consumers {
        storage.add_consumer(consumer).await;
    }

    let config = DeliveryConfig {
        worker_count: 5,
        instance_id: "e2e".into(),
        message_base_url: "https://relay.example.com".into(),
        ..Default::default()
    };
    let mut engine = DeliveryEngine::new(
        Arc::new(storage.clone()),
        config,
        Arc::new(TestClock::new()) as Arc<dyn Clock>,
    )?;
    engine.start().await?;

    Ok(TestBroker { engine, storage })
}

fn message(channel: &str, id: &str) -> Message {
    Message {
        id: id.into(),
        channel_id: channel.into(),
        payload: format!(r#"{{"event":"{id}"}}"#),
        content_type: "application/json".into(),
        priority: 0,
        received_at: Utc::now(),
    }
}

/// Polls storage until every job satisfies `done`.
async fn wait_for_jobs<F>(storage: &InMemoryStorage, done: F) -> Result<Vec<DeliveryJob>>
where
    F: Fn(&[DeliveryJob]) -> bool,
{
    let settled = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let jobs = storage.all_jobs().await;
            if done(jobs.as_slice()) {
                return jobs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    match settled {
        Ok(jobs) => Ok(jobs),
        Err(_) => anyhow::bail!("jobs did not settle: {:?}", storage.all_jobs().await),
    }
}

/// Every consumer fails twice, then accepts. All jobs end up delivered on
/// their third attempt and nothing is dead-lettered.
#[tokio::test]
async fn flaky_consumers_are_delivered_on_third_attempt() -> Result<()> {
    let server = MockServer::start().await;
    let mut consumers = Vec::new();
    for n in 1..=5 {
        let route = format!("/hooks/c{n}");
        Mock::given(method("POST"))
            .and(path(route.as_str()))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(route.as_str()))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        consumers.push(Consumer::push(
            format!("c{n}"),
            "payments",
            format!("{}{route}", server.uri()),
        ));
    }
    let broker = start_broker("payments", consumers).await?;

    let jobs = broker.engine.broadcast(message("payments", "pay_1")).await?;
    assert_eq!(jobs.len(), 5);

    let jobs = wait_for_jobs(&broker.storage, |jobs| {
        jobs.len() == 5 && jobs.iter().all(|job| job.status == JobStatus::Delivered)
    })
    .await?;

    for job in &jobs {
        assert_eq!(job.attempt_count, 3, "job {} for {}", job.id, job.consumer_id);
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 15);

    let stats = broker.engine.stats().await;
    assert_eq!(stats.successful_deliveries, 5);
    assert_eq!(stats.failed_deliveries, 10);
    assert_eq!(stats.dead_lettered, 0);

    broker.engine.shutdown().await?;
    Ok(())
}

/// A consumer that never accepts is dead-lettered after five attempts. Once
/// it recovers, requeueing the dead job delivers a fresh copy.
#[tokio::test]
async fn dead_lettered_job_is_delivered_after_requeue() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let consumer = Consumer::push("crm", "signups", format!("{}/crm", server.uri()));
    let broker = start_broker("signups", vec![consumer]).await?;

    broker.engine.broadcast(message("signups", "user_42")).await?;
    let jobs = wait_for_jobs(&broker.storage, |jobs| {
        jobs.len() == 1 && jobs[0].status == JobStatus::DeadLettered
    })
    .await?;
    let dead = jobs[0].clone();
    assert_eq!(dead.attempt_count, 5);
    assert_eq!(server.received_requests().await.unwrap().len(), 5);

    let listing = broker
        .engine
        .dead_jobs(&"signups".into(), &"crm".into(), &PageRequest::first())
        .await?;
    assert_eq!(listing.items.len(), 1);
    assert_eq!(listing.items[0].job_id, dead.id);
    assert_eq!(
        listing.items[0].message_url,
        "https://relay.example.com/channel/signups/message/user_42"
    );

    // The consumer comes back.
    server.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let fresh = broker
        .engine
        .requeue(&"signups".into(), &"crm".into(), RequeueTarget::Job(dead.id))
        .await?;
    assert_eq!(fresh.len(), 1);
    let fresh_id = fresh[0].id;

    let jobs = wait_for_jobs(&broker.storage, |jobs| {
        jobs.iter().any(|job| job.id == fresh_id && job.status == JobStatus::Delivered)
    })
    .await?;

    let original = jobs.iter().find(|job| job.id == dead.id).unwrap();
    assert_eq!(original, &dead);
    let delivered = jobs.iter().find(|job| job.id == fresh_id).unwrap();
    assert_eq!(delivered.attempt_count, 1);
    assert_eq!(delivered.requeued_from, Some(dead.id));

    let listing = broker
        .engine
        .dead_jobs(&"signups".into(), &"crm".into(), &PageRequest::first())
        .await?;
    assert!(listing.items.is_empty());

    broker.engine.shutdown().await?;
    Ok(())
}

/// Messages for a pull consumer wait in storage. No worker ever calls out
/// for them, and the consumer drains them through the listing.
#[tokio::test]
async fn pull_consumer_collects_its_messages() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let broker = start_broker("audit", vec![Consumer::pull("auditor", "audit")]).await?;

    for n in 0..10 {
        broker.engine.broadcast(message("audit", &format!("entry_{n}"))).await?;
    }

    let listing = broker
        .engine
        .queued_jobs(&"audit".into(), &"auditor".into(), &PageRequest::with_limit(50))
        .await?;
    assert_eq!(listing.items.len(), 10);
    assert!(listing.next_cursor.is_none());

    // Give the workers a chance to misbehave.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.received_requests().await.unwrap().is_empty());
    assert!(broker
        .storage
        .all_jobs()
        .await
        .iter()
        .all(|job| job.status == JobStatus::Queued && job.attempt_count == 0));

    for view in &listing.items {
        broker.engine.consume(&"audit".into(), &"auditor".into(), view.job_id).await?;
    }

    let listing = broker
        .engine
        .queued_jobs(&"audit".into(), &"auditor".into(), &PageRequest::first())
        .await?;
    assert!(listing.items.is_empty());
    assert_eq!(broker.engine.stats().await.consumed, 10);

    broker.engine.shutdown().await?;
    Ok(())
}
