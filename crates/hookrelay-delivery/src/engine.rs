//! Delivery engine facade.
//!
//! The engine owns every moving part of dispatch and is the only type the
//! API layer and the binary talk to.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   ┌───────────┐   ┌────────────┐   ┌─────────────┐
//! │ DeliveryEngine │──▶│ JobQueue  │──▶│ Dispatcher │──▶│ Worker Pool │
//! └────────────────┘   └───────────┘   └────────────┘   └─────────────┘
//!        │                   ▲                                 │
//!        ▼                   │                                 ▼
//! ┌───────────────┐   ┌────────────────┐               ┌──────────────┐
//! │ Storage       │◀──│ Retry / DLQ    │◀──────────────│ Executor     │
//! │ (jobs, locks) │   │                │               │ + HTTP client│
//! └───────────────┘   └────────────────┘               └──────────────┘
//! ```
//!
//! Published messages become one job per consumer. Push jobs go through the
//! queue to the worker pool; pull jobs stay queued in storage until the
//! consumer claims them with `consume`.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hookrelay_core::{
    models::{
        ChannelId, Consumer, ConsumerId, DeliveryJob, JobCursor, JobId, JobStatus, LockKey,
        Message, MessageId,
    },
    Clock,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    client::{ClientConfig, DeliveryClient},
    dlq::{DlqManager, RequeueTarget},
    error::{DeliveryError, Result},
    lock::LockCoordinator,
    pagination::{Page, PageRequest},
    queue::{JobQueue, QueueOrdering},
    retry::{RetryPolicy, RetryScheduler},
    storage::DeliveryStorage,
    worker::{DeliveryExecutor, ExecutionOutcome},
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum number of newly submitted jobs held in the queue.
    pub queue_capacity: usize,

    /// Order in which ready jobs leave the queue.
    pub queue_ordering: QueueOrdering,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Retry policy applied to failed push attempts.
    pub retry_policy: RetryPolicy,

    /// How long a job lock stays valid after acquisition.
    pub lock_ttl: Duration,

    /// How often the lock sweeper runs.
    pub lock_sweep_interval: Duration,

    /// Locks older than this are removed by the sweeper.
    pub lock_sweep_threshold: Duration,

    /// Maximum time to wait for workers to complete on shutdown.
    pub shutdown_timeout: Duration,

    /// Jobs loaded per storage round trip during startup recovery.
    pub recovery_batch_size: usize,

    /// Public base URL used to build message links in DLQ listings.
    pub message_base_url: String,

    /// Identifies this process in lock holder tokens.
    pub instance_id: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            queue_ordering: QueueOrdering::default(),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            lock_ttl: Duration::from_secs(60),
            lock_sweep_interval: Duration::from_secs(30),
            lock_sweep_threshold: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            recovery_batch_size: crate::DEFAULT_RECOVERY_BATCH_SIZE,
            message_base_url: "http://localhost:8080".to_string(),
            instance_id: format!("hookrelay-{}", Uuid::new_v4().simple()),
        }
    }
}

impl DeliveryConfig {
    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be greater than 0"));
        }
        if self.queue_capacity == 0 {
            return Err(DeliveryError::configuration("queue_capacity must be greater than 0"));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.retry_policy.jitter_factor) {
            return Err(DeliveryError::configuration("jitter_factor must be within [0, 1]"));
        }
        if self.lock_ttl <= self.client_config.timeout {
            return Err(DeliveryError::configuration(
                "lock_ttl must be longer than the delivery timeout",
            ));
        }
        if self.recovery_batch_size == 0 {
            return Err(DeliveryError::configuration(
                "recovery_batch_size must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Push attempts completed since startup, successful or not.
    pub jobs_processed: u64,
    /// Successful push deliveries.
    pub successful_deliveries: u64,
    /// Failed push attempts that were scheduled for retry.
    pub failed_deliveries: u64,
    /// Jobs moved to the dead-letter queue.
    pub dead_lettered: u64,
    /// Fresh jobs created from dead ones.
    pub requeued: u64,
    /// Pull jobs claimed by their consumer.
    pub consumed: u64,
    /// Attempts skipped because the job lock was held elsewhere.
    pub lock_contentions: u64,
    /// Push requests currently on the wire.
    pub in_flight_deliveries: u64,
}

/// A queued job as shown to a pull consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJobView {
    /// Job to pass back to `consume`.
    pub job_id: JobId,
    /// Message carried by the job.
    pub message_id: MessageId,
    /// Raw message payload.
    pub payload: String,
    /// Payload MIME type.
    pub content_type: String,
    /// Message priority.
    pub priority: u32,
}

/// A dead job as shown to an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadJobView {
    /// Dead job; pass it to `requeue` to retry it.
    pub job_id: JobId,
    /// Callback URL of the consumer, `None` for pull consumers.
    pub listener_endpoint: Option<String>,
    /// Consumer name.
    pub listener_name: String,
    /// Always `DeadLettered`.
    pub status: JobStatus,
    /// When the job was dead-lettered.
    pub status_changed_at: DateTime<Utc>,
    /// Link to the undelivered message.
    pub message_url: String,
}

/// Main delivery engine coordinating queue, workers, retries and the DLQ.
pub struct DeliveryEngine {
    storage: Arc<dyn DeliveryStorage>,
    config: DeliveryConfig,
    locks: LockCoordinator,
    queue: Arc<JobQueue>,
    dlq: Arc<DlqManager>,
    executor: Arc<DeliveryExecutor>,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates a new delivery engine over `storage`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for an invalid configuration or an HTTP
    /// client that cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let cancellation_token = CancellationToken::new();

        let locks = LockCoordinator::new(storage.clone(), clock.clone(), config.lock_ttl);
        let queue =
            Arc::new(JobQueue::new(config.queue_capacity, config.queue_ordering, clock.clone()));
        let dlq = Arc::new(DlqManager::new(
            storage.clone(),
            locks.clone(),
            queue.clone(),
            stats.clone(),
            clock.clone(),
            config.instance_id.clone(),
            cancellation_token.clone(),
        ));
        let retry = Arc::new(RetryScheduler::new(
            storage.clone(),
            locks.clone(),
            queue.clone(),
            dlq.clone(),
            config.retry_policy.clone(),
            stats.clone(),
            clock.clone(),
        ));
        let executor = Arc::new(DeliveryExecutor::new(
            storage.clone(),
            locks.clone(),
            queue.clone(),
            client,
            retry,
            stats.clone(),
            clock.clone(),
        ));

        Ok(Self {
            storage,
            config,
            locks,
            queue,
            dlq,
            executor,
            stats,
            clock,
            cancellation_token,
            worker_pool: None,
        })
    }

    /// Starts the worker pool, the dispatcher and the lock sweeper.
    ///
    /// Returns immediately after spawning. Use `shutdown()` to stop
    /// gracefully.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the engine already runs or was shut down.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::invalid_state("delivery engine already started"));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(DeliveryError::invalid_state("delivery engine was shut down"));
        }

        info!(
            worker_count = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            ordering = ?self.config.queue_ordering,
            instance_id = %self.config.instance_id,
            "starting delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.config.clone(),
            self.queue.clone(),
            self.executor.clone(),
            self.locks.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
        );
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started successfully");
        Ok(())
    }

    /// Loads every undelivered push job from storage into the queue.
    ///
    /// Jobs still marked `Dispatched` were abandoned by a stopped process.
    /// They become visible once their lock could have expired, so the
    /// next attempt does not trip over the stale lock.
    ///
    /// Call after `start()` when the backlog may exceed the queue capacity,
    /// since enqueueing waits for the workers to make room.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or `ShuttingDown` if the engine stops
    /// during recovery.
    pub async fn recover(&self) -> Result<usize> {
        let lock_ttl = chrono::Duration::from_std(self.config.lock_ttl)
            .map_err(|e| DeliveryError::configuration(format!("lock_ttl out of range: {e}")))?;

        let mut after: Option<JobCursor> = None;
        let mut recovered = 0;
        loop {
            let batch =
                self.storage.list_dispatchable(after, self.config.recovery_batch_size).await?;
            let done = batch.len() < self.config.recovery_batch_size;
            after = batch.last().map(DeliveryJob::created_cursor);

            for job in batch {
                let now = self.clock.now_utc();
                let visible_at = if job.status == JobStatus::Dispatched {
                    job.next_attempt_at.max(job.status_changed_at + lock_ttl)
                } else {
                    job.next_attempt_at
                };

                if visible_at <= now {
                    self.queue.enqueue(job, &self.cancellation_token).await?;
                } else {
                    self.queue.enqueue_delayed(job, visible_at).await;
                }
                recovered += 1;
            }

            if done {
                break;
            }
        }

        info!(recovered, "recovered pending jobs from storage");
        Ok(recovered)
    }

    /// Gracefully shuts down the delivery engine, allowing in-flight
    /// deliveries to complete within the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not finish in time.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await
        } else {
            self.cancellation_token.cancel();
            info!("delivery engine was not started, shutdown completed immediately");
            Ok(())
        }
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// The engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Number of jobs waiting in the in-process queue, delayed ones included.
    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    /// Creates one job per consumer for a freshly published `message`.
    ///
    /// The message and all jobs are persisted before any push job is
    /// queued. Pull jobs are only persisted; they wait for `consume`.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if a consumer subscribes to another channel.
    /// - A storage error if the message or jobs cannot be persisted.
    pub async fn submit(
        &self,
        message: Message,
        consumers: &[Consumer],
    ) -> Result<Vec<DeliveryJob>> {
        if let Some(stranger) = consumers.iter().find(|c| c.channel_id != message.channel_id) {
            return Err(DeliveryError::invalid_input(format!(
                "consumer {} subscribes to channel {}, not {}",
                stranger.id, stranger.channel_id, message.channel_id
            )));
        }

        self.storage.save_message(message.clone()).await?;

        let now = self.clock.now_utc();
        let jobs: Vec<DeliveryJob> =
            consumers.iter().map(|consumer| DeliveryJob::new(&message, consumer, now)).collect();
        self.storage.create_jobs(jobs.clone()).await?;

        let mut pushed = 0;
        for (job, consumer) in jobs.iter().zip(consumers) {
            if !consumer.is_push() {
                continue;
            }
            if let Err(error) = self.queue.enqueue(job.clone(), &self.cancellation_token).await {
                // Persisted as queued; startup recovery dispatches it.
                warn!(job_id = %job.id, error = %error, "submitted job not enqueued");
                continue;
            }
            pushed += 1;
        }

        info!(
            message_id = %message.id,
            channel_id = %message.channel_id,
            jobs = jobs.len(),
            pushed,
            "message submitted for delivery"
        );
        Ok(jobs)
    }

    /// Submits `message` to every consumer of its channel.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown channel, otherwise as `submit`.
    pub async fn broadcast(&self, message: Message) -> Result<Vec<DeliveryJob>> {
        let channel_id = message.channel_id.clone();
        self.storage
            .find_channel(channel_id.clone())
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("channel {channel_id}")))?;

        let consumers = self.storage.list_consumers(channel_id).await?;
        if consumers.is_empty() {
            debug!(message_id = %message.id, "channel has no consumers");
        }
        self.submit(message, &consumers).await
    }

    /// Lists a pull consumer's queued jobs, oldest first.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the consumer does not exist on `channel_id`.
    /// - `InvalidInput` for a push consumer or a malformed cursor.
    pub async fn queued_jobs(
        &self,
        channel_id: &ChannelId,
        consumer_id: &ConsumerId,
        page: &PageRequest,
    ) -> Result<Page<QueuedJobView>> {
        let consumer = self.pull_consumer(channel_id, consumer_id).await?;

        let after = page.decode_cursor()?;
        let limit = page.limit();
        let rows =
            self.storage.list_jobs(consumer.id.clone(), JobStatus::Queued, after, limit + 1).await?;
        let jobs = Page::from_overfetch(rows, limit, DeliveryJob::created_cursor);

        let mut items = Vec::with_capacity(jobs.items.len());
        for job in jobs.items {
            let Some(message) = self.storage.find_message(job.message_id.clone()).await? else {
                error!(job_id = %job.id, message_id = %job.message_id, "message not found");
                continue;
            };
            items.push(QueuedJobView {
                job_id: job.id,
                message_id: message.id,
                payload: message.payload,
                content_type: message.content_type,
                priority: job.priority,
            });
        }

        Ok(Page { items, next_cursor: jobs.next_cursor })
    }

    /// Marks a pull consumer's queued job as delivered.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the consumer or job does not exist, or the job
    ///   belongs to another consumer.
    /// - `InvalidInput` for a push consumer.
    /// - `InvalidState` if the job is no longer queued.
    /// - `LockContention` while another caller holds the job.
    pub async fn consume(
        &self,
        channel_id: &ChannelId,
        consumer_id: &ConsumerId,
        job_id: JobId,
    ) -> Result<DeliveryJob> {
        let consumer = self.pull_consumer(channel_id, consumer_id).await?;

        let key = LockKey::job(job_id);
        let holder = format!("{}/consume-{}", self.config.instance_id, Uuid::new_v4());
        self.locks.try_lock(key.clone(), &holder).await?;

        let result = self.consume_locked(&consumer.id, job_id).await;
        self.locks.release_quietly(&key, &holder).await;

        let job = result?;
        self.stats.write().await.consumed += 1;
        info!(job_id = %job.id, consumer_id = %job.consumer_id, "pull job consumed");
        Ok(job)
    }

    async fn consume_locked(&self, consumer_id: &ConsumerId, job_id: JobId) -> Result<DeliveryJob> {
        let mut job = self.storage.find_job(job_id).await?;
        if &job.consumer_id != consumer_id {
            return Err(DeliveryError::not_found(format!(
                "delivery job {job_id} for consumer {consumer_id}"
            )));
        }
        job.mark_consumed(self.clock.now_utc())?;
        self.storage.update_job(job.clone()).await?;
        Ok(job)
    }

    /// Lists a consumer's outstanding dead jobs, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the consumer does not exist on `channel_id`,
    /// or `InvalidInput` for a malformed cursor.
    pub async fn dead_jobs(
        &self,
        channel_id: &ChannelId,
        consumer_id: &ConsumerId,
        page: &PageRequest,
    ) -> Result<Page<DeadJobView>> {
        let consumer = self.consumer_on(channel_id, consumer_id).await?;
        let dead = self.dlq.list_dead(&consumer.id, page).await?;

        let base = self.config.message_base_url.trim_end_matches('/');
        Ok(dead.map(|job| DeadJobView {
            job_id: job.id,
            listener_endpoint: consumer.kind.callback_url().map(str::to_string),
            listener_name: consumer.name.clone(),
            status: job.status,
            status_changed_at: job.status_changed_at,
            message_url: format!("{base}/channel/{}/message/{}", job.channel_id, job.message_id),
        }))
    }

    /// Requeues dead jobs of a consumer.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the consumer does not exist on `channel_id`,
    /// otherwise as `DlqManager::requeue`.
    pub async fn requeue(
        &self,
        channel_id: &ChannelId,
        consumer_id: &ConsumerId,
        target: RequeueTarget,
    ) -> Result<Vec<DeliveryJob>> {
        let consumer = self.consumer_on(channel_id, consumer_id).await?;
        self.dlq.requeue(&consumer.id, target).await
    }

    /// Loads a job by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the job does not exist.
    pub async fn find_job(&self, job_id: JobId) -> Result<DeliveryJob> {
        Ok(self.storage.find_job(job_id).await?)
    }

    /// Runs the next visible queued job on the calling task.
    ///
    /// Returns `None` when nothing is visible. Meant for embedding the
    /// engine without a worker pool.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails during the attempt.
    pub async fn process_next(&self) -> Result<Option<ExecutionOutcome>> {
        let Some(job) = self.queue.try_dequeue().await else {
            return Ok(None);
        };
        let holder = format!("{}/inline", self.config.instance_id);
        self.executor.execute(job, &holder).await.map(Some)
    }

    async fn consumer_on(
        &self,
        channel_id: &ChannelId,
        consumer_id: &ConsumerId,
    ) -> Result<Consumer> {
        self.storage
            .find_consumer(consumer_id.clone())
            .await?
            .filter(|consumer| &consumer.channel_id == channel_id)
            .ok_or_else(|| {
                DeliveryError::not_found(format!("consumer {consumer_id} on channel {channel_id}"))
            })
    }

    async fn pull_consumer(
        &self,
        channel_id: &ChannelId,
        consumer_id: &ConsumerId,
    ) -> Result<Consumer> {
        let consumer = self.consumer_on(channel_id, consumer_id).await?;
        if consumer.is_push() {
            return Err(DeliveryError::invalid_input(format!(
                "consumer {consumer_id} is a push consumer"
            )));
        }
        Ok(consumer)
    }
}
