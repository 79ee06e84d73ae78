//! Delivery workers and the per-job executor.
//!
//! A worker parks on a private one-shot slot until the dispatcher hands it
//! a job, runs the job through `DeliveryExecutor`, and registers again. The
//! executor owns the attempt itself: take the job lock, reload, dispatch,
//! POST, and record the outcome.

use std::sync::Arc;

use bytes::Bytes;
use hookrelay_core::{
    models::{DeliveryJob, JobId, JobStatus, LockKey},
    Clock,
};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{DeliveryClient, DeliveryRequest, DeliveryResponse},
    engine::EngineStats,
    error::{ErrorCategory, Result},
    lock::LockCoordinator,
    queue::JobQueue,
    retry::RetryScheduler,
    storage::DeliveryStorage,
};

/// Hand-off slot an idle worker registers with the dispatcher.
pub type WorkerSlot = oneshot::Sender<DeliveryJob>;

/// What happened to a job handed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The consumer accepted the delivery.
    Delivered,
    /// The attempt failed and the job was requeued with backoff.
    RetryScheduled,
    /// The attempt failed and no attempts remain.
    DeadLettered,
    /// The job is not yet due, or its lock is held elsewhere; it went back
    /// to the queue's delayed heap.
    Deferred,
    /// Nothing to do: the job already reached a terminal state, or it
    /// belongs to a pull consumer.
    Skipped,
}

/// Runs single delivery attempts.
pub struct DeliveryExecutor {
    storage: Arc<dyn DeliveryStorage>,
    locks: LockCoordinator,
    queue: Arc<JobQueue>,
    client: Arc<DeliveryClient>,
    retry: Arc<RetryScheduler>,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
}

impl DeliveryExecutor {
    /// Creates an executor.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        locks: LockCoordinator,
        queue: Arc<JobQueue>,
        client: Arc<DeliveryClient>,
        retry: Arc<RetryScheduler>,
        stats: Arc<RwLock<EngineStats>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, locks, queue, client, retry, stats, clock }
    }

    /// Attempts one delivery of `job` as `holder`.
    ///
    /// Lock contention is not an error: another worker or process owns the
    /// job. It is checked again once that lock has had time to expire, so a
    /// job held by a crashed process is picked up after the sweep.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails. The job lock is then left to expire
    /// and the job goes back to the queue, visible once the lock is free.
    pub async fn execute(&self, job: DeliveryJob, holder: &str) -> Result<ExecutionOutcome> {
        let key = LockKey::job(job.id);
        match self.locks.try_lock(key.clone(), holder).await {
            Ok(_) => {},
            Err(error) if error.is_contention() => {
                debug!(job_id = %job.id, holder, "job locked elsewhere, deferring");
                self.stats.write().await.lock_contentions += 1;
                self.defer(job, self.locks.ttl()).await;
                return Ok(ExecutionOutcome::Deferred);
            },
            Err(error) => {
                self.defer(job, self.retry.policy().base_delay).await;
                return Err(error);
            },
        }

        match self.execute_locked(job.id, holder).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                error!(
                    job_id = %job.id,
                    holder,
                    category = %ErrorCategory::from(&error),
                    error = %error,
                    "delivery attempt aborted"
                );
                self.defer(job, self.locks.ttl()).await;
                Err(error)
            },
        }
    }

    async fn execute_locked(&self, job_id: JobId, holder: &str) -> Result<ExecutionOutcome> {
        let key = LockKey::job(job_id);
        let mut job = self.storage.find_job(job_id).await?;

        if !matches!(job.status, JobStatus::Queued | JobStatus::Dispatched) {
            debug!(job_id = %job.id, status = %job.status, "job already finished, skipping");
            self.locks.release_quietly(&key, holder).await;
            return Ok(ExecutionOutcome::Skipped);
        }

        let now = self.clock.now_utc();
        if !job.is_due(now) {
            self.locks.release_quietly(&key, holder).await;
            let visible_at = job.next_attempt_at;
            self.queue.enqueue_delayed(job, visible_at).await;
            return Ok(ExecutionOutcome::Deferred);
        }

        let consumer = self.storage.find_consumer(job.consumer_id.clone()).await?;
        let Some(consumer) = consumer else {
            error!(job_id = %job.id, consumer_id = %job.consumer_id, "consumer not found");
            self.locks.release_quietly(&key, holder).await;
            return Ok(ExecutionOutcome::Skipped);
        };
        let Some(url) = consumer.kind.callback_url().map(str::to_string) else {
            debug!(job_id = %job.id, consumer_id = %consumer.id, "pull consumer, not pushing");
            self.locks.release_quietly(&key, holder).await;
            return Ok(ExecutionOutcome::Skipped);
        };
        let Some(message) = self.storage.find_message(job.message_id.clone()).await? else {
            error!(job_id = %job.id, message_id = %job.message_id, "message not found");
            self.locks.release_quietly(&key, holder).await;
            return Ok(ExecutionOutcome::Skipped);
        };

        job.mark_dispatched(holder, now)?;
        self.storage.update_job(job.clone()).await?;

        let request = DeliveryRequest {
            job_id: job.id,
            message_id: message.id.clone(),
            channel_id: message.channel_id.clone(),
            consumer_id: consumer.id.clone(),
            url,
            body: Bytes::from(message.payload),
            content_type: message.content_type,
            attempt_number: job.attempt_count,
        };

        debug!(job_id = %job.id, attempt = job.attempt_count, "attempting push delivery");
        self.stats.write().await.in_flight_deliveries += 1;
        let result = self.client.deliver(request).await.and_then(DeliveryResponse::into_result);
        {
            let mut stats = self.stats.write().await;
            stats.in_flight_deliveries -= 1;
            stats.jobs_processed += 1;
        }

        match result {
            Ok(response) => {
                job.mark_delivered(self.clock.now_utc())?;
                self.storage.update_job(job.clone()).await?;
                self.locks.release_quietly(&key, holder).await;
                self.stats.write().await.successful_deliveries += 1;

                info!(
                    job_id = %job.id,
                    consumer_id = %job.consumer_id,
                    attempt = job.attempt_count,
                    status_code = response.status_code,
                    duration_ms = response.duration.as_millis(),
                    "message delivered"
                );
                Ok(ExecutionOutcome::Delivered)
            },
            Err(error) if error.is_transient() => {
                let job = self.retry.handle_failure(job, holder, error).await?;
                if job.status == JobStatus::DeadLettered {
                    Ok(ExecutionOutcome::DeadLettered)
                } else {
                    Ok(ExecutionOutcome::RetryScheduled)
                }
            },
            Err(error) => Err(error),
        }
    }

    /// Puts a job back into the queue without running it.
    pub async fn return_job(&self, job: DeliveryJob) {
        self.queue.push_front(job).await;
    }

    async fn defer(&self, job: DeliveryJob, delay: std::time::Duration) {
        let delay =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
        self.queue.enqueue_delayed(job, self.clock.now_utc() + delay).await;
    }
}

/// Individual worker that executes the jobs the dispatcher hands it.
pub struct DeliveryWorker {
    id: usize,
    holder: String,
    registrations: mpsc::Sender<WorkerSlot>,
    executor: Arc<DeliveryExecutor>,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    /// Creates a worker. `instance_id` scopes its lock holder token.
    pub fn new(
        id: usize,
        instance_id: &str,
        registrations: mpsc::Sender<WorkerSlot>,
        executor: Arc<DeliveryExecutor>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            id,
            holder: format!("{instance_id}/worker-{id}"),
            registrations,
            executor,
            cancellation_token,
        }
    }

    /// Lock holder token used for this worker's attempts.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Main worker loop: register, wait for a job, execute, repeat.
    ///
    /// Cancellation is observed while idle. A delivery already in progress
    /// runs to completion.
    ///
    /// # Errors
    ///
    /// Never fails today; execution errors are logged and the job deferred.
    pub async fn run(&self) -> Result<()> {
        debug!(worker_id = self.id, "delivery worker ready");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let (slot, mut handoff) = oneshot::channel();
            tokio::select! {
                sent = self.registrations.send(slot) => {
                    if sent.is_err() {
                        debug!(worker_id = self.id, "dispatcher gone, worker exiting");
                        break;
                    }
                }
                () = self.cancellation_token.cancelled() => break,
            }

            let job = tokio::select! {
                job = &mut handoff => match job {
                    Ok(job) => job,
                    Err(_) => break,
                },
                () = self.cancellation_token.cancelled() => {
                    handoff.close();
                    if let Ok(job) = handoff.try_recv() {
                        self.executor.return_job(job).await;
                    }
                    break;
                }
            };

            if let Err(error) = self.executor.execute(job, &self.holder).await {
                warn!(
                    worker_id = self.id,
                    category = %ErrorCategory::from(&error),
                    error = %error,
                    "job execution failed"
                );
            }
        }

        info!(worker_id = self.id, "delivery worker received shutdown signal");
        Ok(())
    }
}
