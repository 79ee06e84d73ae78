//! Dead-letter queue management.
//!
//! Dead jobs are never deleted. Listing returns a consumer's outstanding
//! dead jobs; requeueing creates a fresh job per dead one and leaves the
//! dead record in place, linked through `requeued_from`.

use std::sync::Arc;

use hookrelay_core::{
    models::{ConsumerId, DeliveryJob, JobId, JobStatus, LockKey},
    Clock,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    engine::EngineStats,
    error::{DeliveryError, Result},
    lock::LockCoordinator,
    pagination::{Page, PageRequest, MAX_PAGE_LIMIT},
    queue::JobQueue,
    storage::DeliveryStorage,
};

/// Which dead jobs a requeue applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "job_id", rename_all = "snake_case")]
pub enum RequeueTarget {
    /// One dead job.
    Job(JobId),
    /// Every outstanding dead job of the consumer.
    All,
}

/// Lists and requeues dead-lettered jobs.
pub struct DlqManager {
    storage: Arc<dyn DeliveryStorage>,
    locks: LockCoordinator,
    queue: Arc<JobQueue>,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    cancellation_token: CancellationToken,
}

impl DlqManager {
    /// Creates a manager. `instance_id` prefixes the lock holder tokens of
    /// requeue operations.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        locks: LockCoordinator,
        queue: Arc<JobQueue>,
        stats: Arc<RwLock<EngineStats>>,
        clock: Arc<dyn Clock>,
        instance_id: impl Into<String>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            storage,
            locks,
            queue,
            stats,
            clock,
            instance_id: instance_id.into(),
            cancellation_token,
        }
    }

    /// Records a job that just moved to the dead-letter queue.
    pub async fn admit(&self, job: &DeliveryJob) {
        info!(
            job_id = %job.id,
            consumer_id = %job.consumer_id,
            message_id = %job.message_id,
            attempts = job.attempt_count,
            "job moved to dead-letter queue"
        );
        self.stats.write().await.dead_lettered += 1;
    }

    /// Lists a consumer's outstanding dead jobs, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a malformed cursor, or a storage error.
    pub async fn list_dead(
        &self,
        consumer_id: &ConsumerId,
        page: &PageRequest,
    ) -> Result<Page<DeliveryJob>> {
        let after = page.decode_cursor()?;
        let limit = page.limit();
        let rows = self.storage.list_dead(consumer_id.clone(), after, limit + 1).await?;
        Ok(Page::from_overfetch(rows, limit, DeliveryJob::status_cursor))
    }

    /// Requeues dead jobs of `consumer_id`.
    ///
    /// The fresh jobs are created under the consumer's lock, so two
    /// operators requeueing the same consumer cannot both create successors.
    /// Push jobs are enqueued after the lock is released; they are already
    /// persisted, so waiting on a full queue cannot outlive the lock.
    /// Returns the fresh jobs.
    ///
    /// # Errors
    ///
    /// - `LockContention` if another requeue of this consumer is running.
    /// - `NotFound` if the consumer or the job does not exist, or the job
    ///   belongs to another consumer.
    /// - `InvalidState` if the job is not dead-lettered or was already
    ///   requeued.
    pub async fn requeue(
        &self,
        consumer_id: &ConsumerId,
        target: RequeueTarget,
    ) -> Result<Vec<DeliveryJob>> {
        let key = LockKey::consumer(consumer_id);
        let holder = format!("{}/requeue-{}", self.instance_id, Uuid::new_v4());
        self.locks.try_lock(key.clone(), &holder).await?;

        let result = self.requeue_locked(consumer_id, target).await;
        self.locks.release_quietly(&key, &holder).await;

        let (fresh, push) = result?;
        if fresh.is_empty() {
            return Ok(fresh);
        }
        self.stats.write().await.requeued += fresh.len() as u64;
        info!(consumer_id = %consumer_id, requeued = fresh.len(), "requeued dead jobs");

        if push {
            for job in &fresh {
                let enqueued = self.queue.enqueue(job.clone(), &self.cancellation_token).await;
                if let Err(error) = enqueued {
                    // Persisted as queued; startup recovery dispatches it.
                    warn!(job_id = %job.id, error = %error, "requeued job not enqueued");
                }
            }
        }
        Ok(fresh)
    }

    /// Creates and persists the successors, returning them and whether the
    /// consumer is a push consumer.
    async fn requeue_locked(
        &self,
        consumer_id: &ConsumerId,
        target: RequeueTarget,
    ) -> Result<(Vec<DeliveryJob>, bool)> {
        let consumer = self
            .storage
            .find_consumer(consumer_id.clone())
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("consumer {consumer_id}")))?;

        let dead = match target {
            RequeueTarget::Job(job_id) => vec![self.load_requeueable(consumer_id, job_id).await?],
            RequeueTarget::All => self.all_dead(consumer_id).await?,
        };

        let mut fresh_jobs = Vec::with_capacity(dead.len());
        for dead_job in dead {
            let fresh = dead_job.requeued(self.clock.now_utc())?;
            self.storage.create_job(fresh.clone()).await?;

            info!(
                job_id = %fresh.id,
                requeued_from = %dead_job.id,
                consumer_id = %consumer_id,
                "dead job requeued"
            );
            fresh_jobs.push(fresh);
        }

        Ok((fresh_jobs, consumer.is_push()))
    }

    async fn load_requeueable(
        &self,
        consumer_id: &ConsumerId,
        job_id: JobId,
    ) -> Result<DeliveryJob> {
        let job = self.storage.find_job(job_id).await?;
        if &job.consumer_id != consumer_id {
            return Err(DeliveryError::not_found(format!(
                "delivery job {job_id} for consumer {consumer_id}"
            )));
        }
        if job.status != JobStatus::DeadLettered {
            return Err(DeliveryError::invalid_state(format!(
                "job {job_id} is {}, only dead-lettered jobs can be requeued",
                job.status
            )));
        }
        if let Some(successor) = self.storage.find_successor(job_id).await? {
            return Err(DeliveryError::invalid_state(format!(
                "job {job_id} was already requeued as {}",
                successor.id
            )));
        }
        Ok(job)
    }

    async fn all_dead(&self, consumer_id: &ConsumerId) -> Result<Vec<DeliveryJob>> {
        let mut dead = Vec::new();
        let mut after = None;
        loop {
            let batch =
                self.storage.list_dead(consumer_id.clone(), after, MAX_PAGE_LIMIT).await?;
            let done = batch.len() < MAX_PAGE_LIMIT;
            after = batch.last().map(DeliveryJob::status_cursor);
            dead.extend(batch);
            if done {
                return Ok(dead);
            }
        }
    }
}
