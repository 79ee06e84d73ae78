//! Backoff retry strategies and the retry scheduler.
//!
//! Every failed push attempt, whatever the status code or transport error,
//! comes through here. The job either returns to the queue after a backoff
//! delay or, once its attempts are used up, moves to the dead-letter queue.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hookrelay_core::{
    models::{DeliveryJob, LockKey},
    Clock,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    dlq::DlqManager,
    engine::EngineStats,
    error::{DeliveryError, ErrorCategory, Result},
    lock::LockCoordinator,
    queue::JobQueue,
    storage::DeliveryStorage,
};

/// Retry policy configuration for push delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts (including initial attempt).
    pub max_attempts: u32,

    /// Base delay for backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between retry attempts.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Linear,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    Exponential,
    /// Linear backoff: delay grows by the base amount each attempt.
    Linear,
}

impl RetryPolicy {
    /// Backoff before the attempt following failed attempt `attempt`
    /// (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let raw = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(n),
            BackoffStrategy::Exponential => {
                self.base_delay.saturating_mul(2_u32.saturating_pow((n - 1).min(20)))
            },
        };
        let capped = raw.min(self.max_delay);

        jittered(capped, self.jitter_factor).min(self.max_delay)
    }

    /// Decides what happens to a job whose attempt number `attempt` just
    /// failed at `failed_at`.
    ///
    /// Only the attempt count matters. A consumer answering 4xx is as likely
    /// to recover as one answering 5xx.
    pub fn decide(&self, attempt: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::Exhausted { attempts: attempt };
        }

        match chrono::Duration::from_std(self.delay_for(attempt)) {
            Ok(delay) => RetryDecision::RetryAt(failed_at + delay),
            Err(_) => RetryDecision::Exhausted { attempts: attempt },
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the job visible again at this time.
    RetryAt(DateTime<Utc>),
    /// No attempts left; the job is dead-lettered.
    Exhausted {
        /// Attempts made so far.
        attempts: u32,
    },
}

/// Spreads `delay` uniformly over `delay * (1 ± factor)`.
fn jittered(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return delay;
    }

    let spread = delay.as_secs_f64() * factor.min(1.0);
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}

/// Applies a `RetryPolicy` to failed attempts and persists the outcome.
pub struct RetryScheduler {
    storage: Arc<dyn DeliveryStorage>,
    locks: LockCoordinator,
    queue: Arc<JobQueue>,
    dlq: Arc<DlqManager>,
    policy: RetryPolicy,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
}

impl RetryScheduler {
    /// Creates a scheduler applying `policy`.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        locks: LockCoordinator,
        queue: Arc<JobQueue>,
        dlq: Arc<DlqManager>,
        policy: RetryPolicy,
        stats: Arc<RwLock<EngineStats>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, locks, queue, dlq, policy, stats, clock }
    }

    /// The policy this scheduler applies.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handles a failed attempt of a dispatched `job` whose lock `holder`
    /// still owns.
    ///
    /// The job is either requeued with `next_attempt_at` pushed out by the
    /// backoff delay, or dead-lettered. Either way the lock is released
    /// after the new state is persisted.
    ///
    /// # Errors
    ///
    /// Returns error if the new state cannot be persisted. The lock is kept
    /// in that case, so no other worker picks the job up before it expires.
    pub async fn handle_failure(
        &self,
        mut job: DeliveryJob,
        holder: &str,
        error: DeliveryError,
    ) -> Result<DeliveryJob> {
        let now = self.clock.now_utc();
        let key = LockKey::job(job.id);

        match self.policy.decide(job.attempt_count, now) {
            RetryDecision::RetryAt(next_attempt_at) => {
                job.schedule_retry(next_attempt_at, now)?;
                self.storage.update_job(job.clone()).await?;
                self.locks.release_quietly(&key, holder).await;

                warn!(
                    job_id = %job.id,
                    consumer_id = %job.consumer_id,
                    attempt = job.attempt_count,
                    next_attempt_at = %job.next_attempt_at,
                    category = %ErrorCategory::from(&error),
                    error = %error,
                    "delivery failed, scheduled retry"
                );

                self.stats.write().await.failed_deliveries += 1;
                self.queue.enqueue_delayed(job.clone(), job.next_attempt_at).await;
            },
            RetryDecision::Exhausted { attempts } => {
                job.mark_dead_lettered(self.policy.max_attempts, now)?;
                self.storage.update_job(job.clone()).await?;
                self.locks.release_quietly(&key, holder).await;

                info!(
                    job_id = %job.id,
                    consumer_id = %job.consumer_id,
                    reason = %DeliveryError::retries_exhausted(attempts),
                    category = %ErrorCategory::from(&error),
                    last_error = %error,
                    "moving job to dead-letter queue"
                );

                self.stats.write().await.failed_deliveries += 1;
                self.dlq.admit(&job).await;
            },
        }

        Ok(job)
    }
}
