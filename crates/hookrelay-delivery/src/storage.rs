//! Storage abstraction layer for the dispatch engine.
//!
//! Everything the engine persists (locks, jobs, and lookups of channels,
//! consumers and messages) goes through `DeliveryStorage`. Production uses
//! the PostgreSQL repositories in `hookrelay_core::storage`; tests and the
//! `memory` storage backend use the in-memory implementation below.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use hookrelay_core::{
    error::{CoreError, Result},
    models::{
        Channel, ChannelId, Consumer, ConsumerId, DeliveryJob, JobCursor, JobId, JobStatus, Lock,
        LockKey, Message, MessageId,
    },
};

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the dispatch engine.
///
/// Implementations must make `try_lock` atomic with respect to every other
/// caller sharing the same backing store: of any set of concurrent
/// acquisitions of one free key, exactly one succeeds.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Takes `lock` if its key is free or the current lock has expired.
    ///
    /// Fails with `CoreError::LockContention` while a live lock exists.
    fn try_lock(&self, lock: Lock) -> StorageFuture<'_, ()>;

    /// Releases `key` if `holder` still owns it.
    ///
    /// Fails with `CoreError::LockNotHeld` otherwise.
    fn release_lock(&self, key: LockKey, holder: String) -> StorageFuture<'_, ()>;

    /// Deletes every lock acquired before `cutoff`, returning the count.
    fn timeout_locks(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64>;

    /// Inserts all jobs of one broadcast atomically.
    fn create_jobs(&self, jobs: Vec<DeliveryJob>) -> StorageFuture<'_, ()>;

    /// Inserts a single job.
    fn create_job(&self, job: DeliveryJob) -> StorageFuture<'_, ()>;

    /// Persists the mutable fields of an existing job.
    fn update_job(&self, job: DeliveryJob) -> StorageFuture<'_, ()>;

    /// Loads a job. Fails with `CoreError::NotFound` if it does not exist.
    fn find_job(&self, id: JobId) -> StorageFuture<'_, DeliveryJob>;

    /// Lists a consumer's jobs in `status`, oldest first by creation.
    fn list_jobs(
        &self,
        consumer_id: ConsumerId,
        status: JobStatus,
        after: Option<JobCursor>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryJob>>;

    /// Lists a consumer's dead jobs without a requeued successor, oldest
    /// status change first.
    fn list_dead(
        &self,
        consumer_id: ConsumerId,
        after: Option<JobCursor>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryJob>>;

    /// Finds the job created by requeueing `id`.
    fn find_successor(&self, id: JobId) -> StorageFuture<'_, Option<DeliveryJob>>;

    /// Lists queued or dispatched jobs of push consumers in creation order.
    fn list_dispatchable(
        &self,
        after: Option<JobCursor>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryJob>>;

    /// Looks up a channel.
    fn find_channel(&self, id: ChannelId) -> StorageFuture<'_, Option<Channel>>;

    /// Looks up a consumer.
    fn find_consumer(&self, id: ConsumerId) -> StorageFuture<'_, Option<Consumer>>;

    /// Looks up a message.
    fn find_message(&self, id: MessageId) -> StorageFuture<'_, Option<Message>>;

    /// Lists every consumer subscribed to `channel_id`.
    fn list_consumers(&self, channel_id: ChannelId) -> StorageFuture<'_, Vec<Consumer>>;

    /// Stores a message accepted for dispatch. Idempotent per message id.
    fn save_message(&self, message: Message) -> StorageFuture<'_, ()>;
}

/// Production storage implementation using PostgreSQL.
///
/// Wraps the concrete `hookrelay_core::storage::Storage` so every broker
/// process pointed at the same database shares locks and jobs.
pub struct PostgresDeliveryStorage {
    storage: Arc<hookrelay_core::storage::Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<hookrelay_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn try_lock(&self, lock: Lock) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.locks.try_lock(&lock).await })
    }

    fn release_lock(&self, key: LockKey, holder: String) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.locks.release(&key, &holder).await })
    }

    fn timeout_locks(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.locks.timeout_before(cutoff).await })
    }

    fn create_jobs(&self, jobs: Vec<DeliveryJob>) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_jobs.create_batch(&jobs).await })
    }

    fn create_job(&self, job: DeliveryJob) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_jobs.create(&job).await.map(|_| ()) })
    }

    fn update_job(&self, job: DeliveryJob) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_jobs.update(&job).await })
    }

    fn find_job(&self, id: JobId) -> StorageFuture<'_, DeliveryJob> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .delivery_jobs
                .find_by_id(id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("delivery job {id}")))
        })
    }

    fn list_jobs(
        &self,
        consumer_id: ConsumerId,
        status: JobStatus,
        after: Option<JobCursor>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryJob>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.delivery_jobs.list_by_status(&consumer_id, status, after, limit).await
        })
    }

    fn list_dead(
        &self,
        consumer_id: ConsumerId,
        after: Option<JobCursor>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryJob>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_jobs.list_dead(&consumer_id, after, limit).await })
    }

    fn find_successor(&self, id: JobId) -> StorageFuture<'_, Option<DeliveryJob>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_jobs.find_successor(id).await })
    }

    fn list_dispatchable(
        &self,
        after: Option<JobCursor>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryJob>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_jobs.list_dispatchable(after, limit).await })
    }

    fn find_channel(&self, id: ChannelId) -> StorageFuture<'_, Option<Channel>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.catalog.find_channel(&id).await })
    }

    fn find_consumer(&self, id: ConsumerId) -> StorageFuture<'_, Option<Consumer>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.catalog.find_consumer(&id).await })
    }

    fn find_message(&self, id: MessageId) -> StorageFuture<'_, Option<Message>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.catalog.find_message(&id).await })
    }

    fn list_consumers(&self, channel_id: ChannelId) -> StorageFuture<'_, Vec<Consumer>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.catalog.list_consumers(&channel_id).await })
    }

    fn save_message(&self, message: Message) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.catalog.save_message(&message).await })
    }
}

pub mod memory {
    //! In-memory storage for tests and single-process deployments.
    //!
    //! Mirrors the PostgreSQL semantics closely enough that the engine
    //! cannot tell them apart: conditional lock takeover, atomic batch
    //! inserts, monotonic `status_changed_at`, successor exclusion in the
    //! dead listing. Supports injecting storage failures.

    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use hookrelay_core::error::CoreError;
    use tokio::sync::RwLock;

    use super::{
        Channel, ChannelId, Consumer, ConsumerId, DeliveryJob, DeliveryStorage, JobCursor, JobId,
        JobStatus, Lock, LockKey, Message, MessageId, StorageFuture,
    };

    /// In-memory implementation of `DeliveryStorage`.
    ///
    /// Cloning shares the underlying maps, so two engines built from clones
    /// of one instance behave like two processes on one database.
    #[derive(Clone, Default)]
    pub struct InMemoryStorage {
        locks: Arc<RwLock<HashMap<LockKey, Lock>>>,
        jobs: Arc<RwLock<HashMap<JobId, DeliveryJob>>>,
        channels: Arc<RwLock<HashMap<ChannelId, Channel>>>,
        consumers: Arc<RwLock<HashMap<ConsumerId, Consumer>>>,
        messages: Arc<RwLock<HashMap<MessageId, Message>>>,
        failing_updates: Arc<AtomicU32>,
        failing_lock_ops: Arc<AtomicU32>,
    }

    impl InMemoryStorage {
        /// Creates an empty storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers a channel.
        pub async fn add_channel(&self, channel: Channel) {
            self.channels.write().await.insert(channel.id.clone(), channel);
        }

        /// Registers a consumer.
        pub async fn add_consumer(&self, consumer: Consumer) {
            self.consumers.write().await.insert(consumer.id.clone(), consumer);
        }

        /// Stores a message directly, bypassing broadcast.
        pub async fn add_message(&self, message: Message) {
            self.messages.write().await.insert(message.id.clone(), message);
        }

        /// Stores a job directly, bypassing broadcast.
        pub async fn add_job(&self, job: DeliveryJob) {
            self.jobs.write().await.insert(job.id, job);
        }

        /// Makes the next `count` job updates fail with a database error.
        pub fn fail_next_updates(&self, count: u32) {
            self.failing_updates.store(count, Ordering::SeqCst);
        }

        /// Makes the next `count` lock acquisitions or releases fail with a
        /// database error.
        pub fn fail_next_lock_ops(&self, count: u32) {
            self.failing_lock_ops.store(count, Ordering::SeqCst);
        }

        /// Returns every stored job.
        pub async fn all_jobs(&self) -> Vec<DeliveryJob> {
            let mut jobs: Vec<_> = self.jobs.read().await.values().cloned().collect();
            jobs.sort_by_key(DeliveryJob::created_cursor);
            jobs
        }

        /// Returns the lock currently stored for `key`, live or expired.
        pub async fn lock(&self, key: &LockKey) -> Option<Lock> {
            self.locks.read().await.get(key).cloned()
        }

        /// Returns the number of stored lock rows.
        pub async fn lock_count(&self) -> usize {
            self.locks.read().await.len()
        }

        fn take_failure(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    fn page(
        mut jobs: Vec<DeliveryJob>,
        after: Option<JobCursor>,
        limit: usize,
        key: fn(&DeliveryJob) -> JobCursor,
    ) -> Vec<DeliveryJob> {
        jobs.sort_by_key(key);
        jobs.into_iter()
            .filter(|job| after.map_or(true, |cursor| key(job) > cursor))
            .take(limit)
            .collect()
    }

    impl DeliveryStorage for InMemoryStorage {
        fn try_lock(&self, lock: Lock) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if Self::take_failure(&self.failing_lock_ops) {
                    return Err(CoreError::Database("injected lock failure".into()));
                }

                let mut locks = self.locks.write().await;
                if let Some(existing) = locks.get(&lock.key) {
                    if !existing.is_expired(lock.acquired_at) {
                        return Err(CoreError::LockContention { key: lock.key.to_string() });
                    }
                }
                locks.insert(lock.key.clone(), lock);
                Ok(())
            })
        }

        fn release_lock(&self, key: LockKey, holder: String) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if Self::take_failure(&self.failing_lock_ops) {
                    return Err(CoreError::Database("injected lock failure".into()));
                }

                let mut locks = self.locks.write().await;
                match locks.get(&key) {
                    Some(existing) if existing.holder == holder => {
                        locks.remove(&key);
                        Ok(())
                    },
                    _ => Err(CoreError::LockNotHeld { key: key.to_string(), holder }),
                }
            })
        }

        fn timeout_locks(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                let mut locks = self.locks.write().await;
                let before = locks.len();
                locks.retain(|_, lock| lock.acquired_at >= cutoff);
                Ok((before - locks.len()) as u64)
            })
        }

        fn create_jobs(&self, jobs: Vec<DeliveryJob>) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut stored = self.jobs.write().await;
                if let Some(dup) = jobs.iter().find(|job| stored.contains_key(&job.id)) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "delivery job {} already exists",
                        dup.id
                    )));
                }
                for job in jobs {
                    stored.insert(job.id, job);
                }
                Ok(())
            })
        }

        fn create_job(&self, job: DeliveryJob) -> StorageFuture<'_, ()> {
            self.create_jobs(vec![job])
        }

        fn update_job(&self, job: DeliveryJob) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if Self::take_failure(&self.failing_updates) {
                    return Err(CoreError::Database("injected update failure".into()));
                }

                let mut jobs = self.jobs.write().await;
                let stored = jobs
                    .get_mut(&job.id)
                    .ok_or_else(|| CoreError::NotFound(format!("delivery job {}", job.id)))?;
                let status_changed_at = stored.status_changed_at.max(job.status_changed_at);
                stored.status = job.status;
                stored.attempt_count = job.attempt_count;
                stored.next_attempt_at = job.next_attempt_at;
                stored.status_changed_at = status_changed_at;
                stored.lock_token = job.lock_token;
                Ok(())
            })
        }

        fn find_job(&self, id: JobId) -> StorageFuture<'_, DeliveryJob> {
            Box::pin(async move {
                self.jobs
                    .read()
                    .await
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| CoreError::NotFound(format!("delivery job {id}")))
            })
        }

        fn list_jobs(
            &self,
            consumer_id: ConsumerId,
            status: JobStatus,
            after: Option<JobCursor>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<DeliveryJob>> {
            Box::pin(async move {
                let matching = self
                    .jobs
                    .read()
                    .await
                    .values()
                    .filter(|job| job.consumer_id == consumer_id && job.status == status)
                    .cloned()
                    .collect();
                Ok(page(matching, after, limit, DeliveryJob::created_cursor))
            })
        }

        fn list_dead(
            &self,
            consumer_id: ConsumerId,
            after: Option<JobCursor>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<DeliveryJob>> {
            Box::pin(async move {
                let jobs = self.jobs.read().await;
                let matching = jobs
                    .values()
                    .filter(|job| {
                        job.consumer_id == consumer_id
                            && job.status == JobStatus::DeadLettered
                            && !jobs.values().any(|other| other.requeued_from == Some(job.id))
                    })
                    .cloned()
                    .collect();
                Ok(page(matching, after, limit, DeliveryJob::status_cursor))
            })
        }

        fn find_successor(&self, id: JobId) -> StorageFuture<'_, Option<DeliveryJob>> {
            Box::pin(async move {
                let jobs = self.jobs.read().await;
                Ok(jobs.values().find(|job| job.requeued_from == Some(id)).cloned())
            })
        }

        fn list_dispatchable(
            &self,
            after: Option<JobCursor>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<DeliveryJob>> {
            Box::pin(async move {
                let consumers = self.consumers.read().await;
                let matching = self
                    .jobs
                    .read()
                    .await
                    .values()
                    .filter(|job| matches!(job.status, JobStatus::Queued | JobStatus::Dispatched))
                    .filter(|job| consumers.get(&job.consumer_id).is_some_and(Consumer::is_push))
                    .cloned()
                    .collect();
                Ok(page(matching, after, limit, DeliveryJob::created_cursor))
            })
        }

        fn find_channel(&self, id: ChannelId) -> StorageFuture<'_, Option<Channel>> {
            Box::pin(async move { Ok(self.channels.read().await.get(&id).cloned()) })
        }

        fn find_consumer(&self, id: ConsumerId) -> StorageFuture<'_, Option<Consumer>> {
            Box::pin(async move { Ok(self.consumers.read().await.get(&id).cloned()) })
        }

        fn find_message(&self, id: MessageId) -> StorageFuture<'_, Option<Message>> {
            Box::pin(async move { Ok(self.messages.read().await.get(&id).cloned()) })
        }

        fn list_consumers(&self, channel_id: ChannelId) -> StorageFuture<'_, Vec<Consumer>> {
            Box::pin(async move {
                let mut consumers: Vec<_> = self
                    .consumers
                    .read()
                    .await
                    .values()
                    .filter(|consumer| consumer.channel_id == channel_id)
                    .cloned()
                    .collect();
                consumers.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(consumers)
            })
        }

        fn save_message(&self, message: Message) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if !self.channels.read().await.contains_key(&message.channel_id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "unknown channel {}",
                        message.channel_id
                    )));
                }
                self.messages.write().await.entry(message.id.clone()).or_insert(message);
                Ok(())
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use std::time::Duration;

        use chrono::Utc;

        use super::*;

        fn message(channel: &str, id: &str) -> Message {
            Message {
                id: id.into(),
                channel_id: channel.into(),
                payload: "{}".into(),
                content_type: "application/json".into(),
                priority: 0,
                received_at: Utc::now(),
            }
        }

        #[tokio::test]
        async fn expired_lock_can_be_taken_over() {
            let storage = InMemoryStorage::new();
            let now = Utc::now();
            let key = LockKey("job:1".into());

            storage
                .try_lock(Lock::new(key.clone(), "a", now, Duration::from_secs(5)))
                .await
                .unwrap();
            let err = storage
                .try_lock(Lock::new(key.clone(), "b", now, Duration::from_secs(5)))
                .await
                .unwrap_err();
            assert!(err.is_contention());

            let later = now + chrono::Duration::seconds(5);
            storage
                .try_lock(Lock::new(key.clone(), "b", later, Duration::from_secs(5)))
                .await
                .unwrap();
            assert_eq!(storage.lock(&key).await.unwrap().holder, "b");
        }

        #[tokio::test]
        async fn release_requires_current_holder() {
            let storage = InMemoryStorage::new();
            let key = LockKey("consumer:c1".into());
            storage
                .try_lock(Lock::new(key.clone(), "a", Utc::now(), Duration::from_secs(5)))
                .await
                .unwrap();

            let err = storage.release_lock(key.clone(), "b".into()).await.unwrap_err();
            assert!(matches!(err, CoreError::LockNotHeld { .. }));

            storage.release_lock(key.clone(), "a".into()).await.unwrap();
            assert_eq!(storage.lock_count().await, 0);
        }

        #[tokio::test]
        async fn dead_listing_skips_requeued_jobs() {
            let storage = InMemoryStorage::new();
            storage.add_channel(Channel { id: "ch".into(), name: "ch".into() }).await;
            let consumer = Consumer::push("c1", "ch", "http://localhost/hook");
            storage.add_consumer(consumer.clone()).await;
            let message = message("ch", "m1");
            storage.save_message(message.clone()).await.unwrap();

            let now = Utc::now();
            let mut job = DeliveryJob::new(&message, &consumer, now);
            job.mark_dispatched("w", now).unwrap();
            job.mark_dead_lettered(1, now).unwrap();
            storage.create_job(job.clone()).await.unwrap();

            let dead = storage.list_dead(consumer.id.clone(), None, 10).await.unwrap();
            assert_eq!(dead.len(), 1);

            storage.create_job(job.requeued(now).unwrap()).await.unwrap();
            assert!(storage.list_dead(consumer.id.clone(), None, 10).await.unwrap().is_empty());
            assert!(storage.find_successor(job.id).await.unwrap().is_some());
        }

        #[tokio::test]
        async fn injected_update_failure_is_one_shot() {
            let storage = InMemoryStorage::new();
            let consumer = Consumer::pull("c1", "ch");
            let job = DeliveryJob::new(&message("ch", "m1"), &consumer, Utc::now());
            storage.add_job(job.clone()).await;

            storage.fail_next_updates(1);
            assert!(storage.update_job(job.clone()).await.is_err());
            assert!(storage.update_job(job).await.is_ok());
        }

        #[tokio::test]
        async fn save_message_rejects_unknown_channel() {
            let storage = InMemoryStorage::new();
            let err = storage.save_message(message("missing", "m1")).await.unwrap_err();
            assert!(matches!(err, CoreError::ConstraintViolation(_)));
        }
    }
}
