//! Worker pool management with structured concurrency.
//!
//! Provides lifecycle management and graceful shutdown for the delivery
//! workers, the dispatcher feeding them and the lock sweeper.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    engine::{DeliveryConfig, EngineStats},
    error::{DeliveryError, Result},
    lock::LockCoordinator,
    queue::JobQueue,
    worker::{DeliveryExecutor, DeliveryWorker},
};

/// Worker pool that manages delivery worker tasks with supervision.
///
/// Every worker gets a child of the pool's cancellation token, so a single
/// `cancel()` reaches workers, dispatcher and sweeper alike.
pub struct WorkerPool {
    config: DeliveryConfig,
    queue: Arc<JobQueue>,
    executor: Arc<DeliveryExecutor>,
    locks: LockCoordinator,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    dispatcher_handle: Option<JoinHandle<()>>,
    sweeper_handle: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a new worker pool with the given configuration.
    pub fn new(
        config: DeliveryConfig,
        queue: Arc<JobQueue>,
        executor: Arc<DeliveryExecutor>,
        locks: LockCoordinator,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            queue,
            executor,
            locks,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            dispatcher_handle: None,
            sweeper_handle: None,
        }
    }

    /// Spawn all configured workers, the dispatcher and the lock sweeper.
    ///
    /// Workers will run until cancellation is requested via the cancellation
    /// token. Returns immediately after spawning.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the pool is already running.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if !self.worker_handles.is_empty() {
            return Err(DeliveryError::invalid_state("worker pool already spawned"));
        }

        info!(worker_count = self.config.worker_count, "spawning delivery workers");

        let (registrations, slots) = mpsc::channel(self.config.worker_count.max(1));
        let dispatcher =
            Dispatcher::new(self.queue.clone(), slots, self.cancellation_token.clone());
        self.dispatcher_handle = Some(tokio::spawn(dispatcher.run()));

        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                &self.config.instance_id,
                registrations.clone(),
                self.executor.clone(),
                self.cancellation_token.child_token(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(
                        worker_id,
                        error = %error,
                        "delivery worker terminated with error"
                    );
                } else {
                    info!(worker_id, "delivery worker stopped gracefully");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        self.sweeper_handle = Some(self.locks.spawn_sweeper(
            self.config.lock_sweep_interval,
            self.config.lock_sweep_threshold,
            self.cancellation_token.clone(),
        ));

        self.stats.write().await.active_workers = self.worker_handles.len();

        info!(
            spawned_workers = self.worker_handles.len(),
            "all delivery workers spawned successfully"
        );

        Ok(())
    }

    /// Stops every task and waits for in-flight deliveries to finish.
    ///
    /// Idle workers stop at once. A worker in the middle of a delivery
    /// finishes it first. Jobs still queued stay in storage as `Queued` and
    /// are picked up again by the next process's recovery.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the tasks do not finish in time, or
    /// `WorkerPanic` for the first worker that panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "stopping delivery workers"
        );

        self.cancellation_token.cancel();

        let workers = std::mem::take(&mut self.worker_handles);
        let dispatcher = self.dispatcher_handle.take();
        let sweeper = self.sweeper_handle.take();
        let stats = self.stats.clone();

        let joined = async move {
            let mut panicked = None;
            for (worker_id, handle) in workers.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker stopped with error");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked");
                        panicked.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }

            for (task, handle) in [("dispatcher", dispatcher), ("lock sweeper", sweeper)] {
                let Some(handle) = handle else { continue };
                if let Err(join_error) = handle.await {
                    error!(task, error = %join_error, "task panicked");
                }
            }

            stats.write().await.active_workers = 0;
            panicked
        };

        match tokio::time::timeout(timeout, joined).await {
            Ok(None) => {
                info!("delivery workers stopped");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "shutdown timed out, abandoned jobs keep their locks until expiry"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Check if any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }

    /// Number of spawned worker tasks.
    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.cancellation_token.is_cancelled() {
            return;
        }

        let running = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if running > 0 {
            warn!(running, "worker pool dropped without shutdown, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use hookrelay_core::{Clock, TestClock};

    use super::*;
    use crate::{
        client::DeliveryClient,
        dlq::DlqManager,
        queue::QueueOrdering,
        retry::RetryScheduler,
        storage::{memory::InMemoryStorage, DeliveryStorage},
    };

    fn create_test_worker_pool(config: DeliveryConfig) -> (WorkerPool, Arc<RwLock<EngineStats>>) {
        let storage: Arc<dyn DeliveryStorage> = Arc::new(InMemoryStorage::new());
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let cancellation_token = CancellationToken::new();
        let locks = LockCoordinator::new(storage.clone(), clock.clone(), config.lock_ttl);
        let queue = Arc::new(JobQueue::new(16, QueueOrdering::Fifo, clock.clone()));
        let dlq = Arc::new(DlqManager::new(
            storage.clone(),
            locks.clone(),
            queue.clone(),
            stats.clone(),
            clock.clone(),
            "test",
            cancellation_token.clone(),
        ));
        let retry = Arc::new(RetryScheduler::new(
            storage.clone(),
            locks.clone(),
            queue.clone(),
            dlq,
            config.retry_policy.clone(),
            stats.clone(),
            clock.clone(),
        ));
        let executor = Arc::new(DeliveryExecutor::new(
            storage,
            locks.clone(),
            queue.clone(),
            Arc::new(DeliveryClient::with_defaults().unwrap()),
            retry,
            stats.clone(),
            clock,
        ));

        let pool =
            WorkerPool::new(config, queue, executor, locks, stats.clone(), cancellation_token);
        (pool, stats)
    }

    #[tokio::test]
    async fn worker_pool_spawns_configured_number_of_workers() {
        let config = DeliveryConfig { worker_count: 5, ..Default::default() };
        let (mut pool, _stats) = create_test_worker_pool(config);

        assert_eq!(pool.worker_count(), 0);
        pool.spawn_workers().await.expect("workers should spawn successfully");
        assert_eq!(pool.worker_count(), 5);
        assert!(pool.has_active_workers());

        pool.shutdown_graceful(Duration::from_secs(1))
            .await
            .expect("graceful shutdown should succeed");
    }

    #[tokio::test]
    async fn spawning_twice_is_rejected() {
        let config = DeliveryConfig { worker_count: 2, ..Default::default() };
        let (mut pool, _stats) = create_test_worker_pool(config);

        pool.spawn_workers().await.unwrap();
        assert!(matches!(pool.spawn_workers().await, Err(DeliveryError::InvalidState { .. })));

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn worker_pool_shuts_down_idle_workers_quickly() {
        let config = DeliveryConfig { worker_count: 8, ..Default::default() };
        let (mut pool, _stats) = create_test_worker_pool(config);
        pool.spawn_workers().await.unwrap();

        // Let every worker register with the dispatcher.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let shutdown_start = std::time::Instant::now();
        pool.shutdown_graceful(Duration::from_secs(3))
            .await
            .expect("graceful shutdown should complete within timeout");

        assert!(shutdown_start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unstarted_pool_shuts_down_immediately() {
        let (pool, _stats) = create_test_worker_pool(DeliveryConfig::default());

        let result = pool.shutdown_graceful(Duration::from_millis(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn worker_pool_updates_engine_stats() {
        let config = DeliveryConfig { worker_count: 4, ..Default::default() };
        let (mut pool, stats) = create_test_worker_pool(config);

        assert_eq!(stats.read().await.active_workers, 0);

        pool.spawn_workers().await.expect("workers should spawn successfully");
        assert_eq!(stats.read().await.active_workers, 4);

        pool.shutdown_graceful(Duration::from_secs(1))
            .await
            .expect("graceful shutdown should succeed");
        assert_eq!(stats.read().await.active_workers, 0);
    }
}
