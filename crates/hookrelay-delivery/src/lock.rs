//! Cross-process lock coordination.
//!
//! Every broker process sharing a storage backend coordinates through the
//! same lock records: a worker must hold `job:{id}` before dispatching a job,
//! and operator actions on a consumer's dead-letter queue hold
//! `consumer:{id}`. Locks expire after a TTL so a crashed holder cannot
//! block a job forever, and a background sweeper reclaims stale rows.

use std::{sync::Arc, time::Duration};

use hookrelay_core::{
    models::{Lock, LockKey},
    Clock,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::Result, storage::DeliveryStorage};

/// Acquires, releases and reclaims locks on behalf of the engine.
#[derive(Clone)]
pub struct LockCoordinator {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl LockCoordinator {
    /// Creates a coordinator issuing locks valid for `ttl`.
    pub fn new(storage: Arc<dyn DeliveryStorage>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { storage, clock, ttl }
    }

    /// Lifetime of locks issued by this coordinator.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Takes `key` for `holder` unless another holder's lock is still live.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::LockContention` if the key is held, or
    /// `DeliveryError::StorageError` if the lock store is unreachable.
    pub async fn try_lock(&self, key: LockKey, holder: &str) -> Result<Lock> {
        let lock = Lock::new(key, holder, self.clock.now_utc(), self.ttl);
        self.storage.try_lock(lock.clone()).await?;
        debug!(lock_key = %lock.key, holder, "lock acquired");
        Ok(lock)
    }

    /// Releases `key` if `holder` still owns it.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::LockNotHeld` if the lock expired and was taken
    /// over, or was never held by `holder`.
    pub async fn release(&self, key: &LockKey, holder: &str) -> Result<()> {
        self.storage.release_lock(key.clone(), holder.to_string()).await?;
        debug!(lock_key = %key, holder, "lock released");
        Ok(())
    }

    /// Releases a lock whose loss would not change the outcome, logging
    /// instead of failing.
    pub async fn release_quietly(&self, key: &LockKey, holder: &str) {
        if let Err(error) = self.release(key, holder).await {
            warn!(lock_key = %key, holder, error = %error, "failed to release lock");
        }
    }

    /// Deletes every lock acquired more than `threshold` ago.
    ///
    /// # Errors
    ///
    /// Returns error if the lock store is unreachable.
    pub async fn timeout_locks(&self, threshold: Duration) -> Result<u64> {
        let threshold =
            chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = self.clock.now_utc() - threshold;
        let reclaimed = self.storage.timeout_locks(cutoff).await?;
        if reclaimed > 0 {
            info!(reclaimed, %cutoff, "reclaimed stale locks");
        }
        Ok(reclaimed)
    }

    /// Spawns the background sweeper that runs `timeout_locks(threshold)`
    /// every `interval` until `cancel` fires.
    ///
    /// The interval is measured in real time regardless of the injected
    /// clock.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        threshold: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = coordinator.timeout_locks(threshold).await {
                            warn!(error = %error, "lock sweep failed");
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }

            debug!("lock sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use hookrelay_core::TestClock;

    use super::*;
    use crate::{error::DeliveryError, storage::memory::InMemoryStorage};

    fn coordinator(ttl: Duration) -> (LockCoordinator, Arc<TestClock>, InMemoryStorage) {
        let storage = InMemoryStorage::new();
        let clock = Arc::new(TestClock::new());
        let coordinator = LockCoordinator::new(Arc::new(storage.clone()), clock.clone(), ttl);
        (coordinator, clock, storage)
    }

    #[tokio::test]
    async fn live_lock_excludes_other_holders() {
        let (locks, _clock, _storage) = coordinator(Duration::from_secs(60));
        let key = LockKey("job:a".into());

        locks.try_lock(key.clone(), "w1").await.unwrap();
        let err = locks.try_lock(key.clone(), "w2").await.unwrap_err();
        assert!(matches!(err, DeliveryError::LockContention { .. }));
    }

    #[tokio::test]
    async fn lock_is_free_once_ttl_elapses() {
        let (locks, clock, _storage) = coordinator(Duration::from_secs(60));
        let key = LockKey("job:a".into());

        locks.try_lock(key.clone(), "w1").await.unwrap();
        clock.advance(Duration::from_secs(60));

        let lock = locks.try_lock(key.clone(), "w2").await.unwrap();
        assert_eq!(lock.holder, "w2");

        let err = locks.release(&key, "w1").await.unwrap_err();
        assert!(matches!(err, DeliveryError::LockNotHeld { .. }));
    }

    #[tokio::test]
    async fn timeout_reclaims_only_old_locks() {
        let (locks, clock, storage) = coordinator(Duration::from_secs(600));

        locks.try_lock(LockKey("job:old".into()), "w1").await.unwrap();
        clock.advance(Duration::from_secs(120));
        locks.try_lock(LockKey("job:new".into()), "w1").await.unwrap();

        let reclaimed = locks.timeout_locks(Duration::from_secs(60)).await.unwrap();
        assert_eq!(reclaimed, 1);
        assert!(storage.lock(&LockKey("job:old".into())).await.is_none());
        assert!(storage.lock(&LockKey("job:new".into())).await.is_some());
    }

    #[tokio::test]
    async fn concurrent_acquisition_has_single_winner() {
        let (locks, _clock, _storage) = coordinator(Duration::from_secs(60));
        let key = LockKey("consumer:c1".into());

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let locks = locks.clone();
                let key = key.clone();
                tokio::spawn(async move { locks.try_lock(key, &format!("w{i}")).await.is_ok() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let (locks, _clock, _storage) = coordinator(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let handle =
            locks.spawn_sweeper(Duration::from_millis(10), Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
