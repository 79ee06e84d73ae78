//! Repository for cross-process broker locks.
//!
//! Every broker process sharing the database coordinates through these rows.
//! Acquisition is a single conditional upsert, so concurrent callers racing
//! for the same key cannot both win.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{Lock, LockKey},
};

/// Repository for lock rows in `broker_locks`.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Atomically takes `lock` if its key is free or its current holder's
    /// lock has expired.
    ///
    /// The upsert only overwrites an existing row when that row expired at or
    /// before the new lock's `acquired_at`. Zero affected rows means a live
    /// lock is held by someone else.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LockContention` if a live lock exists, or
    /// `CoreError::Database` on query failure.
    pub async fn try_lock(&self, lock: &Lock) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO broker_locks (lock_key, holder, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (lock_key) DO UPDATE
            SET holder = EXCLUDED.holder,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE broker_locks.expires_at <= EXCLUDED.acquired_at
            "#,
        )
        .bind(lock.key.as_str())
        .bind(&lock.holder)
        .bind(lock.acquired_at)
        .bind(lock.expires_at)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::LockContention { key: lock.key.to_string() });
        }

        Ok(())
    }

    /// Releases the lock on `key` if `holder` still owns it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LockNotHeld` if no row matches both key and
    /// holder, which includes locks already taken over after expiry.
    pub async fn release(&self, key: &LockKey, holder: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM broker_locks
            WHERE lock_key = $1 AND holder = $2
            "#,
        )
        .bind(key.as_str())
        .bind(holder)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::LockNotHeld {
                key: key.to_string(),
                holder: holder.to_string(),
            });
        }

        Ok(())
    }

    /// Deletes every lock acquired before `cutoff`. Returns how many rows
    /// were reclaimed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn timeout_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM broker_locks
            WHERE acquired_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Finds the lock row for `key`, live or expired.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, key: &LockKey) -> Result<Option<Lock>> {
        let lock = sqlx::query_as::<_, Lock>(
            r#"
            SELECT lock_key, holder, acquired_at, expires_at
            FROM broker_locks
            WHERE lock_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        Ok(lock)
    }
}
