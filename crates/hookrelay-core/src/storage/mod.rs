//! Database access layer implementing the repository pattern for broker
//! persistence.
//!
//! The repository layer translates between domain models and database
//! schemas. Lock rows are the single source of truth for which broker
//! process owns a job, so every lock mutation is a single atomic statement.
//!
//! All database operations MUST go through these repositories. Direct SQL
//! queries outside this module are forbidden to maintain consistency.

use std::sync::Arc;

use sqlx::PgPool;

pub mod catalog;
pub mod delivery_jobs;
pub mod locks;

use crate::error::Result;

/// Statements creating the broker schema. Each is idempotent.
pub const SCHEMA: &[(&str, &str)] = &[
    (
        "channels",
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )
        "#,
    ),
    (
        "consumers",
        r#"
        CREATE TABLE IF NOT EXISTS consumers (
            id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL REFERENCES channels(id),
            name TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('push', 'pull')),
            callback_url TEXT,
            CHECK (kind = 'pull' OR callback_url IS NOT NULL)
        )
        "#,
    ),
    (
        "messages",
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL REFERENCES channels(id),
            payload TEXT NOT NULL,
            content_type TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0 CHECK (priority >= 0),
            received_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "delivery_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS delivery_jobs (
            id UUID PRIMARY KEY,
            message_id TEXT NOT NULL REFERENCES messages(id),
            channel_id TEXT NOT NULL REFERENCES channels(id),
            consumer_id TEXT NOT NULL REFERENCES consumers(id),
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TIMESTAMPTZ NOT NULL,
            status_changed_at TIMESTAMPTZ NOT NULL,
            lock_token TEXT,
            requeued_from UUID REFERENCES delivery_jobs(id),
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "broker_locks",
        r#"
        CREATE TABLE IF NOT EXISTS broker_locks (
            lock_key TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "idx_delivery_jobs_consumer_status",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_jobs_consumer_status
        ON delivery_jobs(consumer_id, status, created_at, id)
        "#,
    ),
    (
        "idx_delivery_jobs_dead",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_jobs_dead
        ON delivery_jobs(consumer_id, status_changed_at, id)
        WHERE status = 'dead_lettered'
        "#,
    ),
    (
        "idx_delivery_jobs_requeued_from",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_delivery_jobs_requeued_from
        ON delivery_jobs(requeued_from)
        WHERE requeued_from IS NOT NULL
        "#,
    ),
    (
        "idx_broker_locks_acquired",
        r#"
        CREATE INDEX IF NOT EXISTS idx_broker_locks_acquired
        ON broker_locks(acquired_at)
        "#,
    ),
];

/// Container for all repository instances providing unified database access.
///
/// The `Storage` struct is the entry point for all database operations. It
/// manages a shared connection pool and provides type-safe access to each
/// domain repository.
#[derive(Clone)]
pub struct Storage {
    /// Repository for delivery job records.
    pub delivery_jobs: Arc<delivery_jobs::Repository>,

    /// Repository for cross-process locks.
    pub locks: Arc<locks::Repository>,

    /// Repository for channels, consumers and messages.
    pub catalog: Arc<catalog::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    ///
    /// All repositories share the same pool with Arc for efficient resource
    /// usage.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            delivery_jobs: Arc::new(delivery_jobs::Repository::new(pool.clone())),
            locks: Arc::new(locks::Repository::new(pool.clone())),
            catalog: Arc::new(catalog::Repository::new(pool)),
        }
    }

    /// Creates every broker table and index that does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        let pool = self.delivery_jobs.pool();
        for (_name, statement) in SCHEMA {
            sqlx::query(statement).execute(&*pool).await?;
        }
        Ok(())
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.delivery_jobs.pool()).await?;

        Ok(())
    }
}
