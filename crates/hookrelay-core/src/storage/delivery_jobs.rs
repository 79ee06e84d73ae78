//! Repository for delivery job records.
//!
//! Jobs are append-and-update only: nothing here deletes a row, so dead jobs
//! and requeued predecessors stay available for audit.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{ConsumerId, DeliveryJob, JobCursor, JobId, JobStatus},
};

const JOB_COLUMNS: &str = "id, message_id, channel_id, consumer_id, priority, status, \
                           attempt_count, next_attempt_at, status_changed_at, lock_token, \
                           requeued_from, created_at";

/// Repository for delivery job database operations.
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

    /// Inserts a new delivery job.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, job: &DeliveryJob) -> Result<JobId> {
        self.create_impl(&*self.pool, job).await
    }

    /// Inserts a delivery job within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &DeliveryJob,
    ) -> Result<JobId> {
        self.create_impl(&mut **tx, job).await
    }

    /// Inserts all jobs of one broadcast atomically.
    ///
    /// # Errors
    ///
    /// Returns error if any insert fails; no job is persisted in that case.
    pub async fn create_batch(&self, jobs: &[DeliveryJob]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            self.create_in_tx(&mut tx, job).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_impl<'e, E>(&self, executor: E, job: &DeliveryJob) -> Result<JobId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO delivery_jobs (
                id, message_id, channel_id, consumer_id, priority, status,
                attempt_count, next_attempt_at, status_changed_at, lock_token,
                requeued_from, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
            )
            RETURNING id
            "#,
        )
        .bind(job.id.0)
        .bind(job.message_id.as_str())
        .bind(job.channel_id.as_str())
        .bind(job.consumer_id.as_str())
        .bind(i32::try_from(job.priority).unwrap_or(i32::MAX))
        .bind(job.status.as_str())
        .bind(i32::try_from(job.attempt_count).unwrap_or(i32::MAX))
        .bind(job.next_attempt_at)
        .bind(job.status_changed_at)
        .bind(&job.lock_token)
        .bind(job.requeued_from.map(|id| id.0))
        .bind(job.created_at)
        .fetch_one(executor)
        .await?;

        Ok(JobId(id))
    }

    /// Persists the mutable fields of `job`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the job does not exist.
    pub async fn update(&self, job: &DeliveryJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = $2,
                attempt_count = $3,
                next_attempt_at = $4,
                status_changed_at = GREATEST(status_changed_at, $5),
                lock_token = $6
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(job.status.as_str())
        .bind(i32::try_from(job.attempt_count).unwrap_or(i32::MAX))
        .bind(job.next_attempt_at)
        .bind(job.status_changed_at)
        .bind(&job.lock_token)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("delivery job {}", job.id)));
        }

        Ok(())
    }

    /// Finds a job by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: JobId) -> Result<Option<DeliveryJob>> {
        let job = sqlx::query_as::<_, DeliveryJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM delivery_jobs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }

    /// Lists a consumer's jobs in one status, oldest first by creation.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_by_status(
        &self,
        consumer_id: &ConsumerId,
        status: JobStatus,
        after: Option<JobCursor>,
        limit: usize,
    ) -> Result<Vec<DeliveryJob>> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM delivery_jobs
            WHERE consumer_id = $1
              AND status = $2
              AND ($3::timestamptz IS NULL OR (created_at, id) > ($3, $4))
            ORDER BY created_at ASC, id ASC
            LIMIT $5
            "#
        ))
        .bind(consumer_id.as_str())
        .bind(status.as_str())
        .bind(after.map(|c| c.at))
        .bind(after.map(|c| c.id.0))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(jobs)
    }

    /// Lists a consumer's outstanding dead jobs, oldest status change first.
    ///
    /// Dead jobs that already have a requeued successor are excluded.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_dead(
        &self,
        consumer_id: &ConsumerId,
        after: Option<JobCursor>,
        limit: usize,
    ) -> Result<Vec<DeliveryJob>> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM delivery_jobs AS dead
            WHERE consumer_id = $1
              AND status = 'dead_lettered'
              AND NOT EXISTS (
                  SELECT 1 FROM delivery_jobs AS successor
                  WHERE successor.requeued_from = dead.id
              )
              AND ($2::timestamptz IS NULL OR (status_changed_at, id) > ($2, $3))
            ORDER BY status_changed_at ASC, id ASC
            LIMIT $4
            "#
        ))
        .bind(consumer_id.as_str())
        .bind(after.map(|c| c.at))
        .bind(after.map(|c| c.id.0))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(jobs)
    }

    /// Finds the job created by requeueing `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_successor(&self, id: JobId) -> Result<Option<DeliveryJob>> {
        let job = sqlx::query_as::<_, DeliveryJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM delivery_jobs WHERE requeued_from = $1"
        ))
        .bind(id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }

    /// Lists unfinished jobs of push consumers in creation order.
    ///
    /// Used at startup to rebuild the in-memory queue. Includes jobs left
    /// `dispatched` by a process that died mid-attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_dispatchable(
        &self,
        after: Option<JobCursor>,
        limit: usize,
    ) -> Result<Vec<DeliveryJob>> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(
            r#"
            SELECT j.id, j.message_id, j.channel_id, j.consumer_id, j.priority, j.status,
                   j.attempt_count, j.next_attempt_at, j.status_changed_at, j.lock_token,
                   j.requeued_from, j.created_at
            FROM delivery_jobs AS j
            JOIN consumers AS c ON c.id = j.consumer_id
            WHERE c.kind = 'push'
              AND j.status IN ('queued', 'dispatched')
              AND ($1::timestamptz IS NULL OR (j.created_at, j.id) > ($1, $2))
            ORDER BY j.created_at ASC, j.id ASC
            LIMIT $3
            "#,
        )
        .bind(after.map(|c| c.at))
        .bind(after.map(|c| c.id.0))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(jobs)
    }
}
