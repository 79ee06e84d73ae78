//! Repository for channels, consumers and messages.
//!
//! These records belong to the API layer. The broker reads them to resolve
//! delivery targets and only writes messages it accepts for dispatch.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Channel, ChannelId, Consumer, ConsumerId, Message, MessageId},
};

/// Repository for catalog lookups.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds a channel by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_channel(&self, id: &ChannelId) -> Result<Option<Channel>> {
        let channel = sqlx::query_as::<_, Channel>("SELECT id, name FROM channels WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await?;

        Ok(channel)
    }

    /// Finds a consumer by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query or row decoding fails.
    pub async fn find_consumer(&self, id: &ConsumerId) -> Result<Option<Consumer>> {
        let consumer = sqlx::query_as::<_, Consumer>(
            r#"
            SELECT id, channel_id, name, kind, callback_url
            FROM consumers
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        Ok(consumer)
    }

    /// Lists every consumer subscribed to a channel.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_consumers(&self, channel_id: &ChannelId) -> Result<Vec<Consumer>> {
        let consumers = sqlx::query_as::<_, Consumer>(
            r#"
            SELECT id, channel_id, name, kind, callback_url
            FROM consumers
            WHERE channel_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(channel_id.as_str())
        .fetch_all(&*self.pool)
        .await?;

        Ok(consumers)
    }

    /// Finds a message by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_message(&self, id: &MessageId) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(
            r#"
            SELECT id, channel_id, payload, content_type, priority, received_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        Ok(message)
    }

    /// Stores a message accepted for dispatch. Re-saving the same id is a
    /// no-op, so a retried broadcast does not fail.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails, e.g. for an unknown channel.
    pub async fn save_message(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, channel_id, payload, content_type, priority, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id.as_str())
        .bind(message.channel_id.as_str())
        .bind(&message.payload)
        .bind(&message.content_type)
        .bind(i32::try_from(message.priority).unwrap_or(i32::MAX))
        .bind(message.received_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Registers a channel. Used by fixtures and operator tooling.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (id, name) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(channel.id.as_str())
        .bind(&channel.name)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Registers or updates a consumer. Used by fixtures and operator tooling.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn upsert_consumer(&self, consumer: &Consumer) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO consumers (id, channel_id, name, kind, callback_url)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET channel_id = EXCLUDED.channel_id,
                name = EXCLUDED.name,
                kind = EXCLUDED.kind,
                callback_url = EXCLUDED.callback_url
            "#,
        )
        .bind(consumer.id.as_str())
        .bind(consumer.channel_id.as_str())
        .bind(&consumer.name)
        .bind(consumer.kind.as_str())
        .bind(consumer.kind.callback_url())
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
