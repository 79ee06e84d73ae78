//! Core domain models and strongly-typed identifiers.
//!
//! Defines delivery jobs, locks, and the read-only channel, consumer and
//! message references the broker dispatches against. Includes database
//! serialization traits and the job state machine.

use std::{fmt, time::Duration};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed delivery job identifier.
///
/// Backed by a UUIDv7 so identifiers sort by creation time. A requeued job
/// always receives a fresh identifier; the dead record keeps its own.
///
/// # Example
///
/// ```
/// use hookrelay_core::models::JobId;
/// let first = JobId::new();
/// let second = JobId::new();
/// assert_ne!(first, second);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new time-ordered job ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Declares a string-backed identifier owned by the API layer.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <String as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(s))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

string_id!(
    /// Identifier of a named channel producers broadcast to.
    ChannelId
);

string_id!(
    /// Identifier of a consumer subscribed to a channel.
    ConsumerId
);

string_id!(
    /// Identifier of a broadcast message.
    MessageId
);

/// A named channel. Read-only from the broker's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Channel {
    /// Channel identifier.
    pub id: ChannelId,
    /// Human-readable channel name.
    pub name: String,
}

/// How a consumer receives its jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsumerKind {
    /// The broker POSTs each message to `callback_url`.
    Push {
        /// Destination of the outbound delivery call.
        callback_url: String,
    },
    /// The consumer polls for queued jobs and claims them.
    Pull,
}

impl ConsumerKind {
    /// Returns the database label for this kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Push { .. } => "push",
            Self::Pull => "pull",
        }
    }

    /// Returns the callback URL for push consumers.
    pub fn callback_url(&self) -> Option<&str> {
        match self {
            Self::Push { callback_url } => Some(callback_url),
            Self::Pull => None,
        }
    }
}

/// A consumer subscribed to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumer {
    /// Consumer identifier.
    pub id: ConsumerId,
    /// Channel the consumer subscribes to.
    pub channel_id: ChannelId,
    /// Human-readable consumer name, reported as the DLQ listener name.
    pub name: String,
    /// Push or pull delivery.
    pub kind: ConsumerKind,
}

impl Consumer {
    /// Creates a push consumer delivering to `callback_url`.
    pub fn push(
        id: impl Into<ConsumerId>,
        channel_id: impl Into<ChannelId>,
        callback_url: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            channel_id: channel_id.into(),
            kind: ConsumerKind::Push { callback_url: callback_url.into() },
        }
    }

    /// Creates a pull consumer.
    pub fn pull(id: impl Into<ConsumerId>, channel_id: impl Into<ChannelId>) -> Self {
        let id = id.into();
        Self { name: id.to_string(), id, channel_id: channel_id.into(), kind: ConsumerKind::Pull }
    }

    /// Returns true for push consumers.
    pub const fn is_push(&self) -> bool {
        matches!(self.kind, ConsumerKind::Push { .. })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Consumer {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        let kind: String = row.try_get("kind")?;
        let callback_url: Option<String> = row.try_get("callback_url")?;
        let kind = match (kind.as_str(), callback_url) {
            ("push", Some(callback_url)) => ConsumerKind::Push { callback_url },
            ("push", None) => {
                return Err(sqlx::Error::Decode("push consumer without callback_url".into()))
            },
            ("pull", _) => ConsumerKind::Pull,
            (other, _) => {
                return Err(sqlx::Error::Decode(format!("invalid consumer kind: {other}").into()))
            },
        };

        Ok(Self {
            id: row.try_get("id")?,
            channel_id: row.try_get("channel_id")?,
            name: row.try_get("name")?,
            kind,
        })
    }
}

/// An immutable broadcast message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier.
    pub id: MessageId,
    /// Channel the message was broadcast to.
    pub channel_id: ChannelId,
    /// Raw payload, delivered byte for byte.
    pub payload: String,
    /// MIME type sent as the `Content-Type` of push deliveries.
    pub content_type: String,
    /// Dispatch priority; higher values go first when priority dispatch is
    /// enabled.
    pub priority: u32,
    /// When the broker accepted the message.
    pub received_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Message {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        let priority: i32 = row.try_get("priority")?;
        Ok(Self {
            id: row.try_get("id")?,
            channel_id: row.try_get("channel_id")?,
            payload: row.try_get("payload")?,
            content_type: row.try_get("content_type")?,
            priority: priority
                .try_into()
                .map_err(|_| sqlx::Error::Decode("priority cannot be negative".into()))?,
            received_at: row.try_get("received_at")?,
        })
    }
}

/// Delivery job lifecycle status.
///
/// State transitions:
/// ```text
/// Queued -> Dispatched -> Delivered
///   ^           |
///   +-- retry --+-> DeadLettered --requeue--> (new job) Queued
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker, or for a pull consumer to claim it.
    Queued,

    /// A worker holds the job lock and is attempting delivery.
    Dispatched,

    /// Terminal success state.
    Delivered,

    /// Attempts exhausted. Stays here until an operator requeues it.
    DeadLettered,
}

impl JobStatus {
    /// Returns the database label for this status.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Delivered => "delivered",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "dispatched" => Ok(Self::Dispatched),
            "delivered" => Ok(Self::Delivered),
            "dead_lettered" => Ok(Self::DeadLettered),
            _ => Err(CoreError::InvalidInput(format!("invalid job status: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(|e: CoreError| e.to_string().into())
    }
}

impl sqlx::Encode<'_, PgDb> for JobStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// One scheduled attempt chain delivering a message to one consumer.
///
/// Jobs are never deleted. Every mutation goes through the transition
/// methods below, which reject illegal moves with `CoreError::InvalidState`
/// and keep `status_changed_at` monotonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Unique, time-sortable identifier.
    pub id: JobId,

    /// Message being delivered.
    pub message_id: MessageId,

    /// Channel owning the message.
    pub channel_id: ChannelId,

    /// Consumer the message is delivered to.
    pub consumer_id: ConsumerId,

    /// Priority copied from the message.
    pub priority: u32,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Number of delivery attempts started for this job.
    pub attempt_count: u32,

    /// The job must not be dispatched before this instant.
    pub next_attempt_at: DateTime<Utc>,

    /// When `status` last changed. Never decreases.
    pub status_changed_at: DateTime<Utc>,

    /// Holder token of the worker that dispatched the job.
    pub lock_token: Option<String>,

    /// Dead job this one was requeued from, if any.
    pub requeued_from: Option<JobId>,

    /// When this job record was created.
    pub created_at: DateTime<Utc>,
}

impl DeliveryJob {
    /// Creates a queued job delivering `message` to `consumer`.
    pub fn new(message: &Message, consumer: &Consumer, now: DateTime<Utc>) -> Self {
        let now = stored_precision(now);
        Self {
            id: JobId::new(),
            message_id: message.id.clone(),
            channel_id: message.channel_id.clone(),
            consumer_id: consumer.id.clone(),
            priority: message.priority,
            status: JobStatus::Queued,
            attempt_count: 0,
            next_attempt_at: now,
            status_changed_at: now,
            lock_token: None,
            requeued_from: None,
            created_at: now,
        }
    }

    /// Whether the job may be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at <= now
    }

    /// Keyset position of this job in creation order.
    pub fn created_cursor(&self) -> JobCursor {
        JobCursor { at: self.created_at, id: self.id }
    }

    /// Keyset position of this job in status-change order.
    pub fn status_cursor(&self) -> JobCursor {
        JobCursor { at: self.status_changed_at, id: self.id }
    }

    /// Starts a delivery attempt under `holder`'s lock.
    ///
    /// A job still marked `Dispatched` whose lock the caller just acquired
    /// was abandoned by a crashed holder; it is dispatched again and the
    /// abandoned attempt stays counted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the job is delivered or dead-lettered.
    pub fn mark_dispatched(&mut self, holder: &str, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(&[JobStatus::Queued, JobStatus::Dispatched], "dispatch")?;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.lock_token = Some(holder.to_string());
        self.transition(JobStatus::Dispatched, now);
        Ok(())
    }

    /// Records a successful push delivery.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the job is dispatched.
    pub fn mark_delivered(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(&[JobStatus::Dispatched], "deliver")?;
        self.lock_token = None;
        self.transition(JobStatus::Delivered, now);
        Ok(())
    }

    /// Records a pull consumer claiming the job.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the job is queued.
    pub fn mark_consumed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(&[JobStatus::Queued], "consume")?;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.lock_token = None;
        self.transition(JobStatus::Delivered, now);
        Ok(())
    }

    /// Returns a failed attempt to the queue, invisible until
    /// `next_attempt_at`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the job is dispatched.
    pub fn schedule_retry(
        &mut self,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.expect_status(&[JobStatus::Dispatched], "retry")?;
        self.next_attempt_at = stored_precision(next_attempt_at);
        self.lock_token = None;
        self.transition(JobStatus::Queued, now);
        Ok(())
    }

    /// Demotes the job to the dead-letter queue.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the job is dispatched and has used at
    /// least `max_attempts` attempts.
    pub fn mark_dead_lettered(&mut self, max_attempts: u32, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(&[JobStatus::Dispatched], "dead-letter")?;
        if self.attempt_count < max_attempts {
            return Err(CoreError::InvalidState(format!(
                "job {} has used {} of {} attempts",
                self.id, self.attempt_count, max_attempts
            )));
        }
        self.lock_token = None;
        self.transition(JobStatus::DeadLettered, now);
        Ok(())
    }

    /// Builds the fresh job that replaces this dead one on requeue.
    ///
    /// The dead record itself is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the job is dead-lettered.
    pub fn requeued(&self, now: DateTime<Utc>) -> Result<Self> {
        self.expect_status(&[JobStatus::DeadLettered], "requeue")?;
        let now = stored_precision(now);
        Ok(Self {
            id: JobId::new(),
            message_id: self.message_id.clone(),
            channel_id: self.channel_id.clone(),
            consumer_id: self.consumer_id.clone(),
            priority: self.priority,
            status: JobStatus::Queued,
            attempt_count: 0,
            next_attempt_at: now,
            status_changed_at: now,
            lock_token: None,
            requeued_from: Some(self.id),
            created_at: now,
        })
    }

    fn expect_status(&self, allowed: &[JobStatus], action: &str) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(CoreError::InvalidState(format!(
                "cannot {action} job {} in status {}",
                self.id, self.status
            )))
        }
    }

    fn transition(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.status_changed_at = self.status_changed_at.max(stored_precision(now));
    }
}

/// Truncates `at` to the microsecond precision PostgreSQL stores, so a job
/// orders and pages the same in memory as after a database round trip.
fn stored_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryJob {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        let requeued_from: Option<uuid::Uuid> = row.try_get("requeued_from")?;
        Ok(Self {
            id: row.try_get("id")?,
            message_id: row.try_get("message_id")?,
            channel_id: row.try_get("channel_id")?,
            consumer_id: row.try_get("consumer_id")?,
            priority: {
                let val: i32 = row.try_get("priority")?;
                val.try_into()
                    .map_err(|_| sqlx::Error::Decode("priority cannot be negative".into()))?
            },
            status: row.try_get("status")?,
            attempt_count: {
                let val: i32 = row.try_get("attempt_count")?;
                val.try_into()
                    .map_err(|_| sqlx::Error::Decode("attempt_count cannot be negative".into()))?
            },
            next_attempt_at: row.try_get("next_attempt_at")?,
            status_changed_at: row.try_get("status_changed_at")?,
            lock_token: row.try_get("lock_token")?,
            requeued_from: requeued_from.map(JobId),
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Keyset pagination position: a timestamp plus the job id tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobCursor {
    /// Ordering timestamp of the last item already returned.
    pub at: DateTime<Utc>,
    /// Id of the last item already returned.
    pub id: JobId,
}

/// Key of a lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockKey(pub String);

impl LockKey {
    /// Lock guarding a single delivery job.
    pub fn job(id: JobId) -> Self {
        Self(format!("job:{id}"))
    }

    /// Lock guarding operator actions on a consumer.
    pub fn consumer(id: &ConsumerId) -> Self {
        Self(format!("consumer:{id}"))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A time-bounded exclusive claim on a resource key.
///
/// At most one non-expired lock exists per key. An expired lock is free
/// even while its row still exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Resource being protected.
    pub key: LockKey,
    /// Token identifying the owner.
    pub holder: String,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
    /// When the lock stops being valid.
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    /// Creates a lock record for `holder` valid for `ttl` from `now`.
    pub fn new(key: LockKey, holder: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        Self { key, holder: holder.into(), acquired_at: now, expires_at: now + ttl }
    }

    /// Whether the lock no longer excludes other holders at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Lock {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        let key: String = row.try_get("lock_key")?;
        Ok(Self {
            key: LockKey(key),
            holder: row.try_get("holder")?,
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(priority: u32) -> Message {
        Message {
            id: "msg-1".into(),
            channel_id: "orders".into(),
            payload: r#"{"id":1}"#.to_string(),
            content_type: "application/json".to_string(),
            priority,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn job_status_display_format() {
        assert_eq!(JobStatus::Queued.to_string(), "queued");
        assert_eq!(JobStatus::Dispatched.to_string(), "dispatched");
        assert_eq!(JobStatus::Delivered.to_string(), "delivered");
        assert_eq!(JobStatus::DeadLettered.to_string(), "dead_lettered");
    }

    #[test]
    fn job_status_parses_database_labels() {
        for status in [
            JobStatus::Queued,
            JobStatus::Dispatched,
            JobStatus::Delivered,
            JobStatus::DeadLettered,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("pending".parse::<JobStatus>().is_err());
    }

    #[test]
    fn new_job_copies_message_priority() {
        let consumer = Consumer::pull("c1", "orders");
        let job = DeliveryJob::new(&message(7), &consumer, Utc::now());

        assert_eq!(job.priority, 7);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 0);
        assert!(job.requeued_from.is_none());
    }

    #[test]
    fn job_timestamps_keep_microsecond_precision() {
        let now = DateTime::from_timestamp(1_714_554_000, 123_456_789).unwrap();
        let consumer = Consumer::push("c1", "orders", "http://localhost/hook");
        let mut job = DeliveryJob::new(&message(0), &consumer, now);

        assert_eq!(job.created_at.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(job.created_cursor().at, job.created_at);

        let later = now + chrono::Duration::nanoseconds(999);
        job.mark_dispatched("w1", later).unwrap();
        job.schedule_retry(later + chrono::Duration::nanoseconds(1_500), later).unwrap();
        assert_eq!(job.status_changed_at.timestamp_subsec_nanos(), 123_457_000);
        assert_eq!(job.next_attempt_at.timestamp_subsec_nanos(), 123_459_000);
    }

    #[test]
    fn status_changed_at_never_moves_backwards() {
        let now = Utc::now();
        let consumer = Consumer::push("c1", "orders", "http://localhost/hook");
        let mut job = DeliveryJob::new(&message(0), &consumer, now);

        job.mark_dispatched("w1", now - chrono::Duration::seconds(30)).unwrap();

        assert_eq!(job.status_changed_at, now.trunc_subsecs(6));
    }

    #[test]
    fn delivered_job_cannot_be_dispatched_again() {
        let now = Utc::now();
        let consumer = Consumer::push("c1", "orders", "http://localhost/hook");
        let mut job = DeliveryJob::new(&message(0), &consumer, now);
        job.mark_dispatched("w1", now).unwrap();
        job.mark_delivered(now).unwrap();

        let err = job.mark_dispatched("w2", now).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
    }

    #[test]
    fn lock_keys_are_namespaced() {
        let id = JobId::new();
        assert_eq!(LockKey::job(id).to_string(), format!("job:{id}"));
        assert_eq!(LockKey::consumer(&"c9".into()).as_str(), "consumer:c9");
    }

    #[test]
    fn lock_expires_at_ttl_boundary() {
        let now = Utc::now();
        let lock = Lock::new(LockKey("job:x".into()), "w1", now, Duration::from_secs(10));

        assert!(!lock.is_expired(now + chrono::Duration::seconds(9)));
        assert!(lock.is_expired(now + chrono::Duration::seconds(10)));
    }
}
