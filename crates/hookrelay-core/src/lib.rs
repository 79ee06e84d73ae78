//! Core domain models for the hookrelay broker.
//!
//! Provides strongly-typed identifiers, the delivery job state machine, lock
//! records, the clock abstraction and PostgreSQL repositories. The delivery
//! engine and the binary both build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    Channel, ChannelId, Consumer, ConsumerId, ConsumerKind, DeliveryJob, JobCursor, JobId,
    JobStatus, Lock, LockKey, Message, MessageId,
};
pub use time::{Clock, RealClock, TestClock};
