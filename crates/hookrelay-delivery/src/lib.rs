//! Delivery dispatch engine for the hookrelay broker.
//!
//! Turns every published message into one delivery job per subscribed
//! consumer, pushes jobs to callback URLs through a bounded worker pool,
//! retries failures with backoff and parks exhausted jobs in a dead-letter
//! queue until an operator requeues them.
//!
//! # Architecture
//!
//! A single dispatcher task pairs queued jobs with idle workers. Each worker
//! runs one job at a time through the executor:
//!
//! 1. **Lock** - take the job lock; skip the job if another holder owns it
//! 2. **Reload** - re-read the job and drop it if it already finished
//! 3. **Deliver** - POST the payload to the consumer's callback URL
//! 4. **Record** - mark delivered, or hand the failure to the retry scheduler
//!
//! Locks live in storage, so any number of broker processes can share one
//! database without delivering the same job twice at the same time.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookrelay_core::RealClock;
//! use hookrelay_delivery::{
//!     storage::memory::InMemoryStorage, DeliveryConfig, DeliveryEngine, DeliveryError,
//! };
//!
//! # async fn example() -> std::result::Result<(), DeliveryError> {
//! let storage = Arc::new(InMemoryStorage::new());
//! let mut engine =
//!     DeliveryEngine::new(storage, DeliveryConfig::default(), Arc::new(RealClock::new()))?;
//!
//! engine.start().await?;
//! engine.recover().await?;
//! # engine.shutdown().await
//! # }
//! ```

pub mod client;
pub mod dispatcher;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod lock;
pub mod pagination;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod worker;
pub mod worker_pool;

// Re-export main public API
pub use dlq::RequeueTarget;
pub use engine::{DeadJobView, DeliveryConfig, DeliveryEngine, EngineStats, QueuedJobView};
pub use error::{DeliveryError, Result};
pub use pagination::{Page, PageRequest};
pub use queue::QueueOrdering;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
pub use worker::ExecutionOutcome;

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 50;

/// Default admission limit of the job queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000_000;

/// Default number of jobs loaded per round trip during startup recovery.
pub const DEFAULT_RECOVERY_BATCH_SIZE: usize = 500;
