//! Bounded in-memory job queue with delayed visibility.
//!
//! The queue is a per-process dispatch buffer; storage stays the source of
//! truth. New jobs take one of `capacity` admission permits and `enqueue`
//! waits while none are free, so producers slow down instead of losing
//! jobs. Retries and jobs handed back by the dispatcher skip admission:
//! they were already admitted once, and blocking them could stall the only
//! task that frees permits.
//!
//! Jobs scheduled for later sit in a min-heap keyed by visibility time and
//! move to the ready heap when due.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use hookrelay_core::{models::DeliveryJob, Clock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, Result};

/// Order in which ready jobs leave the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOrdering {
    /// Strict arrival order.
    #[default]
    Fifo,
    /// Higher message priority first, arrival order within a priority.
    Priority,
}

struct ReadyEntry {
    rank: u32,
    seq: i64,
    holds_permit: bool,
    job: DeliveryJob,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for ReadyEntry {}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher rank wins, then the lower sequence number.
        self.rank.cmp(&other.rank).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct DelayedEntry {
    visible_at: DateTime<Utc>,
    seq: i64,
    job: DeliveryJob,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for DelayedEntry {}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.visible_at.cmp(&self.visible_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    next_seq: i64,
    next_front_seq: i64,
}

impl QueueState {
    fn promote_due(&mut self, now: DateTime<Utc>, ordering: QueueOrdering) {
        while self.delayed.peek().is_some_and(|entry| entry.visible_at <= now) {
            if let Some(entry) = self.delayed.pop() {
                let seq = self.take_seq();
                self.ready.push(ReadyEntry {
                    rank: rank(ordering, &entry.job),
                    seq,
                    holds_permit: false,
                    job: entry.job,
                });
            }
        }
    }

    fn take_seq(&mut self) -> i64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn take_front_seq(&mut self) -> i64 {
        self.next_front_seq -= 1;
        self.next_front_seq
    }
}

fn rank(ordering: QueueOrdering, job: &DeliveryJob) -> u32 {
    match ordering {
        QueueOrdering::Fifo => 0,
        QueueOrdering::Priority => job.priority,
    }
}

/// Bounded, optionally priority-ordered queue of jobs awaiting dispatch.
pub struct JobQueue {
    state: Mutex<QueueState>,
    permits: Semaphore,
    notify: Notify,
    capacity: usize,
    ordering: QueueOrdering,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    /// Creates an empty queue admitting at most `capacity` new jobs at once.
    pub fn new(capacity: usize, ordering: QueueOrdering, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            state: Mutex::new(QueueState::default()),
            permits: Semaphore::new(capacity),
            notify: Notify::new(),
            capacity,
            ordering,
            clock,
        }
    }

    /// Admission limit for new jobs.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ordering applied to ready jobs.
    pub fn ordering(&self) -> QueueOrdering {
        self.ordering
    }

    /// Adds a new job, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShuttingDown` if `cancel` fires before space
    /// frees up. The job is not queued in that case.
    pub async fn enqueue(&self, job: DeliveryJob, cancel: &CancellationToken) -> Result<()> {
        let permit = tokio::select! {
            permit = self.permits.acquire() => {
                permit.map_err(|_| DeliveryError::ShuttingDown)?
            }
            () = cancel.cancelled() => return Err(DeliveryError::ShuttingDown),
        };
        permit.forget();

        let mut state = self.state.lock().await;
        let seq = state.take_seq();
        let rank = rank(self.ordering, &job);
        state.ready.push(ReadyEntry { rank, seq, holds_permit: true, job });
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    /// Adds a job that must stay invisible until `visible_at`.
    pub async fn enqueue_delayed(&self, job: DeliveryJob, visible_at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        let seq = state.take_seq();
        state.delayed.push(DelayedEntry { visible_at, seq, job });
        drop(state);

        self.notify.notify_one();
    }

    /// Returns a dequeued job to the head of its priority class.
    pub async fn push_front(&self, job: DeliveryJob) {
        let mut state = self.state.lock().await;
        let seq = state.take_front_seq();
        state.ready.push(ReadyEntry {
            rank: rank(self.ordering, &job),
            seq,
            holds_permit: false,
            job,
        });
        drop(state);

        self.notify.notify_one();
    }

    /// Removes the next visible job without waiting.
    pub async fn try_dequeue(&self) -> Option<DeliveryJob> {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().await;
        state.promote_due(now, self.ordering);
        let entry = state.ready.pop()?;
        drop(state);

        if entry.holds_permit {
            self.permits.add_permits(1);
        }
        Some(entry.job)
    }

    /// Waits for the next visible job.
    ///
    /// Returns `None` once `cancel` fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<DeliveryJob> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            if let Some(job) = self.try_dequeue().await {
                return Some(job);
            }

            let wait = self.next_visible_in().await;
            match wait {
                Some(wait) => {
                    tokio::select! {
                        () = self.notify.notified() => {}
                        () = self.clock.sleep(wait) => {}
                        () = cancel.cancelled() => return None,
                    }
                },
                None => {
                    tokio::select! {
                        () = self.notify.notified() => {}
                        () = cancel.cancelled() => return None,
                    }
                },
            }
        }
    }

    /// Number of jobs held, ready or delayed.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.delayed.len()
    }

    /// Whether the queue holds no jobs at all.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of delayed jobs not yet visible.
    pub async fn delayed_len(&self) -> usize {
        self.state.lock().await.delayed.len()
    }

    async fn next_visible_in(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        let visible_at = state.delayed.peek()?.visible_at;
        Some((visible_at - self.clock.now_utc()).to_std().unwrap_or(Duration::ZERO))
    }
}
