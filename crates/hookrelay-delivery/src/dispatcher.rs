//! Hands queued jobs to idle workers.
//!
//! Idle workers register a one-shot slot on a bounded channel. The
//! dispatcher pairs the next visible job with the next registered slot, so a
//! job only leaves the queue once a worker is ready for it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{queue::JobQueue, worker::WorkerSlot};

/// Single task pairing jobs with idle workers.
pub struct Dispatcher {
    queue: Arc<JobQueue>,
    registrations: mpsc::Receiver<WorkerSlot>,
    cancellation_token: CancellationToken,
}

impl Dispatcher {
    /// Creates a dispatcher reading worker slots from `registrations`.
    pub fn new(
        queue: Arc<JobQueue>,
        registrations: mpsc::Receiver<WorkerSlot>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { queue, registrations, cancellation_token }
    }

    /// Runs until cancelled or every worker is gone.
    ///
    /// A job already taken from the queue when the dispatcher stops, or
    /// whose worker vanished before accepting it, goes back to the front of
    /// the queue.
    pub async fn run(mut self) {
        info!("dispatcher started");

        loop {
            let Some(job) = self.queue.dequeue(&self.cancellation_token).await else {
                break;
            };

            let slot = tokio::select! {
                slot = self.registrations.recv() => slot,
                () = self.cancellation_token.cancelled() => None,
            };

            let Some(slot) = slot else {
                self.queue.push_front(job).await;
                break;
            };

            if let Err(job) = slot.send(job) {
                debug!(job_id = %job.id, "worker left before hand-off, requeueing job");
                self.queue.push_front(job).await;
            }
        }

        info!("dispatcher stopped");
    }
}
