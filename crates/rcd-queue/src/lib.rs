//! In-memory FIFO job queue with a single background worker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rcd_core::{Job, QueueSnapshot};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "rcd-queue";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full (max depth {max_depth})")]
    Full { max_depth: usize },
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Job>,
    processing: bool,
}

/// Owner of all queue state. Every operation takes the internal lock, so
/// concurrent HTTP handlers and the worker observe a consistent view; nothing
/// outside this type ever touches the pending list or the processing flag.
///
/// Queue contents are in-memory only and lost on restart.
#[derive(Debug)]
pub struct JobQueueManager {
    max_depth: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueueManager {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Append a job and wake the worker. Rejected when the pending list is
    /// already at `max_depth`; callers surface that as backpressure rather
    /// than letting unserviced requests pile up without bound.
    pub fn enqueue(&self, job: Job) -> Result<QueueSnapshot, QueueError> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.pending.len() >= self.max_depth {
            return Err(QueueError::Full {
                max_depth: self.max_depth,
            });
        }
        state.pending.push_back(job);
        let snapshot = snapshot_of(&state);
        drop(state);
        self.notify.notify_one();
        Ok(snapshot)
    }

    /// Point-in-time view: `position` counts pending jobs plus the one in
    /// flight, so it drains monotonically to zero as the worker catches up.
    pub fn snapshot(&self) -> QueueSnapshot {
        snapshot_of(&self.state.lock().expect("queue lock poisoned"))
    }

    /// Pop the next job and mark the queue processing, or `None` when idle
    /// or a job is already in flight.
    fn try_begin(&self) -> Option<Job> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.processing {
            return None;
        }
        let job = state.pending.pop_front()?;
        state.processing = true;
        Some(job)
    }

    /// Clear the processing flag once the in-flight job is done, however it
    /// ended.
    fn finish(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.processing = false;
    }

    async fn next_job(&self) -> Job {
        loop {
            if let Some(job) = self.try_begin() {
                return job;
            }
            self.notify.notified().await;
        }
    }
}

fn snapshot_of(state: &QueueState) -> QueueSnapshot {
    QueueSnapshot {
        position: state.pending.len() + usize::from(state.processing),
        processing: state.processing,
    }
}

/// Executes one queued job to completion.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: Job) -> anyhow::Result<()>;
}

/// Spawn the single worker task. Jobs run strictly one at a time in FIFO
/// order; a failed or timed-out job is logged and the worker moves on, it
/// never halts the loop.
pub fn spawn_worker(
    queue: Arc<JobQueueManager>,
    runner: Arc<dyn JobRunner>,
    job_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let job = queue.next_job().await;
            let kind = job.kind;
            info!(?kind, enqueued_at = %job.enqueued_at, "job started");
            match tokio::time::timeout(job_timeout, runner.run(job)).await {
                Ok(Ok(())) => info!(?kind, "job finished"),
                Ok(Err(err)) => warn!(?kind, error = %err, "job failed"),
                Err(_) => warn!(?kind, timeout_secs = job_timeout.as_secs(), "job timed out"),
            }
            queue.finish();
        }
    })
}
