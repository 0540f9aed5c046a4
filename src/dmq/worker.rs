//! Job queues and the DMQ worker pool
//!
//! The dispatch entry point runs on whatever task received the message; it
//! only builds a [`Job`] and appends it to one worker's queue. Each worker
//! is a tokio task bound to exactly one [`JobQueue`]: it drains the queue
//! and parks on the queue's `Notify` when it is empty.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::message::InboundMessage;
use super::node::Node;
use super::peer::{PeerDescriptor, PeerResponse};

// ─────────────────────────────────────────────────────────────────
// Job
// ─────────────────────────────────────────────────────────────────

/// One inbound message waiting to be handled by a peer
#[derive(Debug)]
pub struct Job {
    /// Peer whose handler runs the job
    pub peer: Arc<PeerDescriptor>,

    /// The message itself
    pub message: InboundMessage,

    /// Snapshot of the sending node, if known
    pub origin: Option<Node>,

    /// When the job was created
    pub queued_at: Instant,
}

impl Job {
    pub fn new(peer: Arc<PeerDescriptor>, message: InboundMessage, origin: Option<Node>) -> Self {
        Self {
            peer,
            message,
            origin,
            queued_at: Instant::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Job Queue
// ─────────────────────────────────────────────────────────────────

/// FIFO of jobs for one worker
pub struct JobQueue {
    state: Mutex<QueueState>,
    depth: AtomicUsize,
    notify: Notify,
}

struct QueueState {
    jobs: VecDeque<Job>,
    closed: bool,
}

/// What a worker finds when it looks at its queue
enum Next {
    Job(Job),
    Empty,
    Closed,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                closed: false,
            }),
            depth: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Append a job and wake the bound worker.
    ///
    /// Fails with `ShuttingDown` once the queue is closed; the check and the
    /// push happen under the same lock, so no job lands behind a worker
    /// that has already exited.
    pub fn enqueue(&self, job: Job) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::ShuttingDown);
            }
            state
                .jobs
                .try_reserve(1)
                .map_err(|_| Error::allocation("job queue slot"))?;
            state.jobs.push_back(job);
            self.depth.store(state.jobs.len(), Ordering::Release);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the head job, if any
    pub fn dequeue(&self) -> Option<Job> {
        let mut state = self.state.lock();
        let job = state.jobs.pop_front();
        self.depth.store(state.jobs.len(), Ordering::Release);
        job
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further jobs and wake the worker so it can drain and exit
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Pop the head job, or report whether the worker should park or exit
    fn next(&self) -> Next {
        let mut state = self.state.lock();
        let next = match state.jobs.pop_front() {
            Some(job) => Next::Job(job),
            None if state.closed => Next::Closed,
            None => Next::Empty,
        };
        self.depth.store(state.jobs.len(), Ordering::Release);
        next
    }

    /// Park until `enqueue` or `close` signals this queue
    async fn wait(&self) {
        self.notify.notified().await;
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Worker Pool
// ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PoolStats {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Fixed set of workers, one queue each
pub struct WorkerPool {
    queues: Vec<Arc<JobQueue>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Create a pool of `size` workers. Workers are not running until `start`.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::config_field_invalid(
                "dmq.num_workers",
                "worker pool needs at least one worker",
            ));
        }

        let mut queues = Vec::new();
        queues
            .try_reserve_exact(size)
            .map_err(|_| Error::allocation("worker queues"))?;
        queues.extend((0..size).map(|_| Arc::new(JobQueue::new())));

        Ok(Self {
            queues,
            handles: Mutex::new(Vec::new()),
            stats: Arc::new(PoolStats::default()),
        })
    }

    /// Spawn the worker tasks. Calling it again is a no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }

        for (index, queue) in self.queues.iter().enumerate() {
            let queue = Arc::clone(queue);
            let stats = Arc::clone(&self.stats);
            handles.push(tokio::spawn(worker_loop(index, queue, stats)));
        }

        info!(workers = self.queues.len(), "DMQ worker pool started");
    }

    /// Queue a job on the best worker and return that worker's index
    pub fn dispatch(&self, job: Job) -> Result<usize> {
        let index = self.select_worker();
        self.queues[index].enqueue(job)?;
        debug!(worker = index, depth = self.queues[index].len(), "Job dispatched");
        Ok(index)
    }

    /// First worker with an empty queue, otherwise the least loaded one.
    /// Ties go to the lowest index.
    pub fn select_worker(&self) -> usize {
        if let Some(idle) = self.queues.iter().position(|q| q.is_empty()) {
            return idle;
        }

        self.queues
            .iter()
            .enumerate()
            .min_by_key(|(_, q)| q.len())
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Current depth of every queue
    pub fn queue_depths(&self) -> Vec<usize> {
        self.queues.iter().map(|q| q.len()).collect()
    }

    pub fn size(&self) -> usize {
        self.queues.len()
    }

    pub fn completed_count(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    /// Stop accepting jobs, let workers drain their queues, and join them.
    ///
    /// Jobs left behind by a pool that was never started are answered with
    /// 503 so their senders are not kept waiting.
    pub async fn shutdown(&self) {
        for queue in &self.queues {
            queue.close();
        }

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        for queue in &self.queues {
            while let Some(mut job) = queue.dequeue() {
                reject_job(&mut job);
            }
        }

        info!(
            completed = self.completed_count(),
            failed = self.failed_count(),
            "DMQ worker pool stopped"
        );
    }
}

// ─────────────────────────────────────────────────────────────────
// Worker Loop
// ─────────────────────────────────────────────────────────────────

async fn worker_loop(index: usize, queue: Arc<JobQueue>, stats: Arc<PoolStats>) {
    debug!(worker = index, "Worker started");

    loop {
        match queue.next() {
            Next::Job(job) => run_job(index, job, &stats).await,
            Next::Empty => queue.wait().await,
            Next::Closed => break,
        }
    }

    debug!(worker = index, "Worker stopped");
}

/// Answer a job that will never run
fn reject_job(job: &mut Job) {
    if let Some(reply) = job.message.take_reply() {
        let _ = reply.send(PeerResponse::new(
            Error::ShuttingDown.response_code(),
            Error::ShuttingDown.to_string(),
        ));
    }
}

/// Execute one job and send the reply. Never fails: a handler error or
/// panic is logged and answered with 500.
async fn run_job(index: usize, mut job: Job, stats: &PoolStats) {
    let peer_id = job.peer.peer_id().to_string();
    let reply = job.message.take_reply();
    let handler = job.peer.handler();
    let wait_ms = job.queued_at.elapsed().as_millis() as u64;

    let Job { message, origin, .. } = job;
    let outcome = tokio::spawn(async move { handler.handle(&message, origin.as_ref()).await }).await;

    let response = match outcome {
        Ok(Ok(response)) => {
            stats.completed.fetch_add(1, Ordering::Relaxed);
            debug!(worker = index, peer_id = %peer_id, code = response.code, wait_ms, "Job completed");
            response
        }
        Ok(Err(e)) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(worker = index, peer_id = %peer_id, error = %e.format_for_log(), "Peer handler failed");
            PeerResponse::new(e.response_code(), e.to_string())
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(worker = index, peer_id = %peer_id, error = %e, "Peer handler panicked");
            PeerResponse::server_error()
        }
    };

    if let Some(reply) = reply {
        if reply.send(response).is_err() {
            debug!(peer_id = %peer_id, "Sender stopped waiting for the reply");
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
