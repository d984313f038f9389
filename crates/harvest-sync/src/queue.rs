use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{JobKind, ProcessingStats, RemovalPolicy, SourceJob};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::processor::{JobOutcome, JobRunner};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no queue registered for {0}")]
    UnknownKind(JobKind),
    #[error("queue for {queue} cannot take a {job} job")]
    WrongKind { queue: JobKind, job: JobKind },
    #[error("queue for {0} is shut down")]
    Closed(JobKind),
}

/// Anything that accepts jobs for later execution.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn submit(&self, job: SourceJob) -> Result<Uuid, QueueError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedJob {
    pub job: SourceJob,
    pub attempts: u32,
    pub outcome: JobOutcome,
    pub stats: ProcessingStats,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct History {
    completed: VecDeque<FinishedJob>,
    failed: VecDeque<FinishedJob>,
}

impl History {
    fn record(&mut self, finished: FinishedJob, removal: RemovalPolicy) {
        let (list, keep) = match finished.outcome {
            JobOutcome::Completed => (&mut self.completed, removal.keep_completed),
            JobOutcome::Degraded | JobOutcome::Failed | JobOutcome::Cancelled => {
                (&mut self.failed, removal.keep_failed)
            }
        };
        list.push_back(finished);
        while list.len() > keep {
            list.pop_front();
        }
    }
}

struct Envelope {
    job: SourceJob,
    attempt: u32,
}

struct Shared {
    kind: JobKind,
    sender: mpsc::UnboundedSender<Envelope>,
    history: Mutex<History>,
    outstanding: watch::Sender<usize>,
}

impl Shared {
    fn finish(&self, job: SourceJob, attempts: u32, outcome: JobOutcome, stats: ProcessingStats, error: Option<String>) {
        let removal = job.removal;
        let finished = FinishedJob {
            job,
            attempts,
            outcome,
            stats,
            error,
            finished_at: Utc::now(),
        };
        if let Ok(mut history) = self.history.lock() {
            history.record(finished, removal);
        }
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn cancel(&self, job: SourceJob, attempts: u32, stats: ProcessingStats, reason: String) {
        warn!(job_id = %job.id, kind = %self.kind, attempts, %reason, "job cancelled");
        self.finish(job, attempts, JobOutcome::Cancelled, stats, Some(reason));
    }

    async fn run_one(shared: &Arc<Self>, envelope: Envelope, runner: &dyn JobRunner, cancel: &CancellationToken) {
        let Envelope { job, attempt } = envelope;
        match runner.run(&job).await {
            Ok(report) => shared.finish(job, attempt, report.outcome, report.stats, None),
            Err(err) if attempt < job.retry.max_attempts => {
                let delay = job.retry.delay_before(attempt + 1);
                warn!(
                    job_id = %job.id,
                    kind = %shared.kind,
                    attempt,
                    max_attempts = job.retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "job failed, retry scheduled"
                );
                let shared = Arc::clone(shared);
                let cancel = cancel.clone();
                let (stats, last_error) = (err.stats(), err.to_string());
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            shared.cancel(job, attempt, stats, format!("shut down during retry backoff: {last_error}"));
                        }
                        _ = tokio::time::sleep(delay) => {
                            if let Err(mpsc::error::SendError(envelope)) =
                                shared.sender.send(Envelope { job, attempt: attempt + 1 })
                            {
                                shared.cancel(envelope.job, attempt, stats, "queue closed before retry".into());
                            }
                        }
                    }
                });
            }
            Err(err) => {
                warn!(job_id = %job.id, kind = %shared.kind, attempts = attempt, error = %err, "job gave up");
                let (outcome, stats) = (err.outcome(), err.stats());
                shared.finish(job, attempt, outcome, stats, Some(err.to_string()));
            }
        }
    }
}

/// Per-kind FIFO queue with its own worker tasks.
pub struct JobQueue {
    shared: Arc<Shared>,
    idle: watch::Receiver<usize>,
    cancel: CancellationToken,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Envelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Start `concurrency` workers (at least one) feeding jobs to `runner`.
    pub fn start(kind: JobKind, runner: Arc<dyn JobRunner>, concurrency: usize, cancel: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (outstanding, idle) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            kind,
            sender,
            history: Mutex::new(History::default()),
            outstanding,
        });
        let receiver = Arc::new(AsyncMutex::new(receiver));

        let workers = (0..concurrency.max(1))
            .map(|worker| {
                let shared = Arc::clone(&shared);
                let receiver = Arc::clone(&receiver);
                let runner = Arc::clone(&runner);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            next = async { receiver.lock().await.recv().await } => next,
                        };
                        let Some(envelope) = next else { break };
                        Shared::run_one(&shared, envelope, runner.as_ref(), &cancel).await;
                    }
                    info!(kind = %shared.kind, worker, "worker stopped");
                })
            })
            .collect();

        Self {
            shared,
            idle,
            cancel,
            receiver,
            workers: Mutex::new(workers),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.shared.kind
    }

    pub fn enqueue(&self, job: SourceJob) -> Result<Uuid, QueueError> {
        if job.kind != self.shared.kind {
            return Err(QueueError::WrongKind {
                queue: self.shared.kind,
                job: job.kind,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(QueueError::Closed(self.shared.kind));
        }
        let id = job.id;
        self.shared.outstanding.send_modify(|n| *n += 1);
        if self.shared.sender.send(Envelope { job, attempt: 1 }).is_err() {
            self.shared.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            return Err(QueueError::Closed(self.shared.kind));
        }
        Ok(id)
    }

    /// Jobs enqueued (or awaiting retry) that have not finished yet.
    pub fn outstanding(&self) -> usize {
        *self.idle.borrow()
    }

    /// Resolve once every enqueued job has finished, retries included.
    pub async fn wait_idle(&self) {
        let mut idle = self.idle.clone();
        // An error means the sender is gone, so nothing is left to wait for.
        let _ = idle.wait_for(|n| *n == 0).await;
    }

    pub fn completed(&self) -> Vec<FinishedJob> {
        self.shared
            .history
            .lock()
            .map(|h| h.completed.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn failed(&self) -> Vec<FinishedJob> {
        self.shared
            .history
            .lock()
            .map(|h| h.failed.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stop the workers, wait for in-flight jobs, then record every job
    /// still queued as cancelled.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers = self.workers.lock().map(|mut w| std::mem::take(&mut *w)).unwrap_or_default();
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(kind = %self.shared.kind, error = %err, "worker task panicked");
            }
        }
        let mut receiver = self.receiver.lock().await;
        let mut dropped = 0usize;
        while let Ok(Envelope { job, attempt }) = receiver.try_recv() {
            self.shared
                .cancel(job, attempt.saturating_sub(1), ProcessingStats::default(), "shut down before it ran".into());
            dropped += 1;
        }
        if dropped > 0 {
            warn!(kind = %self.shared.kind, dropped, "queued jobs cancelled at shutdown");
        }
    }
}

#[async_trait]
impl JobSink for JobQueue {
    async fn submit(&self, job: SourceJob) -> Result<Uuid, QueueError> {
        self.enqueue(job)
    }
}

/// One queue per source kind.
#[derive(Default)]
pub struct QueueSet {
    queues: BTreeMap<JobKind, JobQueue>,
}

impl QueueSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, queue: JobQueue) {
        self.queues.insert(queue.kind(), queue);
    }

    pub fn get(&self, kind: JobKind) -> Option<&JobQueue> {
        self.queues.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = JobKind> + '_ {
        self.queues.keys().copied()
    }

    pub async fn wait_idle(&self) {
        for queue in self.queues.values() {
            queue.wait_idle().await;
        }
    }

    pub async fn shutdown(&self) {
        for queue in self.queues.values() {
            queue.shutdown().await;
        }
    }
}

#[async_trait]
impl JobSink for QueueSet {
    async fn submit(&self, job: SourceJob) -> Result<Uuid, QueueError> {
        self.get(job.kind)
            .ok_or(QueueError::UnknownKind(job.kind))?
            .enqueue(job)
    }
}
