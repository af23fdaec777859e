//! Bounded conversion pool.
//!
//! Architecture: a bounded job queue feeds `num_workers` worker tasks. Each
//! worker runs one conversion at a time on the blocking thread pool and
//! reports back over an event channel, tagging every message with the job
//! index so the receiver can attribute results regardless of completion
//! order. Workers share nothing mutable with each other or the receiver.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::worker::{self, WorkerContext};
use crate::{Candidate, ConversionError, ConversionResult};

/// A conversion job submitted to the pool.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    /// Position of the candidate in the run; echoed back in every event.
    pub index: usize,
    pub candidate: Candidate,
}

/// Messages from workers to the pool owner.
#[derive(Debug)]
pub enum PoolEvent {
    Started { index: usize },
    Finished { index: usize, result: ConversionResult },
}

/// A fixed set of worker tasks draining a bounded job queue.
///
/// Submit jobs via [`submit()`](ConversionPool::submit); results arrive on
/// the event channel passed to [`new()`](ConversionPool::new). The channel
/// closes once the pool is shut down and every worker has exited.
pub struct ConversionPool {
    job_tx: async_channel::Sender<ConversionJob>,
    pool_handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ConversionPool {
    /// Spawn `num_workers` workers (at least one).
    ///
    /// The queue holds at most `num_workers` pending jobs, so submitters wait
    /// for capacity instead of buffering the whole run. After `cancel` fires,
    /// queued jobs are dropped unstarted while running ones finish.
    pub fn new(
        ctx: WorkerContext,
        num_workers: usize,
        file_timeout: Option<Duration>,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        let num_workers = num_workers.max(1);
        let (job_tx, job_rx) = async_channel::bounded::<ConversionJob>(num_workers);
        let pool_cancel = cancel.clone();

        let pool_handle = tokio::spawn(async move {
            let mut handles = Vec::with_capacity(num_workers);
            for worker_id in 0..num_workers {
                handles.push(tokio::spawn(worker_loop(
                    worker_id,
                    job_rx.clone(),
                    ctx.clone(),
                    file_timeout,
                    cancel.clone(),
                    events.clone(),
                )));
            }

            // Workers hold the only receivers and event senders from here on
            drop(job_rx);
            drop(events);

            for h in handles {
                let _ = h.await;
            }
        });

        Self {
            job_tx,
            pool_handle,
            cancel: pool_cancel,
        }
    }

    /// Queue a job, waiting for capacity. Returns `false` if the pool is
    /// closed or cancelled.
    pub async fn submit(&self, job: ConversionJob) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.job_tx.send(job).await.is_ok()
    }

    /// Close the queue and wait for all workers to finish.
    pub async fn shutdown(self) {
        self.job_tx.close();
        let _ = self.pool_handle.await;
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: async_channel::Receiver<ConversionJob>,
    ctx: WorkerContext,
    file_timeout: Option<Duration>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    while let Ok(job) = rx.recv().await {
        if cancel.is_cancelled() {
            tracing::debug!(worker_id, index = job.index, "dropping queued job: cancelled");
            continue;
        }

        let ConversionJob { index, candidate } = job;
        let _ = events.send(PoolEvent::Started { index });
        let result = run_job(candidate, &ctx, file_timeout).await;
        let _ = events.send(PoolEvent::Finished { index, result });
    }
}

/// Run one conversion on the blocking pool.
///
/// A timeout cannot interrupt the blocking task. It cancels the job's
/// abandon token, so the task stops before writing anything, and reports the
/// file as failed. A panic is reported the same way.
async fn run_job(
    candidate: Candidate,
    ctx: &WorkerContext,
    file_timeout: Option<Duration>,
) -> ConversionResult {
    let start = Instant::now();
    let fallback = candidate.clone();
    let ctx = ctx.clone();
    let abandon = CancellationToken::new();
    let task = {
        let abandon = abandon.clone();
        tokio::task::spawn_blocking(move || worker::process_until(candidate, &ctx, &abandon))
    };

    let joined = match file_timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                abandon.cancel();
                tracing::warn!(input = %fallback.input_path.display(), ?limit, "conversion timed out, abandoning");
                return ConversionResult::failed(
                    fallback,
                    ConversionError::Timeout(limit),
                    start.elapsed(),
                );
            }
        },
        None => task.await,
    };

    match joined {
        Ok(result) => result,
        Err(e) => {
            let message = if e.is_panic() {
                panic_message(e.into_panic())
            } else {
                e.to_string()
            };
            ConversionResult::failed(
                fallback,
                ConversionError::Panicked(message),
                start.elapsed(),
            )
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
