/// Fixed-size worker pool in front of the orchestrator
///
/// Jobs wait in a bounded queue. `submit` blocks while it is full,
/// `try_submit` hands the job back instead. Results arrive in completion order.
use crate::config::types::{EngineError, Result};
use crate::core::orchestrator::Orchestrator;
use crate::core::types::{ExecutionRequest, ExecutionResult};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A request tagged with a caller-chosen id.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub request: ExecutionRequest,
}

#[derive(Debug, Clone)]
pub struct Completed {
    pub id: String,
    pub result: ExecutionResult,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("execution queue is full")]
    Saturated(Job),

    #[error("execution pool is shut down")]
    Closed(Job),
}

impl PoolError {
    /// Take back the job that could not be queued.
    pub fn into_job(self) -> Job {
        match self {
            PoolError::Saturated(job) | PoolError::Closed(job) => job,
        }
    }
}

pub struct ExecutionPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ExecutionPool {
    /// Start `workers` threads sharing a queue of `queue_capacity` pending jobs.
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        workers: usize,
        queue_capacity: usize,
    ) -> Result<(Self, Receiver<Completed>)> {
        let (job_tx, job_rx) = bounded::<Job>(queue_capacity);
        let (done_tx, done_rx) = unbounded::<Completed>();

        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let orchestrator = Arc::clone(&orchestrator);

            let handle = thread::Builder::new()
                .name(format!("polyrun-worker-{}", index))
                .spawn(move || {
                    for job in jobs.iter() {
                        let result = orchestrator.execute(&job.request);
                        if done.send(Completed { id: job.id, result }).is_err() {
                            log::debug!("Result receiver dropped; discarding result");
                        }
                    }
                })
                .map_err(|e| EngineError::Internal(format!("failed to start worker: {}", e)))?;
            handles.push(handle);
        }

        log::debug!(
            "Execution pool started: {} workers, queue capacity {}",
            handles.len(),
            queue_capacity
        );

        Ok((
            Self {
                jobs: Some(job_tx),
                workers: handles,
            },
            done_rx,
        ))
    }

    /// Queue a job, waiting for room if the queue is full.
    pub fn submit(&self, job: Job) -> std::result::Result<(), PoolError> {
        match &self.jobs {
            Some(jobs) => jobs.send(job).map_err(|e| PoolError::Closed(e.into_inner())),
            None => Err(PoolError::Closed(job)),
        }
    }

    /// Queue a job only if there is room right now.
    pub fn try_submit(&self, job: Job) -> std::result::Result<(), PoolError> {
        match &self.jobs {
            Some(jobs) => jobs.try_send(job).map_err(|e| match e {
                TrySendError::Full(job) => PoolError::Saturated(job),
                TrySendError::Disconnected(job) => PoolError::Closed(job),
            }),
            None => Err(PoolError::Closed(job)),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue, let workers finish what is queued, and join them.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("Execution worker panicked");
            }
        }
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        self.close();
    }
}
