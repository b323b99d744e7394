use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{AdapterError, RunContext, ToolAdapter, Upstream};
use crate::output::RunReporter;
use crate::store::{ResultStore, StoreError};

/// A ready task handed to the pool.
pub struct Job {
    pub index: usize,
    pub name: String,
    pub adapter: Arc<dyn ToolAdapter>,
    pub upstream: Upstream,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("failed to persist result: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub enum Outcome {
    /// Adapter succeeded and its payload was persisted.
    Done(Arc<Value>),
    /// The tool has nothing to do for this target kind.
    NotApplicable,
    Failed(TaskFailure),
}

/// Sent back to the scheduler once per job.
#[derive(Debug)]
pub struct Completion {
    pub index: usize,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Everything a worker needs besides the job itself.
pub struct WorkerEnv {
    pub ctx: Arc<RunContext>,
    pub store: Arc<ResultStore>,
    pub reporter: Arc<RunReporter>,
    pub task_timeout: Duration,
    pub cancel: CancellationToken,
    pub completions: mpsc::UnboundedSender<Completion>,
}

/// Fixed set of workers consuming jobs from one bounded queue.
pub struct WorkerPool {
    jobs: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(size: usize, queue_capacity: usize, env: WorkerEnv) -> Self {
        let size = size.max(1);
        let (jobs, rx) = mpsc::channel(queue_capacity.max(1));
        let queue = Arc::new(Mutex::new(rx));
        let env = Arc::new(env);

        let workers = (0..size)
            .map(|id| tokio::spawn(worker(id, Arc::clone(&queue), Arc::clone(&env))))
            .collect();

        debug!(workers = size, "worker pool started");
        Self { jobs, workers }
    }

    /// Queue a job, waiting for space if the queue is full.
    ///
    /// Fails only when every worker has exited.
    pub async fn submit(&self, job: Job) -> Result<(), Job> {
        self.jobs.send(job).await.map_err(|e| e.0)
    }

    /// Close the queue and wait for workers to drain it.
    pub async fn shutdown(self) {
        drop(self.jobs);
        for result in join_all(self.workers).await {
            if let Err(e) = result {
                warn!(error = %e, "worker terminated abnormally");
            }
        }
    }
}

async fn worker(id: usize, queue: Arc<Mutex<mpsc::Receiver<Job>>>, env: Arc<WorkerEnv>) {
    loop {
        let job = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        debug!(worker = id, task = %job.name, "picked up task");
        let started = Instant::now();
        let outcome = execute(&env, &job).await;

        let completion = Completion {
            index: job.index,
            outcome,
            elapsed: started.elapsed(),
        };
        if env.completions.send(completion).is_err() {
            break;
        }
    }
    debug!(worker = id, "worker exiting");
}

async fn execute(env: &WorkerEnv, job: &Job) -> Outcome {
    if !job.adapter.supports(env.ctx.kind) {
        info!(task = %job.name, kind = %env.ctx.kind, "tool does not apply to target kind");
        return Outcome::NotApplicable;
    }
    if env.cancel.is_cancelled() {
        return Outcome::Failed(AdapterError::Cancelled.into());
    }

    env.reporter.task_started(&job.name);

    let run = tokio::time::timeout(
        env.task_timeout,
        job.adapter.run(&env.ctx, &job.upstream, &env.cancel),
    );
    let result = tokio::select! {
        result = run => result.unwrap_or(Err(AdapterError::Timeout(env.task_timeout))),
        _ = env.cancel.cancelled() => Err(AdapterError::Cancelled),
    };

    let payload = match result {
        Ok(payload) => payload,
        Err(e) => {
            warn!(task = %job.name, error = %e, "tool failed");
            return Outcome::Failed(e.into());
        }
    };

    if let Err(e) = env.store.persist(&job.name, &payload).await {
        warn!(task = %job.name, error = %e, "could not persist result");
        return Outcome::Failed(e.into());
    }

    Outcome::Done(Arc::new(payload))
}
