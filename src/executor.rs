use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::panic_trace::{self, Traced};
use crate::{BoxError, ErrorList, JobError, NodeError};

/// Identity of a job within one executor run.
pub trait JobKey: Clone + Eq + Hash + Display + Send + Sync + 'static {}

impl<T> JobKey for T where T: Clone + Eq + Hash + Display + Send + Sync + 'static {}

/// The work performed for each job.
///
/// Implemented for any `Fn(CancellationToken, J) -> impl Future<Output = Result<(), E>>`.
#[async_trait]
pub trait Work<J>: Send + Sync + 'static {
    async fn call(&self, ctx: CancellationToken, job: J) -> Result<(), BoxError>;
}

#[async_trait]
impl<J, F, Fut, E> Work<J> for F
where
    J: Send + 'static,
    F: Fn(CancellationToken, J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    async fn call(&self, ctx: CancellationToken, job: J) -> Result<(), BoxError> {
        (self)(ctx, job).await.map_err(Into::into)
    }
}

#[derive(Debug, Clone)]
pub enum JobStatus {
    Pending,
    Success,
    Failure(NodeError),
}

impl JobStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failure(_))
    }

    pub fn error(&self) -> Option<&NodeError> {
        match self {
            JobStatus::Failure(err) => Some(err),
            _ => None,
        }
    }
}

type JobResult<J> = (J, Result<(), NodeError>);

struct Batch<J> {
    results: mpsc::UnboundedReceiver<JobResult<J>>,
    remaining: usize,
    errors: ErrorList,
}

impl<J> Batch<J> {
    // Progress is kept in the batch, so a dropped wait loses nothing.
    async fn drain(&mut self) -> Result<(), ErrorList> {
        while self.remaining > 0 {
            match self.results.recv().await {
                Some((_, Err(err))) => self.errors.push(err),
                Some((_, Ok(()))) => {}
                None => break,
            }
            self.remaining -= 1;
        }
        self.errors.clone().into_result()
    }
}

enum Completion<J> {
    Running(Batch<J>),
    Done(Result<(), ErrorList>),
}

struct Shared<J> {
    // One watch channel per job: the current value is the status, and
    // subscribers double as completion signals.
    status: Mutex<HashMap<J, watch::Sender<JobStatus>>>,
    completion: Mutex<Option<Completion<J>>>,
    started: AtomicBool,
}

/// Runs a work function over a fixed set of jobs on a bounded pool of workers.
///
/// The executor runs a single batch: jobs are registered by [`Executor::start`]
/// and cannot be added afterwards. Clones share the same batch, so a work
/// function may hold a clone to look up the status of other jobs.
pub struct Executor<J> {
    shared: Arc<Shared<J>>,
}

impl<J> Clone for Executor<J> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<J: JobKey> Default for Executor<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: JobKey> Executor<J> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                status: Mutex::new(HashMap::new()),
                completion: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Registers every job as pending and spawns
    /// `min(max(parallelism, 1), jobs.len())` workers. Duplicate jobs run once.
    pub async fn start<W>(
        &self,
        ctx: CancellationToken,
        parallelism: usize,
        work: W,
        jobs: Vec<J>,
    ) -> Result<(), JobError>
    where
        W: Work<J>,
    {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(JobError::AlreadyStarted);
        }

        let mut seen = HashSet::with_capacity(jobs.len());
        let jobs: Vec<J> = jobs.into_iter().filter(|j| seen.insert(j.clone())).collect();

        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<J>();
        let (results_tx, results_rx) = mpsc::unbounded_channel::<JobResult<J>>();

        {
            let mut table = self.shared.status.lock().await;
            for job in &jobs {
                let (tx, _) = watch::channel(JobStatus::Pending);
                table.insert(job.clone(), tx);
            }
        }
        for job in &jobs {
            // The receiver is alive until the workers drain it.
            let _ = queue_tx.send(job.clone());
        }
        drop(queue_tx);

        *self.shared.completion.lock().await = Some(Completion::Running(Batch {
            results: results_rx,
            remaining: jobs.len(),
            errors: ErrorList::new(),
        }));

        if jobs.is_empty() {
            return Ok(());
        }

        let workers = parallelism.max(1).min(jobs.len());
        debug!(jobs = jobs.len(), workers, "starting executor");

        let queue = Arc::new(Mutex::new(queue_rx));
        let work = Arc::new(work);
        for _ in 0..workers {
            tokio::spawn(worker(
                Arc::clone(&self.shared),
                Arc::clone(&queue),
                results_tx.clone(),
                ctx.clone(),
                Arc::clone(&work),
            ));
        }

        Ok(())
    }

    pub async fn status(&self, job: &J) -> Result<JobStatus, JobError> {
        let table = self.shared.status.lock().await;
        table
            .get(job)
            .map(|tx| JobStatus::clone(&tx.borrow()))
            .ok_or(JobError::NotFound)
    }

    /// Snapshot of every registered job's status.
    pub async fn statuses(&self) -> HashMap<J, JobStatus> {
        let table = self.shared.status.lock().await;
        table
            .iter()
            .map(|(job, tx)| (job.clone(), JobStatus::clone(&tx.borrow())))
            .collect()
    }

    /// Waits until `job` leaves [`JobStatus::Pending`] and returns its final
    /// status, or [`JobError::Cancelled`] if `ctx` fires first.
    pub async fn wait_for(&self, job: &J, ctx: &CancellationToken) -> Result<JobStatus, JobError> {
        let mut rx = {
            let table = self.shared.status.lock().await;
            table.get(job).ok_or(JobError::NotFound)?.subscribe()
        };

        let done = async move {
            rx.wait_for(|status| !status.is_pending())
                .await
                .map(|status| JobStatus::clone(&status))
        };

        tokio::select! {
            status = done => status.map_err(|_| JobError::NotFound),
            _ = ctx.cancelled() => Err(JobError::Cancelled),
        }
    }

    /// Blocks until every started job has finished and returns the failures
    /// in the order they arrived. Later calls return the same result.
    pub async fn wait_for_completion(&self) -> Result<(), ErrorList> {
        let mut completion = self.shared.completion.lock().await;
        match &mut *completion {
            None => Ok(()),
            Some(Completion::Done(result)) => result.clone(),
            Some(Completion::Running(batch)) => {
                let result = batch.drain().await;
                *completion = Some(Completion::Done(result.clone()));
                result
            }
        }
    }
}

impl<J: JobKey> Shared<J> {
    async fn finish(&self, job: &J, outcome: &Result<(), NodeError>) {
        let status = match outcome {
            Ok(()) => JobStatus::Success,
            Err(err) => JobStatus::Failure(err.clone()),
        };
        let table = self.status.lock().await;
        if let Some(tx) = table.get(job) {
            tx.send_replace(status);
        }
    }
}

async fn worker<J, W>(
    shared: Arc<Shared<J>>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<J>>>,
    results: mpsc::UnboundedSender<JobResult<J>>,
    ctx: CancellationToken,
    work: Arc<W>,
) where
    J: JobKey,
    W: Work<J>,
{
    loop {
        // The queue is filled and closed before workers start, so this never
        // waits on a producer.
        let next = queue.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };

        let outcome = if ctx.is_cancelled() {
            Err(NodeError::new(JobError::Cancelled))
        } else {
            invoke(work.as_ref(), ctx.clone(), job.clone()).await
        };

        let outcome = outcome.map_err(|err| {
            if err.is_panic() {
                warn!(job = %job, error = %err, "recovered panic in work function");
            }
            if err.node_ids().is_empty() {
                err.with_node_ids([job.to_string()])
            } else {
                err
            }
        });
        debug!(job = %job, ok = outcome.is_ok(), "job finished");

        shared.finish(&job, &outcome).await;
        if results.send((job, outcome)).is_err() {
            break;
        }
    }
}

async fn invoke<J, W>(work: &W, ctx: CancellationToken, job: J) -> Result<(), NodeError>
where
    W: Work<J>,
{
    match AssertUnwindSafe(Traced::new(work.call(ctx, job)))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(NodeError::from_boxed(err)),
        Err(payload) => Err(NodeError::panic(panic_message(payload), panic_trace::take())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
