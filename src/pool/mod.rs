//! Pool facade: the public operations over the scheduler actor.
//!
//! Every call is a message to the scheduler; nothing here touches scheduling
//! state directly. Growing and shrinking are serialized by an async mutex so
//! that engine startup, which can take a long time, never runs inside the
//! scheduler itself.

mod handle;
mod scheduler;
pub mod status;
mod workers;

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{info, warn};

use crate::engine::{EngineFactory, start_engines};
use crate::error::PoolError;
use crate::job::{EvalJob, FevalJob, IdGenerator, JobId, JobStatus, ProcessIds, TextSink};

pub use status::{JobStatusEntry, WorkerStatus};

use scheduler::{Command, Scheduler};

/// A resizable pool of compute engines with a FIFO job queue.
pub struct Pool {
    commands: mpsc::UnboundedSender<Command>,
    factory: Arc<dyn EngineFactory>,
    ids: Arc<dyn IdGenerator>,
    resize_lock: Mutex<()>,
}

/// Builder for [`Pool`].
pub struct PoolBuilder {
    factory: Arc<dyn EngineFactory>,
    workers: usize,
    options: Vec<String>,
    ids: Arc<dyn IdGenerator>,
}

impl PoolBuilder {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            workers: 1,
            options: Vec::new(),
            ids: Arc::new(ProcessIds),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Startup options passed to every engine.
    pub fn options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Generator used by [`Pool::job`].
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Start the engines and the scheduler.
    pub async fn start(self) -> Result<Pool, PoolError> {
        if self.workers == 0 {
            return Err(PoolError::EmptyPool);
        }

        let engines = start_engines(self.factory.as_ref(), self.workers, &self.options).await?;
        info!(
            factory = self.factory.name(),
            workers = engines.len(),
            "Pool started"
        );

        Ok(Pool {
            commands: Scheduler::spawn(engines),
            factory: self.factory,
            ids: self.ids,
            resize_lock: Mutex::new(()),
        })
    }
}

impl Pool {
    pub fn builder(factory: Arc<dyn EngineFactory>) -> PoolBuilder {
        PoolBuilder::new(factory)
    }

    /// Start a pool of `workers` engines.
    pub async fn start(
        factory: Arc<dyn EngineFactory>,
        workers: usize,
        options: &[String],
    ) -> Result<Self, PoolError> {
        Self::builder(factory)
            .workers(workers)
            .options(options.iter().cloned())
            .start()
            .await
    }

    /// Build a job with an identifier from this pool's generator.
    pub fn job(&self, function: impl Into<String>, nlhs: usize, args: Vec<Value>) -> FevalJob {
        FevalJob::with_id(self.ids.next_id(), function, nlhs, args)
    }

    fn send(&self, command: Command) -> Result<(), PoolError> {
        self.commands.send(command).map_err(|_| PoolError::Closed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Queue a job. Never waits for a worker.
    ///
    /// A job id may be live only once: ids still queued or dispatched are
    /// rejected with [`PoolError::DuplicateJob`], and id 0 is never accepted.
    pub async fn submit(&self, mut job: FevalJob) -> Result<JobId, PoolError> {
        let id = job.id();
        if id.is_none() {
            return Err(PoolError::ReservedJobId);
        }
        if job.status() != JobStatus::Wait {
            return Err(PoolError::NotSubmittable {
                id,
                status: job.status(),
            });
        }
        job.mark_submitted();
        self.request(|reply| Command::Submit { job, reply }).await?
    }

    /// Wait until job `id` has finished and take it out of the pool.
    pub async fn wait(&self, id: JobId) -> Result<FevalJob, PoolError> {
        let handle = self.request(|reply| Command::Wait { id, reply }).await??;
        let job = handle.resolve().await;
        info!(job_id = %id, status = %job.status(), "Job retrieved");
        Ok(job)
    }

    /// Cancel job `id`, returning the status it ended in.
    pub async fn cancel(&self, id: JobId) -> Result<JobStatus, PoolError> {
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    /// Grow or shrink the pool to `workers` engines.
    ///
    /// New engines are started with `options`. When shrinking, the
    /// highest-indexed workers are removed as they become idle; this waits
    /// until all of them are gone and shut down.
    pub async fn resize(&self, workers: usize, options: &[String]) -> Result<usize, PoolError> {
        if workers == 0 {
            return Err(PoolError::EmptyPool);
        }

        let _guard = self.resize_lock.lock().await;
        let current = self.size().await?;

        if workers > current {
            let engines = start_engines(self.factory.as_ref(), workers - current, options).await?;
            let size = self
                .request(|reply| Command::Grow { engines, reply })
                .await?;
            info!(from = current, to = size, "Pool grown");
            Ok(size)
        } else if workers < current {
            let removed = self
                .request(|reply| Command::Shrink {
                    target: workers,
                    reply,
                })
                .await?;
            join_all(removed.iter().map(|engine| engine.shutdown())).await;
            info!(from = current, to = workers, "Pool shrunk");
            Ok(workers)
        } else {
            Ok(current)
        }
    }

    /// Run a command on every worker at once and collect what each printed.
    pub async fn eval(&self, job: &mut EvalJob) -> Result<(), PoolError> {
        let engines = self.request(|reply| Command::Engines { reply }).await?;
        if engines.is_empty() {
            return Err(PoolError::EmptyPool);
        }

        let command = job.command().to_string();
        let runs = engines.iter().map(|engine| {
            let command = command.as_str();
            async move {
                let output = TextSink::new();
                let error = TextSink::new();
                let result = engine.eval(command, &output, &error).await;
                (output, error, result)
            }
        });

        for (worker, (output, error, result)) in join_all(runs).await.into_iter().enumerate() {
            job.add_output(worker, &output.contents());
            if let Err(failure) = result {
                let text = if error.is_empty() {
                    failure.message
                } else {
                    error.contents()
                };
                warn!(job_id = %job.id(), worker, "Eval failed on worker");
                job.add_error(worker, &text);
            }
        }

        Ok(())
    }

    /// Queued jobs in FIFO order, then dispatched jobs by id.
    pub async fn get_job_status(&self) -> Result<Vec<JobStatusEntry>, PoolError> {
        self.request(|reply| Command::JobStatus { reply }).await
    }

    pub async fn get_worker_status(&self) -> Result<WorkerStatus, PoolError> {
        self.request(|reply| Command::WorkerStatus { reply }).await
    }

    /// Remove every job still waiting in the queue; returns how many were removed.
    pub async fn clear(&self) -> Result<usize, PoolError> {
        self.request(|reply| Command::Clear { reply }).await
    }

    pub async fn size(&self) -> Result<usize, PoolError> {
        self.request(|reply| Command::Size { reply }).await
    }

    /// Stop the scheduler and every engine.
    ///
    /// Dispatched jobs are canceled and pending waiters get [`PoolError::Closed`].
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let (reply, _) = oneshot::channel();
        // Already gone if `shutdown` ran.
        let _ = self.commands.send(Command::Shutdown { reply });
    }
}
