//! The scheduler actor.
//!
//! A single task owns the job queue, the completion table, pending waiters and
//! the worker table. Callers reach it only through [`Command`]s; engines reach
//! it only through worker-ready notifications. Since nothing else touches this
//! state there are no locks to order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::engine::{Completion, Engine, FevalCall, Notifier};
use crate::error::{PoolError, invariant_violation};
use crate::job::{FevalJob, JobId, JobStatus};
use crate::pool::handle::JobHandle;
use crate::pool::status::{JobStatusEntry, WorkerStatus};
use crate::pool::workers::WorkerTable;

type Reply<T> = oneshot::Sender<T>;
type WaitReply = Reply<Result<JobHandle, PoolError>>;

/// Requests handled by the scheduler.
pub(crate) enum Command {
    /// Rejected when another live job already carries the same id.
    Submit {
        job: FevalJob,
        reply: Reply<Result<JobId, PoolError>>,
    },
    Wait {
        id: JobId,
        reply: WaitReply,
    },
    Cancel {
        id: JobId,
        reply: Reply<Result<JobStatus, PoolError>>,
    },
    JobStatus {
        reply: Reply<Vec<JobStatusEntry>>,
    },
    WorkerStatus {
        reply: Reply<WorkerStatus>,
    },
    /// Snapshot of the current engines, for broadcast evaluation.
    Engines {
        reply: Reply<Vec<Arc<dyn Engine>>>,
    },
    Grow {
        engines: Vec<Arc<dyn Engine>>,
        reply: Reply<usize>,
    },
    /// Answered once the table is down to `target`, with the removed engines
    /// in descending index order.
    Shrink {
        target: usize,
        reply: Reply<Vec<Arc<dyn Engine>>>,
    },
    Clear {
        reply: Reply<usize>,
    },
    Size {
        reply: Reply<usize>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

struct PendingShrink {
    target: usize,
    removed: Vec<Arc<dyn Engine>>,
    reply: Reply<Vec<Arc<dyn Engine>>>,
}

pub(crate) struct Scheduler {
    queue: VecDeque<FevalJob>,
    completed: BTreeMap<JobId, JobHandle>,
    waiters: HashMap<JobId, Vec<WaitReply>>,
    workers: WorkerTable,
    /// Set while a shrink drains; no worker is claimed in the meantime.
    pending_shrink: Option<PendingShrink>,
    ready_tx: mpsc::UnboundedSender<usize>,
}

impl Scheduler {
    /// Spawn the actor over `engines` and return its command channel.
    pub(crate) fn spawn(engines: Vec<Arc<dyn Engine>>) -> mpsc::UnboundedSender<Command> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();

        let scheduler = Scheduler {
            queue: VecDeque::new(),
            completed: BTreeMap::new(),
            waiters: HashMap::new(),
            workers: WorkerTable::new(engines),
            pending_shrink: None,
            ready_tx,
        };
        tokio::spawn(scheduler.run(commands_rx, ready_rx));
        commands_tx
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut ready: mpsc::UnboundedReceiver<usize>,
    ) {
        info!(workers = self.workers.len(), "Scheduler started");

        loop {
            tokio::select! {
                biased;

                Some(worker) = ready.recv() => self.worker_ready(worker),
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
            }

            self.progress();
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { job, reply } => {
                let _ = reply.send(self.submit(job));
            }
            Command::Wait { id, reply } => self.wait(id, reply),
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::JobStatus { reply } => {
                let _ = reply.send(self.job_status());
            }
            Command::WorkerStatus { reply } => {
                let _ = reply.send(WorkerStatus {
                    ready: self.workers.ready(),
                });
            }
            Command::Engines { reply } => {
                let _ = reply.send(self.workers.engines());
            }
            Command::Grow { engines, reply } => {
                let added = engines.len();
                for engine in engines {
                    self.workers.push(engine);
                }
                info!(added, workers = self.workers.len(), "Workers added");
                let _ = reply.send(self.workers.len());
            }
            Command::Shrink { target, reply } => {
                info!(from = self.workers.len(), to = target, "Shrinking worker table");
                self.pending_shrink = Some(PendingShrink {
                    target,
                    removed: Vec::new(),
                    reply,
                });
            }
            Command::Clear { reply } => {
                let _ = reply.send(self.clear());
            }
            Command::Size { reply } => {
                let _ = reply.send(self.workers.len());
            }
            Command::Shutdown { .. } => {
                invariant_violation("shutdown reached the command handler")
            }
        }
    }

    fn submit(&mut self, job: FevalJob) -> Result<JobId, PoolError> {
        let id = job.id();
        if self.is_live(id) {
            warn!(job_id = %id, "Rejecting job with an id already in the pool");
            return Err(PoolError::DuplicateJob { id });
        }

        debug!(job_id = %id, function = %job.function(), "Job queued");
        self.queue.push_back(job);
        Ok(id)
    }

    /// Whether `id` is still queued or dispatched.
    fn is_live(&self, id: JobId) -> bool {
        self.completed.contains_key(&id) || self.queue.iter().any(|job| job.id() == id)
    }

    fn worker_ready(&mut self, worker: usize) {
        debug!(worker, "Worker ready");
        self.workers.release(worker);
    }

    /// Advance after every event: drain a pending shrink, then hand out work.
    fn progress(&mut self) {
        self.continue_shrink();
        self.assign_jobs();
    }

    fn continue_shrink(&mut self) {
        let Some(pending) = self.pending_shrink.as_mut() else {
            return;
        };

        while let Some(engine) = self.workers.pop_if_ready(pending.target) {
            debug!(engine = %engine.name(), worker = self.workers.len(), "Worker removed");
            pending.removed.push(engine);
        }

        if self.workers.len() <= pending.target
            && let Some(done) = self.pending_shrink.take()
        {
            info!(workers = self.workers.len(), removed = done.removed.len(), "Shrink complete");
            if let Err(removed) = done.reply.send(done.removed) {
                // Nobody is left to stop these.
                tokio::spawn(async move {
                    join_all(removed.iter().map(|engine| engine.shutdown())).await;
                });
            }
        }
    }

    fn assign_jobs(&mut self) {
        while self.pending_shrink.is_none() {
            let Some(head) = self.queue.front_mut() else {
                return;
            };
            if head.status() == JobStatus::Wait
                && let Err(what) = head.transition_to(JobStatus::AssignToWorker)
            {
                invariant_violation(what);
            }

            let Some((worker, engine)) = self.workers.claim_free() else {
                return;
            };
            let Some(mut job) = self.queue.pop_front() else {
                invariant_violation("queue head disappeared during assignment");
            };

            if job.status() == JobStatus::Canceled {
                debug!(job_id = %job.id(), worker, "Head job was canceled, releasing worker");
                self.workers.release(worker);
                continue;
            }

            if let Err(what) = job.assign_worker(worker) {
                invariant_violation(what);
            }

            let call = FevalCall {
                job: job.id(),
                function: job.function().to_string(),
                nlhs: job.nlhs(),
                args: job.take_args(),
                output: job.output().clone(),
                error: job.error().clone(),
            };
            let (completion, handle) =
                Completion::new(Notifier::new(worker, self.ready_tx.clone()));

            info!(
                job_id = %job.id(),
                worker,
                function = %job.function(),
                "Job assigned to worker"
            );
            engine.feval(call, completion);

            self.deliver(JobHandle::new(job, handle));
        }
    }

    /// Hand a dispatched job to the first live waiter, or park it in the
    /// completion table.
    fn deliver(&mut self, mut handle: JobHandle) {
        let id = handle.id();

        if let Some(waiters) = self.waiters.remove(&id) {
            let mut waiters = waiters.into_iter();
            while let Some(waiter) = waiters.next() {
                let returned = match waiter.send(Ok(handle)) {
                    Ok(()) => {
                        for other in waiters.by_ref() {
                            let _ = other.send(Err(PoolError::JobNotExists { id }));
                        }
                        return;
                    }
                    Err(returned) => returned,
                };
                // That waiter went away; try the next one.
                match returned {
                    Ok(back) => handle = back,
                    Err(_) => invariant_violation("wait reply changed in flight"),
                }
            }
        }

        if self.completed.insert(id, handle).is_some() {
            invariant_violation(format!("job {id} dispatched twice"));
        }
    }

    fn wait(&mut self, id: JobId, reply: WaitReply) {
        if let Some(handle) = self.completed.remove(&id) {
            if let Err(Ok(handle)) = reply.send(Ok(handle)) {
                self.completed.insert(id, handle);
            }
            return;
        }

        let queued = self
            .queue
            .iter()
            .any(|job| job.id() == id && job.status() != JobStatus::Canceled);
        if queued {
            self.waiters.entry(id).or_default().push(reply);
            return;
        }

        let _ = reply.send(Err(PoolError::JobNotExists { id }));
    }

    fn cancel(&mut self, id: JobId) -> Result<JobStatus, PoolError> {
        if let Some(position) = self.queue.iter().position(|job| job.id() == id) {
            match self.queue[position].status() {
                JobStatus::Wait => {
                    if let Some(mut job) = self.queue.remove(position)
                        && let Err(what) = job.transition_to(JobStatus::Canceled)
                    {
                        invariant_violation(what);
                    }
                }
                JobStatus::AssignToWorker => {
                    // Stays at the head; discarded once a worker is claimed for it.
                    if let Err(what) = self.queue[position].transition_to(JobStatus::Canceled) {
                        invariant_violation(what);
                    }
                }
                JobStatus::Canceled => return Err(PoolError::JobNotExists { id }),
                other => invariant_violation(format!("queued job {id} has status {other}")),
            }

            self.fail_waiters(id);
            info!(job_id = %id, "Queued job canceled");
            return Ok(JobStatus::Canceled);
        }

        if let Some(handle) = self.completed.remove(&id) {
            let status = handle.cancel();
            info!(job_id = %id, %status, "Dispatched job canceled");
            return Ok(status);
        }

        Err(PoolError::JobNotExists { id })
    }

    fn fail_waiters(&mut self, id: JobId) {
        for waiter in self.waiters.remove(&id).unwrap_or_default() {
            let _ = waiter.send(Err(PoolError::JobNotExists { id }));
        }
    }

    fn job_status(&mut self) -> Vec<JobStatusEntry> {
        let queued = self.queue.iter().map(|job| JobStatusEntry {
            id: job.id(),
            status: job.status(),
            worker: job.worker(),
        });
        let mut entries: Vec<JobStatusEntry> = queued.collect();

        for (id, handle) in self.completed.iter_mut() {
            entries.push(JobStatusEntry {
                id: *id,
                status: handle.poll_status(),
                worker: handle.worker(),
            });
        }
        entries
    }

    /// Drop every job still waiting in the queue.
    fn clear(&mut self) -> usize {
        let mut removed = Vec::new();
        self.queue.retain(|job| {
            let waiting = job.status() == JobStatus::Wait;
            if waiting {
                removed.push(job.id());
            }
            !waiting
        });

        for id in &removed {
            self.fail_waiters(*id);
        }
        info!(removed = removed.len(), "Queue cleared");
        removed.len()
    }

    async fn shutdown(&mut self) {
        let in_flight = std::mem::take(&mut self.completed);
        for handle in in_flight.into_values() {
            handle.cancel();
        }

        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(PoolError::Closed));
            }
        }

        if !self.queue.is_empty() {
            warn!(dropped = self.queue.len(), "Dropping queued jobs on shutdown");
            self.queue.clear();
        }

        let mut engines = self.workers.drain();
        if let Some(pending) = self.pending_shrink.take() {
            engines.extend(pending.removed);
        }
        join_all(engines.iter().map(|engine| engine.shutdown())).await;
        info!(engines = engines.len(), "Scheduler stopped");
    }
}
