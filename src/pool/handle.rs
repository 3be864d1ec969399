//! Couples a dispatched job with the engine handle that will resolve it.

use crate::engine::{EvalHandle, Outcome};
use crate::error::invariant_violation;
use crate::job::{FevalJob, JobId, JobStatus};

/// A job that has been handed to a worker, plus its pending outcome.
///
/// Lives in the completion table until a waiter takes it or it is canceled.
#[derive(Debug)]
pub struct JobHandle {
    job: FevalJob,
    handle: EvalHandle,
}

impl JobHandle {
    pub(crate) fn new(job: FevalJob, handle: EvalHandle) -> Self {
        Self { job, handle }
    }

    pub fn id(&self) -> JobId {
        self.job.id()
    }

    pub fn worker(&self) -> Option<usize> {
        self.job.worker()
    }

    /// Status without blocking: `InProgress` until the outcome arrives.
    pub fn poll_status(&mut self) -> JobStatus {
        match self.handle.poll() {
            None => JobStatus::InProgress,
            Some(Ok(_)) => JobStatus::Done,
            Some(Err(_)) => JobStatus::Error,
        }
    }

    /// Wait for the outcome and fold it into the job.
    pub async fn resolve(self) -> FevalJob {
        let Self { mut job, handle } = self;
        let outcome = handle.outcome().await;
        apply(&mut job, outcome);
        job
    }

    /// Best-effort cancel. An outcome that already arrived wins and its
    /// status is returned instead of `Canceled`.
    pub fn cancel(self) -> JobStatus {
        let Self { mut job, handle } = self;
        match handle.cancel() {
            Some(outcome) => apply(&mut job, outcome),
            None => {
                if let Err(what) = job.transition_to(JobStatus::Canceled) {
                    invariant_violation(what);
                }
            }
        }
        job.status()
    }
}

fn apply(job: &mut FevalJob, outcome: Outcome) {
    let applied = match outcome {
        Ok(results) => job.complete(results),
        Err(failure) => job.fail(&failure.message),
    };
    if let Err(what) = applied {
        invariant_violation(what);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Completion, EngineFailure, Notifier};
    use serde_json::json;

    fn dispatched(id: u64) -> (JobHandle, Completion) {
        let mut job = FevalJob::with_id(JobId::from(id), "sqrt", 1, vec![json!(4)]);
        job.transition_to(JobStatus::AssignToWorker).unwrap();
        job.assign_worker(2).unwrap();
        let (completion, handle) = Completion::new(Notifier::detached(2));
        (JobHandle::new(job, handle), completion)
    }

    #[tokio::test]
    async fn resolve_records_results() {
        let (mut handle, completion) = dispatched(1);
        assert_eq!(handle.poll_status(), JobStatus::InProgress);
        assert_eq!(handle.worker(), Some(2));

        completion.finish(Ok(vec![json!(2.0)]));
        assert_eq!(handle.poll_status(), JobStatus::Done);

        let mut job = handle.resolve().await;
        assert_eq!(job.status(), JobStatus::Done);
        assert_eq!(job.pop_result().unwrap(), vec![json!(2.0)]);
    }

    #[tokio::test]
    async fn resolve_records_failure() {
        let (handle, completion) = dispatched(2);
        completion.finish(Err(EngineFailure::new("Undefined function 'x'")));

        let mut job = handle.resolve().await;
        assert_eq!(job.status(), JobStatus::Error);
        assert!(job.error().contents().contains("Undefined function"));
        assert!(job.pop_result().is_err());
    }

    #[tokio::test]
    async fn cancel_in_flight() {
        let (handle, mut completion) = dispatched(3);
        assert_eq!(handle.cancel(), JobStatus::Canceled);
        completion.cancelled().await;
    }

    #[tokio::test]
    async fn completion_beats_cancel() {
        let (handle, completion) = dispatched(4);
        completion.finish(Ok(vec![json!(1)]));
        assert_eq!(handle.cancel(), JobStatus::Done);
    }
}
