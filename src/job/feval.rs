//! Per-worker job: one function call evaluated on a single worker.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::JobError;
use crate::job::id::JobId;
use crate::job::sink::TextSink;
use crate::job::state::{JobStatus, StateTransition};

/// A function call with `nlhs` requested outputs, run on exactly one worker.
#[derive(Debug, Default)]
pub struct FevalJob {
    id: JobId,
    function: String,
    nlhs: usize,
    args: Vec<Value>,
    results: Vec<Value>,
    worker: Option<usize>,
    status: JobStatus,
    output: TextSink,
    error: TextSink,
    submitted_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    transitions: Vec<StateTransition>,
}

/// Serializable view of a job, handed back to hosts after `wait`.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: JobId,
    pub function: String,
    pub status: JobStatus,
    pub worker: Option<usize>,
    pub results: Vec<Value>,
    pub output: String,
    pub error: String,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FevalJob {
    /// Create a job with an identifier from the process-wide generator.
    pub fn new(function: impl Into<String>, nlhs: usize, args: Vec<Value>) -> Self {
        Self::with_id(JobId::next(), function, nlhs, args)
    }

    /// Create a job with an explicit identifier.
    pub fn with_id(id: JobId, function: impl Into<String>, nlhs: usize, args: Vec<Value>) -> Self {
        Self {
            id,
            function: function.into(),
            nlhs,
            args,
            status: JobStatus::Wait,
            ..Self::default()
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn nlhs(&self) -> usize {
        self.nlhs
    }

    /// Input arguments. Empty once the job has been handed to a worker.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Index of the worker the job runs or ran on.
    pub fn worker(&self) -> Option<usize> {
        self.worker
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn output(&self) -> &TextSink {
        &self.output
    }

    pub fn error(&self) -> &TextSink {
        &self.error
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Transition to a new status.
    pub(crate) fn transition_to(&mut self, new_status: JobStatus) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "job {}: cannot transition from {} to {}",
                self.id, self.status, new_status
            ));
        }

        self.transitions.push(StateTransition {
            from: self.status,
            to: new_status,
            timestamp: Utc::now(),
        });
        self.status = new_status;

        if new_status.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.submitted_at = Some(Utc::now());
    }

    /// Record the worker and move `AssignToWorker -> InProgress`.
    pub(crate) fn assign_worker(&mut self, worker: usize) -> Result<(), String> {
        self.transition_to(JobStatus::InProgress)?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Move the inputs out; they travel with the call to the engine.
    pub(crate) fn take_args(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.args)
    }

    pub(crate) fn complete(&mut self, results: Vec<Value>) -> Result<(), String> {
        self.transition_to(JobStatus::Done)?;
        self.results = results;
        Ok(())
    }

    /// Record a failed computation. The message lands in the error sink
    /// unless the engine already wrote something there.
    pub(crate) fn fail(&mut self, message: &str) -> Result<(), String> {
        self.transition_to(JobStatus::Error)?;
        if self.error.is_empty() {
            self.error.append_line(message);
        }
        Ok(())
    }

    fn result_error(&self) -> JobError {
        match self.status {
            JobStatus::Error => JobError::ExecutionError {
                id: self.id,
                message: self.error.contents().trim_end().to_string(),
            },
            status => JobError::NoResults {
                id: self.id,
                status,
            },
        }
    }

    /// Borrow the results of a finished job.
    pub fn peek_result(&self) -> Result<&[Value], JobError> {
        if self.status == JobStatus::Done {
            Ok(&self.results)
        } else {
            Err(self.result_error())
        }
    }

    /// Take the results out of a finished job. Works exactly once.
    pub fn pop_result(&mut self) -> Result<Vec<Value>, JobError> {
        if self.status != JobStatus::Done {
            return Err(self.result_error());
        }
        self.transition_to(JobStatus::DoneEmpty)
            .map_err(|_| self.result_error())?;
        Ok(std::mem::take(&mut self.results))
    }

    pub fn report(&self) -> JobReport {
        JobReport {
            id: self.id,
            function: self.function.clone(),
            status: self.status,
            worker: self.worker,
            results: self.results.clone(),
            output: self.output.contents(),
            error: self.error.contents(),
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatched(id: u64) -> FevalJob {
        let mut job = FevalJob::with_id(JobId::from(id), "sqrt", 1, vec![json!(4.0)]);
        job.transition_to(JobStatus::AssignToWorker).unwrap();
        job.assign_worker(1).unwrap();
        job
    }

    #[test]
    fn new_job_waits() {
        let job = FevalJob::with_id(JobId::from(5), "sqrt", 1, vec![json!(2.0)]);
        assert_eq!(job.id(), JobId::from(5));
        assert_eq!(job.status(), JobStatus::Wait);
        assert_eq!(job.worker(), None);
        assert_eq!(job.args().len(), 1);
        assert!(job.output().is_empty());
    }

    #[test]
    fn default_job_is_empty() {
        let job = FevalJob::default();
        assert!(job.id().is_none());
        assert_eq!(job.status(), JobStatus::Empty);
    }

    #[test]
    fn assign_requires_assign_to_worker() {
        let mut job = FevalJob::with_id(JobId::from(1), "sqrt", 1, vec![]);
        assert!(job.assign_worker(0).is_err());
        assert_eq!(job.worker(), None);

        job.transition_to(JobStatus::AssignToWorker).unwrap();
        job.assign_worker(0).unwrap();
        assert_eq!(job.status(), JobStatus::InProgress);
        assert_eq!(job.worker(), Some(0));
    }

    #[test]
    fn pop_result_once() {
        let mut job = dispatched(2);
        job.complete(vec![json!(2.0)]).unwrap();
        assert!(job.finished_at().is_some());
        assert_eq!(job.peek_result().unwrap(), &[json!(2.0)]);

        let results = job.pop_result().unwrap();
        assert_eq!(results, vec![json!(2.0)]);
        assert_eq!(job.status(), JobStatus::DoneEmpty);

        match job.pop_result() {
            Err(JobError::NoResults { id, status }) => {
                assert_eq!(id, JobId::from(2));
                assert_eq!(status, JobStatus::DoneEmpty);
            }
            other => panic!("expected NoResults, got {other:?}"),
        }
    }

    #[test]
    fn failed_job_raises_execution_error() {
        let mut job = dispatched(3);
        job.fail("Undefined function 'sqqqqrt'").unwrap();
        assert_eq!(job.status(), JobStatus::Error);
        assert!(!job.error().is_empty());

        match job.pop_result() {
            Err(JobError::ExecutionError { id, message }) => {
                assert_eq!(id, JobId::from(3));
                assert!(message.contains("sqqqqrt"));
            }
            other => panic!("expected ExecutionError, got {other:?}"),
        }
        assert!(job.peek_result().is_err());
    }

    #[test]
    fn fail_keeps_engine_error_text() {
        let mut job = dispatched(4);
        job.error().append_line("engine said no");
        job.fail("generic failure").unwrap();
        assert_eq!(job.error().contents(), "engine said no\n");
    }

    #[test]
    fn completed_job_cannot_be_canceled() {
        let mut job = dispatched(6);
        job.complete(vec![]).unwrap();
        assert!(job.transition_to(JobStatus::Canceled).is_err());
        assert_eq!(job.status(), JobStatus::Done);
    }

    #[test]
    fn take_args_moves_inputs() {
        let mut job = FevalJob::with_id(JobId::from(7), "plus", 1, vec![json!(1), json!(2)]);
        let args = job.take_args();
        assert_eq!(args.len(), 2);
        assert!(job.args().is_empty());
    }

    #[test]
    fn report_serializes() {
        let mut job = dispatched(8);
        job.complete(vec![json!(2.0)]).unwrap();
        let report = serde_json::to_value(job.report()).unwrap();
        assert_eq!(report["id"], 8);
        assert_eq!(report["status"], "done");
        assert_eq!(report["worker"], 1);
        assert_eq!(report["results"][0], 2.0);
        assert_eq!(job.transitions().len(), 3);
    }
}
