//! Job model.
//!
//! - `id`: process-wide job identifiers and injectable generators
//! - `state`: job lifecycle state machine
//! - `sink`: append-only output/error text sinks
//! - `feval`: per-worker function-call job
//! - `eval`: broadcast command job

pub mod eval;
pub mod feval;
pub mod id;
pub mod sink;
pub mod state;

pub use eval::{EvalJob, EvalReport};
pub use feval::{FevalJob, JobReport};
pub use id::{AtomicIdGenerator, IdGenerator, JobId, ProcessIds};
pub use sink::TextSink;
pub use state::{EvalStatus, JobStatus, StateTransition};

/// Either kind of job, consumed by pattern matching.
#[derive(Debug)]
pub enum Job {
    Feval(FevalJob),
    Eval(EvalJob),
}

impl Job {
    pub fn id(&self) -> JobId {
        match self {
            Job::Feval(job) => job.id(),
            Job::Eval(job) => job.id(),
        }
    }

    pub fn output(&self) -> &TextSink {
        match self {
            Job::Feval(job) => job.output(),
            Job::Eval(job) => job.output(),
        }
    }

    pub fn error(&self) -> &TextSink {
        match self {
            Job::Feval(job) => job.error(),
            Job::Eval(job) => job.error(),
        }
    }

    /// JSON view of the job for hosts.
    pub fn to_json(&self) -> serde_json::Value {
        let report = match self {
            Job::Feval(job) => serde_json::to_value(job.report()),
            Job::Eval(job) => serde_json::to_value(job.report()),
        };
        report.unwrap_or(serde_json::Value::Null)
    }
}

impl From<FevalJob> for Job {
    fn from(job: FevalJob) -> Self {
        Job::Feval(job)
    }
}

impl From<EvalJob> for Job {
    fn from(job: EvalJob) -> Self {
        Job::Eval(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_variants_share_identity_accessors() {
        let feval: Job = FevalJob::with_id(JobId::from(1), "sqrt", 1, vec![]).into();
        let eval: Job = EvalJob::with_id(JobId::from(2), "pwd").into();
        assert_eq!(feval.id(), JobId::from(1));
        assert_eq!(eval.id(), JobId::from(2));

        eval.output().append("x");
        assert_eq!(eval.to_json()["output"], "x");
        assert_eq!(feval.to_json()["status"], "wait");
    }
}
