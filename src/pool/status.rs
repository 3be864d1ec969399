//! Point-in-time snapshots returned by the pool's status queries.

use serde::Serialize;

use crate::job::{JobId, JobStatus};

/// One row of [`Pool::get_job_status`](super::Pool::get_job_status).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobStatusEntry {
    pub id: JobId,
    pub status: JobStatus,
    /// Worker the job runs on. `None` while it is still queued.
    pub worker: Option<usize>,
}

/// Ready flag of every worker, by index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub ready: Vec<bool>,
}

impl WorkerStatus {
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.iter().filter(|ready| **ready).count()
    }

    pub fn busy_count(&self) -> usize {
        self.len() - self.ready_count()
    }
}
