//! Engine Pool: schedules jobs onto a resizable pool of long-lived compute engines.

pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod loader;
pub mod pool;
pub mod shim;

pub use engine::{Engine, EngineFactory};
pub use error::{Error, Result};
pub use job::{EvalJob, FevalJob, Job, JobId, JobStatus};
pub use pool::Pool;
