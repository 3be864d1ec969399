//! Command shim: maps a host command plus JSON arguments onto one pool call.
//!
//! Hosts address commands by name or by numeric id (`resize` = 0 through
//! `clear` = 8). The shim holds nothing but the pool handle; the pool itself is
//! created by the first `resize`.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::engine::EngineFactory;
use crate::error::{JobError, PoolError};
use crate::job::{EvalJob, JobId, JobStatus};
use crate::pool::Pool;

/// Commands understood by [`CommandShim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    Resize,
    Submit,
    Wait,
    StatusJobs,
    StatusWorker,
    Eval,
    Cancel,
    Size,
    Clear,
}

impl CommandId {
    const ALL: [CommandId; 9] = [
        Self::Resize,
        Self::Submit,
        Self::Wait,
        Self::StatusJobs,
        Self::StatusWorker,
        Self::Eval,
        Self::Cancel,
        Self::Size,
        Self::Clear,
    ];

    pub fn code(&self) -> u8 {
        match self {
            Self::Resize => 0,
            Self::Submit => 1,
            Self::Wait => 2,
            Self::StatusJobs => 3,
            Self::StatusWorker => 4,
            Self::Eval => 5,
            Self::Cancel => 6,
            Self::Size => 7,
            Self::Clear => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Resize => "resize",
            Self::Submit => "submit",
            Self::Wait => "wait",
            Self::StatusJobs => "statusJobs",
            Self::StatusWorker => "statusWorker",
            Self::Eval => "eval",
            Self::Cancel => "cancel",
            Self::Size => "size",
            Self::Clear => "clear",
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|c| u64::from(c.code()) == code)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Accept either the command name or its numeric id.
    pub fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::String(name) => Self::from_name(name),
            Value::Number(_) => integer(value).and_then(Self::from_code),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Errors reported back to the host. Each carries a stable identifier.
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error("undefined command: {0}")]
    UndefinedCommand(String),

    #[error("{command}: expected {expected} argument(s), got {got}")]
    InvalidInputSize {
        command: CommandId,
        expected: &'static str,
        got: usize,
    },

    #[error("{command}: {message}")]
    InvalidArgument { command: String, message: String },

    #[error("pool size is equal zero")]
    EmptyPool,

    #[error("job with id={id} does not exist")]
    JobNotExists { id: JobId },

    #[error(transparent)]
    NoResults(JobError),

    #[error(transparent)]
    ExecutionError(JobError),

    #[error("{0}")]
    ErrorInCmd(String),
}

impl ShimError {
    pub fn identifier(&self) -> &'static str {
        match self {
            Self::UndefinedCommand(_) => "UndefCmd",
            Self::InvalidInputSize { .. } => "InvalidInputSize",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::EmptyPool => "EmptyPool",
            Self::JobNotExists { .. } => "JobNotExists",
            Self::NoResults(_) => "NoResults",
            Self::ExecutionError(_) => "ExecutionError",
            Self::ErrorInCmd(_) => "ErrorInCmd",
        }
    }

    fn invalid(command: CommandId, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            command: command.name().to_string(),
            message: message.into(),
        }
    }
}

impl From<PoolError> for ShimError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::EmptyPool => Self::EmptyPool,
            PoolError::JobNotExists { id } => Self::JobNotExists { id },
            other => Self::ErrorInCmd(other.to_string()),
        }
    }
}

impl From<JobError> for ShimError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NoResults { .. } => Self::NoResults(err),
            JobError::ExecutionError { .. } => Self::ExecutionError(err),
        }
    }
}

/// Non-negative integer out of a JSON number. Hosts often send whole doubles.
fn integer(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let x = value.as_f64()?;
    (x >= 0.0 && x.fract() == 0.0 && x <= u64::MAX as f64).then_some(x as u64)
}

/// Dispatches host commands to a [`Pool`].
pub struct CommandShim {
    factory: Arc<dyn EngineFactory>,
    pool: Option<Pool>,
}

impl CommandShim {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            pool: None,
        }
    }

    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    fn require_pool(&self) -> Result<&Pool, ShimError> {
        self.pool.as_ref().ok_or(ShimError::EmptyPool)
    }

    /// Run a request of the form `[command, arg, ...]`.
    pub async fn execute(&mut self, request: &Value) -> Result<Value, ShimError> {
        let Some((command, args)) = request.as_array().and_then(|items| items.split_first()) else {
            return Err(ShimError::UndefinedCommand(request.to_string()));
        };
        let command = CommandId::parse(command)
            .ok_or_else(|| ShimError::UndefinedCommand(command.to_string()))?;
        self.dispatch(command, args).await
    }

    pub async fn dispatch(
        &mut self,
        command: CommandId,
        args: &[Value],
    ) -> Result<Value, ShimError> {
        tracing::debug!(%command, args = args.len(), "Dispatching command");

        match command {
            CommandId::Resize => self.resize(args).await,
            CommandId::Submit => self.submit(args).await,
            CommandId::Wait => self.wait(args).await,
            CommandId::StatusJobs => {
                expect_args(command, args, 0, 0)?;
                let entries = self.require_pool()?.get_job_status().await?;
                let rows: Vec<Value> = entries
                    .iter()
                    .map(|entry| {
                        json!({
                            "id": entry.id,
                            "status": entry.status.code(),
                            "worker": entry.worker,
                        })
                    })
                    .collect();
                Ok(Value::Array(rows))
            }
            CommandId::StatusWorker => {
                expect_args(command, args, 0, 0)?;
                let status = self.require_pool()?.get_worker_status().await?;
                Ok(json!(status.ready))
            }
            CommandId::Eval => {
                expect_args(command, args, 1, 1)?;
                let text = args[0]
                    .as_str()
                    .ok_or_else(|| ShimError::invalid(command, "command must be a string"))?;
                let mut job = EvalJob::new(text);
                self.require_pool()?.eval(&mut job).await?;
                Ok(json!(job.report()))
            }
            CommandId::Cancel => {
                expect_args(command, args, 1, 1)?;
                let id = job_id(command, &args[0])?;
                let status = self.require_pool()?.cancel(id).await?;
                Ok(json!(status))
            }
            CommandId::Size => {
                expect_args(command, args, 0, 0)?;
                let size = match &self.pool {
                    Some(pool) => pool.size().await?,
                    None => 0,
                };
                Ok(json!(size))
            }
            CommandId::Clear => {
                expect_args(command, args, 0, 0)?;
                let removed = match &self.pool {
                    Some(pool) => pool.clear().await?,
                    None => 0,
                };
                Ok(json!(removed))
            }
        }
    }

    /// `resize n [options]`
    async fn resize(&mut self, args: &[Value]) -> Result<Value, ShimError> {
        let command = CommandId::Resize;
        expect_args(command, args, 1, 2)?;

        let workers = integer(&args[0]).ok_or_else(|| {
            ShimError::invalid(command, "pool size must be a non-negative integer")
        })?;
        let workers = usize::try_from(workers)
            .map_err(|_| ShimError::invalid(command, "pool size is too large"))?;
        let options = match args.get(1) {
            Some(value) => string_list(command, value)?,
            None => Vec::new(),
        };

        let size = match &self.pool {
            Some(pool) => pool.resize(workers, &options).await?,
            None => {
                let pool = Pool::start(Arc::clone(&self.factory), workers, &options).await?;
                self.pool = Some(pool);
                workers
            }
        };
        Ok(json!(size))
    }

    /// `submit function nlhs arg...`
    async fn submit(&self, args: &[Value]) -> Result<Value, ShimError> {
        let command = CommandId::Submit;
        if args.len() < 2 {
            return Err(ShimError::InvalidInputSize {
                command,
                expected: "at least 2",
                got: args.len(),
            });
        }

        let function = args[0]
            .as_str()
            .ok_or_else(|| ShimError::invalid(command, "function name must be a string"))?;
        let nlhs = integer(&args[1])
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| ShimError::invalid(command, "nlhs must be a non-negative integer"))?;

        let pool = self.require_pool()?;
        let id = pool
            .submit(pool.job(function, nlhs, args[2..].to_vec()))
            .await?;
        Ok(json!(id))
    }

    /// `wait id` returns the job's results and captured output.
    async fn wait(&self, args: &[Value]) -> Result<Value, ShimError> {
        let command = CommandId::Wait;
        expect_args(command, args, 1, 1)?;
        let id = job_id(command, &args[0])?;

        let mut job = self.require_pool()?.wait(id).await?;
        let output = job.output().contents();
        let results = job.pop_result()?;
        debug_assert_eq!(job.status(), JobStatus::DoneEmpty);

        Ok(json!({
            "id": id,
            "results": results,
            "output": output,
        }))
    }

    /// Shut the pool down, if one was created.
    pub async fn shutdown(&mut self) -> Result<(), ShimError> {
        if let Some(pool) = self.pool.take() {
            pool.shutdown().await?;
        }
        Ok(())
    }
}

fn expect_args(
    command: CommandId,
    args: &[Value],
    min: usize,
    max: usize,
) -> Result<(), ShimError> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = match (min, max) {
        (0, 0) => "0",
        (1, 1) => "1",
        (1, 2) => "1 or 2",
        _ => "a different number of",
    };
    Err(ShimError::InvalidInputSize {
        command,
        expected,
        got: args.len(),
    })
}

fn job_id(command: CommandId, value: &Value) -> Result<JobId, ShimError> {
    integer(value)
        .map(JobId::from)
        .ok_or_else(|| ShimError::invalid(command, "job id must be a non-negative integer"))
}

fn string_list(command: CommandId, value: &Value) -> Result<Vec<String>, ShimError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ShimError::invalid(command, "options must be strings"))
            })
            .collect(),
        _ => Err(ShimError::invalid(command, "options must be a string list")),
    }
}
