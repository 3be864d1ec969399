//! Compute engines: the long-lived sessions that actually run jobs.
//!
//! The scheduler only needs the contract defined here:
//! - [`EngineFactory`] starts a session from a list of startup options
//! - [`Engine::feval`] begins an asynchronous function call and reports back
//!   through a [`Completion`]
//! - [`Engine::eval`] runs a command string to completion
//!
//! Two implementations ship with the crate: [`builtin`] (in-process function
//! registry) and [`process`] (one child process per worker speaking
//! newline-delimited JSON).

pub mod builtin;
pub mod process;
pub mod protocol;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::EngineError;
use crate::job::{JobId, TextSink};

pub use builtin::{BuiltinEngine, BuiltinFactory, FunctionRegistry};
pub use process::{ProcessEngine, ProcessFactory};

/// A remote computation raised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineFailure {
    pub message: String,
}

impl EngineFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn dropped() -> Self {
        Self::new("computation was dropped before it completed")
    }
}

/// Result of one function call: its output values, or the failure it raised.
pub type Outcome = Result<Vec<Value>, EngineFailure>;

/// Marks a worker ready again once its computation is over.
///
/// Carries the worker index it was created for, so the scheduler never has to
/// guess which slot to release. Fires exactly once: through [`Notifier::notify`]
/// or, failing that, when dropped.
#[derive(Debug)]
pub struct Notifier {
    worker: usize,
    ready: Option<mpsc::UnboundedSender<usize>>,
}

impl Notifier {
    pub fn new(worker: usize, ready: mpsc::UnboundedSender<usize>) -> Self {
        Self {
            worker,
            ready: Some(ready),
        }
    }

    /// A notifier that reports to nobody. For driving engines outside a pool.
    pub fn detached(worker: usize) -> Self {
        Self {
            worker,
            ready: None,
        }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn notify(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(ready) = self.ready.take() {
            // The scheduler may already be gone during shutdown.
            let _ = ready.send(self.worker);
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Engine side of an asynchronous function call.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<Outcome>,
    notifier: Notifier,
}

impl Completion {
    /// Create a completion and the handle that observes it.
    pub fn new(notifier: Notifier) -> (Self, EvalHandle) {
        let (tx, rx) = oneshot::channel();
        (Self { tx, notifier }, EvalHandle::new(rx))
    }

    pub fn worker(&self) -> usize {
        self.notifier.worker()
    }

    /// Deliver the outcome, then release the worker.
    pub fn finish(self, outcome: Outcome) {
        let Completion { tx, notifier } = self;
        let _ = tx.send(outcome);
        notifier.notify();
    }

    /// True once the handle was canceled or dropped.
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the handle is canceled or dropped.
    pub async fn cancelled(&mut self) {
        self.tx.closed().await
    }
}

/// Caller side of an asynchronous function call.
#[derive(Debug)]
pub struct EvalHandle {
    rx: oneshot::Receiver<Outcome>,
    resolved: Option<Outcome>,
}

impl EvalHandle {
    fn new(rx: oneshot::Receiver<Outcome>) -> Self {
        Self { rx, resolved: None }
    }

    /// Non-blocking check. Returns the outcome once it has arrived.
    pub fn poll(&mut self) -> Option<&Outcome> {
        if self.resolved.is_none() {
            match self.rx.try_recv() {
                Ok(outcome) => self.resolved = Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.resolved = Some(Err(EngineFailure::dropped()))
                }
            }
        }
        self.resolved.as_ref()
    }

    /// Wait for the computation to resolve.
    pub async fn outcome(mut self) -> Outcome {
        if let Some(outcome) = self.resolved.take() {
            return outcome;
        }
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineFailure::dropped()),
        }
    }

    /// Best-effort cancellation.
    ///
    /// Returns the outcome if it was delivered before the cancel took effect;
    /// in that case the completion wins and nothing was canceled.
    pub fn cancel(mut self) -> Option<Outcome> {
        if let Some(outcome) = self.resolved.take() {
            return Some(outcome);
        }
        self.rx.close();
        self.rx.try_recv().ok()
    }
}

/// Keep the first `nlhs` results; fewer than requested is a failure.
pub(crate) fn select_outputs(function: &str, nlhs: usize, mut results: Vec<Value>) -> Outcome {
    if results.len() < nlhs {
        return Err(EngineFailure::new(format!(
            "{function}: too many output arguments (requested {nlhs}, produced {})",
            results.len()
        )));
    }
    results.truncate(nlhs);
    Ok(results)
}

/// One function call handed to an engine.
#[derive(Debug)]
pub struct FevalCall {
    pub job: JobId,
    pub function: String,
    pub nlhs: usize,
    pub args: Vec<Value>,
    pub output: TextSink,
    pub error: TextSink,
}

/// A running compute session.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Begin `call` asynchronously and report through `completion`. Must not block.
    fn feval(&self, call: FevalCall, completion: Completion);

    /// Evaluate a command string to completion, writing into the given sinks.
    async fn eval(
        &self,
        command: &str,
        output: &TextSink,
        error: &TextSink,
    ) -> Result<(), EngineFailure>;

    /// Stop the session. Called once the worker has left the pool.
    async fn shutdown(&self) {}
}

/// Starts engine sessions.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, options: &[String]) -> Result<Arc<dyn Engine>, EngineError>;
}

/// Start `count` engines concurrently.
///
/// Either all of them come up, or the ones that did start are shut down again
/// and the first failure is returned.
pub async fn start_engines(
    factory: &dyn EngineFactory,
    count: usize,
    options: &[String],
) -> Result<Vec<Arc<dyn Engine>>, EngineError> {
    let results = join_all((0..count).map(|_| factory.start(options))).await;

    let mut engines = Vec::with_capacity(count);
    let mut failure = None;
    for result in results {
        match result {
            Ok(engine) => engines.push(engine),
            Err(e) if failure.is_none() => failure = Some(e),
            Err(e) => tracing::warn!(error = %e, "Additional engine start failure"),
        }
    }

    if let Some(e) = failure {
        tracing::error!(
            factory = factory.name(),
            started = engines.len(),
            requested = count,
            error = %e,
            "Engine start failed, shutting down the engines that did start"
        );
        join_all(engines.iter().map(|engine| engine.shutdown())).await;
        return Err(e);
    }

    tracing::info!(factory = factory.name(), count, "Engines started");
    Ok(engines)
}
