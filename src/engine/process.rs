//! Engine backed by a long-lived child process.
//!
//! Each worker owns one child. A driver task writes requests to the child's
//! stdin and reads the matching response from its stdout, one request at a
//! time, in submission order. See [`protocol`](super::protocol) for the wire format.
//!
//! Shutdown abandons the request in flight, closes stdin, waits
//! [`SHUTDOWN_GRACE`] for the child to exit and then kills it.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::engine::protocol::{Request, Response};
use crate::engine::{Completion, Engine, EngineFactory, EngineFailure, FevalCall, select_outputs};
use crate::error::EngineError;
use crate::job::TextSink;

/// How long a child gets to exit after its stdin is closed before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

enum Pending {
    Feval {
        id: u64,
        call: FevalCall,
        completion: Completion,
    },
    Eval {
        id: u64,
        command: String,
        output: TextSink,
        error: TextSink,
        reply: oneshot::Sender<Result<(), EngineFailure>>,
    },
}

impl Pending {
    /// Fail a request that never reached the child.
    fn reject(self, reason: &str) {
        let failure = EngineFailure::new(reason);
        match self {
            Pending::Feval {
                call, completion, ..
            } => {
                call.error.append_line(reason);
                completion.finish(Err(failure));
            }
            Pending::Eval { error, reply, .. } => {
                error.append_line(reason);
                let _ = reply.send(Err(failure));
            }
        }
    }
}

/// One child process serving one worker.
pub struct ProcessEngine {
    name: String,
    next_request: AtomicU64,
    requests: Mutex<Option<mpsc::UnboundedSender<Pending>>>,
    stop_signal: Mutex<Option<oneshot::Sender<()>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessEngine {
    fn spawn(name: String, mut child: Child) -> Result<Self, EngineError> {
        let stdin = child.stdin.take().ok_or_else(|| EngineError::StartFailed {
            reason: format!("{name}: stdin was not captured"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| EngineError::StartFailed {
            reason: format!("{name}: stdout was not captured"),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let driver = Driver {
            name: name.clone(),
            child,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
            stop_signal: stop_rx,
            exited: None,
        };
        let handle = tokio::spawn(driver.run(rx));

        Ok(Self {
            name,
            next_request: AtomicU64::new(1),
            requests: Mutex::new(Some(tx)),
            stop_signal: Mutex::new(Some(stop_tx)),
            driver: Mutex::new(Some(handle)),
        })
    }

    fn submit(&self, pending: Pending) {
        let sender = self
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        match sender {
            Some(tx) => {
                if let Err(mpsc::error::SendError(pending)) = tx.send(pending) {
                    pending.reject("engine process is no longer running");
                }
            }
            None => pending.reject("engine has been shut down"),
        }
    }

    fn request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn feval(&self, call: FevalCall, completion: Completion) {
        let id = self.request_id();
        self.submit(Pending::Feval {
            id,
            call,
            completion,
        });
    }

    async fn eval(
        &self,
        command: &str,
        output: &TextSink,
        error: &TextSink,
    ) -> Result<(), EngineFailure> {
        let (reply, rx) = oneshot::channel();
        self.submit(Pending::Eval {
            id: self.request_id(),
            command: command.to_string(),
            output: output.clone(),
            error: error.clone(),
            reply,
        });

        rx.await.unwrap_or_else(|_| {
            Err(EngineFailure::new(
                "engine stopped before the command completed",
            ))
        })
    }

    async fn shutdown(&self) {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let stop = self
            .stop_signal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut driver) = driver else {
            return;
        };

        match tokio::time::timeout(2 * SHUTDOWN_GRACE, &mut driver).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(engine = %self.name, error = %e, "Engine driver task failed");
            }
            Err(_) => {
                // Dropping the driver drops the child, which is killed on drop.
                tracing::warn!(engine = %self.name, "Engine driver did not stop in time, aborting");
                driver.abort();
            }
        }
    }
}

/// Owns the child process and serializes requests to it.
struct Driver {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    /// Resolves when the engine is shut down or dropped. Watched only while
    /// `exited` is unset.
    stop_signal: oneshot::Receiver<()>,
    /// Set once the child stopped answering; later requests fail immediately.
    exited: Option<String>,
}

impl Driver {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Pending>) {
        while let Some(pending) = requests.recv().await {
            match pending {
                Pending::Feval {
                    id,
                    call,
                    completion,
                } => self.feval(id, call, completion).await,
                Pending::Eval {
                    id,
                    command,
                    output,
                    error,
                    reply,
                } => {
                    let result = self.eval(id, command, &output, &error).await;
                    let _ = reply.send(result);
                }
            }
        }

        self.stop().await;
    }

    async fn feval(&mut self, id: u64, call: FevalCall, completion: Completion) {
        let FevalCall {
            job,
            function,
            nlhs,
            args,
            output,
            error,
        } = call;

        if completion.is_cancelled() {
            tracing::debug!(engine = %self.name, job_id = %job, "Skipping canceled request");
            return;
        }

        let request = Request::feval(id, function.clone(), nlhs, args);
        let outcome = match self.roundtrip(&request).await {
            Ok(response) => {
                record(&response, &output, &error);
                if response.failed {
                    Err(EngineFailure::new(response.failure_message()))
                } else {
                    select_outputs(&function, nlhs, response.results)
                }
            }
            Err(failure) => Err(failure),
        };

        if let Err(ref failure) = outcome
            && error.is_empty()
        {
            error.append_line(&failure.message);
        }
        completion.finish(outcome);
    }

    async fn eval(
        &mut self,
        id: u64,
        command: String,
        output: &TextSink,
        error: &TextSink,
    ) -> Result<(), EngineFailure> {
        let response = match self.roundtrip(&Request::eval(id, command)).await {
            Ok(response) => response,
            Err(failure) => {
                error.append_line(&failure.message);
                return Err(failure);
            }
        };

        record(&response, output, error);
        if response.failed {
            Err(EngineFailure::new(response.failure_message()))
        } else {
            Ok(())
        }
    }

    async fn roundtrip(&mut self, request: &Request) -> Result<Response, EngineFailure> {
        if let Some(reason) = &self.exited {
            return Err(EngineFailure::new(format!("engine process exited: {reason}")));
        }

        let line = request
            .to_line()
            .map_err(|e| EngineFailure::new(format!("cannot encode request: {e}")))?;

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(self.mark_exited("stdin is closed".to_string()));
        };
        let written = tokio::select! {
            _ = &mut self.stop_signal => None,
            result = write_line(stdin, &line) => Some(result),
        };
        match written {
            None => return Err(self.mark_exited("engine shut down".to_string())),
            Some(Err(e)) => return Err(self.mark_exited(format!("write failed: {e}"))),
            Some(Ok(())) => {}
        }

        loop {
            let next = tokio::select! {
                _ = &mut self.stop_signal => None,
                next = self.lines.next_line() => Some(next),
            };
            let Some(next) = next else {
                return Err(self.mark_exited("engine shut down".to_string()));
            };

            match next {
                Ok(Some(line)) => match Response::parse(&line) {
                    Some(response) if response.id == request.id => return Ok(response),
                    Some(response) => {
                        tracing::warn!(
                            engine = %self.name,
                            expected = request.id,
                            got = response.id,
                            "Discarding response for another request"
                        );
                    }
                    None => {
                        tracing::debug!(engine = %self.name, line = %line, "Engine stdout");
                    }
                },
                Ok(None) => return Err(self.mark_exited("stdout closed".to_string())),
                Err(e) => return Err(self.mark_exited(format!("read failed: {e}"))),
            }
        }
    }

    fn mark_exited(&mut self, reason: String) -> EngineFailure {
        tracing::warn!(engine = %self.name, reason = %reason, "Engine process stopped answering");
        let failure = EngineFailure::new(format!("engine process exited: {reason}"));
        self.exited = Some(reason);
        self.stdin = None;
        failure
    }

    async fn stop(mut self) {
        self.stdin = None;

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(engine = %self.name, %status, "Engine process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(engine = %self.name, error = %e, "Failed to wait for engine process");
            }
            Err(_) => {
                tracing::warn!(engine = %self.name, "Engine process did not exit in time, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(engine = %self.name, error = %e, "Failed to kill engine process");
                }
            }
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

/// Copy the text a response carried into the job's sinks.
fn record(response: &Response, output: &TextSink, error: &TextSink) {
    if !response.output.is_empty() {
        output.append(&response.output);
    }
    if !response.error.is_empty() {
        error.append(&response.error);
    }
}

/// Spawns one [`ProcessEngine`] child per worker.
///
/// Startup options are appended to the child's command line.
#[derive(Debug)]
pub struct ProcessFactory {
    program: String,
    args: Vec<String>,
    started: AtomicUsize,
}

impl ProcessFactory {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            started: AtomicUsize::new(0),
        }
    }

    /// Split a whitespace-separated command line into program and arguments.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl EngineFactory for ProcessFactory {
    fn name(&self) -> &str {
        "process"
    }

    async fn start(&self, options: &[String]) -> Result<Arc<dyn Engine>, EngineError> {
        let n = self.started.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{n}", self.program);

        let child = Command::new(&self.program)
            .args(&self.args)
            .args(options)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::StartFailed {
                reason: format!("failed to spawn {}: {e}", self.program),
            })?;

        tracing::debug!(engine = %name, pid = ?child.id(), "Engine process started");
        Ok(Arc::new(ProcessEngine::spawn(name, child)?))
    }
}
