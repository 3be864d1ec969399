//! In-process engine backed by a registry of named async functions.
//!
//! Each worker is a lightweight session sharing one [`FunctionRegistry`].
//! Calls run on their own tokio task and stop early when the caller cancels.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::engine::{Completion, Engine, EngineFactory, EngineFailure, FevalCall, select_outputs};
use crate::error::EngineError;
use crate::job::TextSink;

/// A named function the builtin engine can evaluate.
#[async_trait]
pub trait Function: Send + Sync {
    fn name(&self) -> &str;

    /// Run the function. Anything printed goes to `output`.
    async fn call(
        &self,
        nlhs: usize,
        args: Vec<Value>,
        output: &TextSink,
    ) -> Result<Vec<Value>, EngineFailure>;
}

/// Registry of available functions.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn Function>>,
}

impl FunctionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the standard functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Sqrt));
        registry.register(Arc::new(Plus));
        registry.register(Arc::new(Pause));
        registry.register(Arc::new(Disp));
        registry.register(Arc::new(Raise));
        registry.register(Arc::new(Pwd));
        registry.register(Arc::new(Identity));
        registry
    }

    /// Register a function, replacing any previous one with the same name.
    pub fn register(&mut self, function: Arc<dyn Function>) {
        let name = function.name().to_string();
        if self.functions.insert(name.clone(), function).is_some() {
            tracing::debug!(function = %name, "Replaced registered function");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.functions.get(name).cloned()
    }

    /// List registered function names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up and call `name`, returning every value it produced.
    pub async fn invoke(
        &self,
        name: &str,
        nlhs: usize,
        args: Vec<Value>,
        output: &TextSink,
    ) -> Result<Vec<Value>, EngineFailure> {
        let function = self
            .get(name)
            .ok_or_else(|| EngineFailure::new(format!("Undefined function '{name}'")))?;
        function.call(nlhs, args, output).await
    }
}

/// In-process engine session.
pub struct BuiltinEngine {
    name: String,
    registry: Arc<FunctionRegistry>,
}

impl BuiltinEngine {
    pub fn new(name: impl Into<String>, registry: Arc<FunctionRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
        }
    }
}

#[async_trait]
impl Engine for BuiltinEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn feval(&self, call: FevalCall, mut completion: Completion) {
        let registry = Arc::clone(&self.registry);
        let engine = self.name.clone();

        tokio::spawn(async move {
            let FevalCall {
                job,
                function,
                nlhs,
                args,
                output,
                error,
            } = call;

            let outcome = tokio::select! {
                outcome = registry.invoke(&function, nlhs, args, &output) => {
                    outcome.and_then(|results| select_outputs(&function, nlhs, results))
                }
                _ = completion.cancelled() => {
                    tracing::debug!(engine = %engine, job_id = %job, "Call canceled");
                    return;
                }
            };

            if let Err(ref failure) = outcome {
                error.append_line(&failure.message);
            }
            completion.finish(outcome);
        });
    }

    async fn eval(
        &self,
        command: &str,
        output: &TextSink,
        error: &TextSink,
    ) -> Result<(), EngineFailure> {
        let mut tokens = command.split_whitespace();
        let Some(name) = tokens.next() else {
            return Ok(());
        };
        let args: Vec<Value> = tokens.map(parse_token).collect();

        match self.registry.invoke(name, 0, args, output).await {
            Ok(results) => {
                for value in results {
                    output.append_line(&format!("ans = {value}"));
                }
                Ok(())
            }
            Err(failure) => {
                error.append_line(&failure.message);
                Err(failure)
            }
        }
    }
}

/// Interpret a command token as JSON when it parses, else as a bare string.
fn parse_token(token: &str) -> Value {
    serde_json::from_str(token).unwrap_or_else(|_| Value::String(token.to_string()))
}

/// Starts [`BuiltinEngine`] sessions sharing one registry.
pub struct BuiltinFactory {
    registry: Arc<FunctionRegistry>,
    started: AtomicUsize,
}

impl BuiltinFactory {
    pub fn new(registry: FunctionRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            started: AtomicUsize::new(0),
        }
    }
}

impl Default for BuiltinFactory {
    fn default() -> Self {
        Self::new(FunctionRegistry::with_builtins())
    }
}

#[async_trait]
impl EngineFactory for BuiltinFactory {
    fn name(&self) -> &str {
        "builtin"
    }

    async fn start(&self, options: &[String]) -> Result<Arc<dyn Engine>, EngineError> {
        let n = self.started.fetch_add(1, Ordering::Relaxed);
        let name = format!("builtin-{n}");
        tracing::debug!(engine = %name, ?options, "Starting builtin engine");
        Ok(Arc::new(BuiltinEngine::new(name, Arc::clone(&self.registry))))
    }
}

// ── Standard functions ──────────────────────────────────────────────

fn number(function: &str, args: &[Value], index: usize) -> Result<f64, EngineFailure> {
    args.get(index).and_then(Value::as_f64).ok_or_else(|| {
        EngineFailure::new(format!(
            "{function}: argument {} must be a number",
            index + 1
        ))
    })
}

fn number_value(function: &str, x: f64) -> Result<Value, EngineFailure> {
    serde_json::Number::from_f64(x)
        .map(Value::Number)
        .ok_or_else(|| {
            EngineFailure::new(format!("{function}: result {x} is not a finite number"))
        })
}

struct Sqrt;

#[async_trait]
impl Function for Sqrt {
    fn name(&self) -> &str {
        "sqrt"
    }

    async fn call(
        &self,
        _nlhs: usize,
        args: Vec<Value>,
        _output: &TextSink,
    ) -> Result<Vec<Value>, EngineFailure> {
        let x = number("sqrt", &args, 0)?;
        if x < 0.0 {
            return Err(EngineFailure::new("sqrt: argument must be non-negative"));
        }
        Ok(vec![number_value("sqrt", x.sqrt())?])
    }
}

struct Plus;

#[async_trait]
impl Function for Plus {
    fn name(&self) -> &str {
        "plus"
    }

    async fn call(
        &self,
        _nlhs: usize,
        args: Vec<Value>,
        _output: &TextSink,
    ) -> Result<Vec<Value>, EngineFailure> {
        let mut sum = 0.0;
        for i in 0..args.len() {
            sum += number("plus", &args, i)?;
        }
        Ok(vec![number_value("plus", sum)?])
    }
}

/// `pause(seconds)`: sleeps without holding a thread.
struct Pause;

#[async_trait]
impl Function for Pause {
    fn name(&self) -> &str {
        "pause"
    }

    async fn call(
        &self,
        _nlhs: usize,
        args: Vec<Value>,
        _output: &TextSink,
    ) -> Result<Vec<Value>, EngineFailure> {
        let seconds = number("pause", &args, 0)?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(EngineFailure::new(
                "pause: duration must be a non-negative number",
            ));
        }
        // Capped at one day.
        let duration = Duration::try_from_secs_f64(seconds.min(86_400.0))
            .map_err(|e| EngineFailure::new(format!("pause: {e}")))?;
        tokio::time::sleep(duration).await;
        Ok(Vec::new())
    }
}

struct Disp;

#[async_trait]
impl Function for Disp {
    fn name(&self) -> &str {
        "disp"
    }

    async fn call(
        &self,
        _nlhs: usize,
        args: Vec<Value>,
        output: &TextSink,
    ) -> Result<Vec<Value>, EngineFailure> {
        for value in args {
            match value {
                Value::String(s) => output.append_line(&s),
                other => output.append_line(&other.to_string()),
            }
        }
        Ok(Vec::new())
    }
}

/// `error(message)`: always raises.
struct Raise;

#[async_trait]
impl Function for Raise {
    fn name(&self) -> &str {
        "error"
    }

    async fn call(
        &self,
        _nlhs: usize,
        args: Vec<Value>,
        _output: &TextSink,
    ) -> Result<Vec<Value>, EngineFailure> {
        let message = match args.first() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "error".to_string(),
        };
        Err(EngineFailure::new(message))
    }
}

struct Pwd;

#[async_trait]
impl Function for Pwd {
    fn name(&self) -> &str {
        "pwd"
    }

    async fn call(
        &self,
        _nlhs: usize,
        _args: Vec<Value>,
        _output: &TextSink,
    ) -> Result<Vec<Value>, EngineFailure> {
        let cwd =
            std::env::current_dir().map_err(|e| EngineFailure::new(format!("pwd: {e}")))?;
        Ok(vec![json!(cwd.display().to_string())])
    }
}

/// Returns its arguments unchanged.
struct Identity;

#[async_trait]
impl Function for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    async fn call(
        &self,
        _nlhs: usize,
        args: Vec<Value>,
        _output: &TextSink,
    ) -> Result<Vec<Value>, EngineFailure> {
        Ok(args)
    }
}
