use std::sync::Arc;

use engine_pool::config::{EngineKind, PoolConfig};
use engine_pool::engine::{BuiltinFactory, EngineFactory, ProcessFactory};
use engine_pool::error::ConfigError;
use engine_pool::loader::PoolLibrary;
use engine_pool::shim::{CommandShim, ShimError};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

fn engine_factory(
    config: &PoolConfig,
) -> Result<Arc<dyn EngineFactory>, Box<dyn std::error::Error>> {
    let factory: Arc<dyn EngineFactory> = match &config.engine {
        EngineKind::Builtin => Arc::new(BuiltinFactory::default()),
        EngineKind::Process { command } => {
            let factory = ProcessFactory::from_command_line(command).ok_or_else(|| {
                ConfigError::MissingRequired {
                    key: "ENGINE_POOL_COMMAND".to_string(),
                    hint: "Set it to the engine program and its arguments".to_string(),
                }
            })?;
            Arc::new(factory)
        }
        EngineKind::Library { path } => PoolLibrary::open(path)?.factory(),
    };
    Ok(factory)
}

fn reply_line(reply: Result<Value, ShimError>) -> String {
    let value = match reply {
        Ok(value) => json!({ "ok": true, "value": value }),
        Err(e) => json!({
            "ok": false,
            "identifier": e.identifier(),
            "message": e.to_string(),
        }),
    };
    let mut line = value.to_string();
    line.push('\n');
    line
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Stdout carries replies, so logs go to stderr
    let (log_writer, _log_guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(log_writer)
        .init();

    let config = PoolConfig::from_env()?;
    tracing::info!(
        engine = %config.engine,
        workers = config.workers,
        options = ?config.options,
        "engine-pool v{}",
        env!("CARGO_PKG_VERSION")
    );

    let factory = engine_factory(&config)?;
    let mut shim = CommandShim::new(factory);

    let mut start = vec![json!("resize"), json!(config.workers)];
    if !config.options.is_empty() {
        start.push(json!(config.options));
    }
    shim.execute(&Value::Array(start)).await?;

    let mut stdout = tokio::io::stdout();
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());

    while let Some(line) = lines.next().await {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Value>(line) {
            Ok(request) => shim.execute(&request).await,
            Err(e) => Err(ShimError::InvalidArgument {
                command: "request".to_string(),
                message: format!("not valid JSON: {e}"),
            }),
        };
        if let Err(ref e) = reply {
            tracing::warn!(identifier = e.identifier(), error = %e, "Command failed");
        }

        stdout.write_all(reply_line(reply).as_bytes()).await?;
        stdout.flush().await?;
    }

    tracing::info!("Input closed, shutting down");
    shim.shutdown().await?;
    Ok(())
}
