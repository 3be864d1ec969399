//! Configuration types.

use std::path::PathBuf;

use crate::error::ConfigError;

const DEFAULT_WORKERS: usize = 2;

/// Which engine implementation the pool drives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// In-process function registry.
    #[default]
    Builtin,
    /// One child process per worker. `command` is the program followed by its
    /// arguments, whitespace separated.
    Process { command: String },
    /// Factory exported by a shared library.
    Library { path: PathBuf },
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Builtin => "builtin",
            Self::Process { .. } => "process",
            Self::Library { .. } => "library",
        };
        write!(f, "{s}")
    }
}

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Workers started with the pool.
    pub workers: usize,
    /// Startup options passed to every engine.
    pub options: Vec<String>,
    pub engine: EngineKind,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            options: Vec::new(),
            engine: EngineKind::Builtin,
        }
    }
}

impl PoolConfig {
    /// Load configuration from `ENGINE_POOL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let workers = match lookup("ENGINE_POOL_WORKERS") {
            Some(raw) => parse_workers(&raw)?,
            None => DEFAULT_WORKERS,
        };

        let options = lookup("ENGINE_POOL_OPTIONS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|option| !option.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let engine = match lookup("ENGINE_POOL_ENGINE")
            .as_deref()
            .map(str::trim)
            .unwrap_or("builtin")
        {
            "builtin" => EngineKind::Builtin,
            "process" => EngineKind::Process {
                command: require(
                    &lookup,
                    "ENGINE_POOL_COMMAND",
                    "Set it to the engine program and its arguments",
                )?,
            },
            "library" => EngineKind::Library {
                path: PathBuf::from(require(
                    &lookup,
                    "ENGINE_POOL_LIBRARY",
                    "Set it to the path of a shared library exporting engine_pool_factory",
                )?),
            },
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "ENGINE_POOL_ENGINE".to_string(),
                    message: format!("'{other}' is not one of builtin, process, library"),
                });
            }
        };

        Ok(Self {
            workers,
            options,
            engine,
        })
    }
}

fn parse_workers(raw: &str) -> Result<usize, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "ENGINE_POOL_WORKERS".to_string(),
        message,
    };

    let workers: usize = raw
        .trim()
        .parse()
        .map_err(|e| invalid(format!("'{raw}': {e}")))?;
    if workers == 0 {
        return Err(invalid("pool size must be at least 1".to_string()));
    }
    Ok(workers)
}

fn require<F>(lookup: &F, key: &str, hint: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::MissingRequired {
            key: key.to_string(),
            hint: hint.to_string(),
        })
}
