//! Loading engine factories out of shared libraries.
//!
//! A plugin exports one function, `engine_pool_factory`, returning a boxed
//! [`EngineFactory`]; [`export_engine_factory!`](crate::export_engine_factory)
//! generates it. Plugins must be built with the same compiler as the host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use libloading::Library;

use crate::engine::{Completion, Engine, EngineFactory, EngineFailure, FevalCall};
use crate::error::{EngineError, Error, LoaderError};
use crate::job::TextSink;
use crate::pool::Pool;

/// Name of the symbol a plugin library must export.
pub const FACTORY_SYMBOL: &str = "engine_pool_factory";

/// Signature of the exported factory constructor.
pub type FactoryConstructor = fn() -> Box<dyn EngineFactory>;

/// Define the `engine_pool_factory` entry point of a plugin library.
///
/// ```ignore
/// engine_pool::export_engine_factory!(MyFactory::default());
/// ```
#[macro_export]
macro_rules! export_engine_factory {
    ($factory:expr) => {
        #[unsafe(no_mangle)]
        pub fn engine_pool_factory() -> ::std::boxed::Box<dyn $crate::engine::EngineFactory> {
            ::std::boxed::Box::new($factory)
        }
    };
}

/// A loaded plugin library and the factory it exported.
///
/// The library stays mapped as long as this value or any engine started
/// through [`PoolLibrary::factory`] is alive.
pub struct PoolLibrary {
    path: PathBuf,
    factory: Arc<LibraryFactory>,
}

impl PoolLibrary {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoaderError> {
        let path = path.as_ref().to_path_buf();

        // SAFETY: loading runs the library's initializers; plugins are trusted
        // code built against this crate.
        let library = unsafe { Library::new(&path) }.map_err(|e| LoaderError::CannotLoadLibrary {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        // SAFETY: the symbol type matches what `export_engine_factory!` defines.
        let constructor: FactoryConstructor =
            match unsafe { library.get::<FactoryConstructor>(FACTORY_SYMBOL.as_bytes()) } {
                Ok(symbol) => *symbol,
                Err(e) => {
                    return Err(LoaderError::CannotLoadFunction {
                        name: FACTORY_SYMBOL.to_string(),
                        reason: e.to_string(),
                    });
                }
            };

        let inner = constructor();
        tracing::info!(path = %path.display(), factory = inner.name(), "Engine library loaded");

        Ok(Self {
            path,
            factory: Arc::new(LibraryFactory {
                inner,
                library: Arc::new(library),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn factory(&self) -> Arc<dyn EngineFactory> {
        Arc::clone(&self.factory) as Arc<dyn EngineFactory>
    }

    /// Start a pool of `workers` engines from this library's factory.
    pub async fn create_pool(&self, workers: usize, options: &[String]) -> Result<Pool, Error> {
        Ok(Pool::start(self.factory(), workers, options).await?)
    }
}

/// Factory wrapper that keeps the library mapped.
struct LibraryFactory {
    // Declared before `library` so it is dropped first.
    inner: Box<dyn EngineFactory>,
    library: Arc<Library>,
}

#[async_trait]
impl EngineFactory for LibraryFactory {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn start(&self, options: &[String]) -> Result<Arc<dyn Engine>, EngineError> {
        let inner = self.inner.start(options).await?;
        Ok(Arc::new(LibraryEngine {
            inner,
            _library: Arc::clone(&self.library),
        }))
    }
}

struct LibraryEngine {
    inner: Arc<dyn Engine>,
    _library: Arc<Library>,
}

#[async_trait]
impl Engine for LibraryEngine {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn feval(&self, call: FevalCall, completion: Completion) {
        self.inner.feval(call, completion);
    }

    async fn eval(
        &self,
        command: &str,
        output: &TextSink,
        error: &TextSink,
    ) -> Result<(), EngineFailure> {
        self.inner.eval(command, output, error).await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}
