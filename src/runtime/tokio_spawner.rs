//! Tokio runtime spawner implementation.

use std::future::Future;
use std::sync::Arc;

use super::Spawn;

/// Tokio-based spawner. Either borrows a handle to a runtime owned elsewhere
/// or owns a dedicated multi-threaded runtime.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
    owned: Option<Arc<tokio::runtime::Runtime>>,
}

impl TokioSpawner {
    /// Spawn onto the runtime behind `handle`.
    pub const fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            owned: None,
        }
    }

    /// Spawn onto the runtime the caller is running in.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    /// Create a dedicated runtime with `worker_threads` threads, kept alive as
    /// long as any clone of the spawner exists.
    pub fn with_worker_threads(worker_threads: usize) -> Result<Self, std::io::Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("dodo-task")
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            owned: Some(Arc::new(runtime)),
        })
    }
}

impl std::fmt::Debug for TokioSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioSpawner")
            .field("owns_runtime", &self.owned.is_some())
            .finish()
    }
}

impl Spawn for TokioSpawner {
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }
}
