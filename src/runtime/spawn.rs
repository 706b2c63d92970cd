//! Abstraction over the async runtime that runs task executions.

use std::future::Future;

/// Spawns fire-and-forget futures on some runtime.
pub trait Spawn: Send + Sync {
    /// Spawn `fut`; it runs to completion independently of the caller.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
