//! Runtime adapters used to run task executions.

pub mod spawn;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_spawner;

pub use spawn::Spawn;
#[cfg(feature = "tokio-runtime")]
pub use tokio_spawner::TokioSpawner;
