//! Worker-side glue: executor interfaces, the task run wrapper and the worker
//! process state that talks to the broker.

pub mod executor;
pub mod process;

pub use process::WorkerCore;
pub use executor::{run_task, ExecutionStatus, ExecutorFactory, StatusUpdate, TaskExecutor};
