//! Task execution interfaces and the run wrapper reporting completion over a channel.

use async_trait::async_trait;
use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::core::{AppResult, TaskId};
use crate::protocol::{AssignedTask, RemoteError};

/// Business logic for one task type.
///
/// ```rust
/// use async_trait::async_trait;
/// use dodo_scheduler::core::AppResult;
/// use dodo_scheduler::protocol::AssignedTask;
/// use dodo_scheduler::worker::{ExecutorFactory, TaskExecutor};
///
/// struct Report;
///
/// #[async_trait]
/// impl TaskExecutor for Report {
///     async fn execute(&self, task: &AssignedTask) -> AppResult<Option<String>> {
///         Ok(Some(format!("report for {}", task.user_id)))
///     }
/// }
///
/// let factory = |task_type: &str| -> Option<Box<dyn TaskExecutor>> {
///     (task_type == "report").then(|| Box::new(Report) as Box<dyn TaskExecutor>)
/// };
/// assert!(factory.create("report").is_some());
/// assert!(factory.create("mail").is_none());
/// ```
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task; the optional string is reported as its result.
    async fn execute(&self, task: &AssignedTask) -> AppResult<Option<String>>;
}

/// Creates the executor for a task type; `None` when the type is unknown here.
pub trait ExecutorFactory: Send + Sync + 'static {
    /// Executor for `task_type`.
    fn create(&self, task_type: &str) -> Option<Box<dyn TaskExecutor>>;
}

impl<F> ExecutorFactory for F
where
    F: Fn(&str) -> Option<Box<dyn TaskExecutor>> + Send + Sync + 'static,
{
    fn create(&self, task_type: &str) -> Option<Box<dyn TaskExecutor>> {
        self(task_type)
    }
}

/// Lifecycle of a task on the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Executor started.
    Running,
    /// Executor returned normally.
    Finished {
        /// Result payload.
        result: Option<String>,
    },
    /// No executor, or the executor failed.
    Error(RemoteError),
}

impl ExecutionStatus {
    /// Whether this is a final state.
    pub const fn is_final(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// A status change for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Task id.
    pub task_id: TaskId,
    /// New status.
    pub status: ExecutionStatus,
}

/// Execute `task` and report `Running` followed by exactly one final status.
pub async fn run_task<F>(factory: &F, task: AssignedTask, updates: &Sender<StatusUpdate>)
where
    F: ExecutorFactory + ?Sized,
{
    let task_id = task.task_id;
    let report = |status: ExecutionStatus| {
        if updates.send(StatusUpdate { task_id, status }).is_err() {
            debug!(task_id, "status receiver gone");
        }
    };

    report(ExecutionStatus::Running);
    let Some(executor) = factory.create(&task.task_type) else {
        warn!(task_id, task_type = %task.task_type, "no executor for task type");
        report(ExecutionStatus::Error(RemoteError::new(
            "execution",
            format!("no executor for task type `{}`", task.task_type),
        )));
        return;
    };
    match executor.execute(&task).await {
        Ok(result) => {
            debug!(task_id, "task finished");
            report(ExecutionStatus::Finished { result });
        }
        Err(e) => {
            warn!(task_id, "task failed: {e:#}");
            report(ExecutionStatus::Error(RemoteError::from_anyhow("execution", &e)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(&self, task: &AssignedTask) -> AppResult<Option<String>> {
            if task.parameter == "fail" {
                anyhow::bail!("asked to fail");
            }
            Ok(Some(task.parameter.clone()))
        }
    }

    fn factory(task_type: &str) -> Option<Box<dyn TaskExecutor>> {
        (task_type == "echo").then(|| Box::new(Echo) as Box<dyn TaskExecutor>)
    }

    fn task(task_type: &str, parameter: &str) -> AssignedTask {
        AssignedTask {
            task_id: 1,
            task_type: task_type.into(),
            user_id: "u".into(),
            parameter: parameter.into(),
        }
    }

    #[tokio::test]
    async fn test_run_task_reports_running_then_finished() {
        let (tx, rx) = crossbeam_channel::unbounded();
        run_task(&factory, task("echo", "hi"), &tx).await;
        let statuses: Vec<ExecutionStatus> = rx.try_iter().map(|u| u.status).collect();
        assert_eq!(
            statuses,
            vec![
                ExecutionStatus::Running,
                ExecutionStatus::Finished {
                    result: Some("hi".into())
                }
            ]
        );
    }

    #[tokio::test]
    async fn test_run_task_reports_errors() {
        let (tx, rx) = crossbeam_channel::unbounded();
        run_task(&factory, task("echo", "fail"), &tx).await;
        run_task(&factory, task("unknown", ""), &tx).await;
        let finals: Vec<ExecutionStatus> = rx
            .try_iter()
            .map(|u| u.status)
            .filter(ExecutionStatus::is_final)
            .collect();
        assert_eq!(finals.len(), 2);
        assert!(finals
            .iter()
            .all(|s| matches!(s, ExecutionStatus::Error(e) if e.kind == "execution")));
    }
}
