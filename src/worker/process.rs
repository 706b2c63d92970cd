//! Worker process state: builds the messages it sends to the broker and runs
//! the tasks the broker assigns.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use super::executor::{run_task, ExecutionStatus, ExecutorFactory, StatusUpdate};
use crate::config::WorkerConfig;
use crate::core::TaskId;
use crate::protocol::{AssignedTask, FinalStatus, Message, MessageBody, TaskResult};
use crate::runtime::Spawn;

/// A worker process talking to one broker.
pub struct WorkerCore<S> {
    config: WorkerConfig,
    process_id: String,
    factory: Arc<dyn ExecutorFactory>,
    spawner: S,
    updates_tx: Sender<StatusUpdate>,
    updates_rx: Receiver<StatusUpdate>,
    running: Mutex<BTreeSet<TaskId>>,
    stopped: AtomicBool,
}

impl<S: Spawn> WorkerCore<S> {
    /// Create a worker with a fresh process id.
    pub fn new(config: WorkerConfig, factory: impl ExecutorFactory, spawner: S) -> Self {
        let (updates_tx, updates_rx) = unbounded();
        Self {
            config,
            process_id: uuid::Uuid::new_v4().to_string(),
            factory: Arc::new(factory),
            spawner,
            updates_tx,
            updates_rx,
            running: Mutex::new(BTreeSet::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Process id of this incarnation.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Whether the broker ordered this worker to stop.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Ids of tasks not yet reported as finished.
    pub fn running_tasks(&self) -> BTreeSet<TaskId> {
        self.running.lock().clone()
    }

    /// CONNECTION_REQUEST advertising this worker's constraints.
    pub fn connection_request(&self) -> Message {
        Message::connection_request(
            self.config.worker_id.clone(),
            self.process_id.clone(),
            self.config.location.clone(),
            self.config.shared_secret.clone(),
            self.running_tasks(),
            self.config.capacity(),
        )
    }

    /// WORKER_PING asking for work.
    pub fn ping(&self) -> Message {
        Message::worker_ping(self.process_id.clone(), self.config.capacity())
    }

    /// WORKER_SHUTDOWN.
    pub fn shutdown_message(&self) -> Message {
        Message::worker_shutdown(self.process_id.clone())
    }

    /// React to a broker message.
    pub fn handle_message(&self, message: &Message) {
        match &message.body {
            MessageBody::TaskAssigned(task) => self.assign(task.clone()),
            MessageBody::KillWorker => {
                warn!(process_id = %self.process_id, "broker requested shutdown");
                self.stopped.store(true, Ordering::Release);
            }
            MessageBody::Error(e) => warn!(process_id = %self.process_id, "broker error: {e}"),
            MessageBody::Ack => {}
            other => warn!(
                process_id = %self.process_id,
                "ignoring unexpected {} from broker",
                other.type_name()
            ),
        }
    }

    /// Start executing an assigned task.
    pub fn assign(&self, task: AssignedTask) {
        info!(task_id = task.task_id, task_type = %task.task_type, "task assigned");
        self.running.lock().insert(task.task_id);
        let factory = Arc::clone(&self.factory);
        let updates = self.updates_tx.clone();
        self.spawner.spawn(async move {
            run_task(factory.as_ref(), task, &updates).await;
        });
    }

    /// Collect final statuses reported so far into one TASK_FINISHED, at most
    /// `max_pending_finished_task_notifications` results per message.
    pub fn drain_finished(&self) -> Option<Message> {
        self.collect(None)
    }

    /// Block until a task reaches a final state or the configured notification
    /// wait elapses, then behave like [`Self::drain_finished`].
    pub fn wait_finished(&self) -> Option<Message> {
        let wait = Duration::from_millis(self.config.max_wait_pending_finished_task_notifications_ms);
        let deadline = Instant::now() + wait;
        loop {
            match self.updates_rx.recv_deadline(deadline) {
                Ok(update) if update.status.is_final() => return self.collect(Some(update)),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    }

    fn collect(&self, first: Option<StatusUpdate>) -> Option<Message> {
        let limit = self.config.max_pending_finished_task_notifications.max(1);
        let mut results = Vec::new();
        let mut running = self.running.lock();
        let mut next = first;
        loop {
            let update = match next.take() {
                Some(update) => update,
                None if results.len() >= limit => break,
                None => match self.updates_rx.try_recv() {
                    Ok(update) => update,
                    Err(_) => break,
                },
            };
            if let Some(result) = into_result(update) {
                running.remove(&result.task_id);
                results.push(result);
            }
        }
        drop(running);
        (!results.is_empty()).then(|| Message::task_finished(self.process_id.clone(), results))
    }
}

fn into_result(update: StatusUpdate) -> Option<TaskResult> {
    let (status, result, error) = match update.status {
        ExecutionStatus::Running => return None,
        ExecutionStatus::Finished { result } => (FinalStatus::Finished, result, None),
        ExecutionStatus::Error(error) => (FinalStatus::Error, None, Some(error)),
    };
    Some(TaskResult {
        task_id: update.task_id,
        status,
        result,
        error,
    })
}

impl<S> std::fmt::Debug for WorkerCore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCore")
            .field("worker_id", &self.config.worker_id)
            .field("process_id", &self.process_id)
            .field("running", &self.running.lock().len())
            .finish_non_exhaustive()
    }
}
