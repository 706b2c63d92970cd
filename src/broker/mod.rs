//! In-process broker facade: turns worker protocol traffic into heap inserts
//! and extractions, and keeps the per-worker and global resource accounting.
//!
//! Lock order is `workers`, then `global_usage`, then the heap's own lock, then
//! `tasks`. Nothing here does network I/O; a transport feeds
//! [`Broker::handle_message`] and sends back what it returns.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::core::{
    HeapStats, ResourceRequirement, ResourceScope, ResourceUsageCounters, SchedulerError,
    TakeRequest, TaskHeap, TaskId, TaskPropertiesResolver, TASKTYPE_ANY,
};
use crate::protocol::{
    AssignedTask, FinalStatus, Message, MessageBody, RemoteError, TaskResult, WorkerCapacity,
};

/// Errors raised while serving worker traffic.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Message from a process that never connected.
    #[error("unknown worker process `{0}`")]
    UnknownWorker(String),
    /// Shared secret mismatch.
    #[error("authentication failed for worker `{0}`")]
    AuthenticationFailed(String),
    /// Message not valid in this direction or state.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Failure from the scheduling core.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl BrokerError {
    /// Structured form sent back to the worker.
    pub fn to_remote(&self) -> RemoteError {
        let kind = match self {
            Self::UnknownWorker(_) | Self::Protocol(_) => "protocol",
            Self::AuthenticationFailed(_) => "auth",
            Self::Scheduler(_) => "scheduler",
        };
        RemoteError::new(kind, self.to_string())
    }
}

#[derive(Debug, Clone)]
struct TaskRecord {
    task_type: String,
    user_id: String,
    parameter: String,
}

#[derive(Debug, Clone)]
struct RunningTask {
    task_type: String,
    resources: Vec<ResourceRequirement>,
}

#[derive(Debug)]
struct WorkerSession {
    worker_id: String,
    capacity: WorkerCapacity,
    usage: ResourceUsageCounters,
    running: HashMap<TaskId, RunningTask>,
}

impl WorkerSession {
    /// Remaining slots per task type; `any` counts running tasks of types
    /// without their own limit.
    fn available_slots(&self) -> HashMap<String, u32> {
        let limits = &self.capacity.max_threads_by_task_type;
        limits
            .iter()
            .map(|(task_type, &limit)| {
                let running = self
                    .running
                    .values()
                    .filter(|r| {
                        if task_type == TASKTYPE_ANY {
                            r.task_type == TASKTYPE_ANY || !limits.contains_key(&r.task_type)
                        } else {
                            &r.task_type == task_type
                        }
                    })
                    .count();
                let running = u32::try_from(running).unwrap_or(u32::MAX);
                (task_type.clone(), limit.saturating_sub(running))
            })
            .collect()
    }

    fn max_tasks(&self) -> usize {
        (self.capacity.max_threads as usize).saturating_sub(self.running.len())
    }
}

/// Broker-side scheduler state shared by all connection handlers.
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    heap: TaskHeap,
    global_usage: Mutex<ResourceUsageCounters>,
    workers: Mutex<HashMap<String, WorkerSession>>,
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
    next_task_id: AtomicU64,
}

impl Broker {
    /// Create a broker. Prefer [`crate::builders::build_broker`], which validates `config`.
    pub fn new(config: BrokerConfig, resolver: impl TaskPropertiesResolver + 'static) -> Self {
        let heap = TaskHeap::with_capacity(config.initial_heap_capacity, resolver)
            .with_max_fragmentation(config.max_fragmentation);
        Self {
            config,
            heap,
            global_usage: Mutex::new(ResourceUsageCounters::new()),
            workers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(1),
        }
    }

    /// The scheduling heap.
    pub const fn heap(&self) -> &TaskHeap {
        &self.heap
    }

    /// Heap counters.
    pub fn stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Snapshot of broker-wide resource usage.
    pub fn global_usage(&self) -> ResourceUsageCounters {
        self.global_usage.lock().clone()
    }

    /// Ids of tasks currently assigned to `process_id`, sorted.
    pub fn running_tasks(&self, process_id: &str) -> Option<BTreeSet<TaskId>> {
        self.workers
            .lock()
            .get(process_id)
            .map(|s| s.running.keys().copied().collect())
    }

    /// Queue a new task and return its id.
    pub fn submit_task(
        &self,
        task_type: &str,
        user_id: &str,
        parameter: impl Into<String>,
    ) -> Result<TaskId, BrokerError> {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().insert(
            task_id,
            TaskRecord {
                task_type: task_type.to_owned(),
                user_id: user_id.to_owned(),
                parameter: parameter.into(),
            },
        );
        if let Err(e) = self.heap.insert(task_id, task_type, user_id) {
            self.tasks.lock().remove(&task_id);
            return Err(e.into());
        }
        debug!(task_id, task_type, user_id, "task submitted");
        Ok(task_id)
    }

    /// Serve one worker message. Failures become an ERROR reply.
    pub fn handle_message(&self, message: &Message) -> Vec<Message> {
        match self.dispatch(message) {
            Ok(replies) => replies,
            Err(e) => {
                warn!(message = %message, "request failed: {e}");
                vec![message.reply(MessageBody::Error(e.to_remote()))]
            }
        }
    }

    fn dispatch(&self, message: &Message) -> Result<Vec<Message>, BrokerError> {
        match &message.body {
            MessageBody::ConnectionRequest {
                worker_id,
                process_id,
                location,
                shared_secret,
                running_tasks,
                capacity,
                ..
            } => {
                if shared_secret != &self.config.shared_secret {
                    return Err(BrokerError::AuthenticationFailed(worker_id.clone()));
                }
                self.connect(worker_id, process_id, running_tasks, capacity.clone());
                info!(worker_id, process_id, location, "worker connected");
                Ok(vec![message.reply(MessageBody::Ack)])
            }
            MessageBody::WorkerPing {
                process_id,
                capacity,
            } => {
                let assigned = self.poll(process_id, capacity.clone())?;
                if assigned.is_empty() {
                    return Ok(vec![message.reply(MessageBody::Ack)]);
                }
                Ok(assigned
                    .into_iter()
                    .map(|task| message.reply(MessageBody::TaskAssigned(task)))
                    .collect())
            }
            MessageBody::TaskFinished {
                process_id,
                results,
            } => {
                self.task_finished(process_id, results)?;
                Ok(vec![message.reply(MessageBody::Ack)])
            }
            MessageBody::WorkerShutdown => {
                let process_id = message
                    .worker_process_id
                    .as_deref()
                    .ok_or_else(|| BrokerError::Protocol("shutdown without process id".into()))?;
                self.disconnect_worker(process_id)?;
                Ok(vec![message.reply(MessageBody::Ack)])
            }
            other => Err(BrokerError::Protocol(format!(
                "unexpected {} from worker",
                other.type_name()
            ))),
        }
    }

    /// Register a worker process. Earlier sessions of the same worker id, and
    /// any session already registered under `process_id`, are closed: tasks the
    /// new process still reports as running move to it if they belonged to the
    /// same worker id, the rest go back to the heap.
    fn connect(
        &self,
        worker_id: &str,
        process_id: &str,
        still_running: &BTreeSet<TaskId>,
        capacity: WorkerCapacity,
    ) {
        let mut requeue = Vec::new();
        let mut session = WorkerSession {
            worker_id: worker_id.to_owned(),
            capacity,
            usage: ResourceUsageCounters::new(),
            running: HashMap::new(),
        };
        {
            let mut workers = self.workers.lock();
            let stale: Vec<String> = workers
                .iter()
                .filter(|(pid, s)| s.worker_id == worker_id || pid.as_str() == process_id)
                .map(|(pid, _)| pid.clone())
                .collect();
            let mut global = self.global_usage.lock();
            for pid in stale {
                let Some(old) = workers.remove(&pid) else {
                    continue;
                };
                info!(
                    worker_id,
                    old_worker_id = %old.worker_id,
                    old_process_id = %pid,
                    "replacing previous session"
                );
                let same_worker = old.worker_id == worker_id;
                for (task_id, task) in old.running {
                    if same_worker && still_running.contains(&task_id) {
                        session.usage.reserve_all(&task.resources);
                        session.running.insert(task_id, task);
                    } else {
                        global.release_all(&task.resources);
                        requeue.push(task_id);
                    }
                }
            }
            workers.insert(process_id.to_owned(), session);
        }
        self.requeue(&requeue);
    }

    /// Extract work for a polling worker and record it as running there.
    fn poll(&self, process_id: &str, capacity: WorkerCapacity) -> Result<Vec<AssignedTask>, BrokerError> {
        let mut workers = self.workers.lock();
        let session = workers
            .get_mut(process_id)
            .ok_or_else(|| BrokerError::UnknownWorker(process_id.to_owned()))?;
        session.capacity = capacity;
        let max_tasks = session.max_tasks();
        if max_tasks == 0 {
            return Ok(Vec::new());
        }
        let mut slots = session.available_slots();
        let mut global = self.global_usage.lock();
        let taken = self.heap.take_tasks(TakeRequest {
            max_tasks,
            groups: &session.capacity.groups,
            excluded_groups: &session.capacity.excluded_groups,
            available_slots: &mut slots,
            worker: ResourceScope::new(&session.capacity.resource_limits, &mut session.usage),
            global: ResourceScope::new(&self.config.global_resource_limits, &mut global),
        })?;
        drop(global);

        let tasks = self.tasks.lock();
        let assigned = taken
            .into_iter()
            .map(|entry| {
                let parameter = tasks
                    .get(&entry.task_id)
                    .map(|r| r.parameter.clone())
                    .unwrap_or_default();
                session.running.insert(
                    entry.task_id,
                    RunningTask {
                        task_type: entry.task_type.clone(),
                        resources: entry.resources,
                    },
                );
                AssignedTask {
                    task_id: entry.task_id,
                    task_type: entry.task_type,
                    user_id: entry.user_id,
                    parameter,
                }
            })
            .collect::<Vec<_>>();
        if !assigned.is_empty() {
            debug!(process_id, count = assigned.len(), "tasks assigned");
        }
        Ok(assigned)
    }

    fn task_finished(&self, process_id: &str, results: &[TaskResult]) -> Result<(), BrokerError> {
        let mut workers = self.workers.lock();
        let session = workers
            .get_mut(process_id)
            .ok_or_else(|| BrokerError::UnknownWorker(process_id.to_owned()))?;
        let mut global = self.global_usage.lock();
        let mut tasks = self.tasks.lock();
        for result in results {
            let Some(task) = session.running.remove(&result.task_id) else {
                warn!(process_id, task_id = result.task_id, "finished task was not running here");
                continue;
            };
            session.usage.release_all(&task.resources);
            global.release_all(&task.resources);
            tasks.remove(&result.task_id);
            match result.status {
                FinalStatus::Finished => debug!(task_id = result.task_id, "task finished"),
                FinalStatus::Error => warn!(
                    task_id = result.task_id,
                    error = ?result.error,
                    "task failed on worker"
                ),
            }
        }
        Ok(())
    }

    /// Forget a worker process and put its running tasks back in the heap.
    pub fn disconnect_worker(&self, process_id: &str) -> Result<(), BrokerError> {
        let session = self
            .workers
            .lock()
            .remove(process_id)
            .ok_or_else(|| BrokerError::UnknownWorker(process_id.to_owned()))?;
        let mut requeue = Vec::with_capacity(session.running.len());
        {
            let mut global = self.global_usage.lock();
            for (task_id, task) in session.running {
                global.release_all(&task.resources);
                requeue.push(task_id);
            }
        }
        info!(process_id, requeued = requeue.len(), "worker disconnected");
        self.requeue(&requeue);
        Ok(())
    }

    fn requeue(&self, task_ids: &[TaskId]) {
        for &task_id in task_ids {
            let Some(record) = self.tasks.lock().get(&task_id).cloned() else {
                warn!(task_id, "cannot requeue unknown task");
                continue;
            };
            if let Err(e) = self.heap.insert(task_id, &record.task_type, &record.user_id) {
                warn!(task_id, "dropping task that cannot be requeued: {e}");
                self.tasks.lock().remove(&task_id);
            } else {
                info!(task_id, "task requeued");
            }
        }
    }
}
