//! Worker-side configuration.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::loader::{env_properties, ConfigError, Properties};
use crate::core::{GroupId, ResourceLimits, GROUP_ANY, TASKTYPE_ANY};
use crate::protocol::WorkerCapacity;

const KEYS: &[&str] = &[
    "workerId",
    "location",
    "maxThreads",
    "maxThreadsByTaskType",
    "groups",
    "excludedGroups",
    "resourcesLimits",
    "tasksRequestTimeout",
    "networkTimeout",
    "maxPendingFinishedTaskNotifications",
    "maxWaitPendingFinishedTaskNotifications",
    "maxKeepAliveTime",
    "sharedSecret",
    "codePoolsDirectory",
    "enableCodePools",
];

/// Configuration of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker id (stable across restarts; not the process id).
    pub worker_id: String,
    /// Free-form description of where the worker runs.
    pub location: String,
    /// Maximum concurrently running tasks.
    pub max_threads: u32,
    /// Maximum running tasks per task type; `any` covers unlisted types.
    pub max_threads_by_task_type: HashMap<String, u32>,
    /// Accepted groups in priority order; `0` means any group not excluded.
    pub groups: Vec<GroupId>,
    /// Groups never accepted through the `0` wildcard.
    pub excluded_groups: HashSet<GroupId>,
    /// Per-resource ceilings on this worker.
    pub resource_limits: ResourceLimits,
    /// Maximum wait for new tasks from the broker.
    pub tasks_request_timeout_ms: u64,
    /// Network operation timeout.
    pub network_timeout_ms: u64,
    /// Finished notifications buffered before a TASK_FINISHED is forced.
    pub max_pending_finished_task_notifications: usize,
    /// Longest time a finished notification may wait in the buffer.
    pub max_wait_pending_finished_task_notifications_ms: u64,
    /// Longest gap between pings to the broker.
    pub max_keep_alive_time_ms: u64,
    /// Secret shared by brokers and workers.
    pub shared_secret: String,
    /// Directory for unpacked code pools.
    pub code_pools_directory: Option<String>,
    /// Whether code pools are downloaded from the broker.
    pub enable_code_pools: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            location: "unknown".into(),
            max_threads: 20,
            max_threads_by_task_type: HashMap::from([(TASKTYPE_ANY.to_owned(), 1)]),
            groups: vec![GROUP_ANY],
            excluded_groups: HashSet::new(),
            resource_limits: ResourceLimits::new(),
            tasks_request_timeout_ms: 60_000,
            network_timeout_ms: 600_000,
            max_pending_finished_task_notifications: 10,
            max_wait_pending_finished_task_notifications_ms: 1_000,
            max_keep_alive_time_ms: 10_000,
            shared_secret: "dodo".into(),
            code_pools_directory: None,
            enable_code_pools: false,
        }
    }
}

impl WorkerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_id.is_empty() {
            return Err("worker_id must be set".into());
        }
        if self.max_threads == 0 {
            return Err("max_threads must be greater than 0".into());
        }
        if self.groups.is_empty() {
            return Err("groups must list at least one group".into());
        }
        if self.max_threads_by_task_type.keys().any(String::is_empty) {
            return Err("max_threads_by_task_type contains an empty task type".into());
        }
        if self.resource_limits.keys().any(String::is_empty) {
            return Err("resource_limits contains an empty resource id".into());
        }
        if self.enable_code_pools && self.code_pools_directory.is_none() {
            return Err("code_pools_directory is required when code pools are enabled".into());
        }
        Ok(())
    }

    /// Populate from string properties, starting from defaults. Each key is
    /// parsed explicitly; unknown keys are ignored.
    pub fn from_properties(source: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let props = Properties::new(source);
        let mut cfg = Self::default();
        cfg.worker_id = props.string("workerId").ok_or(ConfigError::Missing("workerId"))?;
        if let Some(v) = props.string("location") {
            cfg.location = v;
        }
        if let Some(v) = props.parse("maxThreads")? {
            cfg.max_threads = v;
        }
        if let Some(v) = props.map("maxThreadsByTaskType")? {
            cfg.max_threads_by_task_type = v;
        }
        if let Some(v) = props.list("groups")? {
            cfg.groups = v;
        }
        if let Some(v) = props.set::<GroupId>("excludedGroups")? {
            cfg.excluded_groups = v.into_iter().collect();
        }
        if let Some(v) = props.map("resourcesLimits")? {
            cfg.resource_limits = v;
        }
        if let Some(v) = props.parse("tasksRequestTimeout")? {
            cfg.tasks_request_timeout_ms = v;
        }
        if let Some(v) = props.parse("networkTimeout")? {
            cfg.network_timeout_ms = v;
        }
        if let Some(v) = props.parse("maxPendingFinishedTaskNotifications")? {
            cfg.max_pending_finished_task_notifications = v;
        }
        if let Some(v) = props.parse("maxWaitPendingFinishedTaskNotifications")? {
            cfg.max_wait_pending_finished_task_notifications_ms = v;
        }
        if let Some(v) = props.parse("maxKeepAliveTime")? {
            cfg.max_keep_alive_time_ms = v;
        }
        if let Some(v) = props.string("sharedSecret") {
            cfg.shared_secret = v;
        }
        cfg.code_pools_directory = props.string("codePoolsDirectory").filter(|s| !s.is_empty());
        if let Some(v) = props.parse("enableCodePools")? {
            cfg.enable_code_pools = v;
        }
        cfg.validate().map_err(ConfigError::Validation)?;
        Ok(cfg)
    }

    /// Load from `DODO_`-prefixed environment variables (and `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_properties(&env_properties("DODO_", KEYS))
    }

    /// Parse from JSON (snake_case field names) and validate.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let cfg: Self =
            serde_json::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate().map_err(ConfigError::Validation)?;
        Ok(cfg)
    }

    /// Constraint set advertised to the broker on connect and on every ping.
    pub fn capacity(&self) -> WorkerCapacity {
        WorkerCapacity {
            max_threads: self.max_threads,
            max_threads_by_task_type: self.max_threads_by_task_type.clone(),
            groups: self.groups.clone(),
            excluded_groups: self.excluded_groups.clone(),
            resource_limits: self.resource_limits.clone(),
        }
    }
}
