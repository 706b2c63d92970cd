//! Task classification: groups, resource requirements and the pluggable resolver.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::{AppResult, SchedulerError};

/// Unique task identifier, assigned monotonically by the broker.
pub type TaskId = u64;

/// Coarse priority/partitioning tag for tasks.
pub type GroupId = i32;

/// Wildcard group: matches every group not listed in the excluded set.
pub const GROUP_ANY: GroupId = 0;

/// Wildcard task type used as a fallback key in per-type slot tables.
pub const TASKTYPE_ANY: &str = "any";

/// Units of a named resource a task holds for its whole duration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// Resource identifier, e.g. a datasource name.
    pub resource_id: String,
    /// Units consumed.
    pub units: u32,
}

impl ResourceRequirement {
    /// Convenience constructor.
    pub fn new(resource_id: impl Into<String>, units: u32) -> Self {
        Self {
            resource_id: resource_id.into(),
            units,
        }
    }
}

/// Output of a [`TaskPropertiesResolver`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProperties {
    /// Group the task belongs to.
    pub group_id: GroupId,
    /// Resources the task consumes while running.
    pub resources: Vec<ResourceRequirement>,
}

impl TaskProperties {
    /// Properties for a task in `group_id` that needs no resources.
    pub const fn in_group(group_id: GroupId) -> Self {
        Self {
            group_id,
            resources: Vec::new(),
        }
    }

    /// Add a resource requirement.
    #[must_use]
    pub fn with_resource(mut self, resource_id: impl Into<String>, units: u32) -> Self {
        self.resources.push(ResourceRequirement::new(resource_id, units));
        self
    }

    /// Check the resolved values and normalize requirements into an ordered
    /// set: sorted by resource id, duplicates merged by summing units.
    pub(crate) fn normalize(self, task_id: TaskId) -> Result<Self, SchedulerError> {
        let fail = |reason: String| SchedulerError::ResolutionFailed { task_id, reason };
        if self.group_id < 0 {
            return Err(fail(format!("invalid group {}", self.group_id)));
        }
        let mut merged: BTreeMap<String, u32> = BTreeMap::new();
        for req in self.resources {
            if req.resource_id.is_empty() {
                return Err(fail("empty resource id".into()));
            }
            if req.units == 0 {
                return Err(fail(format!("zero units for resource `{}`", req.resource_id)));
            }
            let slot = merged.entry(req.resource_id).or_insert(0);
            *slot = slot
                .checked_add(req.units)
                .ok_or_else(|| fail("resource units overflow".into()))?;
        }
        Ok(Self {
            group_id: self.group_id,
            resources: merged
                .into_iter()
                .map(|(resource_id, units)| ResourceRequirement { resource_id, units })
                .collect(),
        })
    }
}

/// Maps a task to its group and resource requirements.
///
/// Supplied by the surrounding broker. Implementations must be pure; the heap
/// may call them from many threads at once.
///
/// ```rust
/// use dodo_scheduler::core::{AppResult, TaskProperties, TaskPropertiesResolver};
///
/// let resolver = |_id: u64, _task_type: &str, user_id: &str| -> AppResult<TaskProperties> {
///     Ok(TaskProperties::in_group(if user_id == "alice" { 10 } else { 20 }))
/// };
/// assert_eq!(resolver.resolve(1, "report", "alice").unwrap().group_id, 10);
/// ```
pub trait TaskPropertiesResolver: Send + Sync {
    /// Resolve the properties of a task.
    fn resolve(&self, task_id: TaskId, task_type: &str, user_id: &str) -> AppResult<TaskProperties>;
}

impl<F> TaskPropertiesResolver for F
where
    F: Fn(TaskId, &str, &str) -> AppResult<TaskProperties> + Send + Sync,
{
    fn resolve(&self, task_id: TaskId, task_type: &str, user_id: &str) -> AppResult<TaskProperties> {
        self(task_id, task_type, user_id)
    }
}

/// Resolver that puts every task in one group with no resource needs.
#[derive(Debug, Clone, Copy)]
pub struct FixedGroupResolver(pub GroupId);

impl TaskPropertiesResolver for FixedGroupResolver {
    fn resolve(&self, _task_id: TaskId, _task_type: &str, _user_id: &str) -> AppResult<TaskProperties> {
        Ok(TaskProperties::in_group(self.0))
    }
}
