//! Core scheduling abstractions: the task heap and resource accounting.

pub mod entry;
pub mod error;
pub mod properties;
pub mod resource_usage;
pub mod task_heap;

pub use entry::TaskEntry;
pub use error::{AppResult, SchedulerError};
pub use properties::{
    FixedGroupResolver, GroupId, ResourceRequirement, TaskId, TaskProperties,
    TaskPropertiesResolver, GROUP_ANY, TASKTYPE_ANY,
};
pub use resource_usage::{ResourceLimits, ResourceScope, ResourceUsageCounters};
pub use task_heap::{
    HeapScan, HeapStats, TakeRequest, TaskHeap, DEFAULT_MAX_FRAGMENTATION,
    UNLIMITED_FRAGMENTATION,
};
