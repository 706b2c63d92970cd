//! Pending task entries held by the heap.

use serde::{Deserialize, Serialize};

use super::properties::{GroupId, ResourceRequirement, TaskId};

/// A task waiting in the [`TaskHeap`](super::TaskHeap).
///
/// Owned by the heap from insertion until extraction, which hands it to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    /// Broker-assigned task id.
    pub task_id: TaskId,
    /// Kind of work; subject to per-type slots.
    pub task_type: String,
    /// Submitting user.
    pub user_id: String,
    /// Group resolved at insertion.
    pub group_id: GroupId,
    /// Resources the task holds while running, sorted by id.
    pub resources: Vec<ResourceRequirement>,
    /// Heap-local insertion counter; FIFO tie-break within a group and type.
    pub insertion_seq: u64,
    /// Wall clock at insertion, milliseconds since epoch.
    pub inserted_at_ms: u128,
}
