//! The scheduling heap: pending tasks indexed by group and type, and the
//! constrained batch extraction run on every worker poll.
//!
//! Entries live in a sequence-ordered map and are indexed into buckets keyed by
//! `(group, task type)`, each bucket an ordered set of insertion sequence numbers.
//! Extraction merges the buckets that are currently eligible (right group, task
//! type with a free slot) by sequence number through a min-heap of bucket heads,
//! so FIFO order holds within a group and type, types without slots are never
//! visited, and each step costs a logarithm of the eligible bucket count.
//!
//! All operations run under one `parking_lot::Mutex`; two concurrent extractions
//! can never select the same entry.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use super::entry::TaskEntry;
use super::error::SchedulerError;
use super::properties::{GroupId, TaskId, TaskPropertiesResolver, GROUP_ANY, TASKTYPE_ANY};
use super::resource_usage::ResourceScope;
use crate::util::clock::now_ms;

/// Default bound on blocked candidates visited per extraction.
pub const DEFAULT_MAX_FRAGMENTATION: usize = 10_000;

/// Fragmentation bound that makes extraction exhaustive.
pub const UNLIMITED_FRAGMENTATION: usize = usize::MAX;

/// Everything one extraction call needs. Slot and usage maps are mutated in
/// place to reflect what was committed.
#[derive(Debug)]
pub struct TakeRequest<'a> {
    /// Upper bound on returned entries.
    pub max_tasks: usize,
    /// Accepted groups in descending priority; may contain [`GROUP_ANY`].
    pub groups: &'a [GroupId],
    /// Groups never matched through [`GROUP_ANY`].
    pub excluded_groups: &'a HashSet<GroupId>,
    /// Remaining capacity per task type; [`TASKTYPE_ANY`] is the fallback entry.
    pub available_slots: &'a mut HashMap<String, u32>,
    /// The polling worker's resource ceilings and usage.
    pub worker: ResourceScope<'a>,
    /// Broker-wide resource ceilings and usage.
    pub global: ResourceScope<'a>,
}

/// Counters describing the heap.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HeapStats {
    /// Entries currently waiting.
    pub pending: usize,
    /// Distinct groups with at least one pending entry.
    pub groups: usize,
    /// Total successful inserts.
    pub inserted: u64,
    /// Total entries handed out by extraction.
    pub extracted: u64,
    /// Fragmentation counted by the most recent extraction.
    pub last_fragmentation: usize,
}

#[derive(Default)]
struct HeapState {
    entries: BTreeMap<u64, TaskEntry>,
    seq_by_task: HashMap<TaskId, u64>,
    buckets: BTreeMap<GroupId, HashMap<String, BTreeSet<u64>>>,
    next_seq: u64,
    inserted: u64,
    extracted: u64,
    last_fragmentation: usize,
}

/// Which slot table entry pays for a task.
#[derive(Clone, Copy)]
enum SlotKey {
    Exact,
    Any,
}

fn slot_key(slots: &HashMap<String, u32>, task_type: &str) -> Option<SlotKey> {
    match slots.get(task_type) {
        Some(&n) => (n > 0).then_some(SlotKey::Exact),
        None => match slots.get(TASKTYPE_ANY) {
            Some(&n) if n > 0 => Some(SlotKey::Any),
            _ => None,
        },
    }
}

fn consume_slot(slots: &mut HashMap<String, u32>, task_type: &str, key: SlotKey) {
    let name = match key {
        SlotKey::Exact => task_type,
        SlotKey::Any => TASKTYPE_ANY,
    };
    if let Some(n) = slots.get_mut(name) {
        *n = n.saturating_sub(1);
    }
}

/// Accumulated outcome of one extraction call.
struct Walk {
    taken: Vec<TaskEntry>,
    fragmentation: usize,
    max_tasks: usize,
    max_fragmentation: usize,
}

impl Walk {
    fn finished(&self) -> bool {
        self.taken.len() >= self.max_tasks || self.fragmentation >= self.max_fragmentation
    }
}

impl HeapState {
    fn index(&mut self, entry: TaskEntry) {
        let seq = entry.insertion_seq;
        self.buckets
            .entry(entry.group_id)
            .or_default()
            .entry(entry.task_type.clone())
            .or_default()
            .insert(seq);
        self.seq_by_task.insert(entry.task_id, seq);
        self.entries.insert(seq, entry);
    }

    fn unindex(&mut self, seq: u64) -> Option<TaskEntry> {
        let entry = self.entries.remove(&seq)?;
        self.seq_by_task.remove(&entry.task_id);
        if let Some(types) = self.buckets.get_mut(&entry.group_id) {
            if let Some(seqs) = types.get_mut(&entry.task_type) {
                seqs.remove(&seq);
                if seqs.is_empty() {
                    types.remove(&entry.task_type);
                }
            }
            if types.is_empty() {
                self.buckets.remove(&entry.group_id);
            }
        }
        Some(entry)
    }

    /// First sequence in bucket `(group, task_type)` after `seq`.
    fn bucket_next(&self, group: GroupId, task_type: &str, seq: u64) -> Option<u64> {
        let seqs = self.buckets.get(&group)?.get(task_type)?;
        seqs.range((Excluded(seq), Unbounded)).next().copied()
    }

    /// Take eligible entries from `groups` in FIFO order until the walk is
    /// finished or no candidate is left.
    ///
    /// The frontier holds the oldest unvisited entry of every bucket whose type
    /// had a slot when seeded; each step pops the overall oldest and pushes the
    /// next entry of that bucket only. A bucket whose type has run out of slots
    /// is dropped when its head comes up.
    fn drain_groups(&mut self, groups: &[GroupId], req: &mut TakeRequest<'_>, walk: &mut Walk) {
        let mut frontier: BinaryHeap<Reverse<(u64, GroupId, String)>> = BinaryHeap::new();
        for &group in groups {
            let Some(types) = self.buckets.get(&group) else {
                continue;
            };
            for (task_type, seqs) in types {
                if slot_key(req.available_slots, task_type).is_none() {
                    continue;
                }
                if let Some(&seq) = seqs.first() {
                    frontier.push(Reverse((seq, group, task_type.clone())));
                }
            }
        }

        while !walk.finished() {
            let Some(Reverse((seq, group, task_type))) = frontier.pop() else {
                break;
            };
            let Some(key) = slot_key(req.available_slots, &task_type) else {
                continue;
            };
            let Some(entry) = self.entries.get(&seq) else {
                continue;
            };
            if req.worker.fits(&entry.resources) && req.global.fits(&entry.resources) {
                if let Some(entry) = self.unindex(seq) {
                    consume_slot(req.available_slots, &task_type, key);
                    req.worker.commit(&entry.resources);
                    req.global.commit(&entry.resources);
                    walk.taken.push(entry);
                }
            } else {
                trace!(task_id = entry.task_id, group, "resources exhausted, skipping");
                walk.fragmentation += 1;
            }
            if let Some(next) = self.bucket_next(group, &task_type, seq) {
                frontier.push(Reverse((next, group, task_type)));
            }
        }
    }
}

/// Pending tasks with constrained, bounded-cost batch extraction.
pub struct TaskHeap {
    resolver: Box<dyn TaskPropertiesResolver>,
    max_fragmentation: AtomicUsize,
    state: Mutex<HeapState>,
}

impl std::fmt::Debug for TaskHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHeap")
            .field("max_fragmentation", &self.max_fragmentation())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TaskHeap {
    /// Create an empty heap using `resolver` to classify inserted tasks.
    pub fn new(resolver: impl TaskPropertiesResolver + 'static) -> Self {
        Self::with_capacity(0, resolver)
    }

    /// Create an empty heap pre-sized for `capacity` entries.
    pub fn with_capacity(capacity: usize, resolver: impl TaskPropertiesResolver + 'static) -> Self {
        let state = HeapState {
            seq_by_task: HashMap::with_capacity(capacity),
            ..HeapState::default()
        };
        Self {
            resolver: Box::new(resolver),
            max_fragmentation: AtomicUsize::new(DEFAULT_MAX_FRAGMENTATION),
            state: Mutex::new(state),
        }
    }

    /// Set the fragmentation bound (builder style).
    #[must_use]
    pub fn with_max_fragmentation(self, max_fragmentation: usize) -> Self {
        self.set_max_fragmentation(max_fragmentation);
        self
    }

    /// Current fragmentation bound.
    pub fn max_fragmentation(&self) -> usize {
        self.max_fragmentation.load(Ordering::Relaxed)
    }

    /// Change the fragmentation bound; applies to subsequent extractions.
    pub fn set_max_fragmentation(&self, max_fragmentation: usize) {
        self.max_fragmentation.store(max_fragmentation, Ordering::Relaxed);
    }

    /// Add a task. Fails with [`SchedulerError::InvalidState`] if the id is
    /// already pending, or [`SchedulerError::ResolutionFailed`] if the resolver
    /// rejects it; in both cases nothing is inserted.
    pub fn insert(&self, task_id: TaskId, task_type: &str, user_id: &str) -> Result<(), SchedulerError> {
        let properties = self
            .resolver
            .resolve(task_id, task_type, user_id)
            .map_err(|e| SchedulerError::ResolutionFailed {
                task_id,
                reason: format!("{e:#}"),
            })
            .and_then(|p| p.normalize(task_id))
            .inspect_err(|e| warn!(task_id, task_type, user_id, "rejected task: {e}"))?;

        let mut state = self.state.lock();
        if state.seq_by_task.contains_key(&task_id) {
            warn!(task_id, "duplicate insert");
            return Err(SchedulerError::InvalidState(format!(
                "task {task_id} is already in the heap"
            )));
        }
        let insertion_seq = state.next_seq;
        state.next_seq += 1;
        state.inserted += 1;
        trace!(task_id, group = properties.group_id, insertion_seq, "task inserted");
        state.index(TaskEntry {
            task_id,
            task_type: task_type.to_owned(),
            user_id: user_id.to_owned(),
            group_id: properties.group_id,
            resources: properties.resources,
            insertion_seq,
            inserted_at_ms: now_ms(),
        });
        Ok(())
    }

    /// Select and remove up to `max_tasks` entries for a polling worker.
    ///
    /// Explicit groups are walked in the order given, each FIFO by insertion;
    /// [`GROUP_ANY`] then walks every remaining group not in `excluded_groups`.
    /// An entry whose resources do not fit under both scopes is skipped and
    /// counts toward the fragmentation bound; reaching the bound ends the call.
    ///
    /// A short or empty result is routine. Errors only on malformed input.
    pub fn take_tasks(&self, mut req: TakeRequest<'_>) -> Result<Vec<TaskEntry>, SchedulerError> {
        if req.available_slots.keys().any(String::is_empty) {
            return Err(SchedulerError::InvalidState(
                "empty task type in available slots".into(),
            ));
        }
        if req.worker.has_malformed_limits() || req.global.has_malformed_limits() {
            return Err(SchedulerError::InvalidState(
                "empty resource id in resource limits".into(),
            ));
        }

        let mut walk = Walk {
            taken: Vec::with_capacity(req.max_tasks.min(64)),
            fragmentation: 0,
            max_tasks: req.max_tasks,
            max_fragmentation: self.max_fragmentation().max(1),
        };
        let mut state = self.state.lock();
        let mut walked: HashSet<GroupId> = HashSet::new();
        let mut any_walked = false;
        let groups = req.groups;
        for &group in groups {
            if walk.finished() {
                break;
            }
            if group == GROUP_ANY {
                if any_walked {
                    continue;
                }
                any_walked = true;
                let eligible: Vec<GroupId> = state
                    .buckets
                    .keys()
                    .filter(|g| !req.excluded_groups.contains(g) && !walked.contains(g))
                    .copied()
                    .collect();
                state.drain_groups(&eligible, &mut req, &mut walk);
                walked.extend(eligible);
            } else if walked.insert(group) {
                state.drain_groups(&[group], &mut req, &mut walk);
            }
        }

        state.extracted += walk.taken.len() as u64;
        state.last_fragmentation = walk.fragmentation;
        if walk.fragmentation >= walk.max_fragmentation {
            debug!(
                fragmentation = walk.fragmentation,
                "extraction stopped at fragmentation bound"
            );
        }
        debug!(
            taken = walk.taken.len(),
            fragmentation = walk.fragmentation,
            pending = state.entries.len(),
            "extraction complete"
        );
        Ok(walk.taken)
    }

    /// Lazy traversal of pending entries in insertion order.
    ///
    /// The returned iterator holds the heap lock until dropped: do not call
    /// other heap methods from the same thread while it is alive.
    pub fn scan(&self) -> HeapScan<'_> {
        HeapScan {
            guard: self.state.lock(),
            cursor: None,
        }
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `task_id` is pending.
    pub fn contains(&self, task_id: TaskId) -> bool {
        self.state.lock().seq_by_task.contains_key(&task_id)
    }

    /// Snapshot of heap counters.
    pub fn stats(&self) -> HeapStats {
        let state = self.state.lock();
        HeapStats {
            pending: state.entries.len(),
            groups: state.buckets.len(),
            inserted: state.inserted,
            extracted: state.extracted,
            last_fragmentation: state.last_fragmentation,
        }
    }
}

/// Read-only iterator over pending entries, see [`TaskHeap::scan`].
pub struct HeapScan<'a> {
    guard: MutexGuard<'a, HeapState>,
    cursor: Option<u64>,
}

impl HeapScan<'_> {
    /// Start again from the oldest entry.
    pub fn restart(&mut self) {
        self.cursor = None;
    }
}

impl Iterator for HeapScan<'_> {
    type Item = TaskEntry;

    fn next(&mut self) -> Option<TaskEntry> {
        let next = match self.cursor {
            Some(cursor) => self.guard.entries.range((Excluded(cursor), Unbounded)).next(),
            None => self.guard.entries.iter().next(),
        };
        let (&seq, entry) = next?;
        let entry = entry.clone();
        self.cursor = Some(seq);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ResourceLimits, ResourceUsageCounters, TaskProperties};

    const GROUP_A: GroupId = 9713;
    const GROUP_B: GroupId = 972;

    fn by_user(_id: TaskId, _task_type: &str, user_id: &str) -> crate::core::AppResult<TaskProperties> {
        match user_id {
            "a" => Ok(TaskProperties::in_group(GROUP_A)),
            "b" => Ok(TaskProperties::in_group(GROUP_B)),
            "db" => Ok(TaskProperties::in_group(GROUP_A).with_resource("db", 1)),
            other => anyhow::bail!("unknown user {other}"),
        }
    }

    struct Poll {
        slots: HashMap<String, u32>,
        excluded: HashSet<GroupId>,
        worker_limits: ResourceLimits,
        worker_usage: ResourceUsageCounters,
        global_limits: ResourceLimits,
        global_usage: ResourceUsageCounters,
    }

    impl Poll {
        fn new(slots: &[(&str, u32)]) -> Self {
            Self {
                slots: slots.iter().map(|(k, v)| ((*k).to_string(), *v)).collect(),
                excluded: HashSet::new(),
                worker_limits: ResourceLimits::new(),
                worker_usage: ResourceUsageCounters::new(),
                global_limits: ResourceLimits::new(),
                global_usage: ResourceUsageCounters::new(),
            }
        }

        fn take(&mut self, heap: &TaskHeap, max_tasks: usize, groups: &[GroupId]) -> Vec<TaskId> {
            heap.take_tasks(TakeRequest {
                max_tasks,
                groups,
                excluded_groups: &self.excluded,
                available_slots: &mut self.slots,
                worker: ResourceScope::new(&self.worker_limits, &mut self.worker_usage),
                global: ResourceScope::new(&self.global_limits, &mut self.global_usage),
            })
            .unwrap()
            .into_iter()
            .map(|e| e.task_id)
            .collect()
        }
    }

    #[test]
    fn test_duplicate_insert_is_invalid_state() {
        let heap = TaskHeap::new(by_user);
        heap.insert(1, "t", "a").unwrap();
        let err = heap.insert(1, "t", "a").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState(_)));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_resolver_failure_leaves_heap_unchanged() {
        let heap = TaskHeap::new(by_user);
        let err = heap.insert(1, "t", "nobody").unwrap_err();
        assert!(matches!(err, SchedulerError::ResolutionFailed { task_id: 1, .. }));
        assert!(heap.is_empty());
        assert_eq!(heap.stats().inserted, 0);
    }

    #[test]
    fn test_fifo_within_group() {
        let heap = TaskHeap::new(by_user);
        for id in [5, 3, 9] {
            heap.insert(id, "t", "a").unwrap();
        }
        let mut poll = Poll::new(&[("t", 10)]);
        assert_eq!(poll.take(&heap, 10, &[GROUP_ANY]), vec![5, 3, 9]);
    }

    #[test]
    fn test_explicit_group_before_any() {
        let heap = TaskHeap::new(by_user);
        heap.insert(1, "t", "a").unwrap();
        heap.insert(2, "t", "b").unwrap();
        let mut poll = Poll::new(&[("t", 1)]);
        assert_eq!(poll.take(&heap, 10, &[GROUP_B, GROUP_ANY]), vec![2]);
        assert_eq!(poll.slots["t"], 0);
    }

    #[test]
    fn test_excluded_group_not_matched_through_any() {
        let heap = TaskHeap::new(by_user);
        heap.insert(1, "t", "a").unwrap();
        heap.insert(2, "t", "b").unwrap();
        let mut poll = Poll::new(&[("t", 10)]);
        poll.excluded.insert(GROUP_A);
        assert_eq!(poll.take(&heap, 10, &[GROUP_ANY]), vec![2]);
        // explicit listing still matches an excluded group
        assert_eq!(poll.take(&heap, 10, &[GROUP_A]), vec![1]);
    }

    #[test]
    fn test_any_task_type_slot_fallback() {
        let heap = TaskHeap::new(by_user);
        heap.insert(1, "x", "a").unwrap();
        heap.insert(2, "y", "a").unwrap();
        heap.insert(3, "z", "a").unwrap();
        let mut poll = Poll::new(&[("x", 0), (TASKTYPE_ANY, 1)]);
        // x has an explicit zero entry, so it does not borrow from "any"
        assert_eq!(poll.take(&heap, 10, &[GROUP_ANY]), vec![2]);
        assert_eq!(poll.slots[TASKTYPE_ANY], 0);
    }

    #[test]
    fn test_missing_slot_is_not_fragmentation() {
        let heap = TaskHeap::new(by_user).with_max_fragmentation(1);
        for id in 1..=5 {
            heap.insert(id, "busy", "a").unwrap();
        }
        heap.insert(6, "free", "a").unwrap();
        let mut poll = Poll::new(&[("free", 1)]);
        assert_eq!(poll.take(&heap, 10, &[GROUP_ANY]), vec![6]);
        assert_eq!(heap.stats().last_fragmentation, 0);
    }

    #[test]
    fn test_fragmentation_bound_stops_scan() {
        let heap = TaskHeap::new(by_user).with_max_fragmentation(2);
        for id in 1..=3 {
            heap.insert(id, "t", "db").unwrap();
        }
        heap.insert(4, "t", "a").unwrap();
        let mut poll = Poll::new(&[("t", 10)]);
        poll.global_limits.insert("db".into(), 0);
        assert!(poll.take(&heap, 10, &[GROUP_ANY]).is_empty());
        assert_eq!(heap.stats().last_fragmentation, 2);

        heap.set_max_fragmentation(UNLIMITED_FRAGMENTATION);
        assert_eq!(poll.take(&heap, 10, &[GROUP_ANY]), vec![4]);
        assert_eq!(heap.len(), 3);
    }

    #[test]
    fn test_resources_committed_to_both_scopes() {
        let heap = TaskHeap::new(by_user);
        for id in 1..=3 {
            heap.insert(id, "t", "db").unwrap();
        }
        let mut poll = Poll::new(&[("t", 10)]);
        poll.worker_limits.insert("db".into(), 2);
        assert_eq!(poll.take(&heap, 10, &[GROUP_ANY]), vec![1, 2]);
        assert_eq!(poll.worker_usage.usage("db"), 2);
        assert_eq!(poll.global_usage.usage("db"), 2);
    }

    #[test]
    fn test_malformed_limits_rejected() {
        let heap = TaskHeap::new(by_user);
        heap.insert(1, "t", "a").unwrap();
        let mut poll = Poll::new(&[("t", 1)]);
        poll.global_limits.insert(String::new(), 1);
        let err = heap
            .take_tasks(TakeRequest {
                max_tasks: 1,
                groups: &[GROUP_ANY],
                excluded_groups: &poll.excluded,
                available_slots: &mut poll.slots,
                worker: ResourceScope::new(&poll.worker_limits, &mut poll.worker_usage),
                global: ResourceScope::new(&poll.global_limits, &mut poll.global_usage),
            })
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState(_)));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_scan_is_restartable_and_read_only() {
        let heap = TaskHeap::new(by_user);
        heap.insert(10, "t", "a").unwrap();
        heap.insert(11, "t", "b").unwrap();
        {
            let mut scan = heap.scan();
            let first: Vec<TaskId> = scan.by_ref().map(|e| e.task_id).collect();
            assert_eq!(first, vec![10, 11]);
            scan.restart();
            assert_eq!(scan.next().map(|e| e.task_id), Some(10));
        }
        assert_eq!(heap.len(), 2);
    }
}
