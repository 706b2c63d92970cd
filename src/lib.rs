//! # Dodo Scheduler
//!
//! Broker-side scheduling core for a distributed job broker.
//!
//! A central broker hands tasks to a pool of remote worker processes. Every time a
//! worker polls, the broker must pick which pending tasks it may run right now,
//! honoring:
//!
//! - **Per-type slots**: a worker runs at most N tasks of a given type
//! - **Priority groups**: a worker lists the groups it serves in priority order,
//!   with group `0` as a wildcard that skips an excluded set
//! - **Resource quotas**: tasks consume named resources (e.g. datasource
//!   connections) checked against both the worker's and the broker-wide ceilings
//! - **Bounded scan cost**: a large backlog of blocked tasks cannot make a poll
//!   scan the whole heap; a fragmentation bound caps the work per call
//!
//! ## TaskHeap
//!
//! ```rust
//! use std::collections::{HashMap, HashSet};
//! use dodo_scheduler::core::{
//!     FixedGroupResolver, ResourceLimits, ResourceScope, ResourceUsageCounters, TakeRequest,
//!     TaskHeap, GROUP_ANY,
//! };
//!
//! let heap = TaskHeap::new(FixedGroupResolver(7));
//! heap.insert(1, "report", "alice").unwrap();
//!
//! let mut slots = HashMap::from([("report".to_string(), 1)]);
//! let limits = ResourceLimits::new();
//! let (mut worker_usage, mut global_usage) = (ResourceUsageCounters::new(), ResourceUsageCounters::new());
//! let taken = heap
//!     .take_tasks(TakeRequest {
//!         max_tasks: 10,
//!         groups: &[GROUP_ANY],
//!         excluded_groups: &HashSet::new(),
//!         available_slots: &mut slots,
//!         worker: ResourceScope::new(&limits, &mut worker_usage),
//!         global: ResourceScope::new(&limits, &mut global_usage),
//!     })
//!     .unwrap();
//! assert_eq!(taken[0].task_id, 1);
//! assert!(heap.is_empty());
//! ```
//!
//! ## Broker
//!
//! [`broker::Broker`] wraps the heap with worker sessions and resource
//! accounting, driven by the typed messages in [`protocol`]. The worker side of
//! the conversation lives in [`worker`].

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Broker facade driving the heap from worker traffic.
pub mod broker;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Configuration models for the broker and workers.
pub mod config;
/// Core scheduling abstractions and resource accounting.
pub mod core;
/// Broker/worker message contract.
pub mod protocol;
/// Runtime adapters used to run task executions.
pub mod runtime;
/// Shared utilities.
pub mod util;
/// Worker-side execution glue.
pub mod worker;
