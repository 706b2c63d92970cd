//! Resource usage accounting shared by the worker-local and broker-global scopes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::properties::ResourceRequirement;

/// Ceiling per resource id. A resource without an entry is unlimited.
pub type ResourceLimits = HashMap<String, u32>;

/// Current consumption per resource id. A missing key means zero usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsageCounters {
    counters: HashMap<String, u64>,
}

impl ResourceUsageCounters {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current usage of `resource_id`.
    pub fn usage(&self, resource_id: &str) -> u64 {
        self.counters.get(resource_id).copied().unwrap_or(0)
    }

    /// Increment usage of a single resource.
    pub fn reserve(&mut self, resource_id: &str, units: u32) {
        match self.counters.get_mut(resource_id) {
            Some(current) => *current = current.saturating_add(u64::from(units)),
            None => {
                self.counters.insert(resource_id.to_owned(), u64::from(units));
            }
        }
    }

    /// Increment usage for every requirement of a task.
    pub fn reserve_all(&mut self, requirements: &[ResourceRequirement]) {
        for req in requirements {
            self.reserve(&req.resource_id, req.units);
        }
    }

    /// Give back units of a resource when a task completes. Saturates at zero.
    pub fn release(&mut self, resource_id: &str, units: u32) {
        if let Some(current) = self.counters.get_mut(resource_id) {
            *current = current.saturating_sub(u64::from(units));
            if *current == 0 {
                self.counters.remove(resource_id);
            }
        }
    }

    /// Release every requirement of a task.
    pub fn release_all(&mut self, requirements: &[ResourceRequirement]) {
        for req in requirements {
            self.release(&req.resource_id, req.units);
        }
    }

    /// Whether all requirements fit under `limits` on top of current usage.
    pub fn fits(&self, limits: &ResourceLimits, requirements: &[ResourceRequirement]) -> bool {
        requirements.iter().all(|req| match limits.get(&req.resource_id) {
            None => true,
            Some(&limit) => self.usage(&req.resource_id) + u64::from(req.units) <= u64::from(limit),
        })
    }

    /// Iterate over non-zero counters.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// True when nothing is in use.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// A (limits, tracker) pair checked and updated together during extraction.
#[derive(Debug)]
pub struct ResourceScope<'a> {
    /// Ceilings for this scope.
    pub limits: &'a ResourceLimits,
    /// Usage tracker mutated on commit.
    pub usage: &'a mut ResourceUsageCounters,
}

impl<'a> ResourceScope<'a> {
    /// Pair a limit map with its tracker.
    pub fn new(limits: &'a ResourceLimits, usage: &'a mut ResourceUsageCounters) -> Self {
        Self { limits, usage }
    }

    pub(crate) fn fits(&self, requirements: &[ResourceRequirement]) -> bool {
        self.usage.fits(self.limits, requirements)
    }

    pub(crate) fn commit(&mut self, requirements: &[ResourceRequirement]) {
        self.usage.reserve_all(requirements);
    }

    pub(crate) fn has_malformed_limits(&self) -> bool {
        self.limits.keys().any(String::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: &str, units: u32) -> ResourceRequirement {
        ResourceRequirement::new(id, units)
    }

    #[test]
    fn test_absent_usage_is_zero() {
        let counters = ResourceUsageCounters::new();
        assert_eq!(counters.usage("db"), 0);
        assert!(counters.is_empty());
    }

    #[test]
    fn test_reserve_and_release() {
        let mut counters = ResourceUsageCounters::new();
        counters.reserve_all(&[req("db", 2), req("cache", 1)]);
        counters.reserve("db", 3);
        assert_eq!(counters.usage("db"), 5);

        counters.release_all(&[req("db", 2), req("cache", 1)]);
        assert_eq!(counters.usage("db"), 3);
        assert_eq!(counters.usage("cache"), 0);
        assert_eq!(counters.iter().count(), 1);

        counters.release("db", 10);
        assert!(counters.is_empty());
    }

    #[test]
    fn test_fits_respects_limits() {
        let mut counters = ResourceUsageCounters::new();
        let limits: ResourceLimits = [("db".to_string(), 4)].into_iter().collect();
        counters.reserve("db", 3);

        assert!(counters.fits(&limits, &[req("db", 1)]));
        assert!(!counters.fits(&limits, &[req("db", 2)]));
        // no limit entry means unlimited
        assert!(counters.fits(&limits, &[req("cache", 1000)]));
    }
}
