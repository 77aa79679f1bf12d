//! In-memory runtime environment for testing the metric manager.
//!
//! `MockEnvironment` answers the topology and consumer-requirement queries
//! from plain fields and keeps a log of every shadow location it creates.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::environment::{Environment, Location};
use crate::types::{LocationGroupHandle, LocationHandle, LocationKind, SystemTreeNodeHandle};

/// Handles of CPU locations made by [`MockEnvironment::cpu_location`] are
/// their ids; shadow locations are numbered from here.
const FIRST_SHADOW_HANDLE: u32 = 1000;

/// Configurable environment for tests.
#[derive(Debug)]
pub struct MockEnvironment {
    rank: u32,
    process_master: bool,
    async_required: bool,
    host_once_required: bool,
    containers: bool,
    next_handle: AtomicU32,
    created: Mutex<Vec<(Location, String)>>,
    async_queries: AtomicUsize,
    host_once_queries: AtomicUsize,
}

impl MockEnvironment {
    pub const GROUP: LocationGroupHandle = LocationGroupHandle(7);
    pub const ROOT: SystemTreeNodeHandle = SystemTreeNodeHandle(1);
    pub const NODE: SystemTreeNodeHandle = SystemTreeNodeHandle(2);

    /// Rank 0, master on its node, every consumer requirement present.
    pub fn new() -> Self {
        Self {
            rank: 0,
            process_master: true,
            async_required: true,
            host_once_required: true,
            containers: true,
            next_handle: AtomicU32::new(FIRST_SHADOW_HANDLE),
            created: Mutex::new(Vec::new()),
            async_queries: AtomicUsize::new(0),
            host_once_queries: AtomicUsize::new(0),
        }
    }

    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_process_master(mut self, master: bool) -> Self {
        self.process_master = master;
        self
    }

    /// No consumer asks for asynchronous metrics.
    pub fn without_async_consumers(mut self) -> Self {
        self.async_required = false;
        self
    }

    /// No consumer asks for per-host or once metrics.
    pub fn without_host_once_consumers(mut self) -> Self {
        self.host_once_required = false;
        self
    }

    /// Topology queries return `None`.
    pub fn without_containers(mut self) -> Self {
        self.containers = false;
        self
    }

    /// CPU-thread location whose handle equals its id.
    pub fn cpu_location(&self, id: u32) -> Location {
        Location::new(LocationHandle(id), id, LocationKind::CpuThread)
    }

    /// Shadow locations created so far, with their names.
    pub fn created_locations(&self) -> Vec<(Location, String)> {
        match self.created.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// How often the asynchronous consumer requirement was asked.
    pub fn async_queries(&self) -> usize {
        self.async_queries.load(Ordering::Relaxed)
    }

    /// How often the per-host/once consumer requirement was asked.
    pub fn host_once_queries(&self) -> usize {
        self.host_once_queries.load(Ordering::Relaxed)
    }
}

impl Default for MockEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for MockEnvironment {
    fn create_metric_location(&self, parent: &Location, name: &str) -> Location {
        let handle = LocationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let location = Location::new(handle, parent.id, LocationKind::Metric);
        let mut guard = match self.created.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((location, name.to_string()));
        location
    }

    fn process_location_group(&self) -> Option<LocationGroupHandle> {
        self.containers.then_some(Self::GROUP)
    }

    fn shared_memory_node(&self) -> Option<SystemTreeNodeHandle> {
        self.containers.then_some(Self::NODE)
    }

    fn system_tree_root(&self) -> Option<SystemTreeNodeHandle> {
        self.containers.then_some(Self::ROOT)
    }

    fn is_process_master_on_node(&self) -> bool {
        self.process_master
    }

    fn rank(&self) -> u32 {
        self.rank
    }

    fn requires_async_metrics(&self) -> bool {
        self.async_queries.fetch_add(1, Ordering::Relaxed);
        self.async_required
    }

    fn requires_per_host_and_once_metrics(&self) -> bool {
        self.host_once_queries.fetch_add(1, Ordering::Relaxed);
        self.host_once_required
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let env = MockEnvironment::new();
        assert_eq!(env.rank(), 0);
        assert!(env.is_process_master_on_node());
        assert_eq!(env.process_location_group(), Some(MockEnvironment::GROUP));
        assert!(env.requires_async_metrics());
        assert_eq!(env.async_queries(), 1);
        assert_eq!(env.host_once_queries(), 0);
    }

    #[test]
    fn test_shadow_locations_do_not_collide_with_cpu_locations() {
        let env = MockEnvironment::new().with_rank(2).without_containers();
        let cpu = env.cpu_location(3);
        let shadow = env.create_metric_location(&cpu, "m");
        assert_eq!(shadow.id, 3);
        assert_eq!(shadow.kind, LocationKind::Metric);
        assert!(shadow.handle.0 >= FIRST_SHADOW_HANDLE);
        assert_eq!(env.created_locations(), vec![(shadow, "m".to_string())]);
        assert_eq!(env.shared_memory_node(), None);
        assert_eq!(env.rank(), 2);
    }
}
