//! Abstraction over the measurement runtime surrounding the metric subsystem.
//!
//! The `Environment` trait bundles the location registry, the system-topology
//! service and the consumer-requirement queries. `LocalEnvironment` is the
//! single-process implementation used by the probe binary; tests use
//! [`MockEnvironment`](crate::mock::MockEnvironment).

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::types::{
    LocationGroupHandle, LocationHandle, LocationKind, SynchronizationMode, SystemTreeNodeHandle,
};

/// A recordable execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Location {
    /// Process-wide unique handle, used as the recorder of sampling sets.
    pub handle: LocationHandle,
    /// Id of the location inside its process; 0 is the first CPU thread.
    pub id: u32,
    pub kind: LocationKind,
}

impl Location {
    pub fn new(handle: LocationHandle, id: u32, kind: LocationKind) -> Self {
        Self { handle, id, kind }
    }

    pub fn is_cpu_thread(&self) -> bool {
        self.kind == LocationKind::CpuThread
    }
}

/// Services of the measurement runtime the metric subsystem consumes.
pub trait Environment: Send + Sync {
    /// Creates a synthetic metric-only location recording values for `parent`.
    fn create_metric_location(&self, parent: &Location, name: &str) -> Location;

    /// Location group (process) of the caller.
    fn process_location_group(&self) -> Option<LocationGroupHandle>;

    /// System-tree node of the caller's shared-memory domain.
    fn shared_memory_node(&self) -> Option<SystemTreeNodeHandle>;

    /// Root of the system tree.
    fn system_tree_root(&self) -> Option<SystemTreeNodeHandle>;

    /// Whether this process is the first process on its node.
    ///
    /// Only meaningful after the multi-process runtime is initialized.
    fn is_process_master_on_node(&self) -> bool;

    /// Global rank of this process.
    fn rank(&self) -> u32;

    /// Whether any attached consumer reads asynchronous metrics.
    fn requires_async_metrics(&self) -> bool;

    /// Whether any attached consumer reads per-host or once metrics.
    fn requires_per_host_and_once_metrics(&self) -> bool;
}

/// Monotonic time source in ticks.
pub trait Clock: Send + Sync {
    fn ticks(&self) -> u64;
}

/// Nanoseconds since creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn ticks(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

/// Information handed to a source's `synchronize` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncContext {
    pub mode: SynchronizationMode,
    pub is_process_master_on_node: bool,
    pub rank: u32,
    /// Process-local id of the calling location.
    pub location_id: u32,
}

impl SyncContext {
    pub fn new<E: Environment + ?Sized>(env: &E, location: &Location, mode: SynchronizationMode) -> Self {
        Self {
            mode,
            is_process_master_on_node: env.is_process_master_on_node(),
            rank: env.rank(),
            location_id: location.id,
        }
    }
}

/// Environment of a single, standalone process.
///
/// The process is rank 0 and master on its node; every consumer requirement
/// is reported as present.
#[derive(Debug)]
pub struct LocalEnvironment {
    next_handle: AtomicU32,
    next_cpu_id: AtomicU32,
    metric_locations: Mutex<Vec<(Location, String)>>,
}

impl LocalEnvironment {
    const GROUP: LocationGroupHandle = LocationGroupHandle(0);
    const ROOT: SystemTreeNodeHandle = SystemTreeNodeHandle(0);
    const NODE: SystemTreeNodeHandle = SystemTreeNodeHandle(1);

    pub fn new() -> Self {
        Self {
            next_handle: AtomicU32::new(0),
            next_cpu_id: AtomicU32::new(0),
            metric_locations: Mutex::new(Vec::new()),
        }
    }

    /// Allocates the next CPU-thread location.
    ///
    /// The first call returns the location with id 0.
    pub fn new_cpu_location(&self) -> Location {
        let handle = LocationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let id = self.next_cpu_id.fetch_add(1, Ordering::Relaxed);
        Location::new(handle, id, LocationKind::CpuThread)
    }

    /// Metric locations created so far, with their names.
    pub fn metric_locations(&self) -> Vec<(Location, String)> {
        match self.metric_locations.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for LocalEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for LocalEnvironment {
    fn create_metric_location(&self, parent: &Location, name: &str) -> Location {
        let handle = LocationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let location = Location::new(handle, parent.id, LocationKind::Metric);
        let mut guard = match self.metric_locations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((location, name.to_string()));
        location
    }

    fn process_location_group(&self) -> Option<LocationGroupHandle> {
        Some(Self::GROUP)
    }

    fn shared_memory_node(&self) -> Option<SystemTreeNodeHandle> {
        Some(Self::NODE)
    }

    fn system_tree_root(&self) -> Option<SystemTreeNodeHandle> {
        Some(Self::ROOT)
    }

    fn is_process_master_on_node(&self) -> bool {
        true
    }

    fn rank(&self) -> u32 {
        0
    }

    fn requires_async_metrics(&self) -> bool {
        true
    }

    fn requires_per_host_and_once_metrics(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_locations_are_numbered_from_zero() {
        let env = LocalEnvironment::new();
        let first = env.new_cpu_location();
        let second = env.new_cpu_location();
        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
        assert_ne!(first.handle, second.handle);
        assert!(first.is_cpu_thread());
    }

    #[test]
    fn test_metric_locations_get_unique_handles() {
        let env = LocalEnvironment::new();
        let cpu = env.new_cpu_location();
        let shadow = env.create_metric_location(&cpu, "ru_utime");
        assert_eq!(shadow.kind, LocationKind::Metric);
        assert_ne!(shadow.handle, cpu.handle);
        assert_eq!(env.metric_locations().len(), 1);
    }

    #[test]
    fn test_monotonic_clock() {
        let clock = MonotonicClock::new();
        let a = clock.ticks();
        let b = clock.ticks();
        assert!(b >= a);
    }

    #[test]
    fn test_sync_context() {
        let env = LocalEnvironment::new();
        let loc = env.new_cpu_location();
        let ctx = SyncContext::new(&env, &loc, SynchronizationMode::Begin);
        assert_eq!(ctx.rank, 0);
        assert!(ctx.is_process_master_on_node);
        assert_eq!(ctx.location_id, 0);
    }
}
