//! Pre-built mock backends and environments.
//!
//! These cover the measurement layouts the manager tests keep coming back
//! to: a couple of strict counters, a per-process counter, a backend that
//! offers a bit of everything, and processes that are not rank 0.

use super::environment::MockEnvironment;
use super::source::{MockMetric, MockSource};
use crate::types::{Scope, Synchronicity};

impl MockSource {
    /// Two strictly-synchronous counters reading 10 and 20.
    pub fn two_strict_counters() -> Self {
        Self::new("mock")
            .with_metric(MockMetric::strict("m0", 10))
            .with_metric(MockMetric::strict("m1", 20))
    }

    /// Five strictly-synchronous counters `m0..m4` reading 10, 20, ... 50.
    pub fn five_strict_counters() -> Self {
        (0..5).fold(Self::new("mock"), |source, i| {
            source.with_metric(MockMetric::strict(&format!("m{}", i), (i + 1) * 10))
        })
    }

    /// A single synchronous per-process counter.
    pub fn per_process_counter() -> Self {
        Self::new("mock").with_metric(MockMetric::sync("process_counter", Scope::PerProcess, 7))
    }

    /// One metric of every kind a location can record, plus per-host and
    /// once metrics for the MPP phase.
    pub fn everything() -> Self {
        Self::new("mock")
            .with_metric(MockMetric::strict("strict", 1))
            .with_metric(MockMetric::sync("thread", Scope::PerThread, 2))
            .with_metric(MockMetric::sync("process", Scope::PerProcess, 3))
            .with_metric(MockMetric::asynchronous(
                "event",
                Synchronicity::AsyncEvent,
                Scope::PerThread,
                4,
            ))
            .with_metric(MockMetric::asynchronous(
                "polled",
                Synchronicity::Async,
                Scope::PerThread,
                5,
            ))
            .with_metric(MockMetric::sync("host", Scope::PerHost, 6))
            .with_metric(MockMetric::asynchronous(
                "once",
                Synchronicity::Async,
                Scope::Once,
                8,
            ))
    }
}

impl MockEnvironment {
    /// A process that is neither rank 0 nor master on its node.
    pub fn worker_process() -> Self {
        Self::new().with_rank(3).with_process_master(false)
    }

    /// A node master that is not rank 0.
    pub fn node_master() -> Self {
        Self::new().with_rank(1).with_process_master(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;

    #[test]
    fn test_presets() {
        assert!(!MockEnvironment::worker_process().is_process_master_on_node());
        assert_eq!(MockEnvironment::node_master().rank(), 1);
        let source = MockSource::five_strict_counters();
        assert_eq!(source.handle().initialize_source_calls(), 0);
    }
}
