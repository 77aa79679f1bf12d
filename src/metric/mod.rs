//! Metric manager: lifecycle of the sources and of every location's
//! metric state.
//!
//! # Lifecycle
//!
//! ```text
//! register ─► initialize ─► initialize_location (every location, id 0 first)
//!                                 │
//!                           initialize_mpp (one location, after the MPP runtime is up)
//!                                 │
//!               synchronize / read / write_* (repeated, per location)
//!                                 │
//!                    end ─► finalize_location ─► finalize ─► deregister
//! ```
//!
//! Per-location state lives in [`LocationMetrics`], owned by whoever owns
//! the location. The manager itself is shared read-only between location
//! threads; everything that changes shared state (`initialize`, `finalize`,
//! `reinitialize`) takes `&mut self`.

mod buffer;
mod builder;
mod read;
mod registry;
mod sets;

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::ConfigRegistry;
use crate::definitions::Definitions;
use crate::environment::{Environment, Location, SyncContext};
use crate::error::MetricError;
use crate::source::MetricSource;
use crate::types::{MetricHandle, SamplingSetHandle, Synchronicity, SynchronizationMode};
use crate::writer::MetricWriter;

use builder::{Builder, ConsumerGates};

pub use buffer::ValueBuffer;
pub use registry::{MAX_STRICTLY_SYNCHRONOUS_METRICS, StrictDefinition};
pub use sets::{AsynchronousMetricSet, LocationMetrics, SynchronousMetricSet};

pub struct MetricManager<E: Environment, D: Definitions> {
    env: Arc<E>,
    definitions: Arc<D>,
    config: ConfigRegistry,
    sources: Vec<Box<dyn MetricSource>>,
    registry: registry::StrictRegistry,
    gates: ConsumerGates,
    registered: bool,
    mpp_location: Mutex<Option<Location>>,
}

impl<E: Environment, D: Definitions> MetricManager<E, D> {
    /// Creates a manager over an ordered list of sources.
    ///
    /// The source order fixes the layout of the strict metrics.
    pub fn new(env: Arc<E>, definitions: Arc<D>, sources: Vec<Box<dyn MetricSource>>) -> Self {
        Self {
            env,
            definitions,
            config: ConfigRegistry::new(),
            sources,
            registry: registry::StrictRegistry::new(),
            gates: ConsumerGates::default(),
            registered: false,
            mpp_location: Mutex::new(None),
        }
    }

    pub fn environment(&self) -> &Arc<E> {
        &self.env
    }

    pub fn definitions(&self) -> &Arc<D> {
        &self.definitions
    }

    pub fn config(&self) -> &ConfigRegistry {
        &self.config
    }

    /// Configuration values must be supplied between `register` and
    /// `initialize`.
    pub fn config_mut(&mut self) -> &mut ConfigRegistry {
        &mut self.config
    }

    pub fn sources(&self) -> &[Box<dyn MetricSource>] {
        &self.sources
    }

    pub fn is_initialized(&self) -> bool {
        self.registry.is_initialized()
    }

    /// Registers the configuration variables of every source.
    pub fn register(&mut self) -> Result<(), MetricError> {
        if self.registered {
            return Ok(());
        }
        for source in &mut self.sources {
            source.register(&mut self.config)?;
        }
        self.registered = true;
        debug!(sources = self.sources.len(), "metric sources registered");
        Ok(())
    }

    /// Initializes every source and returns the number of strictly-synchronous
    /// metrics. Calling it again before `finalize` changes nothing.
    pub fn initialize(&mut self) -> Result<usize, MetricError> {
        self.registry.initialize(&mut self.sources, &mut self.config)
    }

    fn builder(&self) -> Builder<'_> {
        Builder {
            sources: &self.sources,
            registry: &self.registry,
            env: self.env.as_ref(),
            definitions: self.definitions.as_ref(),
            gates: &self.gates,
        }
    }

    /// Creates the metric state of a location.
    ///
    /// Must run on the thread that owns the location: thread-scoped sources
    /// bind their counters to the calling thread.
    /// Location 0 of the process has to be initialized before any other;
    /// the first initialized location defines the strict metrics. Metric
    /// and GPU locations get an empty state.
    pub fn initialize_location(&self, location: Location) -> Result<LocationMetrics, MetricError> {
        if !location.is_cpu_thread() {
            return Ok(LocationMetrics::empty(location));
        }
        if !self.is_initialized() {
            return Err(MetricError::NotInitialized);
        }
        self.builder().build_location(location)
    }

    /// Adds the per-host and once metrics once the multi-process runtime
    /// knows node masters and ranks.
    pub fn initialize_mpp(&self, metrics: &mut LocationMetrics) -> Result<(), MetricError> {
        *lock(&self.mpp_location) = Some(metrics.location);
        if !metrics.location.is_cpu_thread() {
            return Ok(());
        }
        if !self.is_initialized() {
            return Err(MetricError::NotInitialized);
        }
        self.builder().build_mpp(metrics)
    }

    /// The location that ran the MPP phase last.
    pub fn mpp_location(&self) -> Option<Location> {
        *lock(&self.mpp_location)
    }

    /// Forwards a synchronization point to every source.
    pub fn synchronize(&self, location: &Location, mode: SynchronizationMode) {
        if !self.is_initialized() {
            return;
        }
        let context = SyncContext::new(self.env.as_ref(), location, mode);
        for source in &self.sources {
            source.synchronize(&context);
        }
    }

    /// Reads the strict metrics, the synchronous sets and the event-driven
    /// asynchronous sets, in that order.
    ///
    /// Returns the value buffer, or `None` without touching any source if
    /// the location records no metrics.
    pub fn read<'m>(&self, metrics: &'m mut LocationMetrics) -> Option<&'m [u64]> {
        if !self.is_initialized() || !metrics.has_metrics {
            return None;
        }
        let location = metrics.location.id;
        read::read_strict(&self.sources, &self.registry, metrics);
        read::read_sync_sets(&self.sources, location, &mut metrics.sync_sets, &mut metrics.buffer, false);
        read::read_async_sets(&self.sources, location, &mut metrics.async_event_sets, false);
        Some(metrics.buffer.as_slice())
    }

    /// Hands the strict values of the last read to `writer` as one sample.
    pub fn write_strictly_synchronous_metrics<W: MetricWriter + ?Sized>(
        &self,
        metrics: &LocationMetrics,
        timestamp: u64,
        writer: &mut W,
    ) {
        if !metrics.has_metrics {
            return;
        }
        if let Some(sampling_set) = self.strictly_synchronous_sampling_set() {
            read::write_strict(metrics, self.registry.total(), sampling_set, timestamp, writer);
        }
    }

    /// Hands every synchronous metric updated by the last read to `writer`.
    pub fn write_synchronous_metrics<W: MetricWriter + ?Sized>(
        &self,
        metrics: &LocationMetrics,
        timestamp: u64,
        writer: &mut W,
    ) {
        if metrics.has_metrics {
            read::write_sync_sets(metrics, timestamp, writer);
        }
    }

    /// Hands the event-driven asynchronous pairs of the last read to `writer`.
    pub fn write_asynchronous_metrics<W: MetricWriter + ?Sized>(
        &self,
        metrics: &LocationMetrics,
        writer: &mut W,
    ) {
        if metrics.has_metrics {
            read::write_async_sets(&metrics.async_event_sets, writer);
        }
    }

    /// Reads the polled asynchronous sets one last time, forcing every
    /// source to flush, and hands the pairs to each writer.
    pub fn post_mortem(&self, metrics: &mut LocationMetrics, writers: &mut [&mut dyn MetricWriter]) {
        if !metrics.location.is_cpu_thread() || !metrics.has_metrics {
            return;
        }
        let location = metrics.location.id;
        read::read_async_sets(&self.sources, location, &mut metrics.async_polled_sets, true);
        for writer in writers.iter_mut() {
            read::write_async_sets(metrics.async_sets(Synchronicity::Async), &mut **writer);
        }
    }

    /// Measurement end: runs [`post_mortem`](Self::post_mortem) for every
    /// location.
    pub fn end<'a>(
        &self,
        locations: impl IntoIterator<Item = &'a mut LocationMetrics>,
        writers: &mut [&mut dyn MetricWriter],
    ) {
        for metrics in locations {
            self.post_mortem(metrics, writers);
        }
    }

    /// Releases every event set of a location and empties its state.
    pub fn finalize_location(&self, metrics: &mut LocationMetrics) {
        for set in metrics
            .async_event_sets
            .iter_mut()
            .chain(metrics.async_polled_sets.iter_mut())
        {
            set.clear_pending();
        }
        let sync_members = metrics.sync_sets.drain(..).flat_map(|s| s.members);
        let async_members = metrics
            .async_event_sets
            .drain(..)
            .chain(metrics.async_polled_sets.drain(..))
            .flat_map(|s| s.members);
        for member in sync_members.chain(async_members) {
            if let Some(source) = self.sources.get(member.source) {
                source.free_event_set(member.event_set);
            }
        }
        if metrics.location.is_cpu_thread() && !metrics.strict_event_sets.is_empty() {
            let strict = std::mem::take(&mut metrics.strict_event_sets);
            for (source, event_set) in self.sources.iter().zip(strict) {
                source.finalize_location(event_set);
            }
        }
        metrics.buffer.clear();
        metrics.has_metrics = false;
        debug!(location = metrics.location.id, "location metrics finalized");
    }

    /// Finalizes every source and forgets the strict metrics.
    ///
    /// Every location has to be finalized first.
    pub fn finalize(&mut self) {
        if !self.is_initialized() {
            return;
        }
        for source in &mut self.sources {
            source.finalize_source();
        }
        self.registry.finalize();
        debug!("metric sources finalized");
    }

    /// Removes the configuration variables of every source.
    pub fn deregister(&mut self) {
        if !self.registered {
            return;
        }
        for source in &mut self.sources {
            source.deregister(&mut self.config);
        }
        self.registered = false;
    }

    /// Rebuilds everything from the current configuration: finalizes every
    /// location and source, initializes them again and reruns the MPP phase
    /// for `caller`.
    ///
    /// `locations` has to hold every location with metric state; location 0
    /// first. The exclusive borrows stand for the caller's guarantee that no
    /// location reads metrics meanwhile.
    pub fn reinitialize<'a>(
        &mut self,
        locations: impl IntoIterator<Item = &'a mut LocationMetrics>,
        caller: &Location,
    ) -> Result<(), MetricError> {
        let mut locations: Vec<&mut LocationMetrics> = locations.into_iter().collect();
        for metrics in locations.iter_mut() {
            self.finalize_location(metrics);
        }
        self.finalize();
        self.initialize()?;
        for metrics in locations.iter_mut() {
            **metrics = self.initialize_location(metrics.location)?;
        }

        if let Some(previous) = self.mpp_location() {
            if previous != *caller {
                warn!(
                    previous = previous.id,
                    caller = caller.id,
                    "metrics reinitialized from a different location"
                );
            }
        }
        match locations.iter_mut().find(|m| m.location == *caller) {
            Some(metrics) => self.initialize_mpp(metrics)?,
            None => {
                *lock(&self.mpp_location) = Some(*caller);
                warn!(
                    caller = caller.id,
                    "reinitializing location is not among the given locations, per-host and once metrics are not rebuilt"
                );
            }
        }
        Ok(())
    }

    pub fn number_of_strictly_synchronous_metrics(&self) -> usize {
        self.registry.total()
    }

    pub fn strictly_synchronous_sampling_set(&self) -> Option<SamplingSetHandle> {
        self.registry.definition().and_then(|d| d.sampling_set)
    }

    pub fn strictly_synchronous_metric(&self, index: usize) -> Option<MetricHandle> {
        self.registry
            .definition()
            .and_then(|d| d.metrics.get(index).copied())
    }

    /// Number of synchronous metrics a single sample of `metrics` can carry.
    pub fn maximal_number_of_synchronous_metrics(&self, metrics: &LocationMetrics) -> usize {
        metrics.sync_sets.iter().map(|s| s.len()).sum()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::{InMemoryDefinitions, SamplingSetDefinition};
    use crate::mock::{ManualClock, MockEnvironment, MockMetric, MockPlugin, MockSource, MockSourceHandle};
    use crate::source::CONFIG_NAMESPACE;
    use crate::source::plugins::{PluginSource, StaticPluginLoader};
    use crate::types::{LocationKind, MetricOccurrence, SamplingSetClass, Scope, ScopeContainer};
    use crate::writer::SampleRecorder;

    type Manager = MetricManager<MockEnvironment, InMemoryDefinitions>;

    fn manager_with(env: MockEnvironment, sources: Vec<Box<dyn MetricSource>>) -> Manager {
        let mut manager = MetricManager::new(Arc::new(env), Arc::new(InMemoryDefinitions::new()), sources);
        manager.register().unwrap();
        manager
    }

    fn manager(source: MockSource) -> (Manager, MockSourceHandle) {
        let handle = source.handle();
        let mut manager = manager_with(MockEnvironment::new(), vec![Box::new(source)]);
        manager.initialize().unwrap();
        (manager, handle)
    }

    fn cpu(manager: &Manager, id: u32) -> Location {
        manager.environment().cpu_location(id)
    }

    #[test]
    fn test_scenario_two_strict_values() {
        let (manager, _) = manager(MockSource::two_strict_counters());
        let mut metrics = manager.initialize_location(cpu(&manager, 0)).unwrap();

        assert_eq!(manager.read(&mut metrics), Some(&[10u64, 20][..]));
        let mut recorder = SampleRecorder::new();
        manager.write_strictly_synchronous_metrics(&metrics, 42, &mut recorder);

        assert_eq!(recorder.len(), 1);
        let sample = &recorder.samples()[0];
        assert_eq!(sample.values, vec![10, 20]);
        assert_eq!(sample.timestamp, 42);
        assert_eq!(Some(sample.sampling_set), manager.strictly_synchronous_sampling_set());
    }

    #[test]
    fn test_three_strict_values_round_trip() {
        let source = MockSource::new("mock")
            .with_metric(MockMetric::strict("a", 3))
            .with_metric(MockMetric::strict("b", 1))
            .with_metric(MockMetric::strict("c", 4));
        let (manager, _) = manager(source);
        let mut metrics = manager.initialize_location(cpu(&manager, 0)).unwrap();

        manager.read(&mut metrics);
        let mut recorder = SampleRecorder::new();
        manager.write_strictly_synchronous_metrics(&metrics, 1, &mut recorder);
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.samples()[0].values, vec![3, 1, 4]);
        assert_eq!(manager.number_of_strictly_synchronous_metrics(), 3);
        assert!(manager.strictly_synchronous_metric(2).is_some());
        assert!(manager.strictly_synchronous_metric(3).is_none());
    }

    #[test]
    fn test_too_many_strict_metrics() {
        let source = MockSource::new("mock").with_strict_metrics("m", MAX_STRICTLY_SYNCHRONOUS_METRICS + 1);
        let mut manager = manager_with(MockEnvironment::new(), vec![Box::new(source)]);

        let err = manager.initialize().unwrap_err();
        assert!(matches!(err, MetricError::TooManyStrictMetrics { count } if count == 256));
        assert!(!manager.is_initialized());
        assert_eq!(manager.number_of_strictly_synchronous_metrics(), 0);
        assert!(manager.strictly_synchronous_sampling_set().is_none());
        assert!(matches!(
            manager.initialize_location(cpu(&manager, 0)),
            Err(MetricError::NotInitialized)
        ));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (mut manager, handle) = manager(MockSource::two_strict_counters());
        assert_eq!(manager.initialize().unwrap(), 2);
        assert_eq!(manager.initialize().unwrap(), 2);
        assert_eq!(handle.initialize_source_calls(), 1);
    }

    #[test]
    fn test_location_without_metrics_reads_nothing() {
        let source = MockSource::new("mock").with_metric(MockMetric::sync("p", Scope::PerProcess, 1));
        let (manager, handle) = manager(source);
        let _first = manager.initialize_location(cpu(&manager, 0)).unwrap();
        let mut second = manager.initialize_location(cpu(&manager, 1)).unwrap();
        handle.clear_reads();

        assert!(!second.has_metrics());
        assert_eq!(manager.read(&mut second), None);
        assert_eq!(handle.read_count(), 0);

        let mut recorder = SampleRecorder::new();
        manager.write_strictly_synchronous_metrics(&second, 0, &mut recorder);
        manager.write_synchronous_metrics(&second, 0, &mut recorder);
        manager.write_asynchronous_metrics(&second, &mut recorder);
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_metric_and_gpu_locations_are_skipped() {
        let (manager, handle) = manager(MockSource::everything());
        for kind in [LocationKind::Metric, LocationKind::Gpu] {
            let location = Location::new(crate::types::LocationHandle(50), 0, kind);
            let mut metrics = manager.initialize_location(location).unwrap();
            assert!(!metrics.has_metrics());
            manager.initialize_mpp(&mut metrics).unwrap();
            assert!(!metrics.has_metrics());
        }
        assert!(handle.location_calls().is_empty());
    }

    #[test]
    fn test_scenario_per_process_metric_only_on_location_zero() {
        let (manager, handle) = manager(MockSource::per_process_counter());
        let first = manager.initialize_location(cpu(&manager, 0)).unwrap();
        let second = manager.initialize_location(cpu(&manager, 1)).unwrap();

        assert_eq!(first.synchronous_sets().len(), 1);
        assert_eq!(first.synchronous_sets()[0].scope(), Scope::PerProcess);
        assert!(second.synchronous_sets().is_empty());
        assert!(!handle
            .location_calls()
            .iter()
            .any(|&(id, _, scope)| id == 1 && scope == Scope::PerProcess));

        let snapshot = manager.definitions().snapshot();
        let handle = first.synchronous_sets()[0].sampling_sets()[0];
        match snapshot.sampling_set(handle) {
            Some(SamplingSetDefinition::Scoped {
                recorder, scope, ..
            }) => {
                assert_eq!(*recorder, first.location().handle);
                assert_eq!(*scope, ScopeContainer::LocationGroup(MockEnvironment::GROUP));
            }
            other => panic!("expected a scoped sampling set, got {:?}", other),
        }
    }

    #[test]
    fn test_buffer_layout() {
        let source = MockSource::new("mock")
            .with_metric(MockMetric::strict("s0", 1))
            .with_metric(MockMetric::strict("s1", 2))
            .with_metric(MockMetric::sync("t0", Scope::PerThread, 3))
            .with_metric(MockMetric::sync("t1", Scope::PerThread, 4))
            .with_metric(MockMetric::sync("p", Scope::PerProcess, 5))
            .with_metric(MockMetric::sync("h", Scope::PerHost, 6));
        let (manager, _) = manager(source);
        let mut metrics = manager.initialize_location(cpu(&manager, 0)).unwrap();
        assert_eq!(metrics.values().len(), 5);
        let offsets: Vec<usize> = metrics.synchronous_sets().iter().map(|s| s.offset()).collect();
        assert_eq!(offsets, vec![2, 4]);
        assert_eq!(manager.maximal_number_of_synchronous_metrics(&metrics), 3);

        manager.initialize_mpp(&mut metrics).unwrap();
        assert_eq!(metrics.values().len(), 6);
        assert_eq!(metrics.synchronous_sets()[2].offset(), 5);
        assert_eq!(manager.read(&mut metrics), Some(&[1u64, 2, 3, 4, 5, 6][..]));
    }

    #[test]
    fn test_sync_dispatch_follows_update_flags() {
        let source = MockSource::new("mock")
            .with_metric(MockMetric::sync("always", Scope::PerThread, 1))
            .with_metric(
                MockMetric::sync("sometimes", Scope::PerThread, 2).with_update_pattern(&[false, true]),
            );
        let (manager, _) = manager(source);
        let mut metrics = manager.initialize_location(cpu(&manager, 0)).unwrap();
        let sets = metrics.synchronous_sets()[0].sampling_sets().to_vec();

        manager.read(&mut metrics);
        let mut first = SampleRecorder::new();
        manager.write_synchronous_metrics(&metrics, 1, &mut first);
        assert_eq!(first.len(), 1);
        assert_eq!(first.samples()[0].sampling_set, sets[0]);
        assert_eq!(first.samples()[0].values, vec![1]);

        manager.read(&mut metrics);
        let mut second = SampleRecorder::new();
        manager.write_synchronous_metrics(&metrics, 2, &mut second);
        assert_eq!(second.len(), 2);
        assert_eq!(second.for_sampling_set(sets[1]).count(), 1);
    }

    #[test]
    fn test_failed_read_is_not_updated() {
        let source = MockSource::new("mock")
            .with_metric(MockMetric::strict("s", 5).with_values(&[5, 6]))
            .with_metric(MockMetric::sync("t", Scope::PerThread, 7));
        let (manager, handle) = manager(source);
        let mut metrics = manager.initialize_location(cpu(&manager, 0)).unwrap();
        assert_eq!(manager.read(&mut metrics), Some(&[5u64, 7][..]));

        handle.set_fail_reads(true);
        assert_eq!(manager.read(&mut metrics), Some(&[5u64, 7][..]));
        assert_eq!(metrics.synchronous_sets()[0].updated(), &[false]);
        let mut recorder = SampleRecorder::new();
        manager.write_synchronous_metrics(&metrics, 0, &mut recorder);
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_async_pairs_are_replaced_on_every_read() {
        let source = MockSource::new("mock").with_metric(
            MockMetric::asynchronous("e", Synchronicity::AsyncEvent, Scope::PerThread, 0).with_values(&[1, 2]),
        );
        let (manager, _) = manager(source);
        let mut metrics = manager.initialize_location(cpu(&manager, 0)).unwrap();
        assert!(metrics.async_event_sets()[0].pending().is_none());

        manager.read(&mut metrics);
        manager.read(&mut metrics);
        let pending = metrics.async_event_sets()[0].pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].len(), 1);
        assert_eq!(pending[0][0].value, 2);

        let mut recorder = SampleRecorder::new();
        manager.write_asynchronous_metrics(&metrics, &mut recorder);
        manager.write_asynchronous_metrics(&metrics, &mut recorder);
        assert_eq!(recorder.len(), 2);
        let shadow = metrics.async_event_sets()[0].shadow_locations()[0];
        assert_eq!(recorder.samples()[0].location, shadow.handle);
        assert_eq!(recorder.samples()[0].timestamp, 2);

        manager.finalize_location(&mut metrics);
        assert!(metrics.async_event_sets().is_empty());
    }

    #[test]
    fn test_async_sets_get_one_shadow_location_per_metric() {
        let source = MockSource::new("mock")
            .with_metric(MockMetric::asynchronous("a", Synchronicity::AsyncEvent, Scope::PerThread, 1))
            .with_metric(MockMetric::asynchronous("b", Synchronicity::AsyncEvent, Scope::PerThread, 2));
        let (manager, _) = manager(source);
        let metrics = manager.initialize_location(cpu(&manager, 0)).unwrap();

        let created = manager.environment().created_locations();
        let names: Vec<&str> = created.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let set = &metrics.async_event_sets()[0];
        let snapshot = manager.definitions().snapshot();
        for (shadow, handle) in set.shadow_locations().iter().zip(set.sampling_sets()) {
            match snapshot.sampling_set(*handle) {
                Some(SamplingSetDefinition::Scoped {
                    base,
                    recorder,
                    scope,
                    ..
                }) => {
                    assert_eq!(*recorder, shadow.handle);
                    assert_eq!(*scope, ScopeContainer::Location(metrics.location().handle));
                    match snapshot.sampling_set(*base) {
                        Some(SamplingSetDefinition::Plain {
                            occurrence, class, ..
                        }) => {
                            assert_eq!(*occurrence, MetricOccurrence::Asynchronous);
                            assert_eq!(*class, SamplingSetClass::Abstract);
                        }
                        other => panic!("expected a plain base set, got {:?}", other),
                    }
                }
                other => panic!("expected a scoped sampling set, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_strict_once_metric_never_reaches_the_registry() {
        let source = MockSource::new("mock")
            .with_metric(MockMetric::strict("odd", 1).with_pair(Synchronicity::StrictlySync, Scope::Once));
        let (manager, handle) = manager(source);
        let mut metrics = manager.initialize_location(cpu(&manager, 0)).unwrap();
        manager.initialize_mpp(&mut metrics).unwrap();

        assert_eq!(manager.number_of_strictly_synchronous_metrics(), 0);
        assert!(manager.strictly_synchronous_sampling_set().is_none());
        assert!(!metrics.has_metrics());
        assert!(!handle
            .location_calls()
            .iter()
            .any(|&(_, sync, scope)| sync == Synchronicity::StrictlySync && scope != Scope::PerThread));
        assert_eq!(manager.definitions().metric_count(), 0);
    }

    #[test]
    fn test_mpp_phase_respects_rank_and_node_master() {
        let mut manager = manager_with(MockEnvironment::worker_process(), vec![Box::new(MockSource::everything())]);
        manager.initialize().unwrap();
        let mut metrics = manager.initialize_location(cpu(&manager, 0)).unwrap();
        manager.initialize_mpp(&mut metrics).unwrap();
        let scopes: Vec<Scope> = metrics
            .synchronous_sets()
            .iter()
            .map(|s| s.scope())
            .chain(metrics.async_polled_sets().iter().map(|s| s.scope()))
            .collect();
        assert!(!scopes.contains(&Scope::PerHost));
        assert!(!scopes.contains(&Scope::Once));

        let mut manager = manager_with(MockEnvironment::node_master(), vec![Box::new(MockSource::everything())]);
        manager.initialize().unwrap();
        let mut metrics = manager.initialize_location(cpu(&manager, 0)).unwrap();
        manager.initialize_mpp(&mut metrics).unwrap();
        assert_eq!(metrics.synchronous_sets().last().map(|s| s.scope()), Some(Scope::PerHost));
        assert!(metrics.async_polled_sets().iter().all(|s| s.scope() != Scope::Once));
        assert_eq!(manager.mpp_location(), Some(cpu(&manager, 0)));
    }

    #[test]
    fn test_consumer_gates_are_asked_once_and_free_event_sets() {
        let env = MockEnvironment::new()
            .without_async_consumers()
            .without_host_once_consumers();
        let source = MockSource::everything();
        let handle = source.handle();
        let mut manager = manager_with(env, vec![Box::new(source)]);
        manager.initialize().unwrap();

        let mut first = manager.initialize_location(cpu(&manager, 0)).unwrap();
        let second = manager.initialize_location(cpu(&manager, 1)).unwrap();
        manager.initialize_mpp(&mut first).unwrap();

        assert!(first.async_event_sets().is_empty());
        assert!(first.async_polled_sets().is_empty());
        assert!(second.async_event_sets().is_empty());
        assert!(first.synchronous_sets().iter().all(|s| s.scope() != Scope::PerHost));
        assert_eq!(manager.environment().async_queries(), 1);
        assert_eq!(manager.environment().host_once_queries(), 1);
        assert!(manager.environment().created_locations().is_empty());
        // event, polled for both locations and host + once after MPP
        assert_eq!(handle.freed(), 6);
    }

    #[test]
    fn test_missing_container_is_fatal() {
        let source = MockSource::per_process_counter();
        let mut manager = manager_with(MockEnvironment::new().without_containers(), vec![Box::new(source)]);
        manager.initialize().unwrap();
        assert!(matches!(
            manager.initialize_location(cpu(&manager, 0)),
            Err(MetricError::MissingScopeContainer {
                scope: Scope::PerProcess
            })
        ));
    }

    #[test]
    fn test_scenario_reinitialize_grows_strict_metrics() {
        let source = MockSource::five_strict_counters();
        let handle = source.handle();
        let mut manager = manager_with(MockEnvironment::new(), vec![Box::new(source)]);
        manager.config_mut().set(CONFIG_NAMESPACE, "mock", "m0,m1");
        assert_eq!(manager.initialize().unwrap(), 2);

        let loc0 = cpu(&manager, 0);
        let mut first = manager.initialize_location(loc0).unwrap();
        let mut second = manager.initialize_location(cpu(&manager, 1)).unwrap();
        manager.initialize_mpp(&mut first).unwrap();
        assert_eq!(first.values().len(), 2);

        manager.config_mut().set(CONFIG_NAMESPACE, "mock", "all");
        manager.reinitialize([&mut first, &mut second], &loc0).unwrap();

        assert_eq!(manager.number_of_strictly_synchronous_metrics(), 5);
        assert_eq!(first.values().len(), 5);
        assert_eq!(second.values().len(), 5);
        assert_eq!(manager.read(&mut second), Some(&[10u64, 20, 30, 40, 50][..]));
        assert_eq!(handle.finalize_source_calls(), 1);
        assert_eq!(handle.finalized_locations(), 2);
        assert_eq!(manager.mpp_location(), Some(loc0));
    }

    #[test]
    fn test_reinitialize_from_another_location_moves_mpp_location() {
        let (mut manager, _) = manager(MockSource::everything());
        let loc0 = cpu(&manager, 0);
        let loc1 = cpu(&manager, 1);
        let mut first = manager.initialize_location(loc0).unwrap();
        let mut second = manager.initialize_location(loc1).unwrap();
        manager.initialize_mpp(&mut first).unwrap();
        assert!(first.synchronous_sets().iter().any(|s| s.scope() == Scope::PerHost));

        manager.reinitialize([&mut first, &mut second], &loc1).unwrap();
        assert_eq!(manager.mpp_location(), Some(loc1));
        assert!(second.synchronous_sets().iter().any(|s| s.scope() == Scope::PerHost));
        assert!(first.synchronous_sets().iter().all(|s| s.scope() != Scope::PerHost));
    }

    #[test]
    fn test_reinitialize_from_unknown_location_skips_mpp_sets() {
        let (mut manager, _) = manager(MockSource::everything());
        let loc0 = cpu(&manager, 0);
        let outsider = cpu(&manager, 7);
        let mut first = manager.initialize_location(loc0).unwrap();
        manager.initialize_mpp(&mut first).unwrap();

        manager.reinitialize([&mut first], &outsider).unwrap();
        assert_eq!(manager.mpp_location(), Some(outsider));
        assert!(first.has_metrics());
        assert!(
            first
                .synchronous_sets()
                .iter()
                .all(|s| s.scope() != Scope::PerHost && s.scope() != Scope::Once)
        );
    }

    #[test]
    fn test_scenario_post_mortem_forces_polled_reads_once() {
        let clock = Arc::new(ManualClock::new(10));
        let plugin = Arc::new(
            MockPlugin::new(Synchronicity::Async, Scope::PerThread)
                .with_event("x", &["x"])
                .with_delta_t(u64::MAX),
        );
        let shared = Arc::clone(&plugin);
        let loader = StaticPluginLoader::new().with_plugin("p", move || shared.clone());
        let plugins = PluginSource::with_clock(Arc::new(loader), clock);

        let mock = MockSource::new("mock").with_metric(MockMetric::asynchronous(
            "polled",
            Synchronicity::Async,
            Scope::PerThread,
            3,
        ));
        let handle = mock.handle();
        let mut manager = manager_with(MockEnvironment::new(), vec![Box::new(mock), Box::new(plugins)]);
        manager.config_mut().set(CONFIG_NAMESPACE, "plugins", "p");
        manager.config_mut().set(CONFIG_NAMESPACE, "p", "x");
        manager.initialize().unwrap();

        let mut locations = vec![
            manager.initialize_location(cpu(&manager, 0)).unwrap(),
            manager.initialize_location(cpu(&manager, 1)).unwrap(),
        ];
        for metrics in &mut locations {
            manager.read(&mut *metrics);
            assert_eq!(metrics.async_polled_sets().len(), 1);
            assert!(metrics.async_polled_sets()[0].pending().is_none());
        }
        assert_eq!(handle.read_count(), 0);

        let mut first = SampleRecorder::new();
        let mut second = SampleRecorder::new();
        manager.end(locations.iter_mut(), &mut [&mut first, &mut second]);

        let reads = handle.reads();
        assert_eq!(reads.len(), 2);
        assert!(reads.iter().all(|r| r.force_update));
        assert_eq!(reads[0].location_id, 0);
        assert_eq!(reads[1].location_id, 1);
        // one mock pair and two plugin pairs per location, for every writer
        assert_eq!(first.len(), 6);
        assert_eq!(first.samples(), second.samples());
    }

    #[test]
    fn test_synchronize_reaches_every_source() {
        let (manager, handle) = manager(MockSource::two_strict_counters());
        let location = cpu(&manager, 0);
        manager.synchronize(&location, SynchronizationMode::Begin);
        manager.synchronize(&location, SynchronizationMode::End);
        assert_eq!(
            handle.synchronize_modes(),
            vec![SynchronizationMode::Begin, SynchronizationMode::End]
        );
    }

    #[test]
    fn test_full_teardown() {
        let (mut manager, handle) = manager(MockSource::everything());
        let mut metrics = manager.initialize_location(cpu(&manager, 0)).unwrap();
        manager.initialize_mpp(&mut metrics).unwrap();
        manager.read(&mut metrics);

        manager.finalize_location(&mut metrics);
        assert!(!metrics.has_metrics());
        assert!(metrics.values().is_empty());
        assert_eq!(manager.read(&mut metrics), None);
        assert_eq!(handle.finalized_locations(), 1);
        // thread, process, event, polled, host, once
        assert_eq!(handle.freed(), 6);
        assert_eq!(handle.dropped_event_sets(), 7);

        manager.finalize();
        assert!(!manager.is_initialized());
        assert_eq!(handle.finalize_source_calls(), 1);
        manager.finalize();
        assert_eq!(handle.finalize_source_calls(), 1);

        manager.deregister();
        assert!(!handle.is_registered());
        assert!(!manager.config().is_registered(CONFIG_NAMESPACE, "mock"));
    }

    #[test]
    fn test_locations_initialize_concurrently() {
        let (manager, _) = manager(MockSource::two_strict_counters());
        let results: Vec<Vec<u64>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|id| {
                    let manager = &manager;
                    scope.spawn(move || {
                        let mut metrics = manager.initialize_location(manager.environment().cpu_location(id)).unwrap();
                        manager.read(&mut metrics).map(|v| v.to_vec()).unwrap_or_default()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(|v| v == &[10, 20]));
        // the strict metrics are defined by exactly one of them
        assert_eq!(manager.definitions().metric_count(), 2);
        assert_eq!(manager.definitions().sampling_set_count(), 1);
    }
}
