//! Deterministic metric backend for testing the metric manager.
//!
//! A `MockSource` owns a catalog of [`MockMetric`]s, each bound to one
//! (synchronicity, scope) pair. The configuration variable
//! `metric.<name>` selects which of them are enabled (default `all`).
//! Every call the manager makes is appended to a shared log that tests
//! inspect through a [`MockSourceHandle`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::config::{ConfigRegistry, ConfigVariable, split_list};
use crate::environment::{Location, SyncContext};
use crate::error::{ConfigError, MetricError, ReadError};
use crate::source::{CONFIG_NAMESPACE, EventSet, MetricSource, resolve_metric_list};
use crate::types::{
    MetricProperties, Scope, SourceKind, Synchronicity, SynchronizationMode, TimeValuePair,
};

/// One synthetic metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MockMetric {
    pub name: String,
    pub synchronicity: Synchronicity,
    pub scope: Scope,
    /// Value of the n-th read; the last one repeats.
    pub values: Vec<u64>,
    /// Whether the n-th synchronous read reports an update; cycles.
    pub update_pattern: Vec<bool>,
}

impl MockMetric {
    fn new(name: &str, synchronicity: Synchronicity, scope: Scope, value: u64) -> Self {
        Self {
            name: name.to_string(),
            synchronicity,
            scope,
            values: vec![value],
            update_pattern: vec![true],
        }
    }

    /// Strictly-synchronous per-thread metric.
    pub fn strict(name: &str, value: u64) -> Self {
        Self::new(name, Synchronicity::StrictlySync, Scope::PerThread, value)
    }

    pub fn sync(name: &str, scope: Scope, value: u64) -> Self {
        Self::new(name, Synchronicity::Sync, scope, value)
    }

    /// `synchronicity` is `AsyncEvent` or `Async`.
    pub fn asynchronous(name: &str, synchronicity: Synchronicity, scope: Scope, value: u64) -> Self {
        Self::new(name, synchronicity, scope, value)
    }

    /// Any pair, including ones the manager must never ask for.
    pub fn with_pair(mut self, synchronicity: Synchronicity, scope: Scope) -> Self {
        self.synchronicity = synchronicity;
        self.scope = scope;
        self
    }

    pub fn with_values(mut self, values: &[u64]) -> Self {
        self.values = values.to_vec();
        self
    }

    pub fn with_update_pattern(mut self, pattern: &[bool]) -> Self {
        self.update_pattern = pattern.to_vec();
        self
    }

    fn value(&self, read: usize) -> u64 {
        self.values
            .get(read)
            .or_else(|| self.values.last())
            .copied()
            .unwrap_or(0)
    }

    fn updated(&self, read: usize) -> bool {
        if self.update_pattern.is_empty() {
            return true;
        }
        self.update_pattern[read % self.update_pattern.len()]
    }
}

/// A logged event-set read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCall {
    pub location_id: u32,
    pub synchronicity: Synchronicity,
    pub scope: Scope,
    pub force_update: bool,
    /// Whether the read ran on the thread that created the event set.
    pub on_creating_thread: bool,
}

#[derive(Debug, Default)]
struct MockState {
    registered: bool,
    initialize_source_calls: usize,
    location_calls: Vec<(u32, Synchronicity, Scope)>,
    reads: Vec<ReadCall>,
    freed: usize,
    finalized_locations: usize,
    dropped_event_sets: usize,
    finalize_source_calls: usize,
    synchronize_modes: Vec<SynchronizationMode>,
    fail_reads: bool,
}

/// Shared view of a `MockSource`'s call log.
#[derive(Debug, Clone, Default)]
pub struct MockSourceHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockSourceHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.lock().registered
    }

    pub fn initialize_source_calls(&self) -> usize {
        self.lock().initialize_source_calls
    }

    /// `(location id, synchronicity, scope)` of every `initialize_location`.
    pub fn location_calls(&self) -> Vec<(u32, Synchronicity, Scope)> {
        self.lock().location_calls.clone()
    }

    pub fn reads(&self) -> Vec<ReadCall> {
        self.lock().reads.clone()
    }

    pub fn read_count(&self) -> usize {
        self.lock().reads.len()
    }

    /// Number of `free_event_set` calls.
    pub fn freed(&self) -> usize {
        self.lock().freed
    }

    /// Number of `finalize_location` calls.
    pub fn finalized_locations(&self) -> usize {
        self.lock().finalized_locations
    }

    /// Event sets dropped so far, whichever way they were released.
    pub fn dropped_event_sets(&self) -> usize {
        self.lock().dropped_event_sets
    }

    pub fn finalize_source_calls(&self) -> usize {
        self.lock().finalize_source_calls
    }

    pub fn synchronize_modes(&self) -> Vec<SynchronizationMode> {
        self.lock().synchronize_modes.clone()
    }

    /// Makes every following read fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn clear_reads(&self) {
        self.lock().reads.clear();
    }
}

/// Synthetic backend.
#[derive(Debug)]
pub struct MockSource {
    variable: String,
    catalog: Vec<MockMetric>,
    enabled: Vec<usize>,
    initialized: bool,
    strict_count: u32,
    handle: MockSourceHandle,
}

impl MockSource {
    /// Source configured through `metric.<variable>`.
    pub fn new(variable: &str) -> Self {
        Self {
            variable: variable.to_string(),
            catalog: Vec::new(),
            enabled: Vec::new(),
            initialized: false,
            strict_count: 0,
            handle: MockSourceHandle::default(),
        }
    }

    pub fn with_metric(mut self, metric: MockMetric) -> Self {
        self.catalog.push(metric);
        self
    }

    /// Adds `count` strictly-synchronous metrics `<prefix>0..` reading
    /// their own index.
    pub fn with_strict_metrics(mut self, prefix: &str, count: usize) -> Self {
        for i in 0..count {
            self.catalog
                .push(MockMetric::strict(&format!("{}{}", prefix, i), i as u64));
        }
        self
    }

    pub fn handle(&self) -> MockSourceHandle {
        self.handle.clone()
    }

    fn enabled_for(&self, synchronicity: Synchronicity, scope: Scope) -> Vec<MockMetric> {
        self.enabled
            .iter()
            .map(|&i| &self.catalog[i])
            .filter(|m| m.synchronicity == synchronicity && m.scope == scope)
            .cloned()
            .collect()
    }
}

impl MetricSource for MockSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Synthetic
    }

    fn name(&self) -> String {
        format!("mock:{}", self.variable)
    }

    fn register(&mut self, config: &mut ConfigRegistry) -> Result<(), ConfigError> {
        config.register(ConfigVariable::string(
            CONFIG_NAMESPACE,
            &self.variable,
            "all",
            "Enabled synthetic metrics",
        ))?;
        self.handle.lock().registered = true;
        Ok(())
    }

    fn initialize_source(&mut self, config: &mut ConfigRegistry) -> Result<u32, MetricError> {
        if self.initialized {
            return Ok(self.strict_count);
        }
        let requested = split_list(&config.get_string(CONFIG_NAMESPACE, &self.variable)?, ",");
        let names: Vec<&str> = self.catalog.iter().map(|m| m.name.as_str()).collect();
        self.enabled = resolve_metric_list(SourceKind::Synthetic, &requested, &names)?;
        self.strict_count = self
            .enabled_for(Synchronicity::StrictlySync, Scope::PerThread)
            .len() as u32;
        self.initialized = true;
        self.handle.lock().initialize_source_calls += 1;
        Ok(self.strict_count)
    }

    fn initialize_location(
        &self,
        location: &Location,
        synchronicity: Synchronicity,
        scope: Scope,
    ) -> Result<Option<Box<dyn EventSet>>, MetricError> {
        self.handle
            .lock()
            .location_calls
            .push((location.id, synchronicity, scope));
        let metrics = self.enabled_for(synchronicity, scope);
        if metrics.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(MockEventSet {
            location_id: location.id,
            synchronicity,
            scope,
            metrics,
            reads: 0,
            created_on: thread::current().id(),
            handle: self.handle.clone(),
        })))
    }

    fn synchronize(&self, context: &SyncContext) {
        self.handle.lock().synchronize_modes.push(context.mode);
    }

    fn free_event_set(&self, event_set: Box<dyn EventSet>) {
        self.handle.lock().freed += 1;
        drop(event_set);
    }

    fn finalize_location(&self, event_set: Option<Box<dyn EventSet>>) {
        self.handle.lock().finalized_locations += 1;
        drop(event_set);
    }

    fn finalize_source(&mut self) {
        if !self.initialized {
            return;
        }
        self.initialized = false;
        self.enabled.clear();
        self.strict_count = 0;
        self.handle.lock().finalize_source_calls += 1;
    }

    fn deregister(&mut self, config: &mut ConfigRegistry) {
        config.unregister(CONFIG_NAMESPACE, &self.variable);
        self.handle.lock().registered = false;
    }
}

struct MockEventSet {
    location_id: u32,
    synchronicity: Synchronicity,
    scope: Scope,
    metrics: Vec<MockMetric>,
    reads: usize,
    created_on: ThreadId,
    handle: MockSourceHandle,
}

impl MockEventSet {
    /// Logs the read and returns its index, or fails if reads are broken.
    fn begin_read(&mut self, force_update: bool) -> Result<usize, ReadError> {
        let mut state = self.handle.lock();
        state.reads.push(ReadCall {
            location_id: self.location_id,
            synchronicity: self.synchronicity,
            scope: self.scope,
            force_update,
            on_creating_thread: thread::current().id() == self.created_on,
        });
        if state.fail_reads {
            return Err(ReadError::Backend("injected read failure".to_string()));
        }
        let read = self.reads;
        self.reads += 1;
        Ok(read)
    }
}

impl EventSet for MockEventSet {
    fn len(&self) -> usize {
        self.metrics.len()
    }

    fn properties(&self, index: usize) -> MetricProperties {
        let mut properties = MetricProperties::counter(SourceKind::Synthetic, &self.metrics[index].name);
        properties.description = format!("synthetic {} metric", self.synchronicity);
        properties
    }

    fn read_strict(&mut self, values: &mut [u64]) -> Result<(), ReadError> {
        let read = self.begin_read(false)?;
        for (slot, metric) in values.iter_mut().zip(&self.metrics) {
            *slot = metric.value(read);
        }
        Ok(())
    }

    fn read_sync(
        &mut self,
        values: &mut [u64],
        updated: &mut [bool],
        force_update: bool,
    ) -> Result<(), ReadError> {
        let read = self.begin_read(force_update)?;
        for ((slot, flag), metric) in values.iter_mut().zip(updated.iter_mut()).zip(&self.metrics) {
            *flag = force_update || metric.updated(read);
            if *flag {
                *slot = metric.value(read);
            }
        }
        Ok(())
    }

    /// Event-driven metrics yield one pair per read; polled ones only
    /// when forced.
    fn read_async(&mut self, force_update: bool) -> Result<Vec<Vec<TimeValuePair>>, ReadError> {
        let read = self.begin_read(force_update)?;
        let produce = force_update || self.synchronicity == Synchronicity::AsyncEvent;
        Ok(self
            .metrics
            .iter()
            .map(|metric| {
                if produce {
                    vec![TimeValuePair {
                        timestamp: read as u64 + 1,
                        value: metric.value(read),
                    }]
                } else {
                    Vec::new()
                }
            })
            .collect())
    }
}

impl Drop for MockEventSet {
    fn drop(&mut self) {
        self.handle.lock().dropped_event_sets += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LocationHandle, LocationKind};

    fn location() -> Location {
        Location::new(LocationHandle(0), 0, LocationKind::CpuThread)
    }

    fn configured(source: &mut MockSource, value: Option<&str>) -> ConfigRegistry {
        let mut config = ConfigRegistry::new();
        source.register(&mut config).unwrap();
        if let Some(value) = value {
            config.set(CONFIG_NAMESPACE, "mock", value);
        }
        config
    }

    #[test]
    fn test_strict_count_follows_configuration() {
        let mut source = MockSource::new("mock")
            .with_metric(MockMetric::strict("a", 1))
            .with_metric(MockMetric::strict("b", 2))
            .with_metric(MockMetric::sync("c", Scope::PerThread, 3));
        let mut config = configured(&mut source, Some("b,c"));
        assert_eq!(source.initialize_source(&mut config).unwrap(), 1);
        assert_eq!(source.initialize_source(&mut config).unwrap(), 1);
        assert_eq!(source.handle().initialize_source_calls(), 1);

        source.finalize_source();
        config.set(CONFIG_NAMESPACE, "mock", "all");
        assert_eq!(source.initialize_source(&mut config).unwrap(), 2);
    }

    #[test]
    fn test_unknown_metric_is_rejected() {
        let mut source = MockSource::new("mock").with_metric(MockMetric::strict("a", 1));
        let mut config = configured(&mut source, Some("zz"));
        assert!(matches!(
            source.initialize_source(&mut config),
            Err(MetricError::InvalidMetricName { .. })
        ));
    }

    #[test]
    fn test_update_pattern_and_failures() {
        let mut source = MockSource::new("mock").with_metric(
            MockMetric::sync("s", Scope::PerThread, 0)
                .with_values(&[5, 6])
                .with_update_pattern(&[true, false]),
        );
        let mut config = configured(&mut source, None);
        source.initialize_source(&mut config).unwrap();
        let mut set = source
            .initialize_location(&location(), Synchronicity::Sync, Scope::PerThread)
            .unwrap()
            .unwrap();

        let mut values = [0u64];
        let mut updated = [false];
        set.read_sync(&mut values, &mut updated, false).unwrap();
        assert_eq!((values[0], updated[0]), (5, true));
        set.read_sync(&mut values, &mut updated, false).unwrap();
        assert_eq!((values[0], updated[0]), (5, false));

        let handle = source.handle();
        handle.set_fail_reads(true);
        assert!(set.read_sync(&mut values, &mut updated, false).is_err());
        assert_eq!(handle.read_count(), 3);

        drop(set);
        assert_eq!(handle.dropped_event_sets(), 1);
    }

    #[test]
    fn test_polled_async_only_when_forced() {
        let mut source = MockSource::new("mock").with_metric(MockMetric::asynchronous(
            "p",
            Synchronicity::Async,
            Scope::PerThread,
            9,
        ));
        let mut config = configured(&mut source, None);
        source.initialize_source(&mut config).unwrap();
        let mut set = source
            .initialize_location(&location(), Synchronicity::Async, Scope::PerThread)
            .unwrap()
            .unwrap();
        assert!(set.read_async(false).unwrap()[0].is_empty());
        assert_eq!(set.read_async(true).unwrap()[0][0].value, 9);
    }

    #[test]
    fn test_reads_note_the_creating_thread() {
        let mut source = MockSource::new("mock").with_metric(MockMetric::strict("a", 1));
        let mut config = configured(&mut source, None);
        source.initialize_source(&mut config).unwrap();
        let mut set = source
            .initialize_location(&location(), Synchronicity::StrictlySync, Scope::PerThread)
            .unwrap()
            .unwrap();
        let mut values = [0u64];
        set.read_strict(&mut values).unwrap();

        std::thread::spawn(move || {
            let mut values = [0u64];
            set.read_strict(&mut values).unwrap();
        })
        .join()
        .unwrap();

        let reads = source.handle().reads();
        assert!(reads[0].on_creating_thread);
        assert!(!reads[1].on_creating_thread);
    }
}
