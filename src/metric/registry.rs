//! Process-wide registry of strictly-synchronous metrics.
//!
//! Every source contributes a fixed number of strict metrics; their values
//! occupy the front of every location's value buffer, source after source.
//! The metric and sampling-set definitions are written once, by the first
//! location that is initialized, and shared by all others.

use std::sync::OnceLock;

use tracing::debug;

use crate::config::ConfigRegistry;
use crate::definitions::Definitions;
use crate::environment::Location;
use crate::error::MetricError;
use crate::source::{EventSet, MetricSource};
use crate::types::{MetricHandle, MetricOccurrence, SamplingSetClass, SamplingSetHandle};

/// Maximum number of strictly-synchronous metrics; a sampling set carries
/// its member count in one byte.
pub const MAX_STRICTLY_SYNCHRONOUS_METRICS: usize = 255;

/// Definitions of the strict metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrictDefinition {
    pub metrics: Vec<MetricHandle>,
    /// `None` if there are no strict metrics.
    pub sampling_set: Option<SamplingSetHandle>,
}

#[derive(Debug, Default)]
pub struct StrictRegistry {
    initialized: bool,
    counts: Vec<usize>,
    offsets: Vec<usize>,
    total: usize,
    definition: OnceLock<StrictDefinition>,
}

impl StrictRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Initializes every source in order and lays out their strict metrics.
    ///
    /// Does nothing if already initialized. If the sources ask for more than
    /// [`MAX_STRICTLY_SYNCHRONOUS_METRICS`] metrics, or a source fails, every
    /// source is finalized again and the registry stays uninitialized.
    pub fn initialize(
        &mut self,
        sources: &mut [Box<dyn MetricSource>],
        config: &mut ConfigRegistry,
    ) -> Result<usize, MetricError> {
        if self.initialized {
            return Ok(self.total);
        }

        let mut counts = Vec::with_capacity(sources.len());
        let mut offsets = Vec::with_capacity(sources.len());
        let mut total = 0usize;
        for source in sources.iter_mut() {
            let count = match source.initialize_source(config) {
                Ok(count) => count as usize,
                Err(e) => {
                    rollback(sources);
                    return Err(e);
                }
            };
            offsets.push(total);
            counts.push(count);
            total += count;
        }

        if total > MAX_STRICTLY_SYNCHRONOUS_METRICS {
            rollback(sources);
            return Err(MetricError::TooManyStrictMetrics { count: total });
        }

        debug!(strict_metrics = total, sources = sources.len(), "metric sources initialized");
        self.counts = counts;
        self.offsets = offsets;
        self.total = total;
        self.initialized = true;
        Ok(total)
    }

    /// Defines the strict metrics and their sampling set, unless another
    /// location already did.
    ///
    /// `strict_sets[i]` is the strict event set of source `i` for `location`.
    pub fn define(
        &self,
        location: &Location,
        strict_sets: &[Option<Box<dyn EventSet>>],
        definitions: &dyn Definitions,
    ) -> &StrictDefinition {
        // Other locations block here until the first one is done.
        self.definition.get_or_init(|| {
            let mut metrics = Vec::with_capacity(self.total);
            for (count, event_set) in self.counts.iter().zip(strict_sets) {
                let Some(event_set) = event_set else { continue };
                for index in 0..*count {
                    metrics.push(definitions.define_metric(&event_set.properties(index), None));
                }
            }
            let sampling_set = (!metrics.is_empty()).then(|| {
                definitions.define_sampling_set(
                    &metrics,
                    MetricOccurrence::SynchronousStrict,
                    SamplingSetClass::Cpu,
                )
            });
            debug!(location = location.id, metrics = metrics.len(), "strict metrics defined");
            StrictDefinition {
                metrics,
                sampling_set,
            }
        })
    }

    /// Forgets the layout and the definitions.
    pub fn finalize(&mut self) {
        self.initialized = false;
        self.counts.clear();
        self.offsets.clear();
        self.total = 0;
        self.definition = OnceLock::new();
    }

    /// Overall number of strict metrics.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of strict metrics of source `index`.
    pub fn count(&self, index: usize) -> usize {
        self.counts.get(index).copied().unwrap_or(0)
    }

    /// Buffer offset of the first strict metric of source `index`.
    pub fn offset(&self, index: usize) -> usize {
        self.offsets.get(index).copied().unwrap_or(0)
    }

    pub fn definition(&self) -> Option<&StrictDefinition> {
        self.definition.get()
    }
}

fn rollback(sources: &mut [Box<dyn MetricSource>]) {
    for source in sources.iter_mut() {
        source.finalize_source();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::InMemoryDefinitions;
    use crate::mock::MockSource;
    use crate::types::{LocationHandle, LocationKind, Scope, Synchronicity};

    fn registered(sources: &mut [Box<dyn MetricSource>]) -> ConfigRegistry {
        let mut config = ConfigRegistry::new();
        for source in sources.iter_mut() {
            source.register(&mut config).unwrap();
        }
        config
    }

    #[test]
    fn test_offsets_accumulate_in_source_order() {
        let mut sources: Vec<Box<dyn MetricSource>> = vec![
            Box::new(MockSource::two_strict_counters()),
            Box::new(MockSource::new("other").with_strict_metrics("x", 3)),
        ];
        let mut config = registered(&mut sources);

        let mut registry = StrictRegistry::new();
        assert_eq!(registry.initialize(&mut sources, &mut config).unwrap(), 5);
        assert_eq!((registry.count(0), registry.offset(0)), (2, 0));
        assert_eq!((registry.count(1), registry.offset(1)), (3, 2));
        assert_eq!(registry.count(7), 0);
    }

    #[test]
    fn test_overflow_leaves_nothing_behind() {
        let source = MockSource::new("mock").with_strict_metrics("m", MAX_STRICTLY_SYNCHRONOUS_METRICS + 1);
        let handle = source.handle();
        let mut sources: Vec<Box<dyn MetricSource>> = vec![Box::new(source)];
        let mut config = registered(&mut sources);

        let mut registry = StrictRegistry::new();
        let err = registry.initialize(&mut sources, &mut config).unwrap_err();
        assert!(matches!(err, MetricError::TooManyStrictMetrics { count: 256 }));
        assert!(!registry.is_initialized());
        assert_eq!(registry.total(), 0);
        assert!(registry.definition().is_none());
        assert_eq!(handle.finalize_source_calls(), 1);
    }

    #[test]
    fn test_exactly_the_limit_is_accepted() {
        let mut sources: Vec<Box<dyn MetricSource>> = vec![Box::new(
            MockSource::new("mock").with_strict_metrics("m", MAX_STRICTLY_SYNCHRONOUS_METRICS),
        )];
        let mut config = registered(&mut sources);
        let mut registry = StrictRegistry::new();
        assert_eq!(registry.initialize(&mut sources, &mut config).unwrap(), 255);
    }

    #[test]
    fn test_define_once() {
        let mut sources: Vec<Box<dyn MetricSource>> = vec![Box::new(MockSource::two_strict_counters())];
        let mut config = registered(&mut sources);
        let mut registry = StrictRegistry::new();
        registry.initialize(&mut sources, &mut config).unwrap();

        let location = Location::new(LocationHandle(0), 0, LocationKind::CpuThread);
        let strict = vec![sources[0]
            .initialize_location(&location, Synchronicity::StrictlySync, Scope::PerThread)
            .unwrap()];
        let defs = InMemoryDefinitions::new();

        let first = registry.define(&location, &strict, &defs).clone();
        let second = registry.define(&location, &strict, &defs).clone();
        assert_eq!(first, second);
        assert_eq!(first.metrics.len(), 2);
        assert!(first.sampling_set.is_some());
        assert_eq!(defs.metric_count(), 2);
        assert_eq!(defs.sampling_set_count(), 1);

        registry.finalize();
        assert!(registry.definition().is_none());
        assert!(!registry.is_initialized());
    }
}
