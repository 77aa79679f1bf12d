//! Construction of a location's metric sets.
//!
//! A build runs in one of two phases. The location phase creates the
//! strict event sets and the per-thread and per-process sets when a location
//! is initialized; the MPP phase adds per-host and once sets after the
//! multi-process runtime is up, because only then is it known which process
//! is master on its node and which one is rank 0.
//!
//! Each phase first asks every source for its event sets of every eligible
//! (synchronicity, scope) pair and keeps them in a matrix local to the
//! build. The matrix is then drained into metric sets; pairs that produce
//! no metrics, or that no consumer wants, hand their event sets back to the
//! source.

use std::sync::OnceLock;

use tracing::{debug, trace};

use crate::definitions::Definitions;
use crate::environment::{Environment, Location};
use crate::error::MetricError;
use crate::metric::buffer::ValueBuffer;
use crate::metric::registry::StrictRegistry;
use crate::metric::sets::{AsynchronousMetricSet, LocationMetrics, SetMember, SynchronousMetricSet};
use crate::source::{EventSet, MetricSource};
use crate::types::{
    MetricOccurrence, SamplingSetClass, SamplingSetHandle, Scope, ScopeContainer, Synchronicity,
};

/// Consumer requirements, asked once per process.
#[derive(Debug, Default)]
pub(crate) struct ConsumerGates {
    async_metrics: OnceLock<bool>,
    host_and_once_metrics: OnceLock<bool>,
}

impl ConsumerGates {
    fn allows_async(&self, env: &dyn Environment) -> bool {
        *self
            .async_metrics
            .get_or_init(|| env.requires_async_metrics())
    }

    fn allows_host_and_once(&self, env: &dyn Environment) -> bool {
        *self
            .host_and_once_metrics
            .get_or_init(|| env.requires_per_host_and_once_metrics())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Location,
    Mpp,
}

impl Phase {
    fn scopes(self) -> [Scope; 2] {
        match self {
            Phase::Location => [Scope::PerThread, Scope::PerProcess],
            Phase::Mpp => [Scope::PerHost, Scope::Once],
        }
    }
}

type Matrix = Vec<[[Option<Box<dyn EventSet>>; Scope::COUNT]; Synchronicity::COUNT]>;

pub(crate) struct Builder<'a> {
    pub(crate) sources: &'a [Box<dyn MetricSource>],
    pub(crate) registry: &'a StrictRegistry,
    pub(crate) env: &'a dyn Environment,
    pub(crate) definitions: &'a dyn Definitions,
    pub(crate) gates: &'a ConsumerGates,
}

impl Builder<'_> {
    /// Builds the metric state of a freshly initialized CPU location.
    pub(crate) fn build_location(&self, location: Location) -> Result<LocationMetrics, MetricError> {
        let mut matrix = self.collect(&location, Phase::Location)?;
        let mut metrics = LocationMetrics::empty(location);

        metrics.strict_event_sets = matrix
            .iter_mut()
            .map(|row| row[Synchronicity::StrictlySync.index()][Scope::PerThread.index()].take())
            .collect();
        self.check_strict_sets(&metrics.strict_event_sets)?;

        let strict = self.registry.total();
        metrics.buffer = ValueBuffer::new(strict);
        if strict > 0 {
            self.registry
                .define(&location, &metrics.strict_event_sets, self.definitions);
            metrics.has_metrics = true;
        }

        self.build_sets(&mut metrics, &mut matrix, Phase::Location)?;
        debug!(
            location = location.id,
            values = metrics.buffer.len(),
            has_metrics = metrics.has_metrics,
            "location metrics initialized"
        );
        Ok(metrics)
    }

    /// Adds the per-host and once sets to an initialized location.
    pub(crate) fn build_mpp(&self, metrics: &mut LocationMetrics) -> Result<(), MetricError> {
        let location = metrics.location;
        let mut matrix = self.collect(&location, Phase::Mpp)?;
        self.build_sets(metrics, &mut matrix, Phase::Mpp)?;
        debug!(
            location = location.id,
            values = metrics.buffer.len(),
            "location metrics initialized after MPP"
        );
        Ok(())
    }

    fn collect(&self, location: &Location, phase: Phase) -> Result<Matrix, MetricError> {
        let mut matrix: Matrix = Vec::with_capacity(self.sources.len());
        for source in self.sources {
            let mut row: [[Option<Box<dyn EventSet>>; Scope::COUNT]; Synchronicity::COUNT] =
                std::array::from_fn(|_| std::array::from_fn(|_| None));
            for synchronicity in Synchronicity::ALL {
                for scope in phase.scopes() {
                    if !self.eligible(location, synchronicity, scope) {
                        continue;
                    }
                    row[synchronicity.index()][scope.index()] =
                        source.initialize_location(location, synchronicity, scope)?;
                }
            }
            matrix.push(row);
        }
        Ok(matrix)
    }

    fn eligible(&self, location: &Location, synchronicity: Synchronicity, scope: Scope) -> bool {
        if synchronicity == Synchronicity::StrictlySync && scope != Scope::PerThread {
            if scope == Scope::Once {
                debug!("once metrics cannot be strictly synchronous");
            } else {
                trace!(%scope, "strictly-synchronous metrics are recorded per thread only");
            }
            return false;
        }
        match scope {
            Scope::PerThread => true,
            Scope::PerProcess => {
                if location.id != 0 {
                    trace!(location = location.id, "per-process metrics are recorded by location 0");
                }
                location.id == 0
            }
            Scope::PerHost => self.env.is_process_master_on_node(),
            Scope::Once => self.env.rank() == 0,
        }
    }

    /// Every source with strict metrics has to hand out an event set with
    /// exactly as many metrics as it announced.
    fn check_strict_sets(&self, strict_sets: &[Option<Box<dyn EventSet>>]) -> Result<(), MetricError> {
        for (index, (source, event_set)) in self.sources.iter().zip(strict_sets).enumerate() {
            let expected = self.registry.count(index);
            let got = event_set.as_ref().map_or(0, |e| e.len());
            if got != expected {
                return Err(MetricError::EventSetCreation {
                    source: source.kind(),
                    message: format!(
                        "strict event set has {} metrics, {} were announced",
                        got, expected
                    ),
                });
            }
        }
        Ok(())
    }

    fn build_sets(
        &self,
        metrics: &mut LocationMetrics,
        matrix: &mut Matrix,
        phase: Phase,
    ) -> Result<(), MetricError> {
        for scope in phase.scopes() {
            let event_sets = self.take_column(matrix, Synchronicity::Sync, scope);
            if let Some(set) = self.build_sync_set(metrics, scope, event_sets)? {
                metrics.sync_sets.push(set);
                metrics.has_metrics = true;
            }
        }
        for synchronicity in [Synchronicity::AsyncEvent, Synchronicity::Async] {
            for scope in phase.scopes() {
                let event_sets = self.take_column(matrix, synchronicity, scope);
                if let Some(set) = self.build_async_set(&metrics.location, synchronicity, scope, event_sets)? {
                    metrics.async_sets_mut(synchronicity).push(set);
                    metrics.has_metrics = true;
                }
            }
        }
        Ok(())
    }

    fn take_column(
        &self,
        matrix: &mut Matrix,
        synchronicity: Synchronicity,
        scope: Scope,
    ) -> Vec<(usize, Box<dyn EventSet>)> {
        matrix
            .iter_mut()
            .enumerate()
            .filter_map(|(source, row)| {
                row[synchronicity.index()][scope.index()]
                    .take()
                    .map(|event_set| (source, event_set))
            })
            .collect()
    }

    /// Hands event sets that will not be used back to their sources.
    fn release(&self, event_sets: Vec<(usize, Box<dyn EventSet>)>) {
        for (source, event_set) in event_sets {
            self.sources[source].free_event_set(event_set);
        }
    }

    /// Drops empty event sets and applies the consumer gates.
    ///
    /// Returns the members of the new set, or `None` if there is nothing to
    /// build.
    fn members(
        &self,
        synchronicity: Synchronicity,
        scope: Scope,
        event_sets: Vec<(usize, Box<dyn EventSet>)>,
    ) -> Option<Vec<SetMember>> {
        let (event_sets, empty): (Vec<_>, Vec<_>) =
            event_sets.into_iter().partition(|(_, e)| !e.is_empty());
        self.release(empty);
        if event_sets.is_empty() {
            return None;
        }

        let host_or_once = matches!(scope, Scope::PerHost | Scope::Once);
        let prevented = (synchronicity.is_async() && !self.gates.allows_async(self.env))
            || (host_or_once && !self.gates.allows_host_and_once(self.env));
        if prevented {
            debug!(%synchronicity, %scope, "no consumer records these metrics, skipping");
            self.release(event_sets);
            return None;
        }

        let mut first = 0;
        let members = event_sets
            .into_iter()
            .map(|(source, event_set)| {
                let member = SetMember {
                    source,
                    first,
                    event_set,
                };
                first += member.len();
                member
            })
            .collect();
        Some(members)
    }

    fn build_sync_set(
        &self,
        metrics: &mut LocationMetrics,
        scope: Scope,
        event_sets: Vec<(usize, Box<dyn EventSet>)>,
    ) -> Result<Option<SynchronousMetricSet>, MetricError> {
        let Some(members) = self.members(Synchronicity::Sync, scope, event_sets) else {
            return Ok(None);
        };
        let location = metrics.location;
        let container = match scope {
            Scope::PerThread => None,
            _ => Some(self.container(&location, scope)?),
        };
        let class = if scope == Scope::PerThread {
            SamplingSetClass::Cpu
        } else {
            SamplingSetClass::Abstract
        };

        let mut sampling_sets = Vec::new();
        for member in &members {
            for index in 0..member.len() {
                let metric = self
                    .definitions
                    .define_metric(&member.event_set.properties(index), None);
                let base = self
                    .definitions
                    .define_sampling_set(&[metric], MetricOccurrence::Synchronous, class);
                let handle = match container {
                    Some(container) => {
                        self.definitions
                            .define_scoped_sampling_set(base, location.handle, container)
                    }
                    None => base,
                };
                sampling_sets.push(handle);
            }
        }

        let offset = metrics.buffer.append(sampling_sets.len());
        trace!(location = location.id, %scope, metrics = sampling_sets.len(), offset, "synchronous metric set built");
        Ok(Some(SynchronousMetricSet {
            scope,
            members,
            offset,
            updated: vec![false; sampling_sets.len()],
            sampling_sets,
        }))
    }

    fn build_async_set(
        &self,
        location: &Location,
        synchronicity: Synchronicity,
        scope: Scope,
        event_sets: Vec<(usize, Box<dyn EventSet>)>,
    ) -> Result<Option<AsynchronousMetricSet>, MetricError> {
        let Some(members) = self.members(synchronicity, scope, event_sets) else {
            return Ok(None);
        };
        let container = self.container(location, scope)?;

        let mut shadow_locations = Vec::new();
        let mut sampling_sets: Vec<SamplingSetHandle> = Vec::new();
        for member in &members {
            for index in 0..member.len() {
                let properties = member.event_set.properties(index);
                let metric = self.definitions.define_metric(&properties, None);
                let shadow = self.env.create_metric_location(location, &properties.name);
                let base = self.definitions.define_sampling_set(
                    &[metric],
                    MetricOccurrence::Asynchronous,
                    SamplingSetClass::Abstract,
                );
                sampling_sets.push(
                    self.definitions
                        .define_scoped_sampling_set(base, shadow.handle, container),
                );
                shadow_locations.push(shadow);
            }
        }

        trace!(location = location.id, %synchronicity, %scope, metrics = sampling_sets.len(), "asynchronous metric set built");
        Ok(Some(AsynchronousMetricSet {
            synchronicity,
            scope,
            members,
            shadow_locations,
            sampling_sets,
            pending: None,
        }))
    }

    fn container(&self, location: &Location, scope: Scope) -> Result<ScopeContainer, MetricError> {
        let missing = || MetricError::MissingScopeContainer { scope };
        Ok(match scope {
            Scope::PerThread => ScopeContainer::Location(location.handle),
            Scope::PerProcess => {
                ScopeContainer::LocationGroup(self.env.process_location_group().ok_or_else(missing)?)
            }
            Scope::PerHost => {
                ScopeContainer::SystemTreeNode(self.env.shared_memory_node().ok_or_else(missing)?)
            }
            Scope::Once => {
                ScopeContainer::SystemTreeNode(self.env.system_tree_root().ok_or_else(missing)?)
            }
        })
    }
}
