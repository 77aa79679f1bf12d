//! Per-location metric state.

use crate::environment::Location;
use crate::metric::buffer::ValueBuffer;
use crate::source::EventSet;
use crate::types::{SamplingSetHandle, Scope, Synchronicity, TimeValuePair};

/// The part of a metric set contributed by one source.
pub(crate) struct SetMember {
    /// Index of the source in the manager's source list.
    pub(crate) source: usize,
    pub(crate) event_set: Box<dyn EventSet>,
    /// Position of the member's first metric inside the set.
    pub(crate) first: usize,
}

impl SetMember {
    pub(crate) fn len(&self) -> usize {
        self.event_set.len()
    }

    pub(crate) fn range(&self) -> std::ops::Range<usize> {
        self.first..self.first + self.len()
    }
}

/// Synchronous metrics of one scope, stored in the location's buffer.
pub struct SynchronousMetricSet {
    pub(crate) scope: Scope,
    pub(crate) members: Vec<SetMember>,
    /// Buffer offset of the set's first metric.
    pub(crate) offset: usize,
    pub(crate) sampling_sets: Vec<SamplingSetHandle>,
    pub(crate) updated: Vec<bool>,
}

impl SynchronousMetricSet {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn len(&self) -> usize {
        self.sampling_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sampling_sets.is_empty()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// One sampling set per metric.
    pub fn sampling_sets(&self) -> &[SamplingSetHandle] {
        &self.sampling_sets
    }

    /// Update flags of the most recent read.
    pub fn updated(&self) -> &[bool] {
        &self.updated
    }
}

/// Asynchronous metrics of one scope and one family.
///
/// Values never touch the location's buffer. Each read replaces `pending`
/// with the pairs gathered since the previous read.
pub struct AsynchronousMetricSet {
    pub(crate) synchronicity: Synchronicity,
    pub(crate) scope: Scope,
    pub(crate) members: Vec<SetMember>,
    pub(crate) shadow_locations: Vec<Location>,
    pub(crate) sampling_sets: Vec<SamplingSetHandle>,
    pub(crate) pending: Option<Vec<Vec<TimeValuePair>>>,
}

impl AsynchronousMetricSet {
    pub fn synchronicity(&self) -> Synchronicity {
        self.synchronicity
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn len(&self) -> usize {
        self.sampling_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sampling_sets.is_empty()
    }

    /// Recorder location of each metric.
    pub fn shadow_locations(&self) -> &[Location] {
        &self.shadow_locations
    }

    pub fn sampling_sets(&self) -> &[SamplingSetHandle] {
        &self.sampling_sets
    }

    /// Pairs of the most recent read, one list per metric; `None` outside
    /// the read/dispatch window.
    pub fn pending(&self) -> Option<&[Vec<TimeValuePair>]> {
        self.pending.as_deref()
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending = None;
    }
}

/// Everything the metric subsystem keeps for one location.
pub struct LocationMetrics {
    pub(crate) location: Location,
    /// Strict event set per source.
    pub(crate) strict_event_sets: Vec<Option<Box<dyn EventSet>>>,
    pub(crate) sync_sets: Vec<SynchronousMetricSet>,
    pub(crate) async_event_sets: Vec<AsynchronousMetricSet>,
    pub(crate) async_polled_sets: Vec<AsynchronousMetricSet>,
    pub(crate) has_metrics: bool,
    pub(crate) buffer: ValueBuffer,
}

impl LocationMetrics {
    pub(crate) fn empty(location: Location) -> Self {
        Self {
            location,
            strict_event_sets: Vec::new(),
            sync_sets: Vec::new(),
            async_event_sets: Vec::new(),
            async_polled_sets: Vec::new(),
            has_metrics: false,
            buffer: ValueBuffer::default(),
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn has_metrics(&self) -> bool {
        self.has_metrics
    }

    /// Current contents of the value buffer.
    pub fn values(&self) -> &[u64] {
        self.buffer.as_slice()
    }

    pub fn synchronous_sets(&self) -> &[SynchronousMetricSet] {
        &self.sync_sets
    }

    /// Sets of the event-driven asynchronous family.
    pub fn async_event_sets(&self) -> &[AsynchronousMetricSet] {
        &self.async_event_sets
    }

    /// Sets of the polled asynchronous family, read at measurement end.
    pub fn async_polled_sets(&self) -> &[AsynchronousMetricSet] {
        &self.async_polled_sets
    }

    pub(crate) fn async_sets_mut(&mut self, synchronicity: Synchronicity) -> &mut Vec<AsynchronousMetricSet> {
        if synchronicity == Synchronicity::AsyncEvent {
            &mut self.async_event_sets
        } else {
            &mut self.async_polled_sets
        }
    }

    pub(crate) fn async_sets(&self, synchronicity: Synchronicity) -> &[AsynchronousMetricSet] {
        if synchronicity == Synchronicity::AsyncEvent {
            &self.async_event_sets
        } else {
            &self.async_polled_sets
        }
    }
}

impl std::fmt::Debug for LocationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationMetrics")
            .field("location", &self.location)
            .field("has_metrics", &self.has_metrics)
            .field("values", &self.buffer.as_slice())
            .field("sync_sets", &self.sync_sets.len())
            .field("async_event_sets", &self.async_event_sets.len())
            .field("async_polled_sets", &self.async_polled_sets.len())
            .finish()
    }
}
