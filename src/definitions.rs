//! Definitions service: hands out metric and sampling-set handles.
//!
//! `InMemoryDefinitions` keeps every definition in memory so that the probe
//! can print or serialize them at the end of a run. Metric names, units and
//! descriptions are interned by their xxh3 hash since the same metric is
//! defined again for every location that records it.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

use crate::types::{
    LocationHandle, MetricHandle, MetricOccurrence, MetricProperties, SamplingSetClass,
    SamplingSetHandle, ScopeContainer,
};

/// Consumed definitions service.
pub trait Definitions: Send + Sync {
    fn define_metric(
        &self,
        properties: &MetricProperties,
        parent: Option<MetricHandle>,
    ) -> MetricHandle;

    fn define_sampling_set(
        &self,
        metrics: &[MetricHandle],
        occurrence: MetricOccurrence,
        class: SamplingSetClass,
    ) -> SamplingSetHandle;

    fn define_scoped_sampling_set(
        &self,
        base: SamplingSetHandle,
        recorder: LocationHandle,
        scope: ScopeContainer,
    ) -> SamplingSetHandle;
}

/// Maps a hash to the string it was computed from.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StringTable {
    strings: HashMap<u64, String>,
}

impl StringTable {
    pub fn intern(&mut self, s: &str) -> u64 {
        let hash = xxh3_64(s.as_bytes());
        self.strings.entry(hash).or_insert_with(|| s.to_string());
        hash
    }

    pub fn resolve(&self, hash: u64) -> Option<&str> {
        self.strings.get(&hash).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// A defined metric; string fields are hashes into the string table.
#[derive(Debug, Clone, Serialize)]
pub struct MetricDefinition {
    pub handle: MetricHandle,
    pub name: u64,
    pub description: u64,
    pub unit: u64,
    pub parent: Option<MetricHandle>,
    pub properties: MetricProperties,
}

#[derive(Debug, Clone, Serialize)]
pub enum SamplingSetDefinition {
    Plain {
        handle: SamplingSetHandle,
        metrics: Vec<MetricHandle>,
        occurrence: MetricOccurrence,
        class: SamplingSetClass,
    },
    Scoped {
        handle: SamplingSetHandle,
        base: SamplingSetHandle,
        recorder: LocationHandle,
        scope: ScopeContainer,
    },
}

impl SamplingSetDefinition {
    pub fn handle(&self) -> SamplingSetHandle {
        match self {
            SamplingSetDefinition::Plain { handle, .. } => *handle,
            SamplingSetDefinition::Scoped { handle, .. } => *handle,
        }
    }
}

/// Snapshot of everything defined so far.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DefinitionsSnapshot {
    pub strings: StringTable,
    pub metrics: Vec<MetricDefinition>,
    pub sampling_sets: Vec<SamplingSetDefinition>,
}

impl DefinitionsSnapshot {
    pub fn metric(&self, handle: MetricHandle) -> Option<&MetricDefinition> {
        self.metrics.get(handle.0 as usize)
    }

    pub fn metric_name(&self, handle: MetricHandle) -> Option<&str> {
        self.metric(handle)
            .and_then(|m| self.strings.resolve(m.name))
    }

    pub fn sampling_set(&self, handle: SamplingSetHandle) -> Option<&SamplingSetDefinition> {
        self.sampling_sets.get(handle.0 as usize)
    }

    /// Metrics of a sampling set, following scoped sets to their base.
    pub fn sampling_set_metrics(&self, handle: SamplingSetHandle) -> Option<&[MetricHandle]> {
        match self.sampling_set(handle)? {
            SamplingSetDefinition::Plain { metrics, .. } => Some(metrics),
            SamplingSetDefinition::Scoped { base, .. } => self.sampling_set_metrics(*base),
        }
    }
}

/// Thread-safe in-memory definitions service.
#[derive(Debug, Default)]
pub struct InMemoryDefinitions {
    inner: Mutex<DefinitionsSnapshot>,
}

impl InMemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DefinitionsSnapshot {
        self.with(|d| d.clone())
    }

    pub fn metric_count(&self) -> usize {
        self.with(|d| d.metrics.len())
    }

    pub fn sampling_set_count(&self) -> usize {
        self.with(|d| d.sampling_sets.len())
    }

    fn with<R>(&self, f: impl FnOnce(&mut DefinitionsSnapshot) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl Definitions for InMemoryDefinitions {
    fn define_metric(
        &self,
        properties: &MetricProperties,
        parent: Option<MetricHandle>,
    ) -> MetricHandle {
        self.with(|d| {
            let handle = MetricHandle(d.metrics.len() as u32);
            let name = d.strings.intern(&properties.name);
            let description = d.strings.intern(&properties.description);
            let unit = d.strings.intern(&properties.unit);
            d.metrics.push(MetricDefinition {
                handle,
                name,
                description,
                unit,
                parent,
                properties: properties.clone(),
            });
            handle
        })
    }

    fn define_sampling_set(
        &self,
        metrics: &[MetricHandle],
        occurrence: MetricOccurrence,
        class: SamplingSetClass,
    ) -> SamplingSetHandle {
        self.with(|d| {
            let handle = SamplingSetHandle(d.sampling_sets.len() as u32);
            d.sampling_sets.push(SamplingSetDefinition::Plain {
                handle,
                metrics: metrics.to_vec(),
                occurrence,
                class,
            });
            handle
        })
    }

    fn define_scoped_sampling_set(
        &self,
        base: SamplingSetHandle,
        recorder: LocationHandle,
        scope: ScopeContainer,
    ) -> SamplingSetHandle {
        self.with(|d| {
            let handle = SamplingSetHandle(d.sampling_sets.len() as u32);
            d.sampling_sets.push(SamplingSetDefinition::Scoped {
                handle,
                base,
                recorder,
                scope,
            });
            handle
        })
    }
}
