//! Core vocabulary shared by the metric sources and the metric manager.
//!
//! Handles (`MetricHandle`, `SamplingSetHandle`, ...) are opaque identifiers
//! handed out by the definitions service; the metric subsystem never looks
//! inside them.

use std::fmt;

use serde::Serialize;

/// When a metric produces its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Synchronicity {
    /// Recorded at every enter/exit event; every read must provide a value.
    StrictlySync,
    /// Recorded at enter/exit events, but a read may skip a value.
    Sync,
    /// Recorded at enter/exit events and at arbitrary points in time.
    AsyncEvent,
    /// Recorded at arbitrary points in time, collected post mortem.
    Async,
}

impl Synchronicity {
    pub const ALL: [Synchronicity; 4] = [
        Synchronicity::StrictlySync,
        Synchronicity::Sync,
        Synchronicity::AsyncEvent,
        Synchronicity::Async,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_async(self) -> bool {
        matches!(self, Synchronicity::AsyncEvent | Synchronicity::Async)
    }
}

impl fmt::Display for Synchronicity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Synchronicity::StrictlySync => "strictly-synchronous",
            Synchronicity::Sync => "synchronous",
            Synchronicity::AsyncEvent => "asynchronous-event",
            Synchronicity::Async => "asynchronous",
        };
        f.write_str(s)
    }
}

/// Granularity at which a metric is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Scope {
    PerThread,
    PerProcess,
    PerHost,
    Once,
}

impl Scope {
    pub const ALL: [Scope; 4] = [Scope::PerThread, Scope::PerProcess, Scope::PerHost, Scope::Once];

    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::PerThread => "per-thread",
            Scope::PerProcess => "per-process",
            Scope::PerHost => "per-host",
            Scope::Once => "once",
        };
        f.write_str(s)
    }
}

/// Checkpoints at which metric sources get a chance to synchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SynchronizationMode {
    /// Begin of measurement.
    Begin,
    /// Begin of measurement, after the multi-process runtime was initialized.
    BeginMpp,
    /// End of measurement.
    End,
}

/// Kind of an execution location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LocationKind {
    CpuThread,
    Gpu,
    /// Synthetic location that only carries asynchronous metric values.
    Metric,
}

/// Backend a metric comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SourceKind {
    Rusage,
    Perf,
    Plugin,
    Synthetic,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceKind::Rusage => "rusage",
            SourceKind::Perf => "perf",
            SourceKind::Plugin => "plugin",
            SourceKind::Synthetic => "synthetic",
        };
        f.write_str(s)
    }
}

/// How consecutive values of a metric relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricMode {
    AccumulatedStart,
    AccumulatedPoint,
    AccumulatedLast,
    AccumulatedNext,
    AbsolutePoint,
    AbsoluteLast,
    AbsoluteNext,
    RelativePoint,
    RelativeLast,
    RelativeNext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueType {
    Int64,
    Uint64,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricBase {
    Binary,
    Decimal,
}

/// Aggregation semantics of a metric in a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProfilingType {
    Exclusive,
    Inclusive,
    Simple,
    Min,
    Max,
}

/// Full description of one metric as reported by its event set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricProperties {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub source_kind: SourceKind,
    pub mode: MetricMode,
    pub value_type: ValueType,
    pub base: MetricBase,
    pub exponent: i64,
    pub profiling_type: ProfilingType,
}

impl MetricProperties {
    /// Properties of an accumulated unsigned counter, the most common shape.
    pub fn counter(source_kind: SourceKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            unit: "#".to_string(),
            source_kind,
            mode: MetricMode::AccumulatedStart,
            value_type: ValueType::Uint64,
            base: MetricBase::Decimal,
            exponent: 0,
            profiling_type: ProfilingType::Exclusive,
        }
    }
}

/// One value of an asynchronous metric together with the time it was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeValuePair {
    pub timestamp: u64,
    pub value: u64,
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

handle_type!(
    /// Definition handle of a metric.
    MetricHandle
);
handle_type!(
    /// Definition handle of a (possibly scoped) sampling set.
    SamplingSetHandle
);
handle_type!(
    /// Global handle of a location.
    LocationHandle
);
handle_type!(
    /// Handle of a location group (a process).
    LocationGroupHandle
);
handle_type!(
    /// Handle of a system-tree node (a shared-memory domain or the root).
    SystemTreeNodeHandle
);

/// Occurrence class of a sampling set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricOccurrence {
    SynchronousStrict,
    Synchronous,
    Asynchronous,
}

/// Domain class of a sampling set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SamplingSetClass {
    /// Values belong to the recording CPU location.
    Cpu,
    /// Values belong to a container named by a scoped sampling set.
    Abstract,
}

/// Recording scope of a scoped sampling set together with its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScopeContainer {
    Location(LocationHandle),
    LocationGroup(LocationGroupHandle),
    SystemTreeNode(SystemTreeNodeHandle),
}
