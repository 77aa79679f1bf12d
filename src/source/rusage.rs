//! Resource usage counters from `getrusage(2)`.
//!
//! Two lists are configurable: `metric.rusage` selects strictly-synchronous
//! per-thread metrics, `metric.rusage_per_process` selects synchronous
//! per-process metrics recorded by the first location of the process.

use tracing::debug;

use crate::config::{ConfigRegistry, ConfigVariable, split_list};
use crate::environment::Location;
use crate::error::{ConfigError, MetricError, ReadError};
use crate::source::{CONFIG_NAMESPACE, EventSet, MetricSource, resolve_metric_list};
use crate::types::{
    MetricBase, MetricMode, MetricProperties, ProfilingType, Scope, SourceKind, Synchronicity,
    ValueType,
};

struct RusageMetric {
    name: &'static str,
    unit: &'static str,
    description: &'static str,
    mode: MetricMode,
    base: MetricBase,
    exponent: i64,
}

const fn metric(
    name: &'static str,
    unit: &'static str,
    description: &'static str,
    mode: MetricMode,
    base: MetricBase,
    exponent: i64,
) -> RusageMetric {
    RusageMetric {
        name,
        unit,
        description,
        mode,
        base,
        exponent,
    }
}

use MetricBase::{Binary, Decimal};
use MetricMode::{AbsoluteNext, AccumulatedStart};

/// Counter catalog, in the order `rusage_values` produces them.
const CATALOG: [RusageMetric; 16] = [
    metric("ru_utime", "s", "user CPU time used", AccumulatedStart, Decimal, -6),
    metric("ru_stime", "s", "system CPU time used", AccumulatedStart, Decimal, -6),
    metric("ru_maxrss", "Bytes", "maximum resident set size", AbsoluteNext, Binary, 10),
    metric("ru_ixrss", "Bytes", "integral shared memory size", AccumulatedStart, Binary, 10),
    metric("ru_idrss", "Bytes", "integral unshared data size", AccumulatedStart, Binary, 10),
    metric("ru_isrss", "Bytes", "integral unshared stack size", AccumulatedStart, Binary, 10),
    metric("ru_minflt", "#", "page reclaims (soft page faults)", AccumulatedStart, Decimal, 0),
    metric("ru_majflt", "#", "page faults (hard page faults)", AccumulatedStart, Decimal, 0),
    metric("ru_nswap", "#", "number of swaps", AccumulatedStart, Decimal, 0),
    metric("ru_inblock", "#", "block input operations", AccumulatedStart, Decimal, 0),
    metric("ru_oublock", "#", "block output operations", AccumulatedStart, Decimal, 0),
    metric("ru_msgsnd", "#", "IPC messages sent", AccumulatedStart, Decimal, 0),
    metric("ru_msgrcv", "#", "IPC messages received", AccumulatedStart, Decimal, 0),
    metric("ru_nsignals", "#", "signals received", AccumulatedStart, Decimal, 0),
    metric("ru_nvcsw", "#", "voluntary context switches", AccumulatedStart, Decimal, 0),
    metric("ru_nivcsw", "#", "involuntary context switches", AccumulatedStart, Decimal, 0),
];

const NAMES: [&str; 16] = [
    "ru_utime",
    "ru_stime",
    "ru_maxrss",
    "ru_ixrss",
    "ru_idrss",
    "ru_isrss",
    "ru_minflt",
    "ru_majflt",
    "ru_nswap",
    "ru_inblock",
    "ru_oublock",
    "ru_msgsnd",
    "ru_msgrcv",
    "ru_nsignals",
    "ru_nvcsw",
    "ru_nivcsw",
];

/// Names of all resource usage counters.
pub fn metric_names() -> &'static [&'static str] {
    &NAMES
}

#[cfg(target_os = "linux")]
const THREAD_SCOPE: libc::c_int = libc::RUSAGE_THREAD;
#[cfg(not(target_os = "linux"))]
const THREAD_SCOPE: libc::c_int = libc::RUSAGE_SELF;

const PROCESS_SCOPE: libc::c_int = libc::RUSAGE_SELF;

/// Converts a `rusage` record into catalog order.
///
/// Times are in microseconds; negative fields are clamped to zero.
fn rusage_values(ru: &libc::rusage) -> [u64; 16] {
    fn micros(tv: &libc::timeval) -> u64 {
        let sec = (tv.tv_sec as i64).max(0) as u64;
        let usec = (tv.tv_usec as i64).max(0) as u64;
        sec * 1_000_000 + usec
    }
    fn count(v: libc::c_long) -> u64 {
        (v as i64).max(0) as u64
    }
    [
        micros(&ru.ru_utime),
        micros(&ru.ru_stime),
        count(ru.ru_maxrss),
        count(ru.ru_ixrss),
        count(ru.ru_idrss),
        count(ru.ru_isrss),
        count(ru.ru_minflt),
        count(ru.ru_majflt),
        count(ru.ru_nswap),
        count(ru.ru_inblock),
        count(ru.ru_oublock),
        count(ru.ru_msgsnd),
        count(ru.ru_msgrcv),
        count(ru.ru_nsignals),
        count(ru.ru_nvcsw),
        count(ru.ru_nivcsw),
    ]
}

fn read_rusage(who: libc::c_int) -> Result<[u64; 16], ReadError> {
    // SAFETY: rusage is plain old data; getrusage fills it completely on success.
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrusage(who, &mut ru) };
    if ret != 0 {
        return Err(ReadError::Io(std::io::Error::last_os_error()));
    }
    Ok(rusage_values(&ru))
}

/// Resource usage backend.
#[derive(Debug, Default)]
pub struct RusageSource {
    initialized: bool,
    strict: Vec<usize>,
    per_process: Vec<usize>,
}

impl RusageSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn event_set(metrics: &[usize], who: libc::c_int) -> Option<Box<dyn EventSet>> {
        if metrics.is_empty() {
            return None;
        }
        Some(Box::new(RusageEventSet {
            metrics: metrics.to_vec(),
            who,
        }))
    }
}

impl MetricSource for RusageSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Rusage
    }

    fn register(&mut self, config: &mut ConfigRegistry) -> Result<(), ConfigError> {
        config.register(ConfigVariable::string(
            CONFIG_NAMESPACE,
            "rusage",
            "",
            "Resource usage metrics recorded by every thread, or 'all'",
        ))?;
        config.register(ConfigVariable::string(
            CONFIG_NAMESPACE,
            "rusage_per_process",
            "",
            "Resource usage metrics recorded once per process",
        ))?;
        config.register(ConfigVariable::string(
            CONFIG_NAMESPACE,
            "rusage_sep",
            ",",
            "Separator of the resource usage metric lists",
        ))
    }

    fn initialize_source(&mut self, config: &mut ConfigRegistry) -> Result<u32, MetricError> {
        if self.initialized {
            return Ok(self.strict.len() as u32);
        }
        let sep = config.get_string(CONFIG_NAMESPACE, "rusage_sep")?;
        let strict = split_list(&config.get_string(CONFIG_NAMESPACE, "rusage")?, &sep);
        let per_process = split_list(
            &config.get_string(CONFIG_NAMESPACE, "rusage_per_process")?,
            &sep,
        );

        self.strict = resolve_metric_list(SourceKind::Rusage, &strict, &NAMES)?;
        self.per_process = resolve_metric_list(SourceKind::Rusage, &per_process, &NAMES)?;
        self.initialized = true;

        debug!(
            strict = self.strict.len(),
            per_process = self.per_process.len(),
            "rusage source initialized"
        );
        Ok(self.strict.len() as u32)
    }

    fn initialize_location(
        &self,
        _location: &Location,
        synchronicity: Synchronicity,
        scope: Scope,
    ) -> Result<Option<Box<dyn EventSet>>, MetricError> {
        if !self.initialized {
            return Ok(None);
        }
        Ok(match (synchronicity, scope) {
            (Synchronicity::StrictlySync, Scope::PerThread) => {
                Self::event_set(&self.strict, THREAD_SCOPE)
            }
            (Synchronicity::Sync, Scope::PerProcess) => {
                Self::event_set(&self.per_process, PROCESS_SCOPE)
            }
            _ => None,
        })
    }

    fn finalize_source(&mut self) {
        self.strict.clear();
        self.per_process.clear();
        self.initialized = false;
    }

    fn deregister(&mut self, config: &mut ConfigRegistry) {
        for name in ["rusage", "rusage_per_process", "rusage_sep"] {
            config.unregister(CONFIG_NAMESPACE, name);
        }
    }
}

struct RusageEventSet {
    metrics: Vec<usize>,
    who: libc::c_int,
}

impl RusageEventSet {
    fn fill(&self, values: &mut [u64]) -> Result<(), ReadError> {
        if values.len() < self.metrics.len() {
            return Err(ReadError::ShortRead {
                expected: self.metrics.len(),
                got: values.len(),
            });
        }
        let all = read_rusage(self.who)?;
        for (slot, &index) in values.iter_mut().zip(&self.metrics) {
            *slot = all[index];
        }
        Ok(())
    }
}

impl EventSet for RusageEventSet {
    fn len(&self) -> usize {
        self.metrics.len()
    }

    fn properties(&self, index: usize) -> MetricProperties {
        let m = &CATALOG[self.metrics[index]];
        MetricProperties {
            name: m.name.to_string(),
            description: m.description.to_string(),
            unit: m.unit.to_string(),
            source_kind: SourceKind::Rusage,
            mode: m.mode,
            value_type: ValueType::Uint64,
            base: m.base,
            exponent: m.exponent,
            profiling_type: ProfilingType::Inclusive,
        }
    }

    fn read_strict(&mut self, values: &mut [u64]) -> Result<(), ReadError> {
        self.fill(values)
    }

    fn read_sync(
        &mut self,
        values: &mut [u64],
        updated: &mut [bool],
        _force_update: bool,
    ) -> Result<(), ReadError> {
        self.fill(values)?;
        updated.iter_mut().for_each(|u| *u = true);
        Ok(())
    }
}
