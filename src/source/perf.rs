//! Kernel perf events via `perf_event_open(2)`.
//!
//! Every event set opens one perf group per location: the first event is the
//! group leader, the others are attached to it, and the whole group is read
//! with a single `read(2)` in `PERF_FORMAT_GROUP` layout:
//!
//! ```text
//! u64 nr          number of events in the group
//! u64 values[nr]  counter values, in the order the events were opened
//! ```
//!
//! Only user-space activity is counted (kernel and hypervisor excluded).

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::{debug, warn};

use crate::config::{ConfigRegistry, ConfigVariable, split_list};
use crate::environment::Location;
use crate::error::{ConfigError, MetricError, ReadError};
use crate::source::{CONFIG_NAMESPACE, EventSet, MetricSource};
use crate::types::{
    MetricBase, MetricMode, MetricProperties, ProfilingType, Scope, SourceKind, Synchronicity,
    ValueType,
};

/// Maximum number of events per metric list.
pub const MAX_EVENTS: usize = 20;

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_TYPE_SOFTWARE: u32 = 1;
const PERF_TYPE_HW_CACHE: u32 = 3;
const PERF_TYPE_RAW: u32 = 4;

const PERF_FORMAT_GROUP: u64 = 1 << 3;

const FLAG_DISABLED: u64 = 1 << 0;
const FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
const FLAG_EXCLUDE_HV: u64 = 1 << 6;

const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
const PERF_IOC_FLAG_GROUP: libc::c_ulong = 1;

const ATTR_SIZE: u32 = 112;

/// `struct perf_event_attr`, `PERF_ATTR_SIZE_VER5` layout.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
#[allow(dead_code)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved: u16,
}

const HARDWARE_EVENTS: &[(&str, u64)] = &[
    ("cycles", 0),
    ("cpu-cycles", 0),
    ("instructions", 1),
    ("cache-references", 2),
    ("cache-misses", 3),
    ("branches", 4),
    ("branch-instructions", 4),
    ("branch-misses", 5),
    ("bus-cycles", 6),
    ("stalled-cycles-frontend", 7),
    ("idle-cycles-frontend", 7),
    ("stalled-cycles-backend", 8),
    ("idle-cycles-backend", 8),
    ("ref-cycles", 9),
];

const SOFTWARE_EVENTS: &[(&str, u64)] = &[
    ("cpu-clock", 0),
    ("task-clock", 1),
    ("page-faults", 2),
    ("faults", 2),
    ("context-switches", 3),
    ("cs", 3),
    ("cpu-migrations", 4),
    ("migrations", 4),
    ("minor-faults", 5),
    ("major-faults", 6),
    ("alignment-faults", 7),
    ("emulation-faults", 8),
];

const CACHES: [&str; 7] = [
    "L1-dcache-",
    "L1-icache-",
    "LLC-",
    "dTLB-",
    "iTLB-",
    "branch-",
    "node-",
];
const CACHE_OPS: [&str; 2] = ["load", "store"];
const CACHE_RESULTS: [&str; 2] = ["s", "-misses"];

/// Names of the generic events, including every cache event combination.
pub fn event_names() -> impl Iterator<Item = &'static str> {
    HARDWARE_EVENTS
        .iter()
        .chain(SOFTWARE_EVENTS)
        .map(|(name, _)| *name)
        .chain(CACHE_EVENT_NAMES.iter().copied())
}

const CACHE_EVENT_NAMES: [&str; 28] = [
    "L1-dcache-loads",
    "L1-dcache-load-misses",
    "L1-dcache-stores",
    "L1-dcache-store-misses",
    "L1-icache-loads",
    "L1-icache-load-misses",
    "L1-icache-stores",
    "L1-icache-store-misses",
    "LLC-loads",
    "LLC-load-misses",
    "LLC-stores",
    "LLC-store-misses",
    "dTLB-loads",
    "dTLB-load-misses",
    "dTLB-stores",
    "dTLB-store-misses",
    "iTLB-loads",
    "iTLB-load-misses",
    "iTLB-stores",
    "iTLB-store-misses",
    "branch-loads",
    "branch-load-misses",
    "branch-stores",
    "branch-store-misses",
    "node-loads",
    "node-load-misses",
    "node-stores",
    "node-store-misses",
];

/// Maps an event name to its perf `(type, config)`.
///
/// Besides the named events, `r<hex>` selects a raw event.
fn parse_event(name: &str) -> Option<(u32, u64)> {
    let lookup = |table: &[(&str, u64)]| {
        table
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, config)| *config)
    };
    if let Some(config) = lookup(HARDWARE_EVENTS) {
        return Some((PERF_TYPE_HARDWARE, config));
    }
    if let Some(config) = lookup(SOFTWARE_EVENTS) {
        return Some((PERF_TYPE_SOFTWARE, config));
    }

    for (cache, prefix) in CACHES.iter().enumerate() {
        for (op, action) in CACHE_OPS.iter().enumerate() {
            for (result, suffix) in CACHE_RESULTS.iter().enumerate() {
                let candidate = format!("{}{}{}", prefix, action, suffix);
                if candidate.eq_ignore_ascii_case(name) {
                    // id | op << 8 | result << 16
                    return Some((
                        PERF_TYPE_HW_CACHE,
                        cache as u64 | (op as u64) << 8 | (result as u64) << 16,
                    ));
                }
            }
        }
    }

    let hex = name.strip_prefix('r')?;
    u64::from_str_radix(hex, 16)
        .ok()
        .map(|config| (PERF_TYPE_RAW, config))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PerfEvent {
    name: String,
    type_: u32,
    config: u64,
}

fn parse_event_list(list: &[String]) -> Result<Vec<PerfEvent>, MetricError> {
    if list.len() > MAX_EVENTS {
        return Err(MetricError::TooManyMetrics {
            source: SourceKind::Perf,
            limit: MAX_EVENTS,
        });
    }
    list.iter()
        .map(|name| {
            let (type_, config) =
                parse_event(name).ok_or_else(|| MetricError::InvalidMetricName {
                    source: SourceKind::Perf,
                    name: name.clone(),
                })?;
            Ok(PerfEvent {
                name: name.clone(),
                type_,
                config,
            })
        })
        .collect()
}

fn perf_event_open(attr: &PerfEventAttr, group_fd: RawFd) -> std::io::Result<OwnedFd> {
    // SAFETY: attr points to a correctly sized perf_event_attr; pid 0 and
    // cpu -1 measure the calling thread on any CPU.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            0 as libc::pid_t,
            -1 as libc::c_int,
            group_fd as libc::c_int,
            0 as libc::c_ulong,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: the kernel returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

fn group_ioctl(fd: RawFd, request: u64) -> std::io::Result<()> {
    // SAFETY: fd is an open perf event descriptor.
    let ret = unsafe { libc::ioctl(fd, request as _, PERF_IOC_FLAG_GROUP) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Kernel perf event backend.
#[derive(Debug, Default)]
pub struct PerfSource {
    initialized: bool,
    strict: Vec<PerfEvent>,
    per_process: Vec<PerfEvent>,
}

impl PerfSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn open_group(events: &[PerfEvent]) -> Result<Option<Box<dyn EventSet>>, MetricError> {
        if events.is_empty() {
            return Ok(None);
        }
        let mut fds: Vec<OwnedFd> = Vec::with_capacity(events.len());
        for event in events {
            let mut attr = PerfEventAttr {
                type_: event.type_,
                size: ATTR_SIZE,
                config: event.config,
                read_format: PERF_FORMAT_GROUP,
                flags: FLAG_EXCLUDE_KERNEL | FLAG_EXCLUDE_HV,
                ..Default::default()
            };
            let group_fd = match fds.first() {
                Some(leader) => leader.as_raw_fd(),
                None => {
                    attr.flags |= FLAG_DISABLED;
                    -1
                }
            };
            let fd = perf_event_open(&attr, group_fd).map_err(|e| MetricError::EventSetCreation {
                source: SourceKind::Perf,
                message: format!("perf_event_open({}): {}", event.name, e),
            })?;
            fds.push(fd);
        }

        let leader = fds.remove(0);
        group_ioctl(leader.as_raw_fd(), PERF_EVENT_IOC_ENABLE).map_err(|e| {
            MetricError::EventSetCreation {
                source: SourceKind::Perf,
                message: format!("enabling perf group: {}", e),
            }
        })?;
        debug!(events = events.len(), "perf group opened");

        Ok(Some(Box::new(PerfEventSet {
            events: events.to_vec(),
            leader: File::from(leader),
            _members: fds,
            buffer: vec![0u8; (events.len() + 1) * 8],
        })))
    }
}

impl MetricSource for PerfSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Perf
    }

    fn register(&mut self, config: &mut ConfigRegistry) -> Result<(), ConfigError> {
        config.register(ConfigVariable::string(
            CONFIG_NAMESPACE,
            "perf",
            "",
            "Perf events recorded by every thread",
        ))?;
        config.register(ConfigVariable::string(
            CONFIG_NAMESPACE,
            "perf_per_process",
            "",
            "Perf events recorded once per process",
        ))?;
        config.register(ConfigVariable::string(
            CONFIG_NAMESPACE,
            "perf_sep",
            ",",
            "Separator of the perf event lists",
        ))
    }

    fn initialize_source(&mut self, config: &mut ConfigRegistry) -> Result<u32, MetricError> {
        if self.initialized {
            return Ok(self.strict.len() as u32);
        }
        let sep = config.get_string(CONFIG_NAMESPACE, "perf_sep")?;
        let strict = split_list(&config.get_string(CONFIG_NAMESPACE, "perf")?, &sep);
        let per_process = split_list(
            &config.get_string(CONFIG_NAMESPACE, "perf_per_process")?,
            &sep,
        );
        self.strict = parse_event_list(&strict)?;
        self.per_process = parse_event_list(&per_process)?;
        self.initialized = true;
        debug!(
            strict = self.strict.len(),
            per_process = self.per_process.len(),
            "perf source initialized"
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
        match (synchronicity, scope) {
            (Synchronicity::StrictlySync, Scope::PerThread) => Self::open_group(&self.strict),
            (Synchronicity::Sync, Scope::PerProcess) => Self::open_group(&self.per_process),
            _ => Ok(None),
        }
    }

    fn finalize_source(&mut self) {
        self.strict.clear();
        self.per_process.clear();
        self.initialized = false;
    }

    fn deregister(&mut self, config: &mut ConfigRegistry) {
        for name in ["perf", "perf_per_process", "perf_sep"] {
            config.unregister(CONFIG_NAMESPACE, name);
        }
    }
}

struct PerfEventSet {
    events: Vec<PerfEvent>,
    leader: File,
    // Kept open for the lifetime of the group.
    _members: Vec<OwnedFd>,
    buffer: Vec<u8>,
}

impl PerfEventSet {
    fn read_group(&mut self, values: &mut [u64]) -> Result<(), ReadError> {
        let n = self.leader.read(&mut self.buffer)?;
        let words: Vec<u64> = self.buffer[..n]
            .chunks_exact(8)
            .map(|c| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(c);
                u64::from_ne_bytes(bytes)
            })
            .collect();
        let nr = words.first().copied().unwrap_or(0) as usize;
        if nr < self.events.len() || words.len() < self.events.len() + 1 {
            return Err(ReadError::ShortRead {
                expected: self.events.len(),
                got: nr.min(words.len().saturating_sub(1)),
            });
        }
        for (slot, value) in values.iter_mut().zip(&words[1..]) {
            *slot = *value;
        }
        Ok(())
    }
}

impl Drop for PerfEventSet {
    fn drop(&mut self) {
        if let Err(e) = group_ioctl(self.leader.as_raw_fd(), PERF_EVENT_IOC_DISABLE) {
            warn!(error = %e, "failed to disable perf group");
        }
    }
}

impl EventSet for PerfEventSet {
    fn len(&self) -> usize {
        self.events.len()
    }

    fn properties(&self, index: usize) -> MetricProperties {
        let event = &self.events[index];
        MetricProperties {
            name: event.name.clone(),
            description: event.name.clone(),
            unit: "#".to_string(),
            source_kind: SourceKind::Perf,
            mode: MetricMode::AccumulatedStart,
            value_type: ValueType::Uint64,
            base: MetricBase::Decimal,
            exponent: 0,
            profiling_type: ProfilingType::Exclusive,
        }
    }

    fn read_strict(&mut self, values: &mut [u64]) -> Result<(), ReadError> {
        self.read_group(values)
    }

    fn read_sync(
        &mut self,
        values: &mut [u64],
        updated: &mut [bool],
        _force_update: bool,
    ) -> Result<(), ReadError> {
        self.read_group(values)?;
        updated.iter_mut().for_each(|u| *u = true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LocationHandle, LocationKind};

    #[test]
    fn test_attr_layout() {
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), ATTR_SIZE as usize);
    }

    #[test]
    fn test_parse_named_events() {
        assert_eq!(parse_event("cycles"), Some((PERF_TYPE_HARDWARE, 0)));
        assert_eq!(parse_event("CPU-CYCLES"), Some((PERF_TYPE_HARDWARE, 0)));
        assert_eq!(parse_event("ref-cycles"), Some((PERF_TYPE_HARDWARE, 9)));
        assert_eq!(parse_event("task-clock"), Some((PERF_TYPE_SOFTWARE, 1)));
        assert_eq!(parse_event("cs"), Some((PERF_TYPE_SOFTWARE, 3)));
    }

    #[test]
    fn test_parse_cache_and_raw_events() {
        assert_eq!(
            parse_event("L1-dcache-load-misses"),
            Some((PERF_TYPE_HW_CACHE, 1 << 16))
        );
        assert_eq!(
            parse_event("llc-stores"),
            Some((PERF_TYPE_HW_CACHE, 2 | 1 << 8))
        );
        assert_eq!(parse_event("r1a8"), Some((PERF_TYPE_RAW, 0x1a8)));
        assert_eq!(parse_event("bogus"), None);
        assert_eq!(parse_event("rzz"), None);
    }

    #[test]
    fn test_every_listed_name_parses() {
        for name in event_names() {
            assert!(parse_event(name).is_some(), "{}", name);
        }
    }

    #[test]
    fn test_event_limit() {
        let list: Vec<String> = (0..=MAX_EVENTS).map(|_| "cycles".to_string()).collect();
        let err = parse_event_list(&list).unwrap_err();
        assert!(matches!(err, MetricError::TooManyMetrics { limit: MAX_EVENTS, .. }));
    }

    #[test]
    fn test_unknown_event_is_fatal() {
        let mut config = ConfigRegistry::new();
        let mut source = PerfSource::new();
        source.register(&mut config).unwrap();
        config.set(CONFIG_NAMESPACE, "perf", "cycles,not-an-event");
        let err = source.initialize_source(&mut config).unwrap_err();
        assert!(matches!(err, MetricError::InvalidMetricName { ref name, .. } if name == "not-an-event"));
    }

    #[test]
    fn test_open_software_group() {
        let mut config = ConfigRegistry::new();
        let mut source = PerfSource::new();
        source.register(&mut config).unwrap();
        config.set(CONFIG_NAMESPACE, "perf", "task-clock,context-switches");
        assert_eq!(source.initialize_source(&mut config).unwrap(), 2);

        let location = Location::new(LocationHandle(0), 0, LocationKind::CpuThread);
        // perf may be unavailable in restricted environments
        match source.initialize_location(&location, Synchronicity::StrictlySync, Scope::PerThread) {
            Ok(Some(mut set)) => {
                assert_eq!(set.len(), 2);
                let mut values = [0u64; 2];
                set.read_strict(&mut values).unwrap();
            }
            Ok(None) => panic!("expected an event set"),
            Err(e) => assert!(matches!(e, MetricError::EventSetCreation { .. })),
        }
    }
}
