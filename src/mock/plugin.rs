//! Scriptable metric plugin and a hand-driven clock.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::environment::Clock;
use crate::source::plugins::{MetricPlugin, PLUGIN_INTERFACE_VERSION, PluginInfo, PluginMetricInfo};
use crate::types::{Scope, Synchronicity, SynchronizationMode, TimeValuePair};

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, ticks: u64) {
        self.now.store(ticks, Ordering::Relaxed);
    }

    pub fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn ticks(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Plugin with a fixed catalog of tokens.
///
/// Metric `id` (its position in the catalog) always reads `100 + id`;
/// asynchronous reads return two pairs per query.
#[derive(Debug)]
pub struct MockPlugin {
    info: PluginInfo,
    events: Vec<(String, Vec<String>)>,
    fail_initialize: bool,
    rejected: Vec<String>,
    initialized: AtomicBool,
    value_queries: AtomicUsize,
    synchronize_calls: Mutex<Vec<(bool, SynchronizationMode)>>,
    finalize_calls: AtomicUsize,
}

impl MockPlugin {
    pub fn new(sync: Synchronicity, run_per: Scope) -> Self {
        Self {
            info: PluginInfo {
                plugin_version: PLUGIN_INTERFACE_VERSION,
                sync,
                run_per,
                delta_t: 0,
            },
            events: Vec::new(),
            fail_initialize: false,
            rejected: Vec::new(),
            initialized: AtomicBool::new(false),
            value_queries: AtomicUsize::new(0),
            synchronize_calls: Mutex::new(Vec::new()),
            finalize_calls: AtomicUsize::new(0),
        }
    }

    /// Adds a token expanding into `names`.
    pub fn with_event(mut self, token: &str, names: &[&str]) -> Self {
        self.events.push((
            token.to_string(),
            names.iter().map(|n| n.to_string()).collect(),
        ));
        self
    }

    pub fn with_delta_t(mut self, delta_t: u64) -> Self {
        self.info.delta_t = delta_t;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.info.plugin_version = version;
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// `add_counter(name)` fails.
    pub fn rejecting(mut self, name: &str) -> Self {
        self.rejected.push(name.to_string());
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    /// Number of `optional_value` calls.
    pub fn value_queries(&self) -> usize {
        self.value_queries.load(Ordering::Relaxed)
    }

    pub fn synchronize_calls(&self) -> Vec<(bool, SynchronizationMode)> {
        match self.synchronize_calls.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::Relaxed)
    }

    fn catalog(&self) -> impl Iterator<Item = &str> {
        self.events
            .iter()
            .flat_map(|(_, names)| names.iter().map(|n| n.as_str()))
    }
}

impl MetricPlugin for MockPlugin {
    fn info(&self) -> PluginInfo {
        self.info
    }

    fn initialize(&self) -> Result<(), String> {
        if self.fail_initialize {
            return Err("initialization refused".to_string());
        }
        self.initialized.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn event_info(&self, token: &str) -> Vec<PluginMetricInfo> {
        self.events
            .iter()
            .filter(|(t, _)| t == token)
            .flat_map(|(_, names)| names.iter().map(PluginMetricInfo::new))
            .collect()
    }

    fn add_counter(&self, name: &str) -> Result<u32, String> {
        if self.rejected.iter().any(|r| r == name) {
            return Err(format!("counter {} rejected", name));
        }
        self.catalog()
            .position(|n| n == name)
            .map(|p| p as u32)
            .ok_or_else(|| format!("unknown counter {}", name))
    }

    fn current_value(&self, id: u32) -> u64 {
        100 + u64::from(id)
    }

    fn optional_value(&self, id: u32) -> Option<u64> {
        self.value_queries.fetch_add(1, Ordering::Relaxed);
        Some(100 + u64::from(id))
    }

    fn all_values(&self, id: u32) -> Vec<TimeValuePair> {
        let value = 100 + u64::from(id);
        vec![
            TimeValuePair {
                timestamp: 1,
                value,
            },
            TimeValuePair {
                timestamp: 2,
                value: value + 1,
            },
        ]
    }

    fn synchronize(&self, is_responsible: bool, mode: SynchronizationMode) {
        let mut guard = match self.synchronize_calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((is_responsible, mode));
    }

    fn finalize(&self) {
        self.finalize_calls.fetch_add(1, Ordering::Relaxed);
    }
}
