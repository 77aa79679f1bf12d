//! Metric plugins.
//!
//! Plugins are selected by name through `metric.plugins`; every selected
//! plugin gets its own variable `metric.<plugin-name>` listing the tokens it
//! should expand into metrics. How a name becomes a plugin instance is the
//! business of a [`PluginLoader`]; this crate ships [`StaticPluginLoader`],
//! which maps names to in-process factories.
//!
//! Synchronous and asynchronous plugin metrics are rate-limited by the
//! plugin's `delta_t`: a metric is queried only if more than `delta_t` clock
//! ticks passed since its previous query, unless the read is forced.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{ConfigRegistry, ConfigVariable, split_list};
use crate::environment::{Clock, Location, MonotonicClock, SyncContext};
use crate::error::{ConfigError, MetricError, ReadError};
use crate::source::{CONFIG_NAMESPACE, EventSet, MetricSource};
use crate::types::{
    MetricBase, MetricMode, MetricProperties, ProfilingType, Scope, SourceKind, Synchronicity,
    SynchronizationMode, TimeValuePair, ValueType,
};

/// Newest plugin interface version this crate understands.
pub const PLUGIN_INTERFACE_VERSION: u32 = 1;

/// Static description of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginInfo {
    pub plugin_version: u32,
    pub sync: Synchronicity,
    pub run_per: Scope,
    /// Minimal number of clock ticks between two queries of a metric.
    pub delta_t: u64,
}

/// One metric a plugin token expands into.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginMetricInfo {
    pub name: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub mode: MetricMode,
    pub value_type: ValueType,
    pub base: MetricBase,
    pub exponent: i64,
}

impl PluginMetricInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            unit: None,
            mode: MetricMode::AbsolutePoint,
            value_type: ValueType::Uint64,
            base: MetricBase::Decimal,
            exponent: 0,
        }
    }

    fn into_properties(self) -> MetricProperties {
        MetricProperties {
            name: self.name,
            description: self.description.unwrap_or_default(),
            unit: self.unit.unwrap_or_else(|| "#".to_string()),
            source_kind: SourceKind::Plugin,
            mode: self.mode,
            value_type: self.value_type,
            base: self.base,
            exponent: self.exponent,
            profiling_type: ProfilingType::Exclusive,
        }
    }
}

/// A metric plugin instance.
///
/// Plugins are shared by all locations and must synchronize internally.
pub trait MetricPlugin: Send + Sync {
    fn info(&self) -> PluginInfo;

    fn initialize(&self) -> Result<(), String>;

    /// Expands a user token into zero or more metrics.
    fn event_info(&self, token: &str) -> Vec<PluginMetricInfo>;

    /// Activates a metric for the calling location and returns its id.
    fn add_counter(&self, name: &str) -> Result<u32, String>;

    /// Value of a strictly-synchronous metric.
    fn current_value(&self, id: u32) -> u64 {
        let _ = id;
        0
    }

    /// Value of a synchronous metric, if there is a new one.
    fn optional_value(&self, id: u32) -> Option<u64> {
        let _ = id;
        None
    }

    /// Values of an asynchronous metric gathered since the previous call.
    fn all_values(&self, id: u32) -> Vec<TimeValuePair> {
        let _ = id;
        Vec::new()
    }

    fn synchronize(&self, is_responsible: bool, mode: SynchronizationMode) {
        let _ = (is_responsible, mode);
    }

    fn finalize(&self) {}
}

/// Turns a plugin name into a plugin instance.
pub trait PluginLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<Arc<dyn MetricPlugin>, String>;
}

type PluginFactory = Box<dyn Fn() -> Arc<dyn MetricPlugin> + Send + Sync>;

/// Loader backed by a table of in-process factories.
#[derive(Default)]
pub struct StaticPluginLoader {
    factories: HashMap<String, PluginFactory>,
}

impl StaticPluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn MetricPlugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl PluginLoader for StaticPluginLoader {
    fn load(&self, name: &str) -> Result<Arc<dyn MetricPlugin>, String> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| format!("no plugin named '{}'", name))
    }
}

struct LoadedPlugin {
    name: String,
    plugin: Arc<dyn MetricPlugin>,
    info: PluginInfo,
    events: Vec<MetricProperties>,
}

/// Plugin backend.
pub struct PluginSource {
    loader: Arc<dyn PluginLoader>,
    clock: Arc<dyn Clock>,
    plugins: [Vec<LoadedPlugin>; Synchronicity::COUNT],
    plugin_variables: Vec<String>,
    strict_count: u32,
    initialized: bool,
}

impl PluginSource {
    pub fn new(loader: Arc<dyn PluginLoader>) -> Self {
        Self::with_clock(loader, Arc::new(MonotonicClock::new()))
    }

    /// Uses `clock` for the `delta_t` checks.
    pub fn with_clock(loader: Arc<dyn PluginLoader>, clock: Arc<dyn Clock>) -> Self {
        Self {
            loader,
            clock,
            plugins: Default::default(),
            plugin_variables: Vec::new(),
            strict_count: 0,
            initialized: false,
        }
    }

    /// Names of the plugins that passed validation, per synchronicity.
    pub fn loaded_plugins(&self, synchronicity: Synchronicity) -> Vec<&str> {
        self.plugins[synchronicity.index()]
            .iter()
            .map(|p| p.name.as_str())
            .collect()
    }

    fn load_plugin(
        &mut self,
        name: &str,
        sep: &str,
        config: &mut ConfigRegistry,
    ) -> Result<Option<LoadedPlugin>, MetricError> {
        let plugin = match self.loader.load(name) {
            Ok(plugin) => plugin,
            Err(e) => {
                warn!(plugin = name, error = %e, "could not load metric plugin");
                return Ok(None);
            }
        };

        let info = plugin.info();
        if info.plugin_version > PLUGIN_INTERFACE_VERSION {
            warn!(
                plugin = name,
                version = info.plugin_version,
                supported = PLUGIN_INTERFACE_VERSION,
                "metric plugin is newer than the supported interface"
            );
        }
        if info.sync == Synchronicity::StrictlySync && info.run_per != Scope::PerThread {
            warn!(
                plugin = name,
                run_per = %info.run_per,
                "strictly-synchronous plugins have to be recorded per thread"
            );
            return Ok(None);
        }

        if !config.is_registered(CONFIG_NAMESPACE, name) {
            config.register(ConfigVariable::string(
                CONFIG_NAMESPACE,
                name,
                "",
                format!("Metrics of plugin {}", name),
            ))?;
            self.plugin_variables.push(name.to_string());
        }

        if let Err(e) = plugin.initialize() {
            warn!(plugin = name, error = %e, "metric plugin initialization failed");
            return Ok(None);
        }

        let mut events = Vec::new();
        for token in split_list(&config.get_string(CONFIG_NAMESPACE, name)?, sep) {
            let infos = plugin.event_info(&token);
            if infos.is_empty() {
                warn!(plugin = name, token = %token, "metric plugin returned no metric for token");
                continue;
            }
            events.extend(infos.into_iter().map(PluginMetricInfo::into_properties));
        }
        debug!(plugin = name, sync = %info.sync, events = events.len(), "metric plugin loaded");

        Ok(Some(LoadedPlugin {
            name: name.to_string(),
            plugin,
            info,
            events,
        }))
    }
}

impl MetricSource for PluginSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Plugin
    }

    fn register(&mut self, config: &mut ConfigRegistry) -> Result<(), ConfigError> {
        config.register(ConfigVariable::string(
            CONFIG_NAMESPACE,
            "plugins",
            "",
            "Metric plugins to load",
        ))?;
        config.register(ConfigVariable::string(
            CONFIG_NAMESPACE,
            "plugins_sep",
            ",",
            "Separator of the plugin and plugin metric lists",
        ))
    }

    fn initialize_source(&mut self, config: &mut ConfigRegistry) -> Result<u32, MetricError> {
        if self.initialized {
            return Ok(self.strict_count);
        }
        let sep = config.get_string(CONFIG_NAMESPACE, "plugins_sep")?;
        let mut names = split_list(&config.get_string(CONFIG_NAMESPACE, "plugins")?, &sep);
        let mut seen = Vec::with_capacity(names.len());
        names.retain(|n| {
            if seen.contains(n) {
                false
            } else {
                seen.push(n.clone());
                true
            }
        });

        for name in &names {
            if let Some(loaded) = self.load_plugin(name, &sep, config)? {
                if loaded.info.sync == Synchronicity::StrictlySync {
                    self.strict_count += loaded.events.len() as u32;
                }
                self.plugins[loaded.info.sync.index()].push(loaded);
            }
        }
        self.initialized = true;
        Ok(self.strict_count)
    }

    fn initialize_location(
        &self,
        location: &Location,
        synchronicity: Synchronicity,
        scope: Scope,
    ) -> Result<Option<Box<dyn EventSet>>, MetricError> {
        let mut metrics = Vec::new();
        for loaded in self.plugins[synchronicity.index()]
            .iter()
            .filter(|p| p.info.run_per == scope)
        {
            for properties in &loaded.events {
                let id = match loaded.plugin.add_counter(&properties.name) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(
                            plugin = %loaded.name,
                            metric = %properties.name,
                            location = location.id,
                            error = %e,
                            "could not add plugin metric"
                        );
                        // strict slots are declared up front and must stay in place
                        if synchronicity != Synchronicity::StrictlySync {
                            continue;
                        }
                        None
                    }
                };
                metrics.push(PluginMetric {
                    plugin: Arc::clone(&loaded.plugin),
                    id,
                    properties: properties.clone(),
                    delta_t: loaded.info.delta_t,
                    last_query: 0,
                });
            }
        }
        if metrics.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(PluginEventSet {
            metrics,
            clock: Arc::clone(&self.clock),
        })))
    }

    fn synchronize(&self, context: &SyncContext) {
        for loaded in self.plugins.iter().flatten() {
            if loaded.info.plugin_version == 0 || loaded.events.is_empty() {
                continue;
            }
            let is_responsible = match loaded.info.run_per {
                Scope::PerHost => context.is_process_master_on_node && context.location_id == 0,
                Scope::Once => context.rank == 0 && context.location_id == 0,
                Scope::PerThread | Scope::PerProcess => true,
            };
            loaded.plugin.synchronize(is_responsible, context.mode);
        }
    }

    fn finalize_source(&mut self) {
        for loaded in self.plugins.iter().flatten() {
            loaded.plugin.finalize();
        }
        for list in &mut self.plugins {
            list.clear();
        }
        self.strict_count = 0;
        self.initialized = false;
    }

    fn deregister(&mut self, config: &mut ConfigRegistry) {
        config.unregister(CONFIG_NAMESPACE, "plugins");
        config.unregister(CONFIG_NAMESPACE, "plugins_sep");
        for name in self.plugin_variables.drain(..) {
            config.unregister(CONFIG_NAMESPACE, &name);
        }
    }
}

struct PluginMetric {
    plugin: Arc<dyn MetricPlugin>,
    /// `None` if the plugin refused the counter; reads as 0.
    id: Option<u32>,
    properties: MetricProperties,
    delta_t: u64,
    last_query: u64,
}

impl PluginMetric {
    fn due(&mut self, now: u64, force_update: bool) -> bool {
        if force_update || now.saturating_sub(self.last_query) > self.delta_t {
            self.last_query = now;
            true
        } else {
            false
        }
    }
}

struct PluginEventSet {
    metrics: Vec<PluginMetric>,
    clock: Arc<dyn Clock>,
}

impl EventSet for PluginEventSet {
    fn len(&self) -> usize {
        self.metrics.len()
    }

    fn properties(&self, index: usize) -> MetricProperties {
        self.metrics[index].properties.clone()
    }

    fn read_strict(&mut self, values: &mut [u64]) -> Result<(), ReadError> {
        for (slot, metric) in values.iter_mut().zip(&self.metrics) {
            *slot = metric.id.map_or(0, |id| metric.plugin.current_value(id));
        }
        Ok(())
    }

    fn read_sync(
        &mut self,
        values: &mut [u64],
        updated: &mut [bool],
        force_update: bool,
    ) -> Result<(), ReadError> {
        let now = self.clock.ticks();
        for ((slot, flag), metric) in values.iter_mut().zip(updated.iter_mut()).zip(&mut self.metrics) {
            *flag = false;
            let Some(id) = metric.id else { continue };
            if metric.due(now, force_update) {
                if let Some(value) = metric.plugin.optional_value(id) {
                    *slot = value;
                    *flag = true;
                }
            }
        }
        Ok(())
    }

    fn read_async(&mut self, force_update: bool) -> Result<Vec<Vec<TimeValuePair>>, ReadError> {
        let now = self.clock.ticks();
        Ok(self
            .metrics
            .iter_mut()
            .map(|metric| {
                let id = metric.id;
                match id {
                    Some(id) if metric.due(now, force_update) => metric.plugin.all_values(id),
                    _ => Vec::new(),
                }
            })
            .collect())
    }
}
