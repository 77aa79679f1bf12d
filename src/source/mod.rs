//! Metric source contract and the compiled-in backends.
//!
//! A [`MetricSource`] is a backend (resource usage, kernel perf events,
//! plugins) that is asked once per location and (synchronicity, scope) pair
//! for an [`EventSet`]. The event set owns whatever the backend needs to read
//! its counters for that location and is dropped when it is freed.
//!
//! # Lifecycle
//!
//! ```text
//! register ─► initialize_source ─► initialize_location (per location, per pair)
//!                                        │
//!                                        ├─► read_strict / read_sync / read_async
//!                                        │
//!                     free_event_set / finalize_location
//!                                        │
//!                          finalize_source ─► deregister
//! ```

use std::sync::Arc;

use crate::config::ConfigRegistry;
use crate::environment::{Location, SyncContext};
use crate::error::{ConfigError, MetricError, ReadError};
use crate::types::{MetricProperties, Scope, SourceKind, Synchronicity, TimeValuePair};

#[cfg(all(target_os = "linux", feature = "perf"))]
pub mod perf;
pub mod plugins;
#[cfg(unix)]
pub mod rusage;

/// Namespace of every configuration variable registered by a source.
pub const CONFIG_NAMESPACE: &str = "metric";

/// Per-location handle of a backend for one (synchronicity, scope) pair.
pub trait EventSet: Send {
    /// Number of metrics in this set.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Properties of metric `index`; `index < len()`.
    fn properties(&self, index: usize) -> MetricProperties;

    fn name(&self, index: usize) -> String {
        self.properties(index).name
    }

    fn description(&self, index: usize) -> String {
        self.properties(index).description
    }

    fn unit(&self, index: usize) -> String {
        self.properties(index).unit
    }

    /// Reads every metric; all of `values` must be written.
    fn read_strict(&mut self, values: &mut [u64]) -> Result<(), ReadError> {
        let _ = values;
        Err(ReadError::Backend(
            "strictly-synchronous read not supported".to_string(),
        ))
    }

    /// Reads metrics that may skip a sample; `updated[i]` tells whether
    /// `values[i]` was written.
    fn read_sync(
        &mut self,
        values: &mut [u64],
        updated: &mut [bool],
        force_update: bool,
    ) -> Result<(), ReadError> {
        let _ = (values, updated, force_update);
        Err(ReadError::Backend("synchronous read not supported".to_string()))
    }

    /// Returns, per metric, the values gathered since the previous read.
    fn read_async(&mut self, force_update: bool) -> Result<Vec<Vec<TimeValuePair>>, ReadError> {
        let _ = force_update;
        Err(ReadError::Backend("asynchronous read not supported".to_string()))
    }
}

/// A metric backend.
pub trait MetricSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Name used in log messages.
    fn name(&self) -> String {
        self.kind().to_string()
    }

    /// Registers configuration variables.
    fn register(&mut self, config: &mut ConfigRegistry) -> Result<(), ConfigError>;

    /// Reads the configuration and returns the number of strictly-synchronous
    /// metrics. A second call before `finalize_source` returns the same count
    /// without doing anything.
    fn initialize_source(&mut self, config: &mut ConfigRegistry) -> Result<u32, MetricError>;

    /// Creates the event set of `location` for one (synchronicity, scope) pair.
    ///
    /// Returns `None` if the source has no metrics for that pair.
    fn initialize_location(
        &self,
        location: &Location,
        synchronicity: Synchronicity,
        scope: Scope,
    ) -> Result<Option<Box<dyn EventSet>>, MetricError>;

    fn synchronize(&self, context: &SyncContext) {
        let _ = context;
    }

    /// Releases an event set of a scoped pair.
    fn free_event_set(&self, event_set: Box<dyn EventSet>) {
        drop(event_set);
    }

    /// Releases the strictly-synchronous event set of a location.
    fn finalize_location(&self, event_set: Option<Box<dyn EventSet>>) {
        drop(event_set);
    }

    /// Releases backend-global state. Idempotent.
    fn finalize_source(&mut self);

    /// Removes the configuration variables registered by `register`.
    fn deregister(&mut self, config: &mut ConfigRegistry) {
        let _ = config;
    }
}

/// Returns the ordered list of compiled-in sources.
///
/// The plugin source is only included when a loader is given and the
/// `plugins` feature is enabled.
#[allow(unused_variables)]
pub fn default_sources(
    plugin_loader: Option<Arc<dyn plugins::PluginLoader>>,
) -> Vec<Box<dyn MetricSource>> {
    let mut sources: Vec<Box<dyn MetricSource>> = Vec::new();
    #[cfg(unix)]
    sources.push(Box::new(rusage::RusageSource::new()));
    #[cfg(all(target_os = "linux", feature = "perf"))]
    sources.push(Box::new(perf::PerfSource::new()));
    #[cfg(feature = "plugins")]
    if let Some(loader) = plugin_loader {
        sources.push(Box::new(plugins::PluginSource::new(loader)));
    }
    sources
}

/// Names of the metrics the compiled-in hardware and OS backends offer.
pub fn available_metric_names() -> Vec<(SourceKind, &'static str)> {
    let mut names = Vec::new();
    #[cfg(unix)]
    names.extend(
        rusage::metric_names()
            .iter()
            .map(|n| (SourceKind::Rusage, *n)),
    );
    #[cfg(all(target_os = "linux", feature = "perf"))]
    names.extend(perf::event_names().map(|n| (SourceKind::Perf, n)));
    names
}

/// Resolves a user metric list against a catalog of names.
///
/// Matching is case-insensitive; `all` selects the whole catalog; duplicates
/// are dropped. Returns catalog indices in request order.
pub(crate) fn resolve_metric_list(
    source: SourceKind,
    requested: &[String],
    catalog: &[&str],
) -> Result<Vec<usize>, MetricError> {
    let mut selected: Vec<usize> = Vec::new();
    for item in requested {
        if item.eq_ignore_ascii_case("all") {
            for index in 0..catalog.len() {
                if !selected.contains(&index) {
                    selected.push(index);
                }
            }
            continue;
        }
        let index = catalog
            .iter()
            .position(|name| name.eq_ignore_ascii_case(item))
            .ok_or_else(|| MetricError::InvalidMetricName {
                source,
                name: item.clone(),
            })?;
        if !selected.contains(&index) {
            selected.push(index);
        }
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &[&str] = &["a", "b", "c"];

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_metric_list() {
        let got = resolve_metric_list(SourceKind::Synthetic, &list(&["C", "a", "c"]), CATALOG).unwrap();
        assert_eq!(got, vec![2, 0]);

        let got = resolve_metric_list(SourceKind::Synthetic, &list(&["b", "ALL"]), CATALOG).unwrap();
        assert_eq!(got, vec![1, 0, 2]);
    }

    #[test]
    fn test_resolve_unknown_name() {
        let err = resolve_metric_list(SourceKind::Synthetic, &list(&["a", "zz"]), CATALOG).unwrap_err();
        assert!(matches!(err, MetricError::InvalidMetricName { ref name, .. } if name == "zz"));
    }

    #[cfg(unix)]
    #[test]
    fn test_default_sources_start_with_rusage() {
        let sources = default_sources(None);
        assert_eq!(sources[0].kind(), SourceKind::Rusage);
        assert!(sources.iter().all(|s| s.kind() != SourceKind::Plugin));
    }
}
