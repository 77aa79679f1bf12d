//! Reading event sets into a location's state and handing the values to a
//! writer.
//!
//! Reads and dispatch are separate steps: a read stores values in the
//! buffer (synchronous) or in the sets' pending pairs (asynchronous), and
//! dispatch may run any number of times against the same read.

use tracing::warn;

use crate::error::ReadError;
use crate::metric::registry::StrictRegistry;
use crate::metric::sets::{AsynchronousMetricSet, LocationMetrics, SynchronousMetricSet};
use crate::metric::buffer::ValueBuffer;
use crate::source::MetricSource;
use crate::types::SamplingSetHandle;
use crate::writer::MetricWriter;

fn report(sources: &[Box<dyn MetricSource>], source: usize, location: u32, error: &ReadError) {
    let name = sources
        .get(source)
        .map_or_else(|| "unknown".to_string(), |s| s.name());
    warn!(source = %name, location, error = %error, "metric read failed, values not updated");
}

/// Reads every strict event set into `[0, N)`. On failure the affected
/// slots keep their previous values.
pub(crate) fn read_strict(
    sources: &[Box<dyn MetricSource>],
    registry: &StrictRegistry,
    metrics: &mut LocationMetrics,
) {
    let location = metrics.location.id;
    for (index, slot) in metrics.strict_event_sets.iter_mut().enumerate() {
        let count = registry.count(index);
        let Some(event_set) = slot else { continue };
        if count == 0 {
            continue;
        }
        let values = metrics.buffer.slice_mut(registry.offset(index), count);
        if let Err(e) = event_set.read_strict(values) {
            report(sources, index, location, &e);
        }
    }
}

/// Reads every synchronous set into its buffer slots and update flags.
pub(crate) fn read_sync_sets(
    sources: &[Box<dyn MetricSource>],
    location: u32,
    sets: &mut [SynchronousMetricSet],
    buffer: &mut ValueBuffer,
    force_update: bool,
) {
    for set in sets {
        for member in &mut set.members {
            let range = member.range();
            let values = buffer.slice_mut(set.offset + range.start, range.len());
            let updated = &mut set.updated[range];
            if let Err(e) = member.event_set.read_sync(values, updated, force_update) {
                report(sources, member.source, location, &e);
                updated.fill(false);
            }
        }
    }
}

/// Replaces the pending pairs of every set with a fresh read.
pub(crate) fn read_async_sets(
    sources: &[Box<dyn MetricSource>],
    location: u32,
    sets: &mut [AsynchronousMetricSet],
    force_update: bool,
) {
    for set in sets {
        set.clear_pending();
        let mut pending = vec![Vec::new(); set.len()];
        for member in &mut set.members {
            let range = member.range();
            match member.event_set.read_async(force_update) {
                Ok(pairs) => {
                    for (slot, pairs) in pending[range].iter_mut().zip(pairs) {
                        *slot = pairs;
                    }
                }
                Err(e) => report(sources, member.source, location, &e),
            }
        }
        set.pending = Some(pending);
    }
}

pub(crate) fn write_strict<W: MetricWriter + ?Sized>(
    metrics: &LocationMetrics,
    strict: usize,
    sampling_set: SamplingSetHandle,
    timestamp: u64,
    writer: &mut W,
) {
    writer.write(
        &metrics.location,
        timestamp,
        sampling_set,
        metrics.buffer.slice(0, strict),
    );
}

/// Hands over every synchronous metric whose last read updated it.
pub(crate) fn write_sync_sets<W: MetricWriter + ?Sized>(
    metrics: &LocationMetrics,
    timestamp: u64,
    writer: &mut W,
) {
    for set in &metrics.sync_sets {
        for (index, (&sampling_set, &updated)) in set.sampling_sets.iter().zip(&set.updated).enumerate() {
            if updated {
                writer.write(
                    &metrics.location,
                    timestamp,
                    sampling_set,
                    metrics.buffer.slice(set.offset + index, 1),
                );
            }
        }
    }
}

/// Hands over every pending pair, recorded by the metric's shadow location
/// at the pair's own timestamp.
pub(crate) fn write_async_sets<W: MetricWriter + ?Sized>(sets: &[AsynchronousMetricSet], writer: &mut W) {
    for set in sets {
        let Some(pending) = &set.pending else { continue };
        for (index, pairs) in pending.iter().enumerate() {
            for pair in pairs {
                writer.write(
                    &set.shadow_locations[index],
                    pair.timestamp,
                    set.sampling_sets[index],
                    &[pair.value],
                );
            }
        }
    }
}
