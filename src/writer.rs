//! Recorder interface that dispatched metric values are handed to.

use serde::Serialize;

use crate::environment::Location;
use crate::types::{LocationHandle, SamplingSetHandle};

/// Receives one sampling-set occurrence per call.
///
/// # Arguments
/// * `location` - Recorder location (a shadow location for asynchronous metrics)
/// * `timestamp` - Time of the sample
/// * `sampling_set` - Sampling set the values belong to
/// * `values` - One value per metric of the sampling set
pub trait MetricWriter {
    fn write(
        &mut self,
        location: &Location,
        timestamp: u64,
        sampling_set: SamplingSetHandle,
        values: &[u64],
    );
}

impl<F> MetricWriter for F
where
    F: FnMut(&Location, u64, SamplingSetHandle, &[u64]),
{
    fn write(
        &mut self,
        location: &Location,
        timestamp: u64,
        sampling_set: SamplingSetHandle,
        values: &[u64],
    ) {
        self(location, timestamp, sampling_set, values)
    }
}

/// One recorded sampling-set occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub location: LocationHandle,
    pub timestamp: u64,
    pub sampling_set: SamplingSetHandle,
    pub values: Vec<u64>,
}

/// Writer that keeps every sample in memory.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SampleRecorder {
    samples: Vec<Sample>,
}

impl SampleRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples recorded for the given sampling set.
    pub fn for_sampling_set(&self, sampling_set: SamplingSetHandle) -> impl Iterator<Item = &Sample> {
        self.samples
            .iter()
            .filter(move |s| s.sampling_set == sampling_set)
    }

    /// Moves all samples of `other` into this recorder.
    pub fn merge(&mut self, other: SampleRecorder) {
        self.samples.extend(other.samples);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl MetricWriter for SampleRecorder {
    fn write(
        &mut self,
        location: &Location,
        timestamp: u64,
        sampling_set: SamplingSetHandle,
        values: &[u64],
    ) {
        self.samples.push(Sample {
            location: location.handle,
            timestamp,
            sampling_set,
            values: values.to_vec(),
        });
    }
}
