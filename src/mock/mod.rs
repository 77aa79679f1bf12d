//! Test doubles for the runtime services and the metric backends.
//!
//! `MockEnvironment`, `MockSource` and `MockPlugin` let the whole lifecycle
//! run without hardware counters, kernel support or a multi-process runtime.
//! Pre-built configurations live in `scenarios`.

mod environment;
mod plugin;
mod scenarios;
mod source;

pub use environment::MockEnvironment;
pub use plugin::{ManualClock, MockPlugin};
pub use source::{MockMetric, MockSource, MockSourceHandle, ReadCall};
