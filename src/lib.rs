//! hpcmetric - metric acquisition core of a performance-measurement runtime.
//!
//! Collects values from hardware counters, OS resource usage and plugins for
//! every execution location of a process and hands them to a recorder:
//! - `metric` - lifecycle coordinator, strict registry, set builder, reads
//! - `source` - the backend contract and the compiled-in backends
//! - `environment`, `definitions`, `writer`, `config` - services the
//!   subsystem consumes
//! - `mock` - deterministic stand-ins for tests

pub mod config;
pub mod definitions;
pub mod environment;
pub mod error;
pub mod metric;
pub mod mock;
pub mod source;
pub mod types;
pub mod writer;

pub use error::MetricError;
pub use metric::{LocationMetrics, MetricManager};
