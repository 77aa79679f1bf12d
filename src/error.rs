//! Error types of the metric subsystem.
//!
//! `MetricError` is fatal: it is propagated out of registration and
//! initialization and the caller is expected to stop before measurement
//! starts. `ReadError` is non-fatal: the read engine logs it and treats the
//! affected metrics as not updated for that sample.

use crate::types::{Scope, SourceKind};

/// Error of the configuration service.
#[derive(Debug)]
pub enum ConfigError {
    /// A variable with the same namespace and name is already registered.
    DuplicateVariable { namespace: String, name: String },
    /// The variable was never registered.
    UnknownVariable { namespace: String, name: String },
    /// The raw value does not match the registered type.
    InvalidValue { key: String, value: String, expected: &'static str },
    /// I/O error reading a configuration file.
    Io(std::io::Error),
    /// Malformed configuration file.
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::DuplicateVariable { namespace, name } => {
                write!(f, "configuration variable {}.{} registered twice", namespace, name)
            }
            ConfigError::UnknownVariable { namespace, name } => {
                write!(f, "unknown configuration variable {}.{}", namespace, name)
            }
            ConfigError::InvalidValue {
                key,
                value,
                expected,
            } => write!(f, "invalid value '{}' for {}: expected {}", value, key, expected),
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(msg) => write!(f, "parse error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Fatal error raised while registering or initializing metric sources.
#[derive(Debug)]
pub enum MetricError {
    /// More strictly-synchronous metrics than a sampling set can hold.
    TooManyStrictMetrics { count: usize },
    /// A requested metric name is unknown to its backend.
    InvalidMetricName { source: SourceKind, name: String },
    /// A backend was asked for more metrics than it supports at once.
    TooManyMetrics { source: SourceKind, limit: usize },
    /// A backend failed to create an event set.
    EventSetCreation { source: SourceKind, message: String },
    /// The environment cannot name the container of a scoped sampling set.
    MissingScopeContainer { scope: Scope },
    /// An operation needs `initialize()` to have run first.
    NotInitialized,
    Config(ConfigError),
}

impl std::fmt::Display for MetricError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricError::TooManyStrictMetrics { count } => write!(
                f,
                "{} strictly-synchronous metrics requested, at most {} are supported",
                count,
                crate::metric::MAX_STRICTLY_SYNCHRONOUS_METRICS
            ),
            MetricError::InvalidMetricName { source, name } => {
                write!(f, "{}: invalid metric name '{}'", source, name)
            }
            MetricError::TooManyMetrics { source, limit } => {
                write!(f, "{}: at most {} metrics per list are supported", source, limit)
            }
            MetricError::EventSetCreation { source, message } => {
                write!(f, "{}: cannot create event set: {}", source, message)
            }
            MetricError::MissingScopeContainer { scope } => {
                write!(f, "no container available for {} metrics", scope)
            }
            MetricError::NotInitialized => write!(f, "metric sources are not initialized"),
            MetricError::Config(e) => write!(f, "configuration error: {}", e),
        }
    }
}

impl std::error::Error for MetricError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MetricError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for MetricError {
    fn from(e: ConfigError) -> Self {
        MetricError::Config(e)
    }
}

/// Non-fatal failure of a single event-set read.
#[derive(Debug)]
pub enum ReadError {
    /// The underlying system call failed.
    Io(std::io::Error),
    /// The backend returned fewer values than the event set holds.
    ShortRead { expected: usize, got: usize },
    /// Backend-specific failure.
    Backend(String),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Io(e) => write!(f, "I/O error: {}", e),
            ReadError::ShortRead { expected, got } => {
                write!(f, "short read: expected {} values, got {}", expected, got)
            }
            ReadError::Backend(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ReadError {}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        ReadError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_display_names_source_and_metric() {
        let err = MetricError::InvalidMetricName {
            source: SourceKind::Rusage,
            name: "ru_bogus".to_string(),
        };
        assert_eq!(err.to_string(), "rusage: invalid metric name 'ru_bogus'");

        let err = MetricError::TooManyStrictMetrics { count: 300 };
        assert!(err.to_string().contains("300"));
        assert!(err.to_string().contains("255"));
    }

    #[test]
    fn test_config_error_is_source() {
        let err: MetricError = ConfigError::Parse("bad".to_string()).into();
        assert!(matches!(err, MetricError::Config(_)));
        assert!(err.source().is_some());
    }
}
