//! Configuration service consumed by the metric sources.
//!
//! Sources register namespaced variables during `register()` and read their
//! resolved values during `initialize_source()`. Raw values are stored by
//! environment-style key (`HPCMETRIC_<NAMESPACE>_<NAME>`) and only checked
//! against the variable's type when they are read, so a value supplied before
//! its variable is registered is still picked up.
//!
//! # Value sources
//!
//! ```text
//! process environment ──► load_env()        ─┐
//! key/value pairs     ──► load_pairs()      ─┤
//! JSON file           ──► load_json_file()  ─┼──► raw values ──► get_*()
//! explicit override   ──► set()             ─┘        ▲
//!                                                     │ fallback
//!                                         registered default value
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::error::ConfigError;

/// Prefix of every environment-style configuration key.
pub const ENV_PREFIX: &str = "HPCMETRIC";

/// Type of a configuration variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConfigType {
    String,
    Bool,
    Number,
}

impl ConfigType {
    fn describe(self) -> &'static str {
        match self {
            ConfigType::String => "a string",
            ConfigType::Bool => "a boolean",
            ConfigType::Number => "an unsigned number",
        }
    }
}

/// Resolved value of a configuration variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    String(String),
    Bool(bool),
    Number(u64),
}

/// A registered configuration variable.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigVariable {
    pub namespace: String,
    pub name: String,
    pub kind: ConfigType,
    /// Raw default, parsed like any other raw value.
    pub default: String,
    pub help: String,
}

impl ConfigVariable {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        kind: ConfigType,
        default: impl Into<String>,
        help: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind,
            default: default.into(),
            help: help.into(),
        }
    }

    /// Shorthand for a string variable.
    pub fn string(
        namespace: impl Into<String>,
        name: impl Into<String>,
        default: impl Into<String>,
        help: impl Into<String>,
    ) -> Self {
        Self::new(namespace, name, ConfigType::String, default, help)
    }

    /// Environment-style key of this variable.
    pub fn key(&self) -> String {
        env_key(&self.namespace, &self.name)
    }
}

/// Builds the environment-style key for a variable.
///
/// Upper-cases namespace and name and replaces `-` and `.` by `_`.
pub fn env_key(namespace: &str, name: &str) -> String {
    let mut key = String::with_capacity(ENV_PREFIX.len() + namespace.len() + name.len() + 2);
    key.push_str(ENV_PREFIX);
    for part in [namespace, name] {
        key.push('_');
        key.extend(part.chars().map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        }));
    }
    key
}

/// Splits a `namespace.name=value` assignment.
pub fn parse_assignment(s: &str) -> Result<(String, String, String), ConfigError> {
    let (lhs, value) = s
        .split_once('=')
        .ok_or_else(|| ConfigError::Parse(format!("expected namespace.name=value, got '{}'", s)))?;
    let (namespace, name) = lhs
        .trim()
        .split_once('.')
        .ok_or_else(|| ConfigError::Parse(format!("missing namespace in '{}'", lhs)))?;
    if namespace.is_empty() || name.is_empty() {
        return Err(ConfigError::Parse(format!("empty namespace or name in '{}'", lhs)));
    }
    Ok((namespace.to_string(), name.to_string(), value.to_string()))
}

/// Registry of configuration variables and their raw values.
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    variables: Vec<ConfigVariable>,
    raw: HashMap<String, String>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a variable. Fails if (namespace, name) is already taken.
    pub fn register(&mut self, variable: ConfigVariable) -> Result<(), ConfigError> {
        if self.find(&variable.namespace, &variable.name).is_some() {
            return Err(ConfigError::DuplicateVariable {
                namespace: variable.namespace,
                name: variable.name,
            });
        }
        self.variables.push(variable);
        Ok(())
    }

    /// Removes a variable. Raw values supplied for it are kept.
    pub fn unregister(&mut self, namespace: &str, name: &str) -> bool {
        let before = self.variables.len();
        self.variables
            .retain(|v| !(v.namespace == namespace && v.name == name));
        self.variables.len() != before
    }

    pub fn is_registered(&self, namespace: &str, name: &str) -> bool {
        self.find(namespace, name).is_some()
    }

    /// All registered variables in registration order.
    pub fn variables(&self) -> &[ConfigVariable] {
        &self.variables
    }

    /// Picks up every `HPCMETRIC_*` variable of the process environment.
    pub fn load_env(&mut self) {
        self.load_vars(std::env::vars());
    }

    fn load_vars(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        let prefix = format!("{}_", ENV_PREFIX);
        for (key, value) in vars {
            if key.starts_with(&prefix) {
                self.raw.insert(key, value);
            }
        }
    }

    /// Stores raw values for `(namespace, name, value)` triples.
    pub fn load_pairs<I, N, K, V>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (N, K, V)>,
        N: AsRef<str>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (namespace, name, value) in pairs {
            self.set(namespace.as_ref(), name.as_ref(), value);
        }
    }

    /// Loads a JSON object of the form `{ "<namespace>": { "<name>": value } }`.
    ///
    /// Values may be strings, booleans or numbers.
    pub fn load_json_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        self.load_json_str(&text)
    }

    /// Same as [`load_json_file`](Self::load_json_file) for in-memory text.
    pub fn load_json_str(&mut self, text: &str) -> Result<(), ConfigError> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        let namespaces = root
            .as_object()
            .ok_or_else(|| ConfigError::Parse("top level must be an object".to_string()))?;

        for (namespace, entries) in namespaces {
            let entries = entries.as_object().ok_or_else(|| {
                ConfigError::Parse(format!("namespace '{}' must be an object", namespace))
            })?;
            for (name, value) in entries {
                let raw = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    serde_json::Value::Number(n) => n.to_string(),
                    other => {
                        return Err(ConfigError::Parse(format!(
                            "{}.{}: unsupported value {}",
                            namespace, name, other
                        )));
                    }
                };
                self.set(namespace, name, raw);
            }
        }
        Ok(())
    }

    /// Overrides the raw value of a variable.
    pub fn set(&mut self, namespace: &str, name: &str, value: impl Into<String>) {
        self.raw.insert(env_key(namespace, name), value.into());
    }

    /// Resolves a variable to its typed value.
    pub fn get(&self, namespace: &str, name: &str) -> Result<ConfigValue, ConfigError> {
        let variable = self
            .find(namespace, name)
            .ok_or_else(|| ConfigError::UnknownVariable {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        let key = variable.key();
        let raw = self.raw.get(&key).unwrap_or(&variable.default);
        parse_value(variable.kind, &key, raw)
    }

    pub fn get_string(&self, namespace: &str, name: &str) -> Result<String, ConfigError> {
        match self.get(namespace, name)? {
            ConfigValue::String(s) => Ok(s),
            ConfigValue::Bool(b) => Ok(b.to_string()),
            ConfigValue::Number(n) => Ok(n.to_string()),
        }
    }

    pub fn get_bool(&self, namespace: &str, name: &str) -> Result<bool, ConfigError> {
        match self.get(namespace, name)? {
            ConfigValue::Bool(b) => Ok(b),
            other => Err(self.type_mismatch(namespace, name, other, ConfigType::Bool)),
        }
    }

    pub fn get_number(&self, namespace: &str, name: &str) -> Result<u64, ConfigError> {
        match self.get(namespace, name)? {
            ConfigValue::Number(n) => Ok(n),
            other => Err(self.type_mismatch(namespace, name, other, ConfigType::Number)),
        }
    }

    fn type_mismatch(
        &self,
        namespace: &str,
        name: &str,
        value: ConfigValue,
        expected: ConfigType,
    ) -> ConfigError {
        let value = match value {
            ConfigValue::String(s) => s,
            ConfigValue::Bool(b) => b.to_string(),
            ConfigValue::Number(n) => n.to_string(),
        };
        ConfigError::InvalidValue {
            key: env_key(namespace, name),
            value,
            expected: expected.describe(),
        }
    }

    fn find(&self, namespace: &str, name: &str) -> Option<&ConfigVariable> {
        self.variables
            .iter()
            .find(|v| v.namespace == namespace && v.name == name)
    }
}

fn parse_value(kind: ConfigType, key: &str, raw: &str) -> Result<ConfigValue, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        expected: kind.describe(),
    };
    match kind {
        ConfigType::String => Ok(ConfigValue::String(raw.to_string())),
        ConfigType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(ConfigValue::Bool(true)),
            "0" | "false" | "no" | "off" | "" => Ok(ConfigValue::Bool(false)),
            _ => Err(invalid()),
        },
        ConfigType::Number => raw
            .trim()
            .parse::<u64>()
            .map(ConfigValue::Number)
            .map_err(|_| invalid()),
    }
}

/// Splits a metric list on `separator`, trimming blanks and dropping empty items.
pub fn split_list(list: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        let item = list.trim();
        return if item.is_empty() {
            Vec::new()
        } else {
            vec![item.to_string()]
        };
    }
    list.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
