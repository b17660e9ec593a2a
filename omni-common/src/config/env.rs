//! Environment variable parsing with type safety.
//!
//! Variables carry the `OMNI_` prefix. Errors are collected rather than
//! returned so every bad variable is reported in one pass.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

use super::source::Sourced;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    vars: HashMap<String, String>,
    errors: Vec<EnvError>,
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvParser {
    /// Parser over the process environment.
    pub fn new() -> Self {
        Self::with_vars(std::env::vars())
    }

    /// Parser over an explicit set of variables.
    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            prefix: "OMNI_",
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn lookup(&self, name: &str) -> Option<(String, String)> {
        let var_name = self.var_name(name);
        self.vars.get(&var_name).cloned().map(|v| (var_name, v))
    }

    /// Optional string; empty values count as unset.
    pub fn get_opt_string(&mut self, name: &str) -> Option<Sourced<String>> {
        let (var, value) = self.lookup(name)?;
        if value.trim().is_empty() {
            return None;
        }
        Some(Sourced::from_env(value, var))
    }

    /// Optional path with `~` expanded.
    pub fn get_opt_path(&mut self, name: &str) -> Option<Sourced<PathBuf>> {
        self.get_opt_string(name).map(|s| Sourced {
            value: super::expand_path(&s.value),
            source: s.source,
        })
    }

    /// Path list separated by `;` (or the platform path separator).
    pub fn get_path_list(&mut self, name: &str) -> Option<Sourced<Vec<PathBuf>>> {
        let raw = self.get_opt_string(name)?;
        let value = split_list(&raw.value)
            .into_iter()
            .map(|p| super::expand_path(&p))
            .collect();
        Some(Sourced {
            value,
            source: raw.source,
        })
    }

    /// Plain string list separated by `,` or `;`.
    pub fn get_string_list(&mut self, name: &str) -> Option<Sourced<Vec<String>>> {
        let raw = self.get_opt_string(name)?;
        let value = raw
            .value
            .split([',', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        Some(Sourced {
            value,
            source: raw.source,
        })
    }

    /// Boolean with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let Some((var, value)) = self.lookup(name) else {
            return Sourced::default_value(default);
        };
        let parsed = match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                return Sourced::default_value(default);
            }
        };
        Sourced::from_env(parsed, var)
    }

    /// u16 with default and range validation.
    pub fn get_u16_range(&mut self, name: &str, default: u16, min: u16, max: u16) -> Sourced<u16> {
        let Some((var, value)) = self.lookup(name) else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<u16>() {
            Ok(n) if (min..=max).contains(&n) => Sourced::from_env(n, var),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                Sourced::default_value(default)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "unsigned 16-bit integer".to_string(),
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    let separator = if raw.contains(';') { ';' } else { ',' };
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
