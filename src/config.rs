//! Configuration collaborator.
//!
//! Backend adapters resolve their connection parameters here when they are
//! not passed explicitly at construction time. The surface is deliberately
//! small: section/option lookup with string and integer accessors, backed by
//! a TOML file.
//!
//! ```toml
//! [metadata]
//! mongo_service_host = "mongo.example.org"
//! mongo_service_port = 27017
//! mongo_db = "didmeta"
//! mongo_collection = "dids"
//! ```

use crate::{Error, Result};
use std::path::Path;
use toml::{Table, Value};

/// Section/option configuration store.
///
/// Construction-time collaborator only: adapters read it once while
/// resolving connection parameters and never hold a reference afterward.
#[derive(Debug, Clone, Default)]
pub struct MetaConfig {
    table: Table,
}

impl MetaConfig {
    /// Creates an empty configuration (every lookup misses).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::Storage {
            operation: "read_config_file".to_string(),
            cause: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid TOML.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let table: Table = toml::from_str(contents).map_err(|e| Error::Storage {
            operation: "parse_config".to_string(),
            cause: e.to_string(),
        })?;
        Ok(Self { table })
    }

    /// Sets a single option, creating the section if needed.
    ///
    /// Primarily useful for tests and programmatic wiring.
    pub fn set(&mut self, section: &str, option: &str, value: impl Into<Value>) {
        let entry = self
            .table
            .entry(section.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if let Value::Table(t) = entry {
            t.insert(option.to_string(), value.into());
        }
    }

    fn raw(&self, section: &str, option: &str) -> Option<&Value> {
        self.table.get(section)?.as_table()?.get(option)
    }

    /// Returns true if the section/option pair exists.
    #[must_use]
    pub fn has_option(&self, section: &str, option: &str) -> bool {
        self.raw(section, option).is_some()
    }

    /// Returns the option as a string, if present.
    ///
    /// Integer, float and boolean values are stringified so callers that
    /// only care about the textual form do not need to match on the TOML
    /// type.
    #[must_use]
    pub fn get(&self, section: &str, option: &str) -> Option<String> {
        match self.raw(section, option)? {
            Value::String(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Boolean(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Returns the option as a string, falling back to `default` when absent.
    #[must_use]
    pub fn get_or(&self, section: &str, option: &str, default: &str) -> String {
        self.get(section, option)
            .unwrap_or_else(|| default.to_string())
    }

    /// Returns the option as an integer, if present.
    ///
    /// String values are parsed; anything else that is not an integer is an
    /// error rather than a silent miss.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the value exists but is not an integer.
    pub fn get_int(&self, section: &str, option: &str) -> Result<Option<i64>> {
        match self.raw(section, option) {
            None => Ok(None),
            Some(Value::Integer(i)) => Ok(Some(*i)),
            Some(Value::String(s)) => {
                s.parse::<i64>().map(Some).map_err(|e| Error::Config {
                    option: format!("{section}.{option}"),
                    cause: e.to_string(),
                })
            },
            Some(other) => Err(Error::Config {
                option: format!("{section}.{option}"),
                cause: format!("expected integer, found {}", other.type_str()),
            }),
        }
    }
}
