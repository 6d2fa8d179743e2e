//! YAML settings file read at startup.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::{GucSource, Result, Settings};

/// Scalar as written in the file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    /// Integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// Anything else.
    Text(String),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Int(v) => write!(f, "{v}"),
            SettingValue::Bool(v) => write!(f, "{}", if *v { "on" } else { "off" }),
            SettingValue::Text(v) => f.write_str(v),
        }
    }
}

/// Contents of a settings file.
///
/// ```yaml
/// log_level: debug
/// settings:
///   default_sequence_access_method: seqlocal
///   snowflake.machine_id: 5
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsFile {
    /// Initial log level for the process.
    #[serde(default)]
    pub log_level: Option<String>,
    /// Directory for log files; logs go to stdout when absent.
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Buffer pool size in pages.
    #[serde(default)]
    pub shared_buffers: Option<usize>,
    /// Variable assignments.
    #[serde(default)]
    pub settings: BTreeMap<String, SettingValue>,
}

impl SettingsFile {
    /// Parse a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse file contents.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply every assignment with file privileges. Stops at the first
    /// rejected value.
    pub fn apply(&self, settings: &Settings) -> Result<()> {
        for (name, value) in &self.settings {
            settings.set(name, &value.to_string(), true, GucSource::File)?;
        }
        Ok(())
    }
}
