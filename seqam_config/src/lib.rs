//! Run-time settings registry.
//!
//! Variables are typed, carry the privilege needed to change them and may
//! have a check hook. Extensions define their own variables under a dotted
//! prefix; values assigned to such names before the extension is loaded are
//! kept as placeholders and applied on definition.
#![deny(missing_docs)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

pub mod file;

pub use file::{SettingValue, SettingsFile};

/// Name of the setting choosing the access method of new sequences.
pub const DEFAULT_SEQUENCE_ACCESS_METHOD: &str = "default_sequence_access_method";
/// Built-in default of [`DEFAULT_SEQUENCE_ACCESS_METHOD`].
pub const DEFAULT_SEQUENCE_ACCESS_METHOD_VALUE: &str = "seqlocal";
/// Identifiers are limited to this many bytes, terminator included.
pub const NAMEDATALEN: usize = 64;

/// Who may change a variable, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GucContext {
    /// Only at startup, from the settings file.
    Startup,
    /// Any time, by superusers.
    Superuser,
    /// Any time, by anyone.
    User,
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GucSource {
    /// Compiled-in default.
    Default,
    /// Settings file read at startup.
    File,
    /// `SET` in a session.
    Session,
    /// Validation only; soft failures become notices.
    Test,
}

/// Settings failures. Messages follow the server's wording.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unknown non-dotted name.
    #[error("unrecognized configuration parameter \"{0}\"")]
    Unrecognized(String),
    /// Role may not change the variable.
    #[error("permission denied to set parameter \"{0}\"")]
    PermissionDenied(String),
    /// Startup-only variable changed later.
    #[error("parameter \"{0}\" cannot be changed without restarting the server")]
    CantChangeNow(String),
    /// Value rejected by parsing or a check hook.
    #[error("invalid value for parameter \"{name}\": \"{value}\"{}", .detail.as_ref().map(|d| format!(" ({d})")).unwrap_or_default())]
    InvalidValue {
        /// Variable.
        name: String,
        /// Rejected value.
        value: String,
        /// Hook detail.
        detail: Option<String>,
    },
    /// Integer outside the variable's bounds.
    #[error("{value} is outside the valid range for parameter \"{name}\" ({min} .. {max})")]
    OutOfRange {
        /// Variable.
        name: String,
        /// Rejected value.
        value: i64,
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },
    /// Variable defined twice.
    #[error("attempt to redefine parameter \"{0}\"")]
    Redefined(String),
    /// Variable read with the wrong type.
    #[error("parameter \"{0}\" has a different type")]
    WrongType(String),
    /// Settings file unreadable.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Settings file malformed.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Result alias for settings operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Check hook for string variables. Returns an error detail on rejection.
pub type StringCheckHook =
    Arc<dyn Fn(&str, GucSource) -> std::result::Result<(), String> + Send + Sync>;

/// Shared read handle on an integer variable. Reads never take a lock.
#[derive(Debug, Clone)]
pub struct IntHandle(Arc<AtomicI64>);

impl IntHandle {
    /// Current value.
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

enum VarValue {
    Int {
        value: Arc<AtomicI64>,
        default: i64,
        min: i64,
        max: i64,
    },
    Str {
        value: String,
        default: String,
        check: Option<StringCheckHook>,
    },
}

struct Variable {
    short_desc: String,
    context: GucContext,
    value: VarValue,
}

/// Registry of settings.
pub struct Settings {
    vars: RwLock<BTreeMap<String, Variable>>,
    placeholders: RwLock<BTreeMap<String, String>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("vars", &self.vars.read().keys().collect::<Vec<_>>())
            .field("placeholders", &*self.placeholders.read())
            .finish()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

/// Basic validation of `default_sequence_access_method`, before any
/// catalog lookup.
pub fn check_sequence_am_name(value: &str) -> std::result::Result<(), String> {
    if value.is_empty() {
        return Err(format!("{DEFAULT_SEQUENCE_ACCESS_METHOD} cannot be empty."));
    }
    if value.len() >= NAMEDATALEN {
        return Err(format!(
            "{DEFAULT_SEQUENCE_ACCESS_METHOD} is too long (maximum {} characters).",
            NAMEDATALEN - 1
        ));
    }
    Ok(())
}

impl Settings {
    /// Registry with the built-in variables.
    pub fn new() -> Self {
        let settings = Self {
            vars: RwLock::new(BTreeMap::new()),
            placeholders: RwLock::new(BTreeMap::new()),
            started: AtomicBool::new(false),
        };
        settings.vars.write().insert(
            DEFAULT_SEQUENCE_ACCESS_METHOD.to_string(),
            Variable {
                short_desc: "Sets the default sequence access method for any new sequence."
                    .into(),
                context: GucContext::User,
                value: VarValue::Str {
                    value: DEFAULT_SEQUENCE_ACCESS_METHOD_VALUE.into(),
                    default: DEFAULT_SEQUENCE_ACCESS_METHOD_VALUE.into(),
                    check: Some(Arc::new(|v, _| check_sequence_am_name(v))),
                },
            },
        );
        settings
    }

    /// Refuse further changes to startup-only variables.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Replace the check hook of a string variable.
    pub fn set_check_hook(&self, name: &str, hook: StringCheckHook) -> Result<()> {
        let mut vars = self.vars.write();
        match vars.get_mut(name).map(|v| &mut v.value) {
            Some(VarValue::Str { check, .. }) => {
                *check = Some(hook);
                Ok(())
            }
            Some(_) => Err(ConfigError::WrongType(name.to_string())),
            None => Err(ConfigError::Unrecognized(name.to_string())),
        }
    }

    /// Define an extension integer variable and return a read handle. A
    /// placeholder value set earlier is applied if valid, and dropped with a
    /// warning otherwise.
    pub fn define_custom_int(
        &self,
        name: &str,
        short_desc: &str,
        default: i64,
        min: i64,
        max: i64,
        context: GucContext,
    ) -> Result<IntHandle> {
        let cell = Arc::new(AtomicI64::new(default));
        {
            let mut vars = self.vars.write();
            if vars.contains_key(name) {
                return Err(ConfigError::Redefined(name.to_string()));
            }
            vars.insert(
                name.to_string(),
                Variable {
                    short_desc: short_desc.to_string(),
                    context,
                    value: VarValue::Int {
                        value: Arc::clone(&cell),
                        default,
                        min,
                        max,
                    },
                },
            );
        }
        let pending = self.placeholders.write().remove(name);
        if let Some(value) = pending {
            if let Err(err) = self.assign(name, &value, GucSource::File) {
                tracing::warn!(%name, %value, %err, "ignoring invalid placeholder value");
            }
        }
        Ok(IntHandle(cell))
    }

    /// Change a variable on behalf of a role.
    pub fn set(&self, name: &str, value: &str, superuser: bool, source: GucSource) -> Result<()> {
        let context = match self.vars.read().get(name) {
            Some(var) => var.context,
            None if name.contains('.') => {
                self.placeholders
                    .write()
                    .insert(name.to_string(), value.to_string());
                return Ok(());
            }
            None => return Err(ConfigError::Unrecognized(name.to_string())),
        };
        match context {
            GucContext::Startup if self.started.load(Ordering::Acquire) => {
                return Err(ConfigError::CantChangeNow(name.to_string()))
            }
            GucContext::Superuser if !superuser && source == GucSource::Session => {
                return Err(ConfigError::PermissionDenied(name.to_string()))
            }
            _ => {}
        }
        self.assign(name, value, source)
    }

    fn assign(&self, name: &str, value: &str, source: GucSource) -> Result<()> {
        let invalid = |detail: Option<String>| ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
            detail,
        };
        // Hooks run without the registry lock held; they may consult other
        // state that reads settings.
        let hook = match self.vars.read().get(name).map(|v| &v.value) {
            Some(VarValue::Str { check, .. }) => check.clone(),
            Some(VarValue::Int { .. }) => None,
            None => return Err(ConfigError::Unrecognized(name.to_string())),
        };
        if let Some(hook) = hook {
            hook(value, source).map_err(|detail| invalid(Some(detail)))?;
        }

        let mut vars = self.vars.write();
        let var = vars
            .get_mut(name)
            .ok_or_else(|| ConfigError::Unrecognized(name.to_string()))?;
        match &mut var.value {
            VarValue::Int {
                value: cell,
                min,
                max,
                ..
            } => {
                let parsed: i64 = value.trim().parse().map_err(|_| invalid(None))?;
                if parsed < *min || parsed > *max {
                    return Err(ConfigError::OutOfRange {
                        name: name.to_string(),
                        value: parsed,
                        min: *min,
                        max: *max,
                    });
                }
                cell.store(parsed, Ordering::Relaxed);
            }
            VarValue::Str { value: current, .. } => *current = value.to_string(),
        }
        tracing::debug!(%name, %value, ?source, "setting changed");
        Ok(())
    }

    /// Restore the default of a variable.
    pub fn reset(&self, name: &str) -> Result<()> {
        let mut vars = self.vars.write();
        let var = vars
            .get_mut(name)
            .ok_or_else(|| ConfigError::Unrecognized(name.to_string()))?;
        match &mut var.value {
            VarValue::Int { value, default, .. } => value.store(*default, Ordering::Relaxed),
            VarValue::Str { value, default, .. } => *value = default.clone(),
        }
        Ok(())
    }

    /// Integer value.
    pub fn get_int(&self, name: &str) -> Result<i64> {
        match self.vars.read().get(name).map(|v| &v.value) {
            Some(VarValue::Int { value, .. }) => Ok(value.load(Ordering::Relaxed)),
            Some(_) => Err(ConfigError::WrongType(name.to_string())),
            None => Err(ConfigError::Unrecognized(name.to_string())),
        }
    }

    /// String value.
    pub fn get_string(&self, name: &str) -> Result<String> {
        match self.vars.read().get(name).map(|v| &v.value) {
            Some(VarValue::Str { value, .. }) => Ok(value.clone()),
            Some(_) => Err(ConfigError::WrongType(name.to_string())),
            None => Err(ConfigError::Unrecognized(name.to_string())),
        }
    }

    /// Value as shown by `SHOW`.
    pub fn show(&self, name: &str) -> Result<String> {
        if let Some(value) = self.placeholders.read().get(name) {
            return Ok(value.clone());
        }
        match self.vars.read().get(name).map(|v| &v.value) {
            Some(VarValue::Int { value, .. }) => Ok(value.load(Ordering::Relaxed).to_string()),
            Some(VarValue::Str { value, .. }) => Ok(value.clone()),
            None => Err(ConfigError::Unrecognized(name.to_string())),
        }
    }

    /// Name, value and description of every defined variable.
    pub fn describe(&self) -> Vec<(String, String, String)> {
        self.vars
            .read()
            .iter()
            .map(|(name, var)| {
                let value = match &var.value {
                    VarValue::Int { value, .. } => value.load(Ordering::Relaxed).to_string(),
                    VarValue::Str { value, .. } => value.clone(),
                };
                (name.clone(), value, var.short_desc.clone())
            })
            .collect()
    }
}
