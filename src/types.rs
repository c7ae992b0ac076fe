//! Core domain types for modhost
//!
//! Module paths, capability tags, registry statuses and action names are all
//! proper Rust types here so that stringly-typed values never travel past the
//! parsing boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Separator between category and module name in a module path.
pub const PATH_SEPARATOR: char = '/';

/// Reserved token standing in for `/` in registry file names.
///
/// Path segments may not contain this token nor start or end with `_`, so
/// the encoding is reversible.
pub const ENCODED_SEPARATOR: &str = "__";

/// Errors raised when parsing a module path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModulePathError {
    #[error("module path '{0}' must have the form category/name")]
    WrongShape(String),

    #[error("module path '{path}' has an empty or reserved segment '{segment}'")]
    BadSegment { path: String, segment: String },

    #[error("module path '{path}' contains invalid character '{ch}'")]
    InvalidCharacter { path: String, ch: char },

    #[error("module path segment in '{0}' contains the reserved token '__' or starts/ends with '_'")]
    ReservedToken(String),
}

impl From<ModulePathError> for crate::error::ModhostError {
    fn from(err: ModulePathError) -> Self {
        crate::error::ModhostError::ModulePath(err.to_string())
    }
}

/// Unique identifier of a module: `category/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModulePath {
    category: String,
    name: String,
}

impl ModulePath {
    /// Build a module path from its two segments.
    pub fn new(category: &str, name: &str) -> Result<Self, ModulePathError> {
        let joined = format!("{}{}{}", category, PATH_SEPARATOR, name);
        for segment in [category, name] {
            validate_segment(&joined, segment)?;
        }
        Ok(Self {
            category: category.to_string(),
            name: name.to_string(),
        })
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem-safe encoding used for registry record names.
    ///
    /// `iot/broker` becomes `iot__broker`.
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.category, ENCODED_SEPARATOR, self.name)
    }

    /// Reverse of [`ModulePath::encode`].
    pub fn decode(encoded: &str) -> Result<Self, ModulePathError> {
        let (category, name) = encoded
            .split_once(ENCODED_SEPARATOR)
            .ok_or_else(|| ModulePathError::WrongShape(encoded.to_string()))?;
        Self::new(category, name)
    }
}

fn validate_segment(path: &str, segment: &str) -> Result<(), ModulePathError> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(ModulePathError::BadSegment {
            path: path.to_string(),
            segment: segment.to_string(),
        });
    }
    // A segment touching the boundary with `_` would make the encoding ambiguous
    if segment.contains(ENCODED_SEPARATOR) || segment.starts_with('_') || segment.ends_with('_') {
        return Err(ModulePathError::ReservedToken(path.to_string()));
    }
    if let Some(ch) = segment
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(ModulePathError::InvalidCharacter {
            path: path.to_string(),
            ch,
        });
    }
    Ok(())
}

impl FromStr for ModulePath {
    type Err = ModulePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_matches(PATH_SEPARATOR);
        let mut parts = s.split(PATH_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(category), Some(name), None) => Self::new(category, name),
            _ => Err(ModulePathError::WrongShape(s.to_string())),
        }
    }
}

impl TryFrom<String> for ModulePath {
    type Error = ModulePathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModulePath> for String {
    fn from(path: ModulePath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.category, PATH_SEPARATOR, self.name)
    }
}

/// Capability tags a manifest may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Capability {
    /// Runs a supervised background process
    HasService,
    /// Ships command line tools
    HasCliTools,
    /// Exposes an API
    HasApi,
    /// Owns configuration files
    HasConfig,
    /// Talks to GPIO, I2C or other hardware buses
    UsesHardware,
    /// Produces sensor readings
    ProducesSensorData,
    /// Integrates with an external system (e.g. MQTT, Home Assistant)
    HasIntegration,
}

/// Registry status of a module.
///
/// ```text
/// (absent) ──> Installed | Failed
/// Installed ──> Active (supervised process running)
/// any ──> Removed (record retained)
/// Removed ──> Installed | Failed (re-install)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModuleStatus {
    Installed,
    Active,
    Failed,
    Removed,
}

/// Rejected status change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid status transition for {path}: {} -> {to}", status_label(.from))]
pub struct StatusTransitionError {
    pub path: String,
    pub from: Option<ModuleStatus>,
    pub to: ModuleStatus,
}

fn status_label(status: &Option<ModuleStatus>) -> String {
    status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "absent".to_string())
}

impl ModuleStatus {
    /// Returns true if the module counts as installed for resolution and
    /// package aggregation. `Removed` and `Failed` do not.
    #[inline]
    pub const fn is_installed(self) -> bool {
        matches!(self, Self::Installed | Self::Active)
    }

    /// Returns true if `from -> to` is a legal lifecycle step.
    ///
    /// `from == None` means no record exists yet.
    pub const fn can_transition(from: Option<Self>, to: Self) -> bool {
        match (from, to) {
            (None, Self::Installed | Self::Failed) => true,
            (None, _) => false,
            (Some(Self::Installed | Self::Active), _) => true,
            (Some(Self::Failed), Self::Installed | Self::Failed | Self::Removed) => true,
            (Some(Self::Removed), Self::Installed | Self::Failed | Self::Removed) => true,
            (Some(Self::Failed | Self::Removed), Self::Active) => false,
        }
    }

    /// Validate a transition, producing a typed error on rejection.
    pub fn check_transition(
        path: &ModulePath,
        from: Option<Self>,
        to: Self,
    ) -> Result<(), StatusTransitionError> {
        if Self::can_transition(from, to) {
            Ok(())
        } else {
            Err(StatusTransitionError {
                path: path.to_string(),
                from,
                to,
            })
        }
    }
}

/// How a module came to be installed (registry provenance)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum InstallMethod {
    /// Part of an install of every discovered module
    All,
    /// Named explicitly on the command line
    Targeted,
    /// Pulled in as a dependency of a targeted module
    Dependency,
}

/// Actions every module entry point understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ModuleAction {
    Install,
    Uninstall,
    Status,
}

impl ModuleAction {
    /// Returns true if running this action changes the host.
    #[inline]
    pub const fn mutates_host(self) -> bool {
        matches!(self, Self::Install | Self::Uninstall)
    }
}
