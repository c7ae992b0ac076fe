//! Module Manifests
//!
//! Each module may ship a `module.json` next to its entry point declaring its
//! identity, dependencies, required system packages and capabilities. The
//! manifest is optional metadata: a module without one still installs, it
//! simply has no declared dependencies or packages.
//!
//! # Loading Rules
//!
//! - A missing manifest is valid and yields no metadata.
//! - An unreadable or unparseable manifest is treated as missing, plus a
//!   warning. One bad module never blocks discovery of the others.
//! - Missing required fields (`name`, `version`, `category`), a non-semver
//!   version, unknown capability tags and bad dependency paths are warnings,
//!   never fatal.
//!
//! # Manifest Format
//!
//! ```json
//! {
//!   "name": "temp",
//!   "version": "1.2.0",
//!   "category": "sensors",
//!   "dependencies": ["iot/broker"],
//!   "required_packages": ["python3-smbus", "mosquitto-clients"],
//!   "capabilities": ["has-service", "produces-sensor-data"],
//!   "service": "climate",
//!   "log_files": ["/var/log/climate.log"]
//! }
//! ```
//!
//! camelCase keys (`requiredPackages`, `logFiles`) are accepted as well.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Capability, ModulePath};

/// Errors that stop a manifest from being parsed at all
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// Invalid manifest format
    #[error("Invalid manifest format: {reason}")]
    InvalidFormat { reason: String },

    /// IO error reading manifest
    #[error("Failed to read manifest: {reason}")]
    IoError { reason: String },
}

impl From<std::io::Error> for ManifestError {
    fn from(err: std::io::Error) -> Self {
        ManifestError::IoError {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ManifestError {
    fn from(err: serde_json::Error) -> Self {
        ManifestError::InvalidFormat {
            reason: err.to_string(),
        }
    }
}

/// Non-fatal problems found while loading a manifest
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestWarning {
    #[error("{module}: manifest ignored: {reason}")]
    Unusable { module: String, reason: String },

    #[error("{module}: required field '{field}' is missing or empty")]
    MissingField { module: String, field: &'static str },

    #[error("{module}: version '{version}' is not a semantic version: {reason}")]
    InvalidVersion {
        module: String,
        version: String,
        reason: String,
    },

    #[error("{module}: declared category '{declared}' does not match directory category")]
    CategoryMismatch { module: String, declared: String },

    #[error("{module}: unknown capability tag '{tag}'")]
    UnknownCapability { module: String, tag: String },

    #[error("{module}: invalid dependency '{dependency}': {reason}")]
    InvalidDependency {
        module: String,
        dependency: String,
        reason: String,
    },

    #[error("{module}: module lists itself as a dependency")]
    SelfDependency { module: String },
}

/// Manifest as written on disk. Every field is optional so that required-field
/// checks become warnings instead of parse failures.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    category: Option<String>,
    description: Option<String>,
    dependencies: Vec<String>,
    #[serde(alias = "requiredPackages")]
    required_packages: Vec<String>,
    capabilities: Vec<String>,
    service: Option<String>,
    #[serde(alias = "logFiles")]
    log_files: Vec<PathBuf>,
}

/// Validated module metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleManifest {
    /// Module this manifest belongs to
    pub path: ModulePath,
    pub name: String,
    /// Semantic version string
    pub version: String,
    pub category: String,
    pub description: Option<String>,
    /// Module paths this module depends on, in declared order, without duplicates
    pub dependencies: Vec<ModulePath>,
    /// System packages that must be present before the install action runs
    pub required_packages: BTreeSet<String>,
    pub capabilities: BTreeSet<Capability>,
    /// Explicit supervisor unit name
    pub service: Option<String>,
    /// Files removed on purge
    pub log_files: Vec<PathBuf>,
}

impl ModuleManifest {
    /// Create a new manifest builder
    pub fn builder(path: ModulePath) -> ManifestBuilder {
        ManifestBuilder::new(path)
    }

    /// Parse a manifest for `path` from a JSON string.
    ///
    /// Returns the manifest together with any validation warnings. Only
    /// syntactically broken JSON is an error.
    pub fn from_json(
        path: &ModulePath,
        json: &str,
    ) -> Result<(Self, Vec<ManifestWarning>), ManifestError> {
        let raw: RawManifest = serde_json::from_str(json)?;
        Ok(Self::from_raw(path, raw))
    }

    /// Load a manifest from a JSON file
    pub fn from_file(
        path: &ModulePath,
        file: impl AsRef<Path>,
    ) -> Result<(Self, Vec<ManifestWarning>), ManifestError> {
        let content = std::fs::read_to_string(file)?;
        Self::from_json(path, &content)
    }

    fn from_raw(path: &ModulePath, raw: RawManifest) -> (Self, Vec<ManifestWarning>) {
        let module = path.to_string();
        let mut warnings = Vec::new();

        let mut required = |field: &'static str, value: Option<String>| -> String {
            match value.map(|v| v.trim().to_string()) {
                Some(v) if !v.is_empty() => v,
                _ => {
                    warnings.push(ManifestWarning::MissingField {
                        module: module.clone(),
                        field,
                    });
                    String::new()
                }
            }
        };
        let name = required("name", raw.name);
        let version = required("version", raw.version);
        let category = required("category", raw.category);

        if !version.is_empty() {
            if let Err(e) = semver::Version::parse(&version) {
                warnings.push(ManifestWarning::InvalidVersion {
                    module: module.clone(),
                    version: version.clone(),
                    reason: e.to_string(),
                });
            }
        }

        if !category.is_empty() && category != path.category() {
            warnings.push(ManifestWarning::CategoryMismatch {
                module: module.clone(),
                declared: category.clone(),
            });
        }

        let mut dependencies: Vec<ModulePath> = Vec::new();
        for dep in raw.dependencies {
            match dep.parse::<ModulePath>() {
                Ok(dep_path) if &dep_path == path => {
                    warnings.push(ManifestWarning::SelfDependency {
                        module: module.clone(),
                    });
                }
                Ok(dep_path) => {
                    if !dependencies.contains(&dep_path) {
                        dependencies.push(dep_path);
                    }
                }
                Err(e) => warnings.push(ManifestWarning::InvalidDependency {
                    module: module.clone(),
                    dependency: dep,
                    reason: e.to_string(),
                }),
            }
        }

        let mut capabilities = BTreeSet::new();
        for tag in raw.capabilities {
            match tag.parse::<Capability>() {
                Ok(cap) => {
                    capabilities.insert(cap);
                }
                Err(_) => warnings.push(ManifestWarning::UnknownCapability {
                    module: module.clone(),
                    tag,
                }),
            }
        }

        let required_packages = raw
            .required_packages
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let manifest = Self {
            path: path.clone(),
            name,
            version,
            category,
            description: raw.description,
            dependencies,
            required_packages,
            capabilities,
            service: raw.service.filter(|s| !s.trim().is_empty()),
            log_files: raw.log_files,
        };
        (manifest, warnings)
    }

    /// Returns true if the manifest declares the given capability
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Supervisor unit to probe, if the module runs a service.
    ///
    /// Defaults to the module name when `has-service` is declared without an
    /// explicit `service` field.
    pub fn service_name(&self) -> Option<String> {
        if !self.has_capability(Capability::HasService) {
            return None;
        }
        self.service
            .clone()
            .or_else(|| Some(self.path.name().to_string()))
    }
}

/// Outcome of trying to load a module's manifest
#[derive(Debug, Clone, Default)]
pub struct LoadedManifest {
    /// `None` if absent or unusable
    pub manifest: Option<ModuleManifest>,
    pub warnings: Vec<ManifestWarning>,
}

/// Load the manifest for `path` from `file`, degrading every failure to
/// "manifest absent" plus a warning.
pub fn load_manifest(path: &ModulePath, file: &Path) -> LoadedManifest {
    if !file.exists() {
        debug!("{}: no manifest at {}", path, file.display());
        return LoadedManifest::default();
    }

    match ModuleManifest::from_file(path, file) {
        Ok((manifest, warnings)) => {
            for w in &warnings {
                warn!("{}", w);
            }
            LoadedManifest {
                manifest: Some(manifest),
                warnings,
            }
        }
        Err(e) => {
            let warning = ManifestWarning::Unusable {
                module: path.to_string(),
                reason: e.to_string(),
            };
            warn!("{}", warning);
            LoadedManifest {
                manifest: None,
                warnings: vec![warning],
            }
        }
    }
}

/// Builder for creating ModuleManifest instances
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    manifest: ModuleManifest,
}

impl ManifestBuilder {
    /// Create a new builder with name and category taken from the path
    pub fn new(path: ModulePath) -> Self {
        Self {
            manifest: ModuleManifest {
                name: path.name().to_string(),
                category: path.category().to_string(),
                version: "1.0.0".to_string(),
                description: None,
                dependencies: Vec::new(),
                required_packages: BTreeSet::new(),
                capabilities: BTreeSet::new(),
                service: None,
                log_files: Vec::new(),
                path,
            },
        }
    }

    /// Set version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.manifest.version = version.into();
        self
    }

    /// Add a dependency
    pub fn depends_on(mut self, dep: ModulePath) -> Self {
        if !self.manifest.dependencies.contains(&dep) {
            self.manifest.dependencies.push(dep);
        }
        self
    }

    /// Add a required system package
    pub fn package(mut self, pkg: impl Into<String>) -> Self {
        self.manifest.required_packages.insert(pkg.into());
        self
    }

    /// Add a capability tag
    pub fn capability(mut self, cap: Capability) -> Self {
        self.manifest.capabilities.insert(cap);
        self
    }

    /// Set explicit supervisor unit name
    pub fn service(mut self, unit: impl Into<String>) -> Self {
        self.manifest.service = Some(unit.into());
        self
    }

    /// Add a log file removed on purge
    pub fn log_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.manifest.log_files.push(file.into());
        self
    }

    /// Build the manifest
    pub fn build(self) -> ModuleManifest {
        self.manifest
    }
}

impl From<ManifestError> for crate::error::ModhostError {
    fn from(err: ManifestError) -> Self {
        crate::error::ModhostError::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> ModulePath {
        s.parse().unwrap()
    }

    #[test]
    fn test_manifest_from_json_full() {
        let json = r#"{
            "name": "temp",
            "version": "1.2.0",
            "category": "sensors",
            "dependencies": ["iot/broker"],
            "required_packages": ["mosquitto-clients", "python3-smbus"],
            "capabilities": ["has-service", "produces-sensor-data"]
        }"#;

        let (manifest, warnings) = ModuleManifest::from_json(&path("sensors/temp"), json).unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
        assert_eq!(manifest.name, "temp");
        assert_eq!(manifest.dependencies, vec![path("iot/broker")]);
        assert_eq!(manifest.required_packages.len(), 2);
        assert!(manifest.has_capability(Capability::HasService));
        assert!(manifest.has_capability(Capability::ProducesSensorData));
    }

    #[test]
    fn test_manifest_accepts_camel_case_keys() {
        let json = r#"{
            "name": "mario",
            "version": "0.3.1",
            "category": "motion-detection",
            "requiredPackages": ["python3-rpi.gpio"],
            "logFiles": ["/var/log/motion.log"]
        }"#;

        let (manifest, warnings) =
            ModuleManifest::from_json(&path("motion-detection/mario"), json).unwrap();
        assert!(warnings.is_empty());
        assert!(manifest.required_packages.contains("python3-rpi.gpio"));
        assert_eq!(manifest.log_files, vec![PathBuf::from("/var/log/motion.log")]);
    }

    #[test]
    fn test_missing_required_fields_are_warnings() {
        let (manifest, warnings) =
            ModuleManifest::from_json(&path("iot/broker"), r#"{"dependencies": []}"#).unwrap();
        assert!(manifest.name.is_empty());
        let fields: Vec<&str> = warnings
            .iter()
            .filter_map(|w| match w {
                ManifestWarning::MissingField { field, .. } => Some(*field),
                _ => None,
            })
            .collect();
        assert_eq!(fields, vec!["name", "version", "category"]);
    }

    #[test]
    fn test_invalid_semver_is_warning() {
        let json = r#"{"name": "b", "version": "v1", "category": "iot"}"#;
        let (_, warnings) = ModuleManifest::from_json(&path("iot/b"), json).unwrap();
        assert!(matches!(
            warnings.as_slice(),
            [ManifestWarning::InvalidVersion { .. }]
        ));
    }

    #[test]
    fn test_unknown_capability_and_bad_dependency_are_skipped() {
        let json = r#"{
            "name": "b", "version": "1.0.0", "category": "iot",
            "dependencies": ["not-a-path", "iot/b", "system/base", "system/base"],
            "capabilities": ["has-api", "teleports"]
        }"#;
        let (manifest, warnings) = ModuleManifest::from_json(&path("iot/b"), json).unwrap();
        assert_eq!(manifest.dependencies, vec![path("system/base")]);
        assert_eq!(manifest.capabilities.len(), 1);
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ManifestWarning::InvalidDependency { .. })));
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ManifestWarning::SelfDependency { .. })));
        assert!(warnings.iter().any(
            |w| matches!(w, ManifestWarning::UnknownCapability { tag, .. } if tag == "teleports")
        ));
    }

    #[test]
    fn test_category_mismatch_warning() {
        let json = r#"{"name": "b", "version": "1.0.0", "category": "sensors"}"#;
        let (_, warnings) = ModuleManifest::from_json(&path("iot/b"), json).unwrap();
        assert!(matches!(
            warnings.as_slice(),
            [ManifestWarning::CategoryMismatch { .. }]
        ));
    }

    #[test]
    fn test_broken_json_is_error() {
        let result = ModuleManifest::from_json(&path("iot/b"), "{ not json");
        assert!(matches!(result, Err(ManifestError::InvalidFormat { .. })));
    }

    #[test]
    fn test_load_manifest_absent() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_manifest(&path("iot/b"), &dir.path().join("module.json"));
        assert!(loaded.manifest.is_none());
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn test_load_manifest_malformed_degrades_to_absent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("module.json");
        std::fs::write(&file, "[1, 2").unwrap();

        let loaded = load_manifest(&path("iot/b"), &file);
        assert!(loaded.manifest.is_none());
        assert!(matches!(
            loaded.warnings.as_slice(),
            [ManifestWarning::Unusable { .. }]
        ));
    }

    #[test]
    fn test_service_name_defaults_to_module_name() {
        let manifest = ModuleManifest::builder(path("iot/ha-mqtt"))
            .capability(Capability::HasService)
            .build();
        assert_eq!(manifest.service_name().as_deref(), Some("ha-mqtt"));

        let manifest = ModuleManifest::builder(path("sensors/climate"))
            .capability(Capability::HasService)
            .service("climate-monitor")
            .build();
        assert_eq!(manifest.service_name().as_deref(), Some("climate-monitor"));

        let manifest = ModuleManifest::builder(path("system/optimization")).build();
        assert!(manifest.service_name().is_none());
    }
}
