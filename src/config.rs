//! Orchestrator configuration.
//!
//! Loaded from a JSON file (default `/etc/modhost/modhost.json`, or the path in
//! `MODHOST_CONFIG`). A missing file means defaults; a file that exists but
//! does not parse is an error. Environment variables override the file, and
//! CLI flags override both (applied in `main`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::ModulePath;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/modhost/modhost.json";

/// Environment variable naming an alternative configuration file
pub const ENV_CONFIG: &str = "MODHOST_CONFIG";
/// Environment variable overriding `modules_root`
pub const ENV_MODULES_ROOT: &str = "MODHOST_MODULES_ROOT";
/// Environment variable overriding `registry_dir`
pub const ENV_REGISTRY_DIR: &str = "MODHOST_REGISTRY_DIR";

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Directory holding one subdirectory per category
    pub modules_root: PathBuf,
    /// Category directories scanned for modules, in discovery order
    pub categories: Vec<String>,
    /// Entry point every module exposes (`<entry_point> install|uninstall|status`)
    pub entry_point: String,
    /// Manifest file name inside a module directory
    pub manifest_file: String,
    /// Directory holding one registry record per module
    pub registry_dir: PathBuf,
    /// Per-module configuration lives in `<config_root>/<category>/<name>`
    pub config_root: PathBuf,
    /// Timeout for a single module action
    pub action_timeout_secs: u64,
    /// Timeout for a batched package-manager call
    pub package_timeout_secs: u64,
    /// Recorded as `installedBy` in registry entries
    pub installed_by: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            modules_root: PathBuf::from("/opt/modhost/modules"),
            categories: vec![
                "motion-detection".to_string(),
                "sensors".to_string(),
                "iot".to_string(),
                "system".to_string(),
                "security".to_string(),
            ],
            entry_point: "setup.sh".to_string(),
            manifest_file: "module.json".to_string(),
            registry_dir: PathBuf::from("/var/lib/modhost/registry"),
            config_root: PathBuf::from("/etc/modhost"),
            action_timeout_secs: 600,
            package_timeout_secs: 1800,
            installed_by: "modhost".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Resolve the effective configuration: explicit path, else
    /// `MODHOST_CONFIG`, else the default path (defaults if it does not
    /// exist), then apply environment overrides.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(ENV_CONFIG).map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(from_env) {
            // A path the operator named must exist
            Some(path) => Self::load_from_file(&path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load_from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `MODHOST_MODULES_ROOT` / `MODHOST_REGISTRY_DIR`
    pub fn apply_env_overrides(&mut self) {
        if let Some(root) = std::env::var_os(ENV_MODULES_ROOT) {
            self.modules_root = PathBuf::from(root);
        }
        if let Some(dir) = std::env::var_os(ENV_REGISTRY_DIR) {
            self.registry_dir = PathBuf::from(dir);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.categories.is_empty() {
            anyhow::bail!("At least one module category must be configured");
        }
        let mut seen = std::collections::HashSet::new();
        for category in &self.categories {
            if category.trim().is_empty() || category.contains('/') {
                anyhow::bail!("Invalid category name: {:?}", category);
            }
            if !seen.insert(category) {
                anyhow::bail!("Duplicate category: {}", category);
            }
        }

        for (label, dir) in [
            ("modules_root", &self.modules_root),
            ("registry_dir", &self.registry_dir),
            ("config_root", &self.config_root),
        ] {
            if !dir.is_absolute() {
                anyhow::bail!("{} must be an absolute path, got {:?}", label, dir);
            }
        }

        if self.entry_point.trim().is_empty() || self.entry_point.contains('/') {
            anyhow::bail!("entry_point must be a plain file name");
        }
        if self.action_timeout_secs == 0 || self.package_timeout_secs == 0 {
            anyhow::bail!("Timeouts must be greater than zero");
        }

        Ok(())
    }

    /// Directory holding a module's deployed configuration
    pub fn module_config_dir(&self, path: &ModulePath) -> PathBuf {
        self.config_root.join(path.category()).join(path.name())
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn package_timeout(&self) -> Duration {
        Duration::from_secs(self.package_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.categories.len(), 5);
        assert_eq!(config.entry_point, "setup.sh");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"modules_root": "/srv/modules", "action_timeout_secs": 30}}"#).unwrap();

        let config = OrchestratorConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.modules_root, PathBuf::from("/srv/modules"));
        assert_eq!(config.action_timeout(), Duration::from_secs(30));
        assert_eq!(config.registry_dir, OrchestratorConfig::default().registry_dir);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ nope").unwrap();
        assert!(OrchestratorConfig::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = OrchestratorConfig::default();
        config.categories.clear();
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.categories.push("iot".to_string());
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.registry_dir = PathBuf::from("relative/registry");
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.action_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_module_config_dir() {
        let config = OrchestratorConfig::default();
        let path: ModulePath = "sensors/climate".parse().unwrap();
        assert_eq!(
            config.module_config_dir(&path),
            PathBuf::from("/etc/modhost/sensors/climate")
        );
    }
}
