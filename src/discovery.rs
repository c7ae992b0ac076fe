//! Module discovery
//!
//! Walks `<modules_root>/<category>/<name>` for every configured category and
//! keeps each directory that exposes an executable entry point. The manifest
//! is loaded when present but is never a discovery gate.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::manifest::{load_manifest, ManifestWarning, ModuleManifest};
use crate::types::ModulePath;

/// Discovered module information
#[derive(Debug, Clone)]
pub struct DiscoveredModule {
    pub path: ModulePath,
    /// Module source directory
    pub directory: PathBuf,
    /// Executable install/uninstall/status entry point
    pub entry_point: PathBuf,
    /// Parsed manifest, if present and usable
    pub manifest: Option<ModuleManifest>,
    /// Problems found while loading the manifest
    pub warnings: Vec<ManifestWarning>,
}

impl DiscoveredModule {
    /// Declared dependencies (empty without a manifest)
    pub fn dependencies(&self) -> &[ModulePath] {
        self.manifest
            .as_ref()
            .map(|m| m.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Declared system packages (empty without a manifest)
    pub fn required_packages(&self) -> impl Iterator<Item = &String> {
        self.manifest
            .iter()
            .flat_map(|m| m.required_packages.iter())
    }

    /// Version from the manifest, if any
    pub fn version(&self) -> Option<&str> {
        self.manifest
            .as_ref()
            .map(|m| m.version.as_str())
            .filter(|v| !v.is_empty())
    }
}

/// Ordered result of one discovery pass
#[derive(Debug, Clone, Default)]
pub struct DiscoverySet {
    modules: Vec<DiscoveredModule>,
}

impl DiscoverySet {
    /// Build a set from already-discovered modules, keeping their order.
    /// Later duplicates of the same path are dropped.
    pub fn from_modules(modules: Vec<DiscoveredModule>) -> Self {
        let mut seen = HashSet::new();
        let modules = modules
            .into_iter()
            .filter(|m| seen.insert(m.path.clone()))
            .collect();
        Self { modules }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules in discovery order
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredModule> {
        self.modules.iter()
    }

    pub fn get(&self, path: &ModulePath) -> Option<&DiscoveredModule> {
        self.modules.iter().find(|m| &m.path == path)
    }

    pub fn contains(&self, path: &ModulePath) -> bool {
        self.get(path).is_some()
    }

    /// Module paths in discovery order
    pub fn paths(&self) -> Vec<ModulePath> {
        self.modules.iter().map(|m| m.path.clone()).collect()
    }

    /// Targets plus everything they transitively depend on, restricted to
    /// modules present in this set and returned in discovery order.
    pub fn closure(&self, targets: &[ModulePath]) -> DiscoverySet {
        let mut wanted: HashSet<&ModulePath> = HashSet::new();
        let mut stack: Vec<&ModulePath> = targets.iter().collect();

        while let Some(path) = stack.pop() {
            let Some(module) = self.get(path) else {
                continue;
            };
            if !wanted.insert(&module.path) {
                continue;
            }
            stack.extend(module.dependencies().iter());
        }

        DiscoverySet {
            modules: self
                .modules
                .iter()
                .filter(|m| wanted.contains(&m.path))
                .cloned()
                .collect(),
        }
    }
}

/// Module discovery scanner
#[derive(Debug, Clone)]
pub struct ModuleDiscovery {
    modules_root: PathBuf,
    categories: Vec<String>,
    entry_point: String,
    manifest_file: String,
}

impl ModuleDiscovery {
    /// Create a new module discovery scanner
    pub fn new<P: AsRef<Path>>(
        modules_root: P,
        categories: Vec<String>,
        entry_point: impl Into<String>,
        manifest_file: impl Into<String>,
    ) -> Self {
        Self {
            modules_root: modules_root.as_ref().to_path_buf(),
            categories,
            entry_point: entry_point.into(),
            manifest_file: manifest_file.into(),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            &config.modules_root,
            config.categories.clone(),
            config.entry_point.clone(),
            config.manifest_file.clone(),
        )
    }

    /// Discover all modules under the configured category roots.
    ///
    /// Never fails: unreadable directories and unusable entries are logged
    /// and skipped.
    pub fn discover(&self) -> DiscoverySet {
        info!("Discovering modules in {:?}", self.modules_root);
        let mut modules = Vec::new();

        for category in &self.categories {
            let category_dir = self.modules_root.join(category);
            if !category_dir.is_dir() {
                debug!("Category directory {:?} not present, skipping", category_dir);
                continue;
            }

            let entries = match fs::read_dir(&category_dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Failed to read category directory {:?}: {}", category_dir, e);
                    continue;
                }
            };

            let mut dirs: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_dir())
                .collect();
            // Stable order within a category so repeated runs give repeated plans
            dirs.sort();

            for dir in dirs {
                if let Some(module) = self.inspect(category, &dir) {
                    modules.push(module);
                }
            }
        }

        info!("Discovered {} modules", modules.len());
        DiscoverySet::from_modules(modules)
    }

    fn inspect(&self, category: &str, dir: &Path) -> Option<DiscoveredModule> {
        let name = dir.file_name()?.to_str()?;
        let path = match ModulePath::new(category, name) {
            Ok(path) => path,
            Err(e) => {
                warn!("Skipping {:?}: {}", dir, e);
                return None;
            }
        };

        let entry_point = dir.join(&self.entry_point);
        if !entry_point.is_file() {
            debug!("No {} in {:?}, not a module", self.entry_point, dir);
            return None;
        }
        if !is_executable(&entry_point) {
            warn!("{}: {:?} is not executable, skipping", path, entry_point);
            return None;
        }

        let loaded = load_manifest(&path, &dir.join(&self.manifest_file));
        debug!(
            "Discovered {} (manifest: {})",
            path,
            if loaded.manifest.is_some() { "yes" } else { "no" }
        );

        Some(DiscoveredModule {
            path,
            directory: dir.to_path_buf(),
            entry_point,
            manifest: loaded.manifest,
            warnings: loaded.warnings,
        })
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
