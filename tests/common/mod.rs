//! Shared fixtures for integration tests: a temporary module tree and
//! recording fakes for the module runner, package manager, and service probe.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::rc::Rc;

use modhost::{
    CancellationToken, CommandOutput, DiscoveredModule, FileRegistry, ModuleAction, ModulePath,
    ModuleRunner, Orchestrator, OrchestratorConfig, PackageError, PackageManager, RegistryStore,
    ServiceProbe, ServiceState,
};
use tempfile::TempDir;

pub fn p(s: &str) -> ModulePath {
    s.parse().unwrap()
}

// =============================================================================
// Module tree
// =============================================================================

/// `<tmp>/modules/<category>/<name>/setup.sh` plus registry and config roots
pub struct ModuleTree {
    pub root: TempDir,
}

impl ModuleTree {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
        }
    }

    pub fn modules_root(&self) -> PathBuf {
        self.root.path().join("modules")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root.path().join("registry")
    }

    pub fn config_root(&self) -> PathBuf {
        self.root.path().join("etc")
    }

    pub fn module_dir(&self, path: &str) -> PathBuf {
        self.modules_root().join(path)
    }

    /// Create a module with an executable entry point and optional manifest
    pub fn add(&self, path: &str, manifest: Option<&str>) -> &Self {
        let dir = self.module_dir(path);
        fs::create_dir_all(&dir).unwrap();
        let script = dir.join("setup.sh");
        fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        if let Some(json) = manifest {
            fs::write(dir.join("module.json"), json).unwrap();
        }
        self
    }

    /// Create a module whose manifest lists dependencies and packages
    pub fn add_with(&self, path: &str, deps: &[&str], packages: &[&str]) -> &Self {
        let (category, name) = path.split_once('/').unwrap();
        let manifest = serde_json::json!({
            "name": name,
            "version": "1.0.0",
            "category": category,
            "dependencies": deps,
            "requiredPackages": packages,
        });
        self.add(path, Some(&manifest.to_string()))
    }

    pub fn write(&self, path: &str, file: &str, content: &str) {
        fs::write(self.module_dir(path).join(file), content).unwrap();
    }

    pub fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            modules_root: self.modules_root(),
            registry_dir: self.registry_dir(),
            config_root: self.config_root(),
            categories: ["motion-detection", "sensors", "iot", "system", "security"]
                .map(String::from)
                .to_vec(),
            installed_by: "integration-test".to_string(),
            ..OrchestratorConfig::default()
        }
    }

    pub fn registry(&self) -> FileRegistry {
        FileRegistry::new(self.registry_dir())
    }
}

// =============================================================================
// Fakes
// =============================================================================

/// Records every module action in call order
#[derive(Clone, Default)]
pub struct FakeModules {
    pub calls: Rc<RefCell<Vec<(ModulePath, ModuleAction)>>>,
    pub failing: Rc<RefCell<HashSet<(ModulePath, ModuleAction)>>>,
    /// Cancelled once the first action has run, like an operator's Ctrl+C
    pub interrupt: Rc<RefCell<Option<CancellationToken>>>,
}

impl FakeModules {
    pub fn fail(&self, path: &str, action: ModuleAction) {
        self.failing.borrow_mut().insert((p(path), action));
    }

    pub fn interrupt_after_first(&self, token: &CancellationToken) {
        *self.interrupt.borrow_mut() = Some(token.clone());
    }

    pub fn calls(&self) -> Vec<(ModulePath, ModuleAction)> {
        self.calls.borrow().clone()
    }

    pub fn called(&self, action: ModuleAction) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|(_, a)| *a == action)
            .map(|(p, _)| p.to_string())
            .collect()
    }
}

impl ModuleRunner for FakeModules {
    fn run_action(
        &self,
        module: &DiscoveredModule,
        action: ModuleAction,
    ) -> anyhow::Result<CommandOutput> {
        self.calls.borrow_mut().push((module.path.clone(), action));
        if let Some(token) = self.interrupt.borrow().as_ref() {
            token.cancel();
        }
        if self.failing.borrow().contains(&(module.path.clone(), action)) {
            Ok(CommandOutput::failed(1, format!("{} {} broke", module.path, action)))
        } else {
            Ok(CommandOutput::ok(format!("{} {} ok\n", module.path, action)))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageCall {
    Install(Vec<String>),
    Remove(Vec<String>),
}

/// In-memory package database
#[derive(Clone, Default)]
pub struct FakePackages {
    pub installed: Rc<RefCell<BTreeSet<String>>>,
    pub calls: Rc<RefCell<Vec<PackageCall>>>,
    pub fail_install: Rc<RefCell<bool>>,
}

impl FakePackages {
    pub fn preinstalled(&self, pkg: &str) {
        self.installed.borrow_mut().insert(pkg.to_string());
    }

    pub fn calls(&self) -> Vec<PackageCall> {
        self.calls.borrow().clone()
    }
}

impl PackageManager for FakePackages {
    fn is_installed(&self, package: &str) -> Result<bool, PackageError> {
        Ok(self.installed.borrow().contains(package))
    }

    fn install(&self, packages: &[String]) -> Result<(), PackageError> {
        self.calls
            .borrow_mut()
            .push(PackageCall::Install(packages.to_vec()));
        if *self.fail_install.borrow() {
            return Err(PackageError::Install {
                packages: packages.to_vec(),
                reason: "network unreachable".to_string(),
            });
        }
        self.installed.borrow_mut().extend(packages.iter().cloned());
        Ok(())
    }

    fn remove(&self, packages: &[String]) -> Result<(), PackageError> {
        self.calls
            .borrow_mut()
            .push(PackageCall::Remove(packages.to_vec()));
        let mut installed = self.installed.borrow_mut();
        for p in packages {
            installed.remove(p);
        }
        Ok(())
    }
}

/// Services listed in `running` report as running
#[derive(Clone, Default)]
pub struct FakeServices {
    pub running: Rc<RefCell<HashSet<String>>>,
    pub probed: Rc<RefCell<Vec<String>>>,
}

impl FakeServices {
    pub fn start(&self, unit: &str) {
        self.running.borrow_mut().insert(unit.to_string());
    }
}

impl ServiceProbe for FakeServices {
    fn state(&self, unit: &str) -> ServiceState {
        self.probed.borrow_mut().push(unit.to_string());
        if self.running.borrow().contains(unit) {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Module tree plus shared fakes; every `orchestrator()` sees the same
/// on-disk registry
pub struct Harness {
    pub tree: ModuleTree,
    pub modules: FakeModules,
    pub packages: FakePackages,
    pub services: FakeServices,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            tree: ModuleTree::new(),
            modules: FakeModules::default(),
            packages: FakePackages::default(),
            services: FakeServices::default(),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(Box::new(self.tree.registry()))
    }

    pub fn orchestrator_with(&self, registry: Box<dyn RegistryStore>) -> Orchestrator {
        Orchestrator::new(
            self.tree.config(),
            registry,
            Box::new(self.modules.clone()),
            Box::new(self.packages.clone()),
            Box::new(self.services.clone()),
        )
    }

    pub fn registry(&self) -> FileRegistry {
        self.tree.registry()
    }
}
