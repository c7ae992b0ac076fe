//! Installation Orchestrator
//!
//! Drives one operation end to end:
//!
//! ```text
//! install:   Discovery → closure(target) → Resolver → Aggregator
//!            → one package batch → per-module install → Registry
//! uninstall: Discovery + Registry → reverse dependency order
//!            → per-module uninstall → mark removed
//! purge:     confirmation → uninstall → delete record, config, logs
//!            → one batch removing orphaned packages
//! status:    Registry + Discovery + service probe (+ status action)
//! ```
//!
//! Refusals (unknown module, cycle, package batch failure, unconfirmed
//! purge) happen before any module action runs. A failing module is
//! recorded and the run continues with the next independent module.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::discovery::{DiscoveredModule, DiscoverySet, ModuleDiscovery};
use crate::error::ModhostError;
use crate::fingerprint::fingerprint_dir;
use crate::packages::{self, PackageManager};
use crate::process_guard::CancellationToken;
use crate::registry::{RegistryEntry, RegistryStore};
use crate::report::{
    FailureKind, Operation, OperationReport, Outcome, StatusReport, StatusRow,
};
use crate::resolver::{self, InstallationPlan, StepRole};
use crate::runner::ModuleRunner;
use crate::services::ServiceProbe;
use crate::types::{InstallMethod, ModuleAction, ModulePath, ModuleStatus};

/// Literal the operator must supply to confirm a purge
pub const PURGE_TOKEN: &str = "PURGE";

pub struct Orchestrator {
    config: OrchestratorConfig,
    discovery: ModuleDiscovery,
    registry: Box<dyn RegistryStore>,
    modules: Box<dyn ModuleRunner>,
    packages: Box<dyn PackageManager>,
    services: Box<dyn ServiceProbe>,
    cancel: CancellationToken,
    dry_run: bool,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Box<dyn RegistryStore>,
        modules: Box<dyn ModuleRunner>,
        packages: Box<dyn PackageManager>,
        services: Box<dyn ServiceProbe>,
    ) -> Self {
        Self {
            discovery: ModuleDiscovery::from_config(&config),
            config,
            registry,
            modules,
            packages,
            services,
            cancel: CancellationToken::new(),
            dry_run: false,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Report as a dry run and leave config and log files in place on purge
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn registry(&self) -> &dyn RegistryStore {
        self.registry.as_ref()
    }

    /// Discover and index current registry records
    fn snapshot(
        &self,
    ) -> Result<(DiscoverySet, BTreeMap<ModulePath, RegistryEntry>), ModhostError> {
        let set = self.discovery.discover();
        let entries = self
            .registry
            .list()?
            .into_iter()
            .map(|e| (e.module_path.clone(), e))
            .collect();
        Ok((set, entries))
    }

    // ========================================================================
    // install
    // ========================================================================

    /// Install `target` and its dependencies, or every discovered module
    pub fn install(&mut self, target: Option<&ModulePath>) -> OperationReport {
        let report = OperationReport::new(Operation::Install, self.dry_run);

        let (set, existing) = match self.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => return report.refused(e.to_string()),
        };

        let targets: Option<Vec<ModulePath>> = target.map(|t| vec![t.clone()]);
        let scope = match &targets {
            Some(targets) => {
                if let Some(missing) = targets.iter().find(|t| !set.contains(t)) {
                    return report
                        .refused(ModhostError::ModuleNotFound(missing.to_string()).to_string());
                }
                set.closure(targets)
            }
            None => set,
        };

        let plan = match InstallationPlan::build(&scope, targets.as_deref(), |path| {
            is_satisfied(&scope, &existing, path)
        }) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Refusing install: {}", e);
                return report.refused(ModhostError::from(e).to_string());
            }
        };

        let mut report = report;
        report.warnings.extend(plan.missing.iter().map(|m| {
            format!("{} depends on {}, which was not found", m.module, m.dependency)
        }));
        info!(
            "Installation plan: {}",
            plan.paths()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let pending = plan.pending().filter_map(|s| scope.get(&s.path));
        let required = packages::required_packages(pending);
        let batch = packages::aggregate(required, self.packages.as_ref())
            .and_then(|set| packages::install_missing(&set, self.packages.as_ref()));
        if let Err(e) = batch {
            warn!("Refusing install: {}", e);
            let reason = ModhostError::from(e).to_string();
            for step in &plan.steps {
                report.record(
                    step.path.clone(),
                    Outcome::NotAttempted {
                        reason: "package installation failed".to_string(),
                    },
                );
            }
            return report.refused(reason);
        }

        let mut outcomes: HashMap<ModulePath, Outcome> = HashMap::new();
        for step in &plan.steps {
            let Some(module) = scope.get(&step.path) else {
                continue;
            };

            let outcome = if step.satisfied {
                info!("{} already installed from identical source, skipping", step.path);
                Outcome::SkippedAlreadySatisfied
            } else if self.cancel.is_cancelled() {
                report.cancelled = true;
                Outcome::NotAttempted {
                    reason: "interrupted".to_string(),
                }
            } else if let Some(reason) = blocked_by(module, &outcomes) {
                warn!("Not installing {}: {}", step.path, reason);
                Outcome::NotAttempted { reason }
            } else {
                let method = match (target, step.role) {
                    (None, _) => InstallMethod::All,
                    (Some(_), StepRole::Target) => InstallMethod::Targeted,
                    (Some(_), StepRole::Dependency) => InstallMethod::Dependency,
                };
                self.install_one(module, method)
            };

            outcomes.insert(step.path.clone(), outcome.clone());
            report.record(step.path.clone(), outcome);
        }

        report
    }

    fn install_one(&mut self, module: &DiscoveredModule, method: InstallMethod) -> Outcome {
        let installed_by = self.config.installed_by.clone();
        let result = self.modules.run_action(module, ModuleAction::Install);

        let failure = match result {
            Ok(out) if out.success => None,
            Ok(out) => Some(out.failure_reason()),
            Err(e) => Some(format!("{:#}", e)),
        };

        if let Some(reason) = failure {
            warn!("{} install failed: {}", module.path, reason);
            let entry =
                RegistryEntry::for_module(module, ModuleStatus::Failed, method, installed_by);
            if let Err(e) = self.registry.put(entry) {
                warn!("Could not record failure of {}: {}", module.path, e);
            }
            return Outcome::Failed {
                kind: FailureKind::Action,
                reason,
            };
        }

        let fingerprint = match fingerprint_dir(&module.directory) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("Could not fingerprint {}: {}", module.path, e);
                None
            }
        };
        let entry = RegistryEntry::for_module(module, ModuleStatus::Installed, method, installed_by)
            .with_fingerprint(fingerprint);
        let service = entry.service.clone();

        let mut stored = match self.registry.put(entry) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("{} installed but not recorded: {}", module.path, e);
                return Outcome::Failed {
                    kind: FailureKind::Registry,
                    reason: e.to_string(),
                };
            }
        };

        if let Some(unit) = service {
            let state = self.services.state(&unit);
            debug!("{} service {} is {}", module.path, unit, state);
            if state.is_running() {
                stored.status = ModuleStatus::Active;
                match self.registry.put(stored) {
                    Ok(active) => stored = active,
                    Err(e) => {
                        warn!("{} is active but not recorded: {}", module.path, e);
                        return Outcome::Failed {
                            kind: FailureKind::Registry,
                            reason: e.to_string(),
                        };
                    }
                }
            }
        }

        info!("{} {}", module.path, stored.status);
        Outcome::Succeeded {
            status: stored.status,
        }
    }

    // ========================================================================
    // uninstall / purge
    // ========================================================================

    /// Run uninstall actions and mark records `removed`
    pub fn uninstall(&mut self, target: Option<&ModulePath>) -> OperationReport {
        self.remove(Operation::Uninstall, target)
    }

    /// Uninstall, then erase records, config, logs, and orphaned packages.
    ///
    /// Nothing happens unless `confirmation` is exactly [`PURGE_TOKEN`].
    pub fn purge(
        &mut self,
        target: Option<&ModulePath>,
        confirmation: Option<&str>,
    ) -> OperationReport {
        if confirmation != Some(PURGE_TOKEN) {
            warn!("Purge not confirmed, nothing removed");
            return OperationReport::new(Operation::Purge, self.dry_run).refused(
                ModhostError::PurgeNotConfirmed {
                    expected: PURGE_TOKEN,
                }
                .to_string(),
            );
        }
        self.remove(Operation::Purge, target)
    }

    fn remove(&mut self, operation: Operation, target: Option<&ModulePath>) -> OperationReport {
        let purge = operation == Operation::Purge;
        let mut report = OperationReport::new(operation, self.dry_run);

        let (set, existing) = match self.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => return report.refused(e.to_string()),
        };

        let targets: Vec<ModulePath> = match target {
            Some(t) if set.contains(t) || (purge && existing.contains_key(t)) => vec![t.clone()],
            Some(t) => {
                return report.refused(ModhostError::ModuleNotFound(t.to_string()).to_string());
            }
            None => {
                let mut all: Vec<ModulePath> = set
                    .iter()
                    .filter(|m| {
                        existing
                            .get(&m.path)
                            .is_some_and(|e| purge || e.status != ModuleStatus::Removed)
                    })
                    .map(|m| m.path.clone())
                    .collect();
                if purge {
                    all.extend(existing.keys().filter(|p| !set.contains(p)).cloned());
                }
                all
            }
        };

        let order = removal_order(&set, targets, &mut report);
        let mut purged: Vec<RegistryEntry> = Vec::new();

        for path in order {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                report.record(
                    path,
                    Outcome::NotAttempted {
                        reason: "interrupted".to_string(),
                    },
                );
                continue;
            }

            let previous = existing.get(&path).cloned();
            let outcome = match set.get(&path) {
                Some(module) => self.uninstall_one(module, previous.as_ref(), purge),
                None => {
                    // Purge of a record whose source is gone
                    warn!("{}: source not found, removing record only", path);
                    Outcome::Purged
                }
            };

            if purge && outcome == Outcome::Purged {
                let snapshot = previous.or_else(|| {
                    set.get(&path).map(|m| {
                        RegistryEntry::for_module(
                            m,
                            ModuleStatus::Removed,
                            InstallMethod::All,
                            self.config.installed_by.clone(),
                        )
                    })
                });
                match self.erase(&path) {
                    Ok(()) => {
                        if let Some(entry) = snapshot {
                            self.clean_files(&entry, &mut report);
                            purged.push(entry);
                        }
                        report.record(path, Outcome::Purged);
                    }
                    Err(e) => report.record(
                        path,
                        Outcome::Failed {
                            kind: FailureKind::Registry,
                            reason: e.to_string(),
                        },
                    ),
                }
                continue;
            }
            report.record(path, outcome);
        }

        if purge && !purged.is_empty() {
            self.remove_orphaned_packages(&purged, &mut report);
        }
        report
    }

    fn uninstall_one(
        &mut self,
        module: &DiscoveredModule,
        previous: Option<&RegistryEntry>,
        purge: bool,
    ) -> Outcome {
        let failure = match self.modules.run_action(module, ModuleAction::Uninstall) {
            Ok(out) if out.success => None,
            Ok(out) => Some(out.failure_reason()),
            Err(e) => Some(format!("{:#}", e)),
        };

        if let Some(reason) = failure {
            warn!("{} uninstall failed: {}", module.path, reason);
            // Never installed through modhost: nothing to mark
            if let Some(prev) = previous {
                let entry = RegistryEntry {
                    status: ModuleStatus::Failed,
                    ..prev.clone()
                };
                if let Err(e) = self.registry.put(entry) {
                    warn!("Could not record failure of {}: {}", module.path, e);
                }
            }
            return Outcome::Failed {
                kind: FailureKind::Action,
                reason,
            };
        }

        if purge {
            return Outcome::Purged;
        }

        match previous {
            None => {
                info!("{} uninstalled (no registry record)", module.path);
                Outcome::Succeeded {
                    status: ModuleStatus::Removed,
                }
            }
            Some(_) => match self.registry.mark_removed(&module.path) {
                Ok(entry) => {
                    info!("{} removed", module.path);
                    Outcome::Succeeded {
                        status: entry.status,
                    }
                }
                Err(e) => Outcome::Failed {
                    kind: FailureKind::Registry,
                    reason: e.to_string(),
                },
            },
        }
    }

    fn erase(&mut self, path: &ModulePath) -> Result<(), ModhostError> {
        if self.registry.delete(path)? {
            info!("{} record deleted", path);
        }
        Ok(())
    }

    fn clean_files(&self, entry: &RegistryEntry, report: &mut OperationReport) {
        let config_dir = self.config.module_config_dir(&entry.module_path);
        let targets = std::iter::once(config_dir.as_path())
            .chain(entry.log_files.iter().map(|p| p.as_path()));
        for target in targets {
            if let Err(e) = self.remove_path(target) {
                report
                    .cleanup_errors
                    .push(format!("{}: {}: {}", entry.module_path, target.display(), e));
            }
        }
    }

    fn remove_path(&self, target: &Path) -> io::Result<()> {
        let meta = match fs::symlink_metadata(target) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if self.dry_run {
            info!("[DRY RUN] Skipped: remove {}", target.display());
            return Ok(());
        }
        if meta.is_dir() {
            fs::remove_dir_all(target)?;
        } else {
            fs::remove_file(target)?;
        }
        info!("Removed {}", target.display());
        Ok(())
    }

    fn remove_orphaned_packages(&self, purged: &[RegistryEntry], report: &mut OperationReport) {
        let remaining = match self.registry.list() {
            Ok(remaining) => remaining,
            Err(e) => {
                report
                    .cleanup_errors
                    .push(format!("package cleanup skipped: {}", e));
                return;
            }
        };
        let orphans: Vec<String> = packages::orphaned_packages(purged, &remaining)
            .into_iter()
            .collect();
        if orphans.is_empty() {
            return;
        }
        info!("Removing {} package(s): {}", orphans.len(), orphans.join(" "));
        if let Err(e) = self.packages.remove(&orphans) {
            report.cleanup_errors.push(e.to_string());
        }
    }

    // ========================================================================
    // status
    // ========================================================================

    /// Merged, read-only view. `live` also runs each module's status action.
    pub fn status(&self, target: Option<&ModulePath>, live: bool) -> StatusReport {
        let (set, existing) = match self.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return StatusReport {
                    rows: Vec::new(),
                    refusal: Some(e.to_string()),
                };
            }
        };

        let mut paths: Vec<ModulePath> = set.paths();
        paths.extend(existing.keys().filter(|p| !set.contains(p)).cloned());
        if let Some(t) = target {
            if !paths.contains(t) {
                return StatusReport {
                    rows: Vec::new(),
                    refusal: Some(ModhostError::ModuleNotFound(t.to_string()).to_string()),
                };
            }
            paths.retain(|p| p == t);
        }

        let rows = paths
            .into_iter()
            .map(|path| {
                let module = set.get(&path);
                let entry = existing.get(&path);
                self.status_row(path, module, entry, live)
            })
            .collect();
        StatusReport {
            rows,
            refusal: None,
        }
    }

    fn status_row(
        &self,
        path: ModulePath,
        module: Option<&DiscoveredModule>,
        entry: Option<&RegistryEntry>,
        live: bool,
    ) -> StatusRow {
        let unit = entry
            .and_then(|e| e.service.clone())
            .or_else(|| module.and_then(|m| m.manifest.as_ref()).and_then(|m| m.service_name()));
        let service = unit.map(|unit| {
            let state = self.services.state(&unit);
            (unit, state)
        });

        let live = match module {
            Some(module) if live => Some(
                match self.modules.run_action(module, ModuleAction::Status) {
                    Ok(out) if out.success => Ok(()),
                    Ok(out) => Err(out.failure_reason()),
                    Err(e) => Err(format!("{:#}", e)),
                },
            ),
            _ => None,
        };

        StatusRow {
            discovered: module.is_some(),
            status: entry.map(|e| e.status),
            version: entry
                .map(|e| e.version.clone())
                .or_else(|| module.and_then(|m| m.version().map(str::to_string))),
            installed_at: entry.and_then(|e| e.installed_at),
            updated_at: entry.map(|e| e.updated_at),
            service,
            live,
            path,
        }
    }
}

/// A dependency satisfied by an earlier run: installed or active, and
/// recorded from the same source as is present now
fn is_satisfied(
    scope: &DiscoverySet,
    existing: &BTreeMap<ModulePath, RegistryEntry>,
    path: &ModulePath,
) -> bool {
    let Some(entry) = existing.get(path).filter(|e| e.is_installed()) else {
        return false;
    };
    let Some(module) = scope.get(path) else {
        return false;
    };
    match (&entry.fingerprint, fingerprint_dir(&module.directory)) {
        (Some(recorded), Ok(current)) => *recorded == current,
        _ => false,
    }
}

/// Reason a module cannot run because of a dependency's outcome this run
fn blocked_by(
    module: &DiscoveredModule,
    outcomes: &HashMap<ModulePath, Outcome>,
) -> Option<String> {
    module.dependencies().iter().find_map(|dep| match outcomes.get(dep) {
        Some(Outcome::Failed { .. }) => Some(format!("dependency {} failed", dep)),
        Some(Outcome::NotAttempted { .. }) => Some(format!("dependency {} was not attempted", dep)),
        _ => None,
    })
}

/// Dependents before their dependencies. Falls back to reverse discovery
/// order when the graph has a cycle.
fn removal_order(
    set: &DiscoverySet,
    targets: Vec<ModulePath>,
    report: &mut OperationReport,
) -> Vec<ModulePath> {
    let resolved = match resolver::resolve(set) {
        Ok(resolution) => resolution.order,
        Err(e) => {
            let note = format!("{}; removing in reverse discovery order", e);
            warn!("{}", note);
            report.warnings.push(note);
            set.paths()
        }
    };
    let mut ordered: Vec<ModulePath> = resolved
        .into_iter()
        .rev()
        .filter(|p| targets.contains(p))
        .collect();
    // Record-only targets have no position in the graph
    ordered.extend(targets.into_iter().filter(|p| !set.contains(p)));
    ordered
}
