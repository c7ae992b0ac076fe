//! modhost Library
//!
//! Discovers independently installable host modules, orders them by declared
//! dependency, installs their system packages in one batch, runs each
//! module's own install/uninstall/status entry point, and keeps a durable
//! per-module registry of what happened.

pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod manifest;
pub mod orchestrator;
pub mod packages;
pub mod process_guard;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod runner;
pub mod services;
pub mod types;

// Re-export main types for convenience
pub use config::OrchestratorConfig;
pub use discovery::{DiscoveredModule, DiscoverySet, ModuleDiscovery};
pub use error::{ModhostError, Result};
pub use manifest::{ManifestError, ManifestWarning, ModuleManifest};
pub use orchestrator::{Orchestrator, PURGE_TOKEN};
pub use packages::{AptPackageManager, PackageError, PackageManager, PackageSet};
pub use process_guard::{CancellationToken, ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use registry::{FileRegistry, MemoryRegistry, RegistryEntry, RegistryError, RegistryStore};
pub use report::{FailureKind, Operation, OperationReport, Outcome, StatusReport, StatusRow};
pub use resolver::{DependencyGraph, InstallationPlan, ResolveError};
pub use runner::{
    CommandOutput, CommandRunner, CommandSpec, EntryPointRunner, ModuleRunner, SystemRunner,
};
pub use services::{ServiceProbe, ServiceState, SystemctlProbe};
pub use types::{Capability, InstallMethod, ModuleAction, ModulePath, ModuleStatus};
