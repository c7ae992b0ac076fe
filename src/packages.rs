//! Package Aggregator
//!
//! Collects the system packages required by a set of modules, splits them
//! into already-satisfied and missing using the host package database, and
//! installs every missing package in one batch.
//!
//! # Design
//!
//! - **Deduplication**: sets are `BTreeSet`, so each package appears once and
//!   batches are sorted for deterministic command lines
//! - **One call**: a batch is a single package-manager invocation, never one
//!   per module
//! - **Fail whole**: a failed batch fails the operation before any module
//!   action runs

use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::discovery::DiscoveredModule;
use crate::registry::RegistryEntry;
use crate::runner::{CommandRunner, CommandSpec};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackageError {
    #[error("invalid package name {0:?}")]
    InvalidName(String),

    #[error("could not query package {package}: {reason}")]
    Query { package: String, reason: String },

    #[error("installing [{}] failed: {reason}", .packages.join(", "))]
    Install { packages: Vec<String>, reason: String },

    #[error("removing [{}] failed: {reason}", .packages.join(", "))]
    Remove { packages: Vec<String>, reason: String },
}

impl From<PackageError> for crate::error::ModhostError {
    fn from(err: PackageError) -> Self {
        crate::error::ModhostError::Package(err.to_string())
    }
}

/// Host package database and installer
pub trait PackageManager {
    fn is_installed(&self, package: &str) -> Result<bool, PackageError>;

    /// Install the whole batch in one invocation
    fn install(&self, packages: &[String]) -> Result<(), PackageError>;

    /// Remove the whole batch in one invocation
    fn remove(&self, packages: &[String]) -> Result<(), PackageError>;
}

/// Aggregated requirements of a module set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageSet {
    pub satisfied: BTreeSet<String>,
    pub missing: BTreeSet<String>,
}

/// Debian package name, optionally with `:arch`
pub fn is_valid_package_name(name: &str) -> bool {
    let (pkg, arch) = match name.split_once(':') {
        Some((pkg, arch)) => (pkg, Some(arch)),
        None => (name, None),
    };
    let pkg_ok = pkg.len() >= 2
        && pkg.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && pkg
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.'));
    let arch_ok = arch.is_none_or(|a| {
        !a.is_empty() && a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    });
    pkg_ok && arch_ok
}

/// De-duplicated union of the modules' required packages
pub fn required_packages<'a>(
    modules: impl IntoIterator<Item = &'a DiscoveredModule>,
) -> BTreeSet<String> {
    modules
        .into_iter()
        .flat_map(|m| m.required_packages().cloned())
        .collect()
}

/// Partition `required` by what the host already has
pub fn aggregate(
    required: BTreeSet<String>,
    manager: &dyn PackageManager,
) -> Result<PackageSet, PackageError> {
    if let Some(bad) = required.iter().find(|p| !is_valid_package_name(p)) {
        return Err(PackageError::InvalidName(bad.clone()));
    }

    let mut set = PackageSet::default();
    for package in required {
        if manager.is_installed(&package)? {
            set.satisfied.insert(package);
        } else {
            set.missing.insert(package);
        }
    }
    debug!(
        "Packages: {} satisfied, {} missing",
        set.satisfied.len(),
        set.missing.len()
    );
    Ok(set)
}

/// Install every missing package in a single call. No call when nothing is
/// missing.
pub fn install_missing(set: &PackageSet, manager: &dyn PackageManager) -> Result<(), PackageError> {
    if set.missing.is_empty() {
        info!("All {} required package(s) already installed", set.satisfied.len());
        return Ok(());
    }
    let batch: Vec<String> = set.missing.iter().cloned().collect();
    info!("Installing {} package(s): {}", batch.len(), batch.join(" "));
    manager.install(&batch)
}

/// Packages of the purged modules that no remaining installed module needs
pub fn orphaned_packages<'a>(
    purged: impl IntoIterator<Item = &'a RegistryEntry>,
    remaining: impl IntoIterator<Item = &'a RegistryEntry>,
) -> BTreeSet<String> {
    let still_needed: BTreeSet<&String> = remaining
        .into_iter()
        .filter(|e| e.is_installed())
        .flat_map(|e| e.packages.iter())
        .collect();
    purged
        .into_iter()
        .flat_map(|e| e.packages.iter())
        .filter(|p| !still_needed.contains(p))
        .cloned()
        .collect()
}

/// dpkg/apt backed package manager
#[derive(Debug, Clone)]
pub struct AptPackageManager<R> {
    runner: R,
    timeout: Duration,
}

impl<R: CommandRunner> AptPackageManager<R> {
    pub fn new(runner: R, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    fn apt_get(&self, verb: &[&str], packages: &[String]) -> CommandSpec {
        CommandSpec::new("apt-get")
            .args(verb.iter().copied())
            .arg("-y")
            .args(packages.iter().cloned())
            .env("DEBIAN_FRONTEND", "noninteractive")
            .timeout(self.timeout)
            .mutating()
    }
}

impl<R: CommandRunner> PackageManager for AptPackageManager<R> {
    fn is_installed(&self, package: &str) -> Result<bool, PackageError> {
        let spec = CommandSpec::new("dpkg-query").args(["-W", "--showformat=${Status}", package]);
        let out = self.runner.run(&spec).map_err(|e| PackageError::Query {
            package: package.to_string(),
            reason: format!("{:#}", e),
        })?;
        // Unknown packages make dpkg-query exit non-zero
        Ok(out.success && out.stdout.trim_end().ends_with("install ok installed"))
    }

    fn install(&self, packages: &[String]) -> Result<(), PackageError> {
        let spec = self.apt_get(&["install"], packages);
        let reason = match self.runner.run(&spec) {
            Ok(out) if out.success => return Ok(()),
            Ok(out) => out.failure_reason(),
            Err(e) => format!("{:#}", e),
        };
        Err(PackageError::Install {
            packages: packages.to_vec(),
            reason,
        })
    }

    fn remove(&self, packages: &[String]) -> Result<(), PackageError> {
        let spec = self.apt_get(&["remove", "--purge"], packages);
        let reason = match self.runner.run(&spec) {
            Ok(out) if out.success => return Ok(()),
            Ok(out) => out.failure_reason(),
            Err(e) => format!("{:#}", e),
        };
        Err(PackageError::Remove {
            packages: packages.to_vec(),
            reason,
        })
    }
}
